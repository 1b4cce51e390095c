use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 单个数据点
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

impl Sample {
    pub fn new(timestamp: DateTime<Utc>, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// 指标类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
    Summary,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Histogram => "histogram",
            MetricKind::Summary => "summary",
        }
    }
}

impl Default for MetricKind {
    fn default() -> Self {
        MetricKind::Gauge
    }
}

/// 乱序写入策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutOfOrderPolicy {
    /// 拒绝早于最新数据点的写入
    Reject,
    /// 覆盖同一时间戳或按序插入
    Overwrite,
}

impl OutOfOrderPolicy {
    /// 计数器类数据乱序意味着数据错误，仪表类数据允许回填
    pub fn default_for(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Gauge => OutOfOrderPolicy::Overwrite,
            MetricKind::Counter | MetricKind::Histogram | MetricKind::Summary => {
                OutOfOrderPolicy::Reject
            }
        }
    }
}

/// 告警级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Warning => "warning",
            AlertSeverity::Critical => "critical",
        }
    }
}

impl Default for AlertSeverity {
    fn default() -> Self {
        AlertSeverity::Warning
    }
}

/// 查询无数据时规则的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoDataState {
    /// 视为未触发
    #[default]
    Ok,
    /// 视为触发
    Alerting,
    /// 保持上一轮的状态
    KeepState,
}

/// 通知队列满时的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// 丢弃最旧的批次
    #[default]
    DropOldest,
    /// 拒绝新的批次
    Reject,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policies() {
        assert_eq!(
            OutOfOrderPolicy::default_for(MetricKind::Counter),
            OutOfOrderPolicy::Reject
        );
        assert_eq!(
            OutOfOrderPolicy::default_for(MetricKind::Gauge),
            OutOfOrderPolicy::Overwrite
        );
    }

    #[test]
    fn test_enum_serde_names() {
        let kind: MetricKind = serde_json::from_str("\"histogram\"").unwrap();
        assert_eq!(kind, MetricKind::Histogram);

        let state: NoDataState = serde_json::from_str("\"keep_state\"").unwrap();
        assert_eq!(state, NoDataState::KeepState);

        assert_eq!(
            serde_json::to_string(&AlertSeverity::Critical).unwrap(),
            "\"critical\""
        );
    }
}
