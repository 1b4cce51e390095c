use ablage_core::{AlertSeverity, Labels};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 事件对应的状态迁移
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventState {
    Firing,
    Resolved,
}

impl EventState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventState::Firing => "firing",
            EventState::Resolved => "resolved",
        }
    }
}

/// 交给通知渠道的告警事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    /// 规则名称
    pub rule: String,
    pub labels: Labels,
    pub annotations: BTreeMap<String, String>,
    pub state: EventState,
    pub severity: AlertSeverity,
    /// 首次触发条件成立的时间
    pub started_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    /// 最近一次评估的值
    pub value: f64,
    pub fingerprint: String,
    /// 同一次状态迁移的幂等键，重试投递时保持不变
    pub dedup_key: String,
}

impl AlertEvent {
    pub fn new(
        rule: impl Into<String>,
        labels: Labels,
        state: EventState,
        started_at: DateTime<Utc>,
        value: f64,
    ) -> Self {
        let fingerprint = labels.fingerprint();
        let dedup_key = dedup_key(&fingerprint, started_at, state);
        Self {
            rule: rule.into(),
            labels,
            annotations: BTreeMap::new(),
            state,
            severity: AlertSeverity::default(),
            started_at,
            resolved_at: None,
            value,
            fingerprint,
            dedup_key,
        }
    }

    pub fn with_annotations(mut self, annotations: BTreeMap<String, String>) -> Self {
        self.annotations = annotations;
        self
    }

    pub fn with_severity(mut self, severity: AlertSeverity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_resolved_at(mut self, resolved_at: DateTime<Utc>) -> Self {
        self.resolved_at = Some(resolved_at);
        self
    }

    /// 同一次告警周期中 firing 事件的幂等键
    pub fn firing_key(&self) -> String {
        dedup_key(&self.fingerprint, self.started_at, EventState::Firing)
    }
}

/// `fingerprint@started_at_millis:state`
pub fn dedup_key(fingerprint: &str, started_at: DateTime<Utc>, state: EventState) -> String {
    format!(
        "{}@{}:{}",
        fingerprint,
        started_at.timestamp_millis(),
        state.as_str()
    )
}

/// 一个分组的一次刷新
#[derive(Debug, Clone, Serialize)]
pub struct NotificationBatch {
    pub group_key: String,
    pub group_labels: Labels,
    pub events: Vec<AlertEvent>,
    pub created_at: DateTime<Utc>,
}

impl NotificationBatch {
    pub fn new(group_labels: Labels, events: Vec<AlertEvent>, created_at: DateTime<Utc>) -> Self {
        Self {
            group_key: group_labels.fingerprint(),
            group_labels,
            events,
            created_at,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_dedup_key_identifies_transition() {
        let started = Utc.timestamp_opt(300, 0).unwrap();
        let labels = Labels::new().with("alertname", "HighErrorRate");

        let firing = AlertEvent::new("HighErrorRate", labels.clone(), EventState::Firing, started, 0.1);
        let resolved = AlertEvent::new("HighErrorRate", labels, EventState::Resolved, started, 0.0);

        assert_eq!(firing.dedup_key, r#"{alertname="HighErrorRate"}@300000:firing"#);
        assert_ne!(firing.dedup_key, resolved.dedup_key);
        assert_eq!(resolved.firing_key(), firing.dedup_key);
    }

    #[test]
    fn test_event_serialization() {
        let started = Utc.timestamp_opt(0, 0).unwrap();
        let event = AlertEvent::new("A", Labels::new(), EventState::Resolved, started, 1.0)
            .with_resolved_at(started);

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["state"], "resolved");
        assert_eq!(json["severity"], "warning");
    }
}
