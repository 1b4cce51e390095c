use crate::expr::{parse_condition, Condition};
use crate::template::Template;
use ablage_core::{AblageError, AlertSeverity, Labels, NoDataState, Result, ALERT_NAME_LABEL, SEVERITY_LABEL};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

fn default_interval() -> std::time::Duration {
    std::time::Duration::from_secs(30)
}

/// 配置文件中的规则定义
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleDefinition {
    /// 规则名称，作为 `alertname` 标签
    pub alert: String,
    pub expr: String,
    #[serde(rename = "for", default, with = "humantime_serde")]
    pub for_duration: std::time::Duration,
    #[serde(default)]
    pub severity: AlertSeverity,
    #[serde(default)]
    pub labels: Labels,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub no_data_state: NoDataState,
    /// 覆盖全局的 resolved 保留时长
    #[serde(default, with = "humantime_serde")]
    pub resolved_retention: Option<std::time::Duration>,
}

/// 配置文件中的规则组定义
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleGroupDefinition {
    pub name: String,
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: std::time::Duration,
    #[serde(default)]
    pub rules: Vec<RuleDefinition>,
}

fn to_chrono(duration: std::time::Duration, what: &str) -> Result<Duration> {
    Duration::from_std(duration).map_err(|e| AblageError::Config(format!("{} out of range: {}", what, e)))
}

/// 编译后的告警规则，加载后不可变
#[derive(Debug, Clone)]
pub struct AlertRule {
    pub name: String,
    pub condition: Condition,
    pub for_duration: Duration,
    pub severity: AlertSeverity,
    pub labels: Labels,
    pub annotations: BTreeMap<String, Template>,
    pub no_data_state: NoDataState,
    pub resolved_retention: Option<Duration>,
}

impl AlertRule {
    pub fn compile(definition: &RuleDefinition) -> Result<Self> {
        if definition.alert.trim().is_empty() {
            return Err(AblageError::Config("rule name must not be empty".to_string()));
        }

        let condition = parse_condition(&definition.expr).map_err(|e| {
            AblageError::Config(format!("rule {}: invalid expression: {}", definition.alert, e))
        })?;

        let annotations = definition
            .annotations
            .iter()
            .map(|(key, source)| {
                Template::parse(source)
                    .map(|t| (key.clone(), t))
                    .map_err(|e| AblageError::Config(format!("rule {}: annotation {}: {}", definition.alert, key, e)))
            })
            .collect::<Result<BTreeMap<_, _>>>()?;

        let resolved_retention = definition
            .resolved_retention
            .map(|d| to_chrono(d, "resolved_retention"))
            .transpose()?;

        Ok(Self {
            name: definition.alert.clone(),
            condition,
            for_duration: to_chrono(definition.for_duration, "for")?,
            severity: definition.severity,
            labels: definition.labels.clone(),
            annotations,
            no_data_state: definition.no_data_state,
            resolved_retention,
        })
    }

    /// 告警实例标签：序列标签 + 规则标签 + alertname + severity
    pub fn instance_labels(&self, series_labels: &Labels) -> Labels {
        series_labels
            .merge(&self.labels)
            .with(ALERT_NAME_LABEL, self.name.clone())
            .with(SEVERITY_LABEL, self.severity.as_str())
    }

    pub fn render_annotations(&self, labels: &Labels, value: f64) -> BTreeMap<String, String> {
        self.annotations
            .iter()
            .map(|(key, template)| (key.clone(), template.render(labels, value)))
            .collect()
    }
}

/// 编译后的规则组
#[derive(Debug, Clone)]
pub struct RuleGroup {
    pub name: String,
    pub interval: std::time::Duration,
    pub rules: Vec<AlertRule>,
}

impl RuleGroup {
    pub fn compile(definition: &RuleGroupDefinition) -> Result<Self> {
        if definition.interval.is_zero() {
            return Err(AblageError::Config(format!(
                "rule group {}: interval must be positive",
                definition.name
            )));
        }

        let rules = definition
            .rules
            .iter()
            .map(AlertRule::compile)
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            name: definition.name.clone(),
            interval: definition.interval,
            rules,
        })
    }
}
