use crate::evaluator::{RuleEvaluator, RuleHealth, RuleRuntime};
use crate::rule::RuleGroup;
use crate::state::AlertInstance;
use ablage_core::AlertSeverity;
use ablage_metrics::EngineMetrics;
use ablage_notify::AlertEvent;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// 规则状态快照，供 API 查询
#[derive(Debug, Clone, Serialize)]
pub struct RuleStatus {
    pub group: String,
    pub name: String,
    pub query: String,
    #[serde(rename = "for", with = "humantime_serde")]
    pub for_duration: std::time::Duration,
    pub severity: AlertSeverity,
    #[serde(flatten)]
    pub health: RuleHealth,
    pub last_evaluation: Option<DateTime<Utc>>,
    pub alerts: Vec<AlertInstance>,
}

/// 规则组运行时
///
/// 组内规则按顺序评估；每条规则的实例状态由各自的互斥锁保护。
#[derive(Debug)]
pub struct GroupRuntime {
    name: String,
    interval: std::time::Duration,
    rules: Vec<Mutex<RuleRuntime>>,
}

impl GroupRuntime {
    pub fn new(group: RuleGroup) -> Self {
        Self {
            name: group.name,
            interval: group.interval,
            rules: group.rules.into_iter().map(|r| Mutex::new(RuleRuntime::new(r))).collect(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interval(&self) -> std::time::Duration {
        self.interval
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// 评估组内全部规则，返回需要通知的事件
    pub async fn evaluate(
        &self,
        evaluator: &RuleEvaluator,
        now: DateTime<Utc>,
        default_retention: Duration,
        metrics: Option<&EngineMetrics>,
    ) -> Vec<AlertEvent> {
        let _scope = metrics.map(|m| m.rule_group_scope(&self.name));
        let mut events = Vec::new();

        for runtime in &self.rules {
            let mut runtime = runtime.lock().await;
            let outcome = evaluator.evaluate(runtime.rule(), now).await;

            if let Some(metrics) = metrics {
                metrics.record_rule_evaluation(&self.name, &runtime.rule().name);
                if let Err(e) = &outcome {
                    if !e.is_no_data() {
                        metrics.record_rule_failure(&self.name, &runtime.rule().name, e.kind());
                    }
                }
            }

            let transitions = runtime.apply(outcome, now, default_retention);
            events.extend(
                transitions
                    .iter()
                    .filter(|record| record.transition.is_notifiable())
                    .filter_map(|record| record.instance.to_event(runtime.rule())),
            );
        }

        if !events.is_empty() {
            info!(group = %self.name, events = events.len(), "Rule group produced alert events");
        } else {
            debug!(group = %self.name, "Rule group evaluated");
        }
        events
    }

    pub async fn instances(&self) -> Vec<AlertInstance> {
        let mut instances = Vec::new();
        for runtime in &self.rules {
            instances.extend(runtime.lock().await.instances().cloned());
        }
        instances
    }

    pub async fn statuses(&self) -> Vec<RuleStatus> {
        let mut statuses = Vec::with_capacity(self.rules.len());
        for runtime in &self.rules {
            let runtime = runtime.lock().await;
            let rule = runtime.rule();
            statuses.push(RuleStatus {
                group: self.name.clone(),
                name: rule.name.clone(),
                query: rule.condition.to_string(),
                for_duration: rule.for_duration.to_std().unwrap_or_default(),
                severity: rule.severity,
                health: runtime.health().clone(),
                last_evaluation: runtime.last_evaluation(),
                alerts: runtime.instances().cloned().collect(),
            });
        }
        statuses
    }
}
