use crate::event::{AlertEvent, EventState};
use crate::notifier::{DeliveryError, Notifier};
use async_trait::async_trait;
use tracing::{info, warn};

/// 把告警事件写入日志的渠道
pub struct LogNotifier {
    name: String,
}

impl LogNotifier {
    pub fn new() -> Self {
        Self {
            name: "log".to_string(),
        }
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for LogNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn deliver(&self, event: &AlertEvent) -> Result<(), DeliveryError> {
        let summary = event.annotations.get("summary").map(String::as_str).unwrap_or("");
        match event.state {
            EventState::Firing => warn!(
                channel = %self.name,
                rule = %event.rule,
                labels = %event.labels,
                severity = event.severity.as_str(),
                value = event.value,
                started_at = %event.started_at,
                summary,
                "Alert firing"
            ),
            EventState::Resolved => info!(
                channel = %self.name,
                rule = %event.rule,
                labels = %event.labels,
                started_at = %event.started_at,
                resolved_at = ?event.resolved_at,
                "Alert resolved"
            ),
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
