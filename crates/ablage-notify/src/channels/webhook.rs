use crate::event::{AlertEvent, EventState};
use crate::notifier::{DeliveryError, Notifier, PartialDelivery};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

fn default_timeout() -> Duration {
    Duration::from_secs(10)
}

/// Webhook 渠道配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// 通用 JSON 负载
#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    version: &'static str,
    status: EventState,
    alerts: &'a [AlertEvent],
}

/// 以 JSON POST 投递告警事件
pub struct WebhookNotifier {
    name: String,
    config: WebhookConfig,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(name: impl Into<String>, config: WebhookConfig) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            name: name.into(),
            config,
            client,
        })
    }

    async fn post(&self, events: &[AlertEvent]) -> Result<(), DeliveryError> {
        let status = if events.iter().any(|e| e.state == EventState::Firing) {
            EventState::Firing
        } else {
            EventState::Resolved
        };
        let payload = WebhookPayload {
            version: "1",
            status,
            alerts: events,
        };

        let mut request = self.client.post(&self.config.url);
        for (key, value) in &self.config.headers {
            request = request.header(key, value);
        }

        let response = request.json(&payload).send().await?;
        let code = response.status();
        if code.is_success() {
            debug!(channel = %self.name, alerts = events.len(), "Webhook delivered");
            Ok(())
        } else {
            let message = response.text().await.unwrap_or_default();
            Err(DeliveryError::Rejected {
                status: code.as_u16(),
                message,
            })
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn deliver(&self, event: &AlertEvent) -> Result<(), DeliveryError> {
        self.post(std::slice::from_ref(event)).await
    }

    /// 整批放在一个请求里，成功与失败都是整批的
    async fn deliver_batch(&self, events: &[AlertEvent]) -> Result<(), PartialDelivery> {
        if events.is_empty() {
            return Ok(());
        }
        self.post(events).await.map_err(PartialDelivery::none)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
