use crate::event::AlertEvent;
use async_trait::async_trait;
use thiserror::Error;

/// 投递错误
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Rejected by receiver with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Channel disabled: {0}")]
    Disabled(String),
}

impl DeliveryError {
    /// 接收方明确拒绝（4xx）或本地序列化失败时重试没有意义
    pub fn is_retryable(&self) -> bool {
        match self {
            DeliveryError::Transport(_) => true,
            DeliveryError::Rejected { status, .. } => *status >= 500 || *status == 429,
            DeliveryError::Serialization(_) | DeliveryError::Disabled(_) => false,
        }
    }
}

/// 批量投递中途失败：前 `delivered` 个事件已经送达，其余未送达
#[derive(Error, Debug)]
#[error("{error} ({delivered} events delivered before failure)")]
pub struct PartialDelivery {
    pub delivered: usize,
    #[source]
    pub error: DeliveryError,
}

impl PartialDelivery {
    /// 整批都没有送达
    pub fn none(error: DeliveryError) -> Self {
        Self { delivered: 0, error }
    }
}

impl From<reqwest::Error> for DeliveryError {
    fn from(err: reqwest::Error) -> Self {
        DeliveryError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for DeliveryError {
    fn from(err: serde_json::Error) -> Self {
        DeliveryError::Serialization(err.to_string())
    }
}

/// 通知渠道 trait
#[async_trait]
pub trait Notifier: Send + Sync {
    /// 投递单个事件
    async fn deliver(&self, event: &AlertEvent) -> Result<(), DeliveryError>;

    /// 投递一批事件，默认逐个投递
    ///
    /// 失败时必须如实报告已经送达的前缀长度，分发器据此只重试剩余事件。
    /// 整批原子投递的渠道（如 webhook）失败时报告 0。
    async fn deliver_batch(&self, events: &[AlertEvent]) -> Result<(), PartialDelivery> {
        for (delivered, event) in events.iter().enumerate() {
            self.deliver(event)
                .await
                .map_err(|error| PartialDelivery { delivered, error })?;
        }
        Ok(())
    }

    /// 渠道名称
    fn name(&self) -> &str;

    /// 是否启用
    fn is_enabled(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(DeliveryError::Transport("reset".into()).is_retryable());
        assert!(DeliveryError::Rejected { status: 503, message: String::new() }.is_retryable());
        assert!(DeliveryError::Rejected { status: 429, message: String::new() }.is_retryable());
        assert!(!DeliveryError::Rejected { status: 400, message: String::new() }.is_retryable());
        assert!(!DeliveryError::Serialization("bad".into()).is_retryable());
    }

    struct FlakyNotifier {
        fail_on: usize,
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl Notifier for FlakyNotifier {
        async fn deliver(&self, _event: &AlertEvent) -> Result<(), DeliveryError> {
            let call = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if call == self.fail_on {
                return Err(DeliveryError::Transport("reset".into()));
            }
            Ok(())
        }

        fn name(&self) -> &str {
            "flaky"
        }
    }

    #[tokio::test]
    async fn test_default_batch_reports_delivered_prefix() {
        use crate::event::EventState;
        use ablage_core::Labels;
        use chrono::{TimeZone, Utc};

        let started = Utc.timestamp_opt(0, 0).unwrap();
        let events: Vec<AlertEvent> = ["a", "b", "c"]
            .iter()
            .map(|service| {
                AlertEvent::new("A", Labels::new().with("service", *service), EventState::Firing, started, 1.0)
            })
            .collect();
        let notifier = FlakyNotifier {
            fail_on: 2,
            calls: Default::default(),
        };

        let partial = notifier.deliver_batch(&events).await.unwrap_err();
        assert_eq!(partial.delivered, 2);
        assert!(partial.error.is_retryable());
    }
}
