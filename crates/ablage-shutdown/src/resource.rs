use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{timeout, Instant};
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("Cleanup failed: {0}")]
    CleanupFailed(String),

    #[error("Cleanup timed out after {0:?}")]
    Timeout(Duration),
}

/// 需要在关闭时收尾的组件，例如通知分发器
#[async_trait]
pub trait Resource: Send + Sync {
    async fn cleanup(&self) -> Result<(), ResourceError>;

    fn name(&self) -> &str;

    /// 数字越小越先清理
    fn priority(&self) -> u32 {
        100
    }
}

/// 一次清理的汇总
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupSummary {
    pub cleaned: usize,
    /// 失败或超时的资源名
    pub failed: Vec<String>,
}

/// 按优先级管理关闭时的清理工作
#[derive(Default)]
pub struct ResourceManager {
    resources: Vec<Arc<dyn Resource>>,
}

impl ResourceManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, resource: Arc<dyn Resource>) {
        info!(resource = resource.name(), priority = resource.priority(), "Resource registered");
        self.resources.push(resource);
        self.resources.sort_by_key(|r| r.priority());
    }

    pub fn count(&self) -> usize {
        self.resources.len()
    }

    /// 依次清理全部资源，所有资源共享 `budget`
    ///
    /// 单个资源失败或超时不影响后续资源；预算耗尽后剩余资源直接记为超时。
    pub async fn cleanup_all(&self, budget: Duration) -> CleanupSummary {
        let deadline = Instant::now() + budget;
        let mut summary = CleanupSummary::default();

        for resource in &self.resources {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let result = match timeout(remaining, resource.cleanup()).await {
                Ok(result) => result,
                Err(_) => Err(ResourceError::Timeout(budget)),
            };

            match result {
                Ok(()) => {
                    info!(resource = resource.name(), "Resource cleaned up");
                    summary.cleaned += 1;
                }
                Err(e) => {
                    error!(resource = resource.name(), error = %e, "Resource cleanup failed");
                    summary.failed.push(resource.name().to_string());
                }
            }
        }
        summary
    }
}
