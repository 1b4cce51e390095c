use crate::resource::ResourceManager;
use crate::signal::{ShutdownSignal, SignalHandler};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{info, warn};

/// 关闭阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    Running,
    Draining,
    Cleaning,
    Complete,
}

/// 关闭结果
#[derive(Debug, Clone)]
pub struct ShutdownReport {
    pub signal: ShutdownSignal,
    pub phase: ShutdownPhase,
    /// 在排空时限内正常退出的任务数
    pub tasks_stopped: usize,
    /// 超时被中止的任务数
    pub tasks_aborted: usize,
    pub resource_failures: usize,
    pub elapsed: Duration,
}

/// 关闭协调器
///
/// 收到信号后依次执行：等待后台任务退出（超时则中止）、按优先级清理资源。
pub struct ShutdownCoordinator {
    signal_handler: SignalHandler,
    shutdown_rx: broadcast::Receiver<ShutdownSignal>,
    tasks: Vec<(String, JoinHandle<()>)>,
    resource_manager: Option<ResourceManager>,
    cleanup_timeout: Duration,
    drain_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn builder() -> ShutdownCoordinatorBuilder {
        ShutdownCoordinatorBuilder::new()
    }

    /// 运行关闭流程
    pub async fn run(mut self) -> ShutdownReport {
        info!("Shutdown coordinator started, waiting for signal...");

        // 构建之前就已触发的关闭不会出现在接收端里
        let signal = if self.signal_handler.is_shutting_down() {
            self.shutdown_rx.try_recv().unwrap_or(ShutdownSignal::Manual)
        } else {
            self.shutdown_rx.recv().await.unwrap_or(ShutdownSignal::Manual)
        };
        info!(signal = ?signal, "Received shutdown signal");

        let start = Instant::now();
        let mut report = ShutdownReport {
            signal,
            phase: ShutdownPhase::Draining,
            tasks_stopped: 0,
            tasks_aborted: 0,
            resource_failures: 0,
            elapsed: Duration::ZERO,
        };

        info!(tasks = self.tasks.len(), "Draining background tasks");
        let deadline = start + self.drain_timeout;
        for (name, mut handle) in self.tasks.drain(..) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, &mut handle).await {
                Ok(Ok(())) => report.tasks_stopped += 1,
                Ok(Err(e)) => {
                    warn!(task = %name, error = %e, "Background task ended abnormally");
                    report.tasks_stopped += 1;
                }
                Err(_) => {
                    warn!(task = %name, timeout = ?self.drain_timeout, "Background task did not stop in time, aborting");
                    handle.abort();
                    report.tasks_aborted += 1;
                }
            }
        }

        report.phase = ShutdownPhase::Cleaning;
        if let Some(manager) = &self.resource_manager {
            let summary = manager.cleanup_all(self.cleanup_timeout).await;
            if !summary.failed.is_empty() {
                warn!(failed = ?summary.failed, "Some resources were not cleaned up");
            }
            report.resource_failures = summary.failed.len();
        }

        report.phase = ShutdownPhase::Complete;
        report.elapsed = start.elapsed();
        info!(elapsed = ?report.elapsed, aborted = report.tasks_aborted, "Graceful shutdown complete");
        report
    }
}

/// 关闭协调器构建器
pub struct ShutdownCoordinatorBuilder {
    signal_handler: Option<SignalHandler>,
    tasks: Vec<(String, JoinHandle<()>)>,
    resource_manager: Option<ResourceManager>,
    cleanup_timeout: Duration,
    drain_timeout: Duration,
}

impl ShutdownCoordinatorBuilder {
    pub fn new() -> Self {
        Self {
            signal_handler: None,
            tasks: Vec::new(),
            resource_manager: None,
            cleanup_timeout: Duration::from_secs(60),
            drain_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_signal_handler(mut self, handler: SignalHandler) -> Self {
        self.signal_handler = Some(handler);
        self
    }

    /// 登记一个需要在关闭时等待的后台任务
    pub fn with_task(mut self, name: impl Into<String>, handle: JoinHandle<()>) -> Self {
        self.tasks.push((name.into(), handle));
        self
    }

    pub fn with_resource_manager(mut self, manager: ResourceManager) -> Self {
        self.resource_manager = Some(manager);
        self
    }

    pub fn with_cleanup_timeout(mut self, timeout: Duration) -> Self {
        self.cleanup_timeout = timeout;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn build(self) -> ShutdownCoordinator {
        let signal_handler = self.signal_handler.unwrap_or_default();
        let shutdown_rx = signal_handler.subscribe();

        ShutdownCoordinator {
            signal_handler,
            shutdown_rx,
            tasks: self.tasks,
            resource_manager: self.resource_manager,
            cleanup_timeout: self.cleanup_timeout,
            drain_timeout: self.drain_timeout,
        }
    }
}

impl Default for ShutdownCoordinatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{Resource, ResourceError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct FlagResource {
        cleaned: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Resource for FlagResource {
        async fn cleanup(&self) -> Result<(), ResourceError> {
            self.cleaned.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &str {
            "flag"
        }
    }

    #[tokio::test]
    async fn test_tasks_drained_then_resources_cleaned() {
        let (handler, _rx) = SignalHandler::new();
        let mut task_rx = handler.subscribe();
        let task = tokio::spawn(async move {
            let _ = task_rx.recv().await;
        });

        let cleaned = Arc::new(AtomicBool::new(false));
        let mut manager = ResourceManager::new();
        manager.register(Arc::new(FlagResource {
            cleaned: cleaned.clone(),
        }));

        let coordinator = ShutdownCoordinator::builder()
            .with_signal_handler(handler.clone())
            .with_task("loop", task)
            .with_resource_manager(manager)
            .with_drain_timeout(Duration::from_secs(5))
            .build();

        handler.trigger_shutdown();
        let report = coordinator.run().await;

        assert_eq!(report.signal, ShutdownSignal::Manual);
        assert_eq!(report.phase, ShutdownPhase::Complete);
        assert_eq!(report.tasks_stopped, 1);
        assert_eq!(report.tasks_aborted, 0);
        assert!(cleaned.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_stuck_task_is_aborted() {
        let (handler, _rx) = SignalHandler::new();
        let stuck = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });

        let coordinator = ShutdownCoordinator::builder()
            .with_signal_handler(handler.clone())
            .with_task("stuck", stuck)
            .with_drain_timeout(Duration::from_millis(50))
            .build();

        handler.trigger_shutdown();
        let report = coordinator.run().await;

        assert_eq!(report.tasks_aborted, 1);
        assert_eq!(report.resource_failures, 0);
    }

    #[tokio::test]
    async fn test_signal_before_build_is_not_lost() {
        let (handler, _rx) = SignalHandler::new();
        handler.notify(ShutdownSignal::Term);

        let report = ShutdownCoordinator::builder()
            .with_signal_handler(handler)
            .build()
            .run()
            .await;

        assert_eq!(report.phase, ShutdownPhase::Complete);
        assert_eq!(report.tasks_stopped, 0);
    }
}
