use crate::api::{create_router, AppState};
use ablage_alert::AlertEngine;
use ablage_config::AblageConfig;
use ablage_metrics::EngineMetrics;
use ablage_notify::{DispatchQueue, Dispatcher, LogNotifier, WebhookNotifier};
use ablage_shutdown::{
    Resource, ResourceError, ResourceManager, ShutdownCoordinator, ShutdownReport, SignalHandler,
};
use ablage_tsdb::{Ingestor, SeriesStore};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

/// 关闭时关闭通知队列并等待分发器把剩余批次投递完
struct NotificationDrain {
    queue: Arc<DispatchQueue>,
    handle: Mutex<Option<JoinHandle<()>>>,
    timeout: Duration,
}

#[async_trait]
impl Resource for NotificationDrain {
    async fn cleanup(&self) -> Result<(), ResourceError> {
        self.queue.close();
        let Some(handle) = self.handle.lock().await.take() else {
            return Ok(());
        };

        match tokio::time::timeout(self.timeout, handle).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ResourceError::CleanupFailed(e.to_string())),
            Err(_) => Err(ResourceError::Timeout(self.timeout)),
        }
    }

    fn name(&self) -> &str {
        "notification-dispatcher"
    }

    fn priority(&self) -> u32 {
        10
    }
}

/// 组装好的服务进程
pub struct Application {
    config: AblageConfig,
    state: Arc<AppState>,
    queue: Arc<DispatchQueue>,
    dispatcher: Dispatcher,
}

impl Application {
    /// 根据配置构建全部组件，不启动任何任务
    pub fn build(config: AblageConfig) -> Result<Self> {
        let metrics = Arc::new(EngineMetrics::new().context("failed to create metrics registry")?);

        let store = Arc::new(
            SeriesStore::new(config.storage.store_options()?).with_metrics(metrics.clone()),
        );
        let queue = Arc::new(
            DispatchQueue::new(config.notify.queue_capacity, config.notify.overflow_policy)
                .with_metrics(metrics.clone()),
        );

        let engine = AlertEngine::new(
            config.compile_rule_groups()?,
            store.clone(),
            config.compile_inhibitor()?,
            queue.clone(),
            config.engine_options(),
        )?
        .with_metrics(metrics.clone());

        let mut dispatcher = Dispatcher::new(config.notify.retry.clone(), config.notify.dedup_ttl)
            .with_metrics(metrics.clone());
        if config.notify.log_channel {
            dispatcher.register(Arc::new(LogNotifier::new()));
        }
        for webhook in &config.notify.webhooks {
            let notifier = WebhookNotifier::new(webhook.name.clone(), webhook.config.clone())
                .with_context(|| format!("failed to create webhook channel {}", webhook.name))?;
            dispatcher.register(Arc::new(notifier));
        }

        let state = Arc::new(AppState {
            ingestor: Ingestor::new(store.clone()),
            store,
            engine: Arc::new(engine),
            metrics,
        });

        Ok(Self {
            config,
            state,
            queue,
            dispatcher,
        })
    }

    pub fn state(&self) -> Arc<AppState> {
        self.state.clone()
    }

    /// 启动所有后台任务和 HTTP 服务，直到收到关闭信号
    pub async fn run(self) -> Result<ShutdownReport> {
        let Self {
            config,
            state,
            queue,
            dispatcher,
        } = self;

        let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", config.server.host, config.server.port))?;

        let (signal, _rx) = SignalHandler::new();

        info!(
            channels = dispatcher.channel_count(),
            groups = state.engine.groups().len(),
            rules = state.engine.rule_count(),
            "Starting alert pipeline"
        );
        let dispatcher_handle = tokio::spawn(dispatcher.run(queue.clone()));

        let mut builder = ShutdownCoordinator::builder()
            .with_signal_handler(signal.clone())
            .with_drain_timeout(config.shutdown.drain_timeout)
            .with_cleanup_timeout(config.shutdown.cleanup_timeout);

        for (index, handle) in state.engine.spawn(&signal).into_iter().enumerate() {
            builder = builder.with_task(format!("alert-loop-{}", index), handle);
        }
        builder = builder.with_task(
            "housekeeping",
            spawn_housekeeping(state.store.clone(), config.storage.housekeeping_interval, &signal),
        );

        let router = create_router(state.clone());
        let mut http_shutdown = signal.subscribe();
        let server = axum::Server::try_bind(&addr)
            .with_context(|| format!("failed to bind {}", addr))?
            .serve(router.into_make_service())
            .with_graceful_shutdown(async move {
                let _ = http_shutdown.recv().await;
            });
        info!(%addr, "HTTP API listening");
        builder = builder.with_task(
            "http",
            tokio::spawn(async move {
                if let Err(e) = server.await {
                    error!(error = %e, "HTTP server failed");
                }
            }),
        );

        let listener = signal.clone();
        tokio::spawn(async move {
            if let Err(e) = listener.wait_for_system_signal().await {
                error!(error = %e, "Failed to install signal handlers");
                listener.trigger_shutdown();
            }
        });

        let mut resources = ResourceManager::new();
        resources.register(Arc::new(NotificationDrain {
            queue,
            handle: Mutex::new(Some(dispatcher_handle)),
            timeout: config.shutdown.drain_timeout,
        }));

        let report = builder.with_resource_manager(resources).build().run().await;
        if report.tasks_aborted > 0 || report.resource_failures > 0 {
            warn!(
                aborted = report.tasks_aborted,
                failures = report.resource_failures,
                "Shutdown finished with errors"
            );
        }
        Ok(report)
    }
}

/// 定期清理过期序列并刷新存储统计
fn spawn_housekeeping(store: Arc<SeriesStore>, interval: Duration, signal: &SignalHandler) -> JoinHandle<()> {
    let mut shutdown = signal.subscribe();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let pruned = store.prune_stale(Utc::now());
                    let stats = store.stats().await;
                    if pruned > 0 {
                        info!(pruned, series = stats.series, samples = stats.samples, "Pruned stale series");
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    })
}
