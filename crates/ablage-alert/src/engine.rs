//! 告警引擎
//!
//! 每个规则组一个评估任务，按各自的间隔运行；每轮评估之后统一处理：
//! 根据当前 firing 集合重新计算抑制关系，刷新到期的分组，把通知批次放入分发队列。

use crate::evaluator::RuleEvaluator;
use crate::group::{GroupRuntime, RuleStatus};
use crate::inhibit::{Inhibitor, Suppression};
use crate::route::{RouteConfig, Router};
use crate::rule::RuleGroup;
use crate::state::{AlertInstance, AlertState};
use ablage_core::{AblageError, Labels, Result};
use ablage_metrics::EngineMetrics;
use ablage_notify::{AlertEvent, DispatchQueue};
use ablage_shutdown::SignalHandler;
use ablage_tsdb::SeriesReader;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// 引擎配置
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// resolved 实例的默认保留时长
    pub resolved_retention: std::time::Duration,
    pub route: RouteConfig,
    /// 分组刷新检查间隔
    pub flush_interval: std::time::Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            resolved_retention: std::time::Duration::from_secs(15 * 60),
            route: RouteConfig::default(),
            flush_interval: std::time::Duration::from_secs(1),
        }
    }
}

/// 对外展示的告警实例
#[derive(Debug, Clone, Serialize)]
pub struct ActiveAlert {
    #[serde(flatten)]
    pub instance: AlertInstance,
    pub inhibited_by: Option<Suppression>,
}

pub struct AlertEngine {
    groups: Vec<Arc<GroupRuntime>>,
    evaluator: RuleEvaluator,
    inhibitor: Inhibitor,
    router: Mutex<Router>,
    suppressed: RwLock<BTreeMap<String, Suppression>>,
    queue: Arc<DispatchQueue>,
    metrics: Option<Arc<EngineMetrics>>,
    default_retention: Duration,
    flush_interval: std::time::Duration,
}

impl AlertEngine {
    pub fn new(
        groups: Vec<RuleGroup>,
        reader: Arc<dyn SeriesReader>,
        inhibitor: Inhibitor,
        queue: Arc<DispatchQueue>,
        options: EngineOptions,
    ) -> Result<Self> {
        let default_retention = Duration::from_std(options.resolved_retention)
            .map_err(|e| AblageError::Config(format!("resolved_retention out of range: {}", e)))?;
        if options.flush_interval.is_zero() {
            return Err(AblageError::Config("flush_interval must be positive".to_string()));
        }

        Ok(Self {
            groups: groups.into_iter().map(|g| Arc::new(GroupRuntime::new(g))).collect(),
            evaluator: RuleEvaluator::new(reader),
            inhibitor,
            router: Mutex::new(Router::new(options.route)),
            suppressed: RwLock::new(BTreeMap::new()),
            queue,
            metrics: None,
            default_retention,
            flush_interval: options.flush_interval,
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<EngineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn groups(&self) -> &[Arc<GroupRuntime>] {
        &self.groups
    }

    pub fn rule_count(&self) -> usize {
        self.groups.iter().map(|g| g.rule_count()).sum()
    }

    /// 评估指定规则组并处理产生的事件
    pub async fn tick(&self, index: usize, now: DateTime<Utc>) -> usize {
        let events = self.evaluate_group(index, now).await;
        self.process(events, now).await
    }

    pub async fn evaluate_group(&self, index: usize, now: DateTime<Utc>) -> Vec<AlertEvent> {
        match self.groups.get(index) {
            Some(group) => {
                group
                    .evaluate(&self.evaluator, now, self.default_retention, self.metrics.as_deref())
                    .await
            }
            None => {
                warn!(index, "Unknown rule group");
                Vec::new()
            }
        }
    }

    /// 一轮处理：重新计算抑制、刷新分组、入队，返回入队的批次数
    pub async fn process(&self, events: Vec<AlertEvent>, now: DateTime<Utc>) -> usize {
        let firing = self.firing_labels().await;

        let (suppressed, batches) = {
            let mut router = self.router.lock().await;
            for event in events {
                router.observe(event, now);
            }
            let suppressed = self
                .inhibitor
                .compute(&firing, router.member_labels().chain(firing.iter()));
            let batches = router.flush(now, &suppressed);
            (suppressed, batches)
        };

        if let Some(metrics) = &self.metrics {
            metrics.set_inhibited(suppressed.len());
        }
        if !suppressed.is_empty() {
            debug!(inhibited = suppressed.len(), "Inhibition recomputed");
        }
        *self.suppressed.write().await = suppressed;

        let mut enqueued = 0;
        for batch in batches {
            let group = batch.group_key.clone();
            match self.queue.push(batch).await {
                Ok(_) => enqueued += 1,
                Err(e) => warn!(group = %group, error = %e, "Failed to enqueue notification batch"),
            }
        }
        enqueued
    }

    async fn firing_labels(&self) -> Vec<Labels> {
        let mut firing = Vec::new();
        let mut counts: BTreeMap<AlertState, usize> = BTreeMap::new();

        for group in &self.groups {
            for instance in group.instances().await {
                *counts.entry(instance.state).or_default() += 1;
                if instance.state == AlertState::Firing {
                    firing.push(instance.labels);
                }
            }
        }

        if let Some(metrics) = &self.metrics {
            for state in [AlertState::Pending, AlertState::Firing, AlertState::Resolved] {
                metrics.set_alerts(state.as_str(), counts.get(&state).copied().unwrap_or(0));
            }
        }
        firing
    }

    /// 当前全部告警实例，附带抑制信息
    pub async fn active_alerts(&self) -> Vec<ActiveAlert> {
        let suppressed = self.suppressed.read().await.clone();
        let mut alerts = Vec::new();
        for group in &self.groups {
            for instance in group.instances().await {
                let inhibited_by = suppressed.get(&instance.fingerprint).cloned();
                alerts.push(ActiveAlert { instance, inhibited_by });
            }
        }
        alerts
    }

    pub async fn rule_statuses(&self) -> Vec<RuleStatus> {
        let mut statuses = Vec::new();
        for group in &self.groups {
            statuses.extend(group.statuses().await);
        }
        statuses
    }

    /// 为每个规则组启动评估任务，另启动一个分组刷新任务
    ///
    /// 任务只在两次评估之间检查关闭信号，进行中的评估总会完成。
    pub fn spawn(self: &Arc<Self>, shutdown: &SignalHandler) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.groups.len() + 1);

        for (index, group) in self.groups.iter().enumerate() {
            let engine = Arc::clone(self);
            let interval = group.interval();
            let name = group.name().to_string();
            let mut shutdown_rx = shutdown.subscribe();

            handles.push(tokio::spawn(async move {
                info!(group = %name, interval = ?interval, "Rule group started");
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            engine.tick(index, Utc::now()).await;
                        }
                        _ = shutdown_rx.recv() => {
                            info!(group = %name, "Rule group stopped");
                            break;
                        }
                    }
                }
            }));
        }

        let engine = Arc::clone(self);
        let mut shutdown_rx = shutdown.subscribe();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.flush_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        engine.process(Vec::new(), Utc::now()).await;
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("Alert flusher stopped");
                        break;
                    }
                }
            }
        }));

        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::RuleGroupDefinition;
    use ablage_core::{MetricKind, OverflowPolicy, Sample, SeriesId};
    use ablage_tsdb::{SeriesStore, StoreOptions};

    fn engine(store: Arc<SeriesStore>, queue: Arc<DispatchQueue>) -> Arc<AlertEngine> {
        let definition: RuleGroupDefinition = serde_json::from_value(serde_json::json!({
            "name": "api",
            "interval": "50ms",
            "rules": [{ "alert": "Up", "expr": "up < 1" }]
        }))
        .unwrap();
        let options = EngineOptions {
            route: RouteConfig {
                group_wait: std::time::Duration::ZERO,
                ..RouteConfig::default()
            },
            flush_interval: std::time::Duration::from_millis(20),
            ..EngineOptions::default()
        };
        Arc::new(
            AlertEngine::new(
                vec![RuleGroup::compile(&definition).unwrap()],
                store,
                Inhibitor::default(),
                queue,
                options,
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_spawned_groups_stop_on_shutdown() {
        let store = Arc::new(SeriesStore::new(StoreOptions {
            ingestion_lag: Duration::zero(),
            ..StoreOptions::default()
        }));
        store
            .ingest(SeriesId::new("up", Labels::new()), MetricKind::Gauge, Sample::new(Utc::now(), 0.0))
            .await
            .unwrap();

        let queue = Arc::new(DispatchQueue::new(8, OverflowPolicy::Reject));
        let engine = engine(store, queue.clone());
        let (signal, _rx) = SignalHandler::new();

        let handles = engine.spawn(&signal);
        assert_eq!(handles.len(), 2);

        let batch = tokio::time::timeout(std::time::Duration::from_secs(5), queue.pop())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.events[0].rule, "Up");

        signal.trigger_shutdown();
        for handle in handles {
            tokio::time::timeout(std::time::Duration::from_secs(5), handle)
                .await
                .unwrap()
                .unwrap();
        }

        let statuses = engine.rule_statuses().await;
        assert_eq!(statuses[0].alerts[0].state, AlertState::Firing);
    }

    #[tokio::test]
    async fn test_unknown_group_index() {
        let store = Arc::new(SeriesStore::new(StoreOptions::default()));
        let queue = Arc::new(DispatchQueue::new(8, OverflowPolicy::Reject));
        let engine = engine(store, queue);

        assert!(engine.evaluate_group(7, Utc::now()).await.is_empty());
        assert_eq!(engine.rule_count(), 1);
    }

    #[test]
    fn test_zero_flush_interval_rejected() {
        let store: Arc<dyn SeriesReader> = Arc::new(SeriesStore::new(StoreOptions::default()));
        let options = EngineOptions {
            flush_interval: std::time::Duration::ZERO,
            ..EngineOptions::default()
        };
        let result = AlertEngine::new(
            Vec::new(),
            store,
            Inhibitor::default(),
            Arc::new(DispatchQueue::new(1, OverflowPolicy::Reject)),
            options,
        );
        assert!(matches!(result, Err(AblageError::Config(_))));
    }
}
