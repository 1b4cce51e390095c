use crate::query::{InstantSample, Selector, SeriesRange, TimeRange};
use crate::series::{IngestOutcome, Series};
use ablage_core::{MetricKind, OutOfOrderPolicy, Result, Sample, SeriesId};
use ablage_metrics::EngineMetrics;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// 存储配置
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// 数据保留时长
    pub retention: Duration,
    /// 写入延迟容忍度，读水位线 = now - ingestion_lag
    pub ingestion_lag: Duration,
    /// 瞬时查询回看窗口
    pub lookback: Duration,
    /// 按指标类型覆盖默认的乱序策略
    pub policy_overrides: HashMap<MetricKind, OutOfOrderPolicy>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            retention: Duration::hours(6),
            ingestion_lag: Duration::seconds(5),
            lookback: Duration::minutes(5),
            policy_overrides: HashMap::new(),
        }
    }
}

impl StoreOptions {
    pub fn policy_for(&self, kind: MetricKind) -> OutOfOrderPolicy {
        self.policy_overrides
            .get(&kind)
            .copied()
            .unwrap_or_else(|| OutOfOrderPolicy::default_for(kind))
    }
}

/// 存储统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub series: usize,
    pub samples: usize,
}

/// 只读序列访问 trait
///
/// 规则评估只依赖这个接口，测试中可以替换为固定数据。
#[async_trait]
pub trait SeriesReader: Send + Sync {
    /// 范围查询
    async fn select_range(&self, selector: &Selector, range: TimeRange) -> Vec<SeriesRange>;

    /// 瞬时查询
    async fn select_instant(&self, selector: &Selector, at: DateTime<Utc>) -> Vec<InstantSample>;

    /// 读水位线
    fn watermark(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now
    }
}

/// 内存时序存储
///
/// 序列表是分片的并发 map，每条序列各自持有读写锁，不存在跨序列的全局锁。
pub struct SeriesStore {
    series: DashMap<SeriesId, Arc<RwLock<Series>>>,
    options: StoreOptions,
    metrics: Option<Arc<EngineMetrics>>,
}

impl SeriesStore {
    pub fn new(options: StoreOptions) -> Self {
        info!(
            retention_secs = options.retention.num_seconds(),
            ingestion_lag_secs = options.ingestion_lag.num_seconds(),
            "Series store initialized"
        );

        Self {
            series: DashMap::new(),
            options,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<EngineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    /// 写入一个数据点
    pub async fn ingest(&self, id: SeriesId, kind: MetricKind, sample: Sample) -> Result<IngestOutcome> {
        let series = self.series_entry(id, kind);

        let result = {
            let mut guard = series.write().await;
            guard.append(sample, self.options.retention)
        };

        if let Some(metrics) = &self.metrics {
            match &result {
                Ok(outcome) => metrics.record_ingested(kind.as_str(), outcome.as_str()),
                Err(e) => metrics.record_rejected(e.kind()),
            }
        }

        result
    }

    fn series_entry(&self, id: SeriesId, kind: MetricKind) -> Arc<RwLock<Series>> {
        // 先走只读路径，避免每次写入都拿分片写锁
        if let Some(existing) = self.series.get(&id) {
            return existing.value().clone();
        }

        self.series
            .entry(id.clone())
            .or_insert_with(|| {
                debug!(series = %id, kind = kind.as_str(), "Series created");
                Arc::new(RwLock::new(Series::new(
                    id,
                    kind,
                    self.options.policy_for(kind),
                )))
            })
            .value()
            .clone()
    }

    fn matching(&self, selector: &Selector) -> Vec<Arc<RwLock<Series>>> {
        self.series
            .iter()
            .filter(|entry| selector.matches(entry.key()))
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// 按选择器做范围查询，结果按序列标识排序
    pub async fn query(&self, selector: &Selector, range: TimeRange) -> Vec<SeriesRange> {
        let mut results = Vec::new();
        for series in self.matching(selector) {
            let guard = series.read().await;
            let samples = guard.range(range.start, range.end);
            if !samples.is_empty() {
                results.push(SeriesRange::new(guard.id().clone(), guard.kind(), samples));
            }
        }
        results.sort_by(|a, b| a.id.cmp(&b.id));
        results
    }

    /// 按精确的序列标识查询
    pub async fn query_series(&self, id: &SeriesId, range: TimeRange) -> Option<SeriesRange> {
        let series = self.series.get(id).map(|entry| entry.value().clone())?;
        let guard = series.read().await;
        Some(SeriesRange::new(
            guard.id().clone(),
            guard.kind(),
            guard.range(range.start, range.end),
        ))
    }

    /// 每条匹配序列在 `at` 时刻回看窗口内的最新数据点
    pub async fn instant(&self, selector: &Selector, at: DateTime<Utc>, lookback: Duration) -> Vec<InstantSample> {
        let mut results = Vec::new();
        for series in self.matching(selector) {
            let guard = series.read().await;
            if let Some(sample) = guard.latest_at(at, lookback) {
                results.push(InstantSample {
                    id: guard.id().clone(),
                    sample,
                });
            }
        }
        results.sort_by(|a, b| a.id.cmp(&b.id));
        results
    }

    pub async fn stats(&self) -> StoreStats {
        let all: Vec<_> = self.series.iter().map(|e| e.value().clone()).collect();
        let mut stats = StoreStats {
            series: all.len(),
            samples: 0,
        };
        for series in all {
            stats.samples += series.read().await.len();
        }

        if let Some(metrics) = &self.metrics {
            metrics.set_store_size(stats.series, stats.samples);
        }
        stats
    }

    /// 删除最新数据点已超出保留窗口的整条序列，返回删除数量
    ///
    /// 只删除当前没有其他持有者、且未被锁住的序列；正在写入的序列留到下一轮。
    pub fn prune_stale(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.options.retention;
        let before = self.series.len();

        self.series.retain(|_, series| {
            if Arc::strong_count(series) > 1 {
                return true;
            }
            match series.try_read() {
                Ok(guard) => guard.last().is_some_and(|s| s.timestamp >= cutoff),
                Err(_) => true,
            }
        });

        let pruned = before.saturating_sub(self.series.len());
        if pruned > 0 {
            info!(pruned, "Stale series pruned");
        }
        pruned
    }

    pub fn series_count(&self) -> usize {
        self.series.len()
    }
}

#[async_trait]
impl SeriesReader for SeriesStore {
    async fn select_range(&self, selector: &Selector, range: TimeRange) -> Vec<SeriesRange> {
        self.query(selector, range).await
    }

    async fn select_instant(&self, selector: &Selector, at: DateTime<Utc>) -> Vec<InstantSample> {
        self.instant(selector, at, self.options.lookback).await
    }

    fn watermark(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.options.ingestion_lag
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ablage_core::{AblageError, LabelMatcher, Labels};
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn id(name: &str, a: &str) -> SeriesId {
        SeriesId::new(name, Labels::new().with("a", a))
    }

    #[tokio::test]
    async fn test_ingest_then_query_round_trip() {
        let store = SeriesStore::new(StoreOptions::default());
        store
            .ingest(id("x", "1"), MetricKind::Gauge, Sample::new(ts(10), 5.0))
            .await
            .unwrap();

        let range = store
            .query_series(&id("x", "1"), TimeRange::new(ts(0), ts(20)))
            .await
            .unwrap();

        let samples: Vec<Sample> = range.iter().collect();
        assert_eq!(samples, vec![Sample::new(ts(10), 5.0)]);
    }

    #[tokio::test]
    async fn test_counter_rejects_out_of_order() {
        let store = SeriesStore::new(StoreOptions::default());
        store
            .ingest(id("c", "1"), MetricKind::Counter, Sample::new(ts(20), 1.0))
            .await
            .unwrap();

        let err = store
            .ingest(id("c", "1"), MetricKind::Counter, Sample::new(ts(10), 2.0))
            .await
            .unwrap_err();
        assert!(matches!(err, AblageError::OutOfOrderSample { .. }));
    }

    #[tokio::test]
    async fn test_policy_override() {
        let mut options = StoreOptions::default();
        options
            .policy_overrides
            .insert(MetricKind::Counter, OutOfOrderPolicy::Overwrite);
        let store = SeriesStore::new(options);

        store
            .ingest(id("c", "1"), MetricKind::Counter, Sample::new(ts(20), 1.0))
            .await
            .unwrap();
        let outcome = store
            .ingest(id("c", "1"), MetricKind::Counter, Sample::new(ts(10), 2.0))
            .await
            .unwrap();
        assert_eq!(outcome, IngestOutcome::Inserted);
    }

    #[tokio::test]
    async fn test_query_by_selector() {
        let store = SeriesStore::new(StoreOptions::default());
        for a in ["1", "2", "3"] {
            store
                .ingest(id("x", a), MetricKind::Gauge, Sample::new(ts(10), 1.0))
                .await
                .unwrap();
        }
        store
            .ingest(id("y", "1"), MetricKind::Gauge, Sample::new(ts(10), 1.0))
            .await
            .unwrap();

        let selector = Selector::metric("x").with_matcher(
            LabelMatcher::new("a", ablage_core::MatchOp::NotEqual, "2").unwrap(),
        );
        let results = store.query(&selector, TimeRange::new(ts(0), ts(20))).await;

        let ids: Vec<_> = results.iter().map(|r| r.id.labels.value("a").to_string()).collect();
        assert_eq!(ids, vec!["1", "3"]);
    }

    #[tokio::test]
    async fn test_query_snapshot_is_isolated_from_later_writes() {
        let store = SeriesStore::new(StoreOptions::default());
        store
            .ingest(id("x", "1"), MetricKind::Gauge, Sample::new(ts(10), 1.0))
            .await
            .unwrap();

        let snapshot = store
            .query(&Selector::metric("x"), TimeRange::new(ts(0), ts(100)))
            .await;

        store
            .ingest(id("x", "1"), MetricKind::Gauge, Sample::new(ts(20), 2.0))
            .await
            .unwrap();

        assert_eq!(snapshot[0].len(), 1);
        assert_eq!(snapshot[0].iter().count(), 1);
    }

    #[tokio::test]
    async fn test_instant_and_watermark() {
        let store = SeriesStore::new(StoreOptions::default());
        store
            .ingest(id("x", "1"), MetricKind::Gauge, Sample::new(ts(100), 1.0))
            .await
            .unwrap();
        store
            .ingest(id("x", "1"), MetricKind::Gauge, Sample::new(ts(118), 2.0))
            .await
            .unwrap();

        // now = 120s，水位线 115s，118s 的数据点不可见
        let at = store.watermark(ts(120));
        let results = store.select_instant(&Selector::metric("x"), at).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].sample.value, 1.0);
    }

    #[tokio::test]
    async fn test_prune_stale_series() {
        let options = StoreOptions {
            retention: Duration::seconds(60),
            ..Default::default()
        };
        let store = SeriesStore::new(options);
        store
            .ingest(id("x", "old"), MetricKind::Gauge, Sample::new(ts(0), 1.0))
            .await
            .unwrap();
        store
            .ingest(id("x", "new"), MetricKind::Gauge, Sample::new(ts(100), 1.0))
            .await
            .unwrap();

        assert_eq!(store.prune_stale(ts(120)), 1);
        assert_eq!(store.series_count(), 1);

        let stats = store.stats().await;
        assert_eq!(stats, StoreStats { series: 1, samples: 1 });
    }

    #[tokio::test]
    async fn test_concurrent_ingest() {
        let store = Arc::new(SeriesStore::new(StoreOptions::default()));
        let mut handles = Vec::new();

        for worker in 0..4 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..50 {
                    let series = id("x", &worker.to_string());
                    store
                        .ingest(series, MetricKind::Counter, Sample::new(ts(i), i as f64))
                        .await
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let stats = store.stats().await;
        assert_eq!(stats.series, 4);
        assert_eq!(stats.samples, 200);
    }
}
