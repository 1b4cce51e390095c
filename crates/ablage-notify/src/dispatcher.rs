use crate::event::{AlertEvent, EventState, NotificationBatch};
use crate::notifier::Notifier;
use ablage_core::OverflowPolicy;
use ablage_metrics::EngineMetrics;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// 入队错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("Notification queue is full ({0} batches)")]
    Full(usize),

    #[error("Notification queue is closed")]
    Closed,
}

/// 入队结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// 队列已满，丢弃了最旧的批次
    DroppedOldest,
}

/// 评估与投递之间的有界队列
///
/// 评估侧只做入队，不会因为渠道缓慢而阻塞。
pub struct DispatchQueue {
    inner: Mutex<VecDeque<NotificationBatch>>,
    capacity: usize,
    policy: OverflowPolicy,
    notify: Notify,
    closed: AtomicBool,
    metrics: Option<Arc<EngineMetrics>>,
}

impl DispatchQueue {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            policy,
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<EngineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn push(&self, batch: NotificationBatch) -> Result<EnqueueOutcome, QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }

        let mut queue = self.inner.lock().await;
        let mut outcome = EnqueueOutcome::Queued;

        if queue.len() >= self.capacity {
            match self.policy {
                OverflowPolicy::Reject => {
                    warn!(group = %batch.group_key, capacity = self.capacity, "Notification queue full, batch rejected");
                    self.record_dropped();
                    return Err(QueueError::Full(self.capacity));
                }
                OverflowPolicy::DropOldest => {
                    if let Some(dropped) = queue.pop_front() {
                        warn!(group = %dropped.group_key, capacity = self.capacity, "Notification queue full, oldest batch dropped");
                    }
                    self.record_dropped();
                    outcome = EnqueueOutcome::DroppedOldest;
                }
            }
        }

        queue.push_back(batch);
        self.record_length(queue.len());
        drop(queue);

        self.notify.notify_one();
        Ok(outcome)
    }

    /// 取出下一个批次；队列关闭且已清空时返回 `None`
    pub async fn pop(&self) -> Option<NotificationBatch> {
        loop {
            let notified = self.notify.notified();
            {
                let mut queue = self.inner.lock().await;
                if let Some(batch) = queue.pop_front() {
                    self.record_length(queue.len());
                    return Some(batch);
                }
                if self.is_closed() {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// 关闭队列：不再接受新批次，已入队的批次仍可取出
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }

    fn record_dropped(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.record_notification_dropped();
        }
    }

    fn record_length(&self, length: usize) {
        if let Some(metrics) = &self.metrics {
            metrics.set_queue_length(length);
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff() -> Duration {
    Duration::from_millis(500)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(30)
}

/// 指数退避重试策略
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff", with = "humantime_serde")]
    pub initial_backoff: Duration,
    #[serde(default = "default_max_backoff", with = "humantime_serde")]
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
        }
    }
}

impl RetryPolicy {
    /// 第 `attempt` 次失败后的等待时间（从 1 开始）
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

/// 一次分发的统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// 账本中的一条投递记录
#[derive(Debug, Clone, Copy)]
struct LedgerEntry {
    delivered_at: Instant,
    /// firing 已投递、对应的 resolved 还没投递
    open: bool,
}

/// 通知分发器
///
/// 每个渠道维护独立的投递账本（幂等键 → 投递记录）：
/// - 已投递过的幂等键不会重复投递
/// - resolved 事件只投递给已经成功投递过对应 firing 事件的渠道
/// - 重试只重发尚未送达的事件，送达一个记一个
/// - TTL 只清理已关闭的记录；仍在 firing 的记录一直保留到 resolved 送达
pub struct Dispatcher {
    channels: Vec<Arc<dyn Notifier>>,
    retry: RetryPolicy,
    dedup_ttl: Duration,
    ledger: HashMap<String, HashMap<String, LedgerEntry>>,
    metrics: Option<Arc<EngineMetrics>>,
}

impl Dispatcher {
    pub fn new(retry: RetryPolicy, dedup_ttl: Duration) -> Self {
        Self {
            channels: Vec::new(),
            retry,
            dedup_ttl,
            ledger: HashMap::new(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<EngineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// 注册通知渠道
    pub fn register(&mut self, notifier: Arc<dyn Notifier>) {
        info!(channel = notifier.name(), "Registered notification channel");
        self.channels.push(notifier);
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// 持续消费队列，直到队列关闭并清空
    pub async fn run(mut self, queue: Arc<DispatchQueue>) {
        info!(channels = self.channels.len(), "Notification dispatcher started");

        while let Some(batch) = queue.pop().await {
            let report = self.dispatch(&batch).await;
            debug!(
                group = %batch.group_key,
                delivered = report.delivered,
                skipped = report.skipped,
                failed = report.failed,
                "Batch dispatched"
            );
        }

        info!("Notification dispatcher drained and stopped");
    }

    /// 把一个批次投递到所有启用的渠道
    pub async fn dispatch(&mut self, batch: &NotificationBatch) -> DispatchReport {
        self.expire_ledger();

        let mut report = DispatchReport::default();
        let channels = self.channels.clone();

        for channel in channels.iter().filter(|c| c.is_enabled()) {
            let pending = self.pending_for(channel.name(), &batch.events);
            report.skipped += batch.events.len() - pending.len();

            if pending.is_empty() {
                continue;
            }

            let delivered = self.deliver_with_retry(channel.as_ref(), &pending).await;
            report.delivered += delivered;
            report.failed += pending.len() - delivered;
        }

        report
    }

    fn pending_for(&self, channel: &str, events: &[AlertEvent]) -> Vec<AlertEvent> {
        let delivered = self.ledger.get(channel);
        let seen = |key: &str| delivered.is_some_and(|entries| entries.contains_key(key));

        events
            .iter()
            .filter(|event| {
                if seen(&event.dedup_key) {
                    debug!(channel, key = %event.dedup_key, "Duplicate event suppressed");
                    return false;
                }
                if event.state == EventState::Resolved && !seen(&event.firing_key()) {
                    debug!(channel, key = %event.dedup_key, "Resolved event without delivered firing skipped");
                    return false;
                }
                true
            })
            .cloned()
            .collect()
    }

    /// 带退避地投递，返回最终送达的事件数
    ///
    /// 每次失败后只重发尚未送达的剩余事件；已送达的事件立即记账，
    /// 即使后续重试耗尽也不会丢失记录。
    async fn deliver_with_retry(&mut self, channel: &dyn Notifier, events: &[AlertEvent]) -> usize {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut sent = 0;

        for attempt in 1..=max_attempts {
            let mut scope = self
                .metrics
                .as_ref()
                .map(|metrics| metrics.delivery_scope(channel.name()));

            let remaining = &events[sent..];
            let partial = match channel.deliver_batch(remaining).await {
                Ok(()) => {
                    self.record_delivered(channel.name(), remaining);
                    return events.len();
                }
                Err(partial) => partial,
            };

            let delivered = partial.delivered.min(remaining.len());
            self.record_delivered(channel.name(), &remaining[..delivered]);
            sent += delivered;

            let e = partial.error;
            if attempt == max_attempts || !e.is_retryable() {
                if let Some(scope) = scope.as_mut() {
                    scope.fail();
                }
                error!(
                    channel = channel.name(),
                    attempts = attempt,
                    delivered = sent,
                    undelivered = events.len() - sent,
                    error = %e,
                    "Notification delivery failed"
                );
                return sent;
            }

            let backoff = self.retry.backoff(attempt);
            warn!(
                channel = channel.name(),
                attempt,
                remaining = events.len() - sent,
                backoff_ms = backoff.as_millis() as u64,
                error = %e,
                "Notification delivery failed, retrying"
            );
            drop(scope);
            tokio::time::sleep(backoff).await;
        }

        sent
    }

    fn record_delivered(&mut self, channel: &str, events: &[AlertEvent]) {
        if events.is_empty() {
            return;
        }

        let now = Instant::now();
        let entries = self.ledger.entry(channel.to_string()).or_default();
        for event in events {
            match event.state {
                EventState::Firing => {
                    entries.insert(
                        event.dedup_key.clone(),
                        LedgerEntry {
                            delivered_at: now,
                            open: true,
                        },
                    );
                }
                EventState::Resolved => {
                    if let Some(firing) = entries.get_mut(&event.firing_key()) {
                        firing.open = false;
                        firing.delivered_at = now;
                    }
                    entries.insert(
                        event.dedup_key.clone(),
                        LedgerEntry {
                            delivered_at: now,
                            open: false,
                        },
                    );
                }
            }
            if let Some(metrics) = &self.metrics {
                metrics.record_notification(channel, event.state.as_str());
            }
        }
    }

    fn expire_ledger(&mut self) {
        let ttl = self.dedup_ttl;
        for entries in self.ledger.values_mut() {
            entries.retain(|_, entry| entry.open || entry.delivered_at.elapsed() < ttl);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::DeliveryError;
    use ablage_core::Labels;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct RecordingNotifier {
        delivered: std::sync::Mutex<Vec<AlertEvent>>,
        failures_left: AtomicUsize,
        attempts: AtomicUsize,
        /// 第 n 次调用失败（从 1 计）
        fail_on_calls: Vec<usize>,
        /// 这个 service 的事件总是失败
        broken_service: Option<&'static str>,
    }

    impl RecordingNotifier {
        fn failing(times: usize) -> Self {
            Self {
                failures_left: AtomicUsize::new(times),
                ..Default::default()
            }
        }

        fn failing_on(calls: &[usize]) -> Self {
            Self {
                fail_on_calls: calls.to_vec(),
                ..Default::default()
            }
        }

        fn broken_for(service: &'static str) -> Self {
            Self {
                broken_service: Some(service),
                ..Default::default()
            }
        }

        fn delivered_services(&self) -> Vec<(String, EventState)> {
            self.delivered()
                .iter()
                .map(|e| (e.labels.value("service").to_string(), e.state))
                .collect()
        }

        fn delivered(&self) -> Vec<AlertEvent> {
            self.delivered.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn deliver(&self, event: &AlertEvent) -> Result<(), DeliveryError> {
            let call = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_on_calls.contains(&call)
                || self.broken_service.is_some_and(|s| event.labels.value("service") == s)
            {
                return Err(DeliveryError::Transport("connection reset".into()));
            }
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(DeliveryError::Transport("connection refused".into()));
            }
            self.delivered.lock().unwrap().push(event.clone());
            Ok(())
        }

        fn name(&self) -> &str {
            "recording"
        }
    }

    fn started() -> DateTime<Utc> {
        Utc.timestamp_opt(1_000, 0).unwrap()
    }

    fn event(state: EventState) -> AlertEvent {
        AlertEvent::new(
            "HighErrorRate",
            Labels::new().with("alertname", "HighErrorRate"),
            state,
            started(),
            0.1,
        )
    }

    fn service_event(service: &str, state: EventState) -> AlertEvent {
        AlertEvent::new(
            "HighErrorRate",
            Labels::new()
                .with("alertname", "HighErrorRate")
                .with("service", service),
            state,
            started(),
            0.1,
        )
    }

    fn batch(events: Vec<AlertEvent>) -> NotificationBatch {
        NotificationBatch::new(Labels::new(), events, started())
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
        };

        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(4), Duration::from_millis(800));
        assert_eq!(policy.backoff(5), Duration::from_secs(1));
        assert_eq!(policy.backoff(50), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_queue_drop_oldest() {
        let queue = DispatchQueue::new(2, OverflowPolicy::DropOldest);
        for i in 0..3 {
            let b = NotificationBatch::new(Labels::new().with("n", i.to_string()), vec![], started());
            queue.push(b).await.unwrap();
        }

        assert_eq!(queue.len().await, 2);
        let first = queue.pop().await.unwrap();
        assert_eq!(first.group_labels.value("n"), "1");
    }

    #[tokio::test]
    async fn test_queue_reject_when_full() {
        let queue = DispatchQueue::new(1, OverflowPolicy::Reject);
        queue.push(batch(vec![])).await.unwrap();

        let err = queue.push(batch(vec![])).await.unwrap_err();
        assert_eq!(err, QueueError::Full(1));
    }

    #[tokio::test]
    async fn test_queue_drains_after_close() {
        let queue = Arc::new(DispatchQueue::new(4, OverflowPolicy::DropOldest));
        queue.push(batch(vec![])).await.unwrap();
        queue.close();

        tokio_test::assert_err!(queue.push(batch(vec![])).await);
        assert!(queue.pop().await.is_some());
        assert!(queue.pop().await.is_none());
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push() {
        let queue = Arc::new(DispatchQueue::new(4, OverflowPolicy::DropOldest));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::task::yield_now().await;
        queue.push(batch(vec![event(EventState::Firing)])).await.unwrap();

        let received = consumer.await.unwrap().unwrap();
        assert_eq!(received.len(), 1);
    }

    #[tokio::test]
    async fn test_retried_batch_is_not_delivered_twice() {
        let channel = Arc::new(RecordingNotifier::default());
        let mut dispatcher = Dispatcher::new(fast_retry(3), Duration::from_secs(3600));
        dispatcher.register(channel.clone());

        let firing = batch(vec![event(EventState::Firing)]);
        let first = dispatcher.dispatch(&firing).await;
        let second = dispatcher.dispatch(&firing).await;

        assert_eq!(first.delivered, 1);
        assert_eq!(second.skipped, 1);
        assert_eq!(channel.delivered().len(), 1);
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let channel = Arc::new(RecordingNotifier::failing(2));
        let mut dispatcher = Dispatcher::new(fast_retry(3), Duration::from_secs(3600));
        dispatcher.register(channel.clone());

        let report = dispatcher.dispatch(&batch(vec![event(EventState::Firing)])).await;

        assert_eq!(report.delivered, 1);
        assert_eq!(channel.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_records_failure() {
        let metrics = Arc::new(EngineMetrics::new().unwrap());
        let channel = Arc::new(RecordingNotifier::failing(10));
        let mut dispatcher =
            Dispatcher::new(fast_retry(2), Duration::from_secs(3600)).with_metrics(metrics.clone());
        dispatcher.register(channel.clone());

        let report = dispatcher.dispatch(&batch(vec![event(EventState::Firing)])).await;

        assert_eq!(report.failed, 1);
        assert_eq!(channel.attempts.load(Ordering::SeqCst), 2);
        let exported = metrics.export().unwrap();
        assert!(exported.contains("ablage_notifications_failed_total{channel=\"recording\"} 1"));
    }

    #[tokio::test]
    async fn test_retry_resends_only_undelivered_events() {
        // 第一个事件送达，第二个失败一次
        let channel = Arc::new(RecordingNotifier::failing_on(&[2]));
        let mut dispatcher = Dispatcher::new(fast_retry(3), Duration::from_secs(3600));
        dispatcher.register(channel.clone());

        let report = dispatcher
            .dispatch(&batch(vec![
                service_event("api", EventState::Firing),
                service_event("db", EventState::Firing),
            ]))
            .await;

        assert_eq!(report, DispatchReport { delivered: 2, skipped: 0, failed: 0 });
        assert_eq!(channel.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(
            channel.delivered_services(),
            vec![("api".to_string(), EventState::Firing), ("db".to_string(), EventState::Firing)]
        );
    }

    #[tokio::test]
    async fn test_exhausted_retry_keeps_delivered_events_in_ledger() {
        let metrics = Arc::new(EngineMetrics::new().unwrap());
        let channel = Arc::new(RecordingNotifier::broken_for("db"));
        let mut dispatcher =
            Dispatcher::new(fast_retry(2), Duration::from_secs(3600)).with_metrics(metrics.clone());
        dispatcher.register(channel.clone());

        let firing = batch(vec![
            service_event("api", EventState::Firing),
            service_event("db", EventState::Firing),
        ]);
        let report = dispatcher.dispatch(&firing).await;
        assert_eq!(report, DispatchReport { delivered: 1, skipped: 0, failed: 1 });
        // api 一次，db 两次
        assert_eq!(channel.attempts.load(Ordering::SeqCst), 3);

        // 再次投递同一批：api 已记账，只重试 db
        let again = dispatcher.dispatch(&firing).await;
        assert_eq!(again.skipped, 1);
        assert_eq!(again.failed, 1);

        let resolved = dispatcher
            .dispatch(&batch(vec![
                service_event("api", EventState::Resolved),
                service_event("db", EventState::Resolved),
            ]))
            .await;
        assert_eq!(resolved.delivered, 1);
        assert_eq!(resolved.skipped, 1);
        assert_eq!(
            channel.delivered_services(),
            vec![("api".to_string(), EventState::Firing), ("api".to_string(), EventState::Resolved)]
        );

        let exported = metrics.export().unwrap();
        assert!(exported.contains("ablage_notifications_failed_total{channel=\"recording\"} 2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_firing_survives_dedup_ttl() {
        let channel = Arc::new(RecordingNotifier::default());
        let ttl = Duration::from_secs(24 * 3600);
        let mut dispatcher = Dispatcher::new(fast_retry(1), ttl);
        dispatcher.register(channel.clone());

        dispatcher.dispatch(&batch(vec![event(EventState::Firing)])).await;
        tokio::time::advance(Duration::from_secs(25 * 3600)).await;

        let report = dispatcher.dispatch(&batch(vec![event(EventState::Resolved)])).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(channel.delivered().len(), 2);

        // 关闭后的记录照常按 TTL 过期
        tokio::time::advance(Duration::from_secs(25 * 3600)).await;
        dispatcher.dispatch(&batch(vec![])).await;
        assert!(dispatcher.ledger["recording"].is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_entries_suppress_duplicates_within_ttl() {
        let channel = Arc::new(RecordingNotifier::default());
        let mut dispatcher = Dispatcher::new(fast_retry(1), Duration::from_secs(3600));
        dispatcher.register(channel.clone());

        dispatcher.dispatch(&batch(vec![event(EventState::Firing)])).await;
        dispatcher.dispatch(&batch(vec![event(EventState::Resolved)])).await;
        tokio::time::advance(Duration::from_secs(60)).await;

        let replay = dispatcher
            .dispatch(&batch(vec![event(EventState::Firing), event(EventState::Resolved)]))
            .await;
        assert_eq!(replay.skipped, 2);
        assert_eq!(channel.delivered().len(), 2);
    }

    #[tokio::test]
    async fn test_resolved_requires_delivered_firing() {
        let channel = Arc::new(RecordingNotifier::default());
        let mut dispatcher = Dispatcher::new(fast_retry(1), Duration::from_secs(3600));
        dispatcher.register(channel.clone());

        // firing 从未投递成功，resolved 不应发出
        let report = dispatcher.dispatch(&batch(vec![event(EventState::Resolved)])).await;
        assert_eq!(report.skipped, 1);
        assert!(channel.delivered().is_empty());

        dispatcher.dispatch(&batch(vec![event(EventState::Firing)])).await;
        dispatcher.dispatch(&batch(vec![event(EventState::Resolved)])).await;

        let states: Vec<EventState> = channel.delivered().iter().map(|e| e.state).collect();
        assert_eq!(states, vec![EventState::Firing, EventState::Resolved]);
    }

    #[tokio::test]
    async fn test_run_drains_queue_on_close() {
        let channel = Arc::new(RecordingNotifier::default());
        let mut dispatcher = Dispatcher::new(fast_retry(1), Duration::from_secs(3600));
        dispatcher.register(channel.clone());

        let queue = Arc::new(DispatchQueue::new(8, OverflowPolicy::DropOldest));
        queue.push(batch(vec![event(EventState::Firing)])).await.unwrap();
        queue.push(batch(vec![event(EventState::Resolved)])).await.unwrap();
        queue.close();

        dispatcher.run(queue.clone()).await;

        assert_eq!(channel.delivered().len(), 2);
        assert!(queue.is_empty().await);
    }
}
