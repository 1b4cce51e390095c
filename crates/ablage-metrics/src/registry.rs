use crate::scope::MeasurementScope;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};

/// 引擎自身指标
///
/// 进程内只构建一次，通过 `Arc<EngineMetrics>` 显式传递给需要记录指标的组件。
pub struct EngineMetrics {
    // 写入指标
    samples_ingested_total: IntCounterVec,
    samples_rejected_total: IntCounterVec,
    series_active: IntGauge,
    samples_stored: IntGauge,

    // 规则评估指标
    rule_evaluations_total: IntCounterVec,
    rule_evaluation_failures_total: IntCounterVec,
    rule_group_duration_seconds: HistogramVec,
    rule_groups_in_progress: IntGaugeVec,
    rule_group_failures_total: IntCounterVec,

    // 告警指标
    alerts: IntGaugeVec,
    alerts_inhibited: IntGauge,

    // 通知指标
    notifications_sent_total: IntCounterVec,
    notifications_failed_total: IntCounterVec,
    notifications_dropped_total: IntCounter,
    notification_queue_length: IntGauge,
    notification_duration_seconds: HistogramVec,
    notifications_in_progress: IntGaugeVec,

    registry: Registry,
}

impl EngineMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("ablage".to_string()), None)?;

        let samples_ingested_total = IntCounterVec::new(
            Opts::new("samples_ingested_total", "Total number of samples accepted"),
            &["kind", "outcome"],
        )?;
        registry.register(Box::new(samples_ingested_total.clone()))?;

        let samples_rejected_total = IntCounterVec::new(
            Opts::new("samples_rejected_total", "Total number of samples rejected"),
            &["reason"],
        )?;
        registry.register(Box::new(samples_rejected_total.clone()))?;

        let series_active = IntGauge::new("series_active", "Number of series in the store")?;
        registry.register(Box::new(series_active.clone()))?;

        let samples_stored = IntGauge::new("samples_stored", "Number of samples retained")?;
        registry.register(Box::new(samples_stored.clone()))?;

        let rule_evaluations_total = IntCounterVec::new(
            Opts::new("rule_evaluations_total", "Total number of rule evaluations"),
            &["group", "rule"],
        )?;
        registry.register(Box::new(rule_evaluations_total.clone()))?;

        let rule_evaluation_failures_total = IntCounterVec::new(
            Opts::new(
                "rule_evaluation_failures_total",
                "Total number of failed rule evaluations",
            ),
            &["group", "rule", "reason"],
        )?;
        registry.register(Box::new(rule_evaluation_failures_total.clone()))?;

        let rule_group_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "rule_group_duration_seconds",
                "Duration of one rule group evaluation tick",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["group"],
        )?;
        registry.register(Box::new(rule_group_duration_seconds.clone()))?;

        let rule_groups_in_progress = IntGaugeVec::new(
            Opts::new(
                "rule_groups_in_progress",
                "Rule group evaluations currently running",
            ),
            &["group"],
        )?;
        registry.register(Box::new(rule_groups_in_progress.clone()))?;

        let rule_group_failures_total = IntCounterVec::new(
            Opts::new(
                "rule_group_failures_total",
                "Rule group ticks with at least one failed rule",
            ),
            &["group"],
        )?;
        registry.register(Box::new(rule_group_failures_total.clone()))?;

        let alerts = IntGaugeVec::new(
            Opts::new("alerts", "Number of alert instances by state"),
            &["state"],
        )?;
        registry.register(Box::new(alerts.clone()))?;

        let alerts_inhibited = IntGauge::new("alerts_inhibited", "Number of inhibited alerts")?;
        registry.register(Box::new(alerts_inhibited.clone()))?;

        let notifications_sent_total = IntCounterVec::new(
            Opts::new("notifications_sent_total", "Total number of delivered alert events"),
            &["channel", "state"],
        )?;
        registry.register(Box::new(notifications_sent_total.clone()))?;

        let notifications_failed_total = IntCounterVec::new(
            Opts::new(
                "notifications_failed_total",
                "Total number of alert events that exhausted delivery retries",
            ),
            &["channel"],
        )?;
        registry.register(Box::new(notifications_failed_total.clone()))?;

        let notifications_dropped_total = IntCounter::new(
            "notifications_dropped_total",
            "Total number of notification batches dropped on queue overflow",
        )?;
        registry.register(Box::new(notifications_dropped_total.clone()))?;

        let notification_queue_length = IntGauge::new(
            "notification_queue_length",
            "Number of notification batches waiting for dispatch",
        )?;
        registry.register(Box::new(notification_queue_length.clone()))?;

        let notification_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "notification_duration_seconds",
                "Duration of a single delivery attempt",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]),
            &["channel"],
        )?;
        registry.register(Box::new(notification_duration_seconds.clone()))?;

        let notifications_in_progress = IntGaugeVec::new(
            Opts::new(
                "notifications_in_progress",
                "Delivery attempts currently running",
            ),
            &["channel"],
        )?;
        registry.register(Box::new(notifications_in_progress.clone()))?;

        Ok(Self {
            samples_ingested_total,
            samples_rejected_total,
            series_active,
            samples_stored,
            rule_evaluations_total,
            rule_evaluation_failures_total,
            rule_group_duration_seconds,
            rule_groups_in_progress,
            rule_group_failures_total,
            alerts,
            alerts_inhibited,
            notifications_sent_total,
            notifications_failed_total,
            notifications_dropped_total,
            notification_queue_length,
            notification_duration_seconds,
            notifications_in_progress,
            registry,
        })
    }

    // 写入指标记录
    pub fn record_ingested(&self, kind: &str, outcome: &str) {
        self.samples_ingested_total
            .with_label_values(&[kind, outcome])
            .inc();
    }

    pub fn record_rejected(&self, reason: &str) {
        self.samples_rejected_total
            .with_label_values(&[reason])
            .inc();
    }

    pub fn set_store_size(&self, series: usize, samples: usize) {
        self.series_active.set(series as i64);
        self.samples_stored.set(samples as i64);
    }

    // 规则评估指标记录
    pub fn record_rule_evaluation(&self, group: &str, rule: &str) {
        self.rule_evaluations_total
            .with_label_values(&[group, rule])
            .inc();
    }

    pub fn record_rule_failure(&self, group: &str, rule: &str, reason: &str) {
        self.rule_evaluation_failures_total
            .with_label_values(&[group, rule, reason])
            .inc();
    }

    /// 一次规则组评估的测量作用域
    pub fn rule_group_scope(&self, group: &str) -> MeasurementScope {
        MeasurementScope::enter(
            self.rule_group_duration_seconds.with_label_values(&[group]),
            self.rule_groups_in_progress.with_label_values(&[group]),
        )
        .with_failure_counter(self.rule_group_failures_total.with_label_values(&[group]))
    }

    // 告警指标记录
    pub fn set_alerts(&self, state: &str, count: usize) {
        self.alerts.with_label_values(&[state]).set(count as i64);
    }

    pub fn set_inhibited(&self, count: usize) {
        self.alerts_inhibited.set(count as i64);
    }

    // 通知指标记录
    pub fn record_notification(&self, channel: &str, state: &str) {
        self.notifications_sent_total
            .with_label_values(&[channel, state])
            .inc();
    }

    /// 一次投递尝试的测量作用域
    pub fn delivery_scope(&self, channel: &str) -> MeasurementScope {
        MeasurementScope::enter(
            self.notification_duration_seconds.with_label_values(&[channel]),
            self.notifications_in_progress.with_label_values(&[channel]),
        )
        .with_failure_counter(self.notifications_failed_total.with_label_values(&[channel]))
    }

    pub fn record_notification_dropped(&self) {
        self.notifications_dropped_total.inc();
    }

    pub fn set_queue_length(&self, length: usize) {
        self.notification_queue_length.set(length as i64);
    }

    // 导出指标
    pub fn export(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
