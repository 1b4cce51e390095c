use ablage_alert::{
    AlertEngine, EngineOptions, InhibitRuleDefinition, Inhibitor, RouteConfig, RuleGroup,
    RuleGroupDefinition,
};
use ablage_core::{Labels, MetricKind, OverflowPolicy, Sample, SeriesId};
use ablage_notify::{
    AlertEvent, DeliveryError, DispatchQueue, Dispatcher, EventState, Notifier, RetryPolicy,
};
use ablage_tsdb::{SeriesStore, StoreOptions};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct RecordingNotifier {
    delivered: Mutex<Vec<AlertEvent>>,
}

impl RecordingNotifier {
    fn delivered(&self) -> Vec<(String, EventState)> {
        self.delivered
            .lock()
            .unwrap()
            .iter()
            .map(|e| (e.rule.clone(), e.state))
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn deliver(&self, event: &AlertEvent) -> Result<(), DeliveryError> {
        self.delivered.lock().unwrap().push(event.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        "recording"
    }
}

struct Harness {
    store: Arc<SeriesStore>,
    engine: AlertEngine,
    queue: Arc<DispatchQueue>,
    dispatcher: Dispatcher,
    notifier: Arc<RecordingNotifier>,
}

impl Harness {
    fn new(group: serde_json::Value, inhibit_rules: &[InhibitRuleDefinition]) -> Self {
        let store = Arc::new(SeriesStore::new(StoreOptions {
            ingestion_lag: Duration::zero(),
            ..StoreOptions::default()
        }));
        let queue = Arc::new(DispatchQueue::new(64, OverflowPolicy::Reject));

        let definition: RuleGroupDefinition = serde_json::from_value(group).unwrap();
        let options = EngineOptions {
            route: RouteConfig {
                group_by: Vec::new(),
                group_wait: std::time::Duration::ZERO,
                group_interval: std::time::Duration::ZERO,
            },
            ..EngineOptions::default()
        };
        let engine = AlertEngine::new(
            vec![RuleGroup::compile(&definition).unwrap()],
            store.clone(),
            Inhibitor::compile(inhibit_rules).unwrap(),
            queue.clone(),
            options,
        )
        .unwrap();

        let notifier = Arc::new(RecordingNotifier::default());
        let mut dispatcher = Dispatcher::new(RetryPolicy::default(), std::time::Duration::from_secs(3600));
        dispatcher.register(notifier.clone());

        Self {
            store,
            engine,
            queue,
            dispatcher,
            notifier,
        }
    }

    async fn set(&self, name: &str, service: &str, t: i64, value: f64) {
        let id = SeriesId::new(name, Labels::new().with("service", service));
        self.store
            .ingest(id, MetricKind::Gauge, Sample::new(at(t), value))
            .await
            .unwrap();
    }

    /// 评估一轮并把产生的批次全部分发
    async fn tick(&mut self, t: i64) {
        self.engine.tick(0, at(t)).await;
        while !self.queue.is_empty().await {
            if let Some(batch) = self.queue.pop().await {
                self.dispatcher.dispatch(&batch).await;
            }
        }
    }
}

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

#[tokio::test]
async fn test_sustained_breach_fires_once_and_resolves_once() {
    let mut harness = Harness::new(
        serde_json::json!({
            "name": "api",
            "interval": "30s",
            "rules": [{
                "alert": "HighErrorRate",
                "expr": "error_rate > 0.05",
                "for": "5m",
                "annotations": { "summary": "{{ $labels.service }} error rate {{ $value | humanizePercentage }}" }
            }]
        }),
        &[],
    );

    for tick in 0..=20 {
        let t = tick * 30;
        harness.set("error_rate", "api", t, 0.1).await;
        harness.tick(t).await;

        let delivered = harness.notifier.delivered();
        if t < 300 {
            assert!(delivered.is_empty(), "fired early at t={}", t);
        } else {
            assert_eq!(delivered.len(), 1);
        }
    }

    for tick in 21..=30 {
        let t = tick * 30;
        harness.set("error_rate", "api", t, 0.01).await;
        harness.tick(t).await;
    }

    assert_eq!(
        harness.notifier.delivered(),
        vec![
            ("HighErrorRate".to_string(), EventState::Firing),
            ("HighErrorRate".to_string(), EventState::Resolved),
        ]
    );

    let events = harness.notifier.delivered.lock().unwrap().clone();
    assert_eq!(events[0].started_at, at(0));
    assert_eq!(events[0].annotations["summary"], "api error rate 10%");
    assert_eq!(events[1].resolved_at, Some(at(630)));
}

#[tokio::test]
async fn test_inhibition_lifts_within_one_cycle() {
    let inhibit = InhibitRuleDefinition {
        source_match: r#"{severity="critical"}"#.to_string(),
        target_match: r#"{severity="warning"}"#.to_string(),
        equal: vec!["service".to_string()],
    };
    let mut harness = Harness::new(
        serde_json::json!({
            "name": "api",
            "rules": [
                { "alert": "ServiceDown", "expr": "up == 0", "severity": "critical" },
                { "alert": "HighLatency", "expr": "latency > 1", "severity": "warning" }
            ]
        }),
        &[inhibit],
    );

    harness.set("up", "api", 0, 0.0).await;
    harness.set("latency", "api", 0, 2.0).await;
    harness.tick(0).await;

    assert_eq!(
        harness.notifier.delivered(),
        vec![("ServiceDown".to_string(), EventState::Firing)]
    );

    let alerts = harness.engine.active_alerts().await;
    let latency = alerts.iter().find(|a| a.instance.rule == "HighLatency").unwrap();
    assert_eq!(latency.inhibited_by.as_ref().map(|s| s.rule_index), Some(0));

    harness.set("up", "api", 30, 1.0).await;
    harness.set("latency", "api", 30, 2.0).await;
    harness.tick(30).await;

    let delivered = harness.notifier.delivered();
    assert_eq!(delivered.len(), 3);
    assert!(delivered.contains(&("ServiceDown".to_string(), EventState::Resolved)));
    assert!(delivered.contains(&("HighLatency".to_string(), EventState::Firing)));

    let alerts = harness.engine.active_alerts().await;
    assert!(alerts.iter().all(|a| a.inhibited_by.is_none()));
}

#[tokio::test]
async fn test_unhealthy_rule_does_not_block_group() {
    let mut harness = Harness::new(
        serde_json::json!({
            "name": "api",
            "rules": [
                { "alert": "Ratio", "expr": "errors / requests > 0.5" },
                { "alert": "Errors", "expr": "errors > 0" }
            ]
        }),
        &[],
    );

    harness.set("errors", "api", 0, 3.0).await;
    harness.set("requests", "api", 0, 0.0).await;
    harness.tick(0).await;

    assert_eq!(
        harness.notifier.delivered(),
        vec![("Errors".to_string(), EventState::Firing)]
    );

    let statuses = harness.engine.rule_statuses().await;
    assert_eq!(statuses[0].health.as_str(), "err");
    assert_eq!(statuses[1].health.as_str(), "ok");
}
