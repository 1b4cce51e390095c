use crate::expr::{evaluate_condition, Condition, EvalContext, EvalPoint, Fetched, SelectorRef};
use crate::rule::AlertRule;
use crate::state::{AlertInstance, AlertStateMachine, TransitionRecord};
use ablage_core::{Labels, NoDataState, Result};
use ablage_tsdb::{SeriesReader, TimeRange};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// 规则健康状态
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "health", content = "error", rename_all = "lowercase")]
pub enum RuleHealth {
    /// 尚未评估
    Unknown,
    Ok,
    Err(String),
}

impl RuleHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleHealth::Unknown => "unknown",
            RuleHealth::Ok => "ok",
            RuleHealth::Err(_) => "err",
        }
    }
}

/// 规则求值器
///
/// 每次评估先在水位线处预取表达式引用的全部序列，再同步求值。
#[derive(Clone)]
pub struct RuleEvaluator {
    reader: Arc<dyn SeriesReader>,
}

impl RuleEvaluator {
    pub fn new(reader: Arc<dyn SeriesReader>) -> Self {
        Self { reader }
    }

    /// 在 `now` 对应的水位线处预取数据
    pub async fn fetch(&self, condition: &Condition, now: DateTime<Utc>) -> EvalContext {
        let watermark = self.reader.watermark(now);
        let mut ctx = EvalContext::new();

        for selector in condition.expr.selectors() {
            let data = match &selector {
                SelectorRef::Instant(sel) => Fetched::Instant(self.reader.select_instant(sel, watermark).await),
                SelectorRef::Range(sel, window) => Fetched::Range(
                    self.reader
                        .select_range(sel, TimeRange::ending_at(watermark, *window))
                        .await,
                ),
            };
            ctx.insert(&selector, data);
        }

        ctx
    }

    pub async fn evaluate(&self, rule: &AlertRule, now: DateTime<Utc>) -> Result<Vec<EvalPoint>> {
        let ctx = self.fetch(&rule.condition, now).await;
        evaluate_condition(&rule.condition, &ctx)
    }
}

/// 一条规则的运行时：编译后的规则 + 实例状态 + 健康状态
#[derive(Debug)]
pub struct RuleRuntime {
    rule: AlertRule,
    machine: AlertStateMachine,
    health: RuleHealth,
    last_evaluation: Option<DateTime<Utc>>,
}

impl RuleRuntime {
    pub fn new(rule: AlertRule) -> Self {
        Self {
            rule,
            machine: AlertStateMachine::new(),
            health: RuleHealth::Unknown,
            last_evaluation: None,
        }
    }

    pub fn rule(&self) -> &AlertRule {
        &self.rule
    }

    pub fn health(&self) -> &RuleHealth {
        &self.health
    }

    pub fn last_evaluation(&self) -> Option<DateTime<Utc>> {
        self.last_evaluation
    }

    pub fn instances(&self) -> impl Iterator<Item = &AlertInstance> {
        self.machine.instances()
    }

    /// 将一次求值结果应用到状态机
    ///
    /// `NoData` 按规则的无数据策略处理；其余错误只标记规则不健康，实例状态保持不变。
    pub fn apply(
        &mut self,
        outcome: Result<Vec<EvalPoint>>,
        now: DateTime<Utc>,
        default_retention: Duration,
    ) -> Vec<TransitionRecord> {
        self.last_evaluation = Some(now);

        let points = match outcome {
            Ok(points) => points,
            Err(e) if e.is_no_data() => {
                debug!(rule = %self.rule.name, policy = ?self.rule.no_data_state, "Rule returned no data");
                match self.rule.no_data_state {
                    NoDataState::Ok => Vec::new(),
                    NoDataState::Alerting => vec![EvalPoint {
                        labels: Labels::new(),
                        value: f64::NAN,
                        breaching: true,
                    }],
                    NoDataState::KeepState => {
                        self.health = RuleHealth::Ok;
                        return Vec::new();
                    }
                }
            }
            Err(e) => {
                warn!(rule = %self.rule.name, error = %e, "Rule evaluation failed");
                self.health = RuleHealth::Err(e.to_string());
                return Vec::new();
            }
        };

        self.health = RuleHealth::Ok;
        self.machine.observe(&self.rule, &points, now, default_retention)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::RuleDefinition;
    use crate::state::{AlertState, Transition};
    use ablage_core::{AblageError, MetricKind, Sample, SeriesId};
    use ablage_tsdb::{SeriesStore, StoreOptions};
    use chrono::TimeZone;

    fn rule(expr: &str, no_data_state: &str) -> AlertRule {
        let definition: RuleDefinition = serde_json::from_value(serde_json::json!({
            "alert": "Test",
            "expr": expr,
            "no_data_state": no_data_state,
        }))
        .unwrap();
        AlertRule::compile(&definition).unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn retention() -> Duration {
        Duration::minutes(15)
    }

    async fn store() -> Arc<SeriesStore> {
        let store = Arc::new(SeriesStore::new(StoreOptions {
            ingestion_lag: Duration::zero(),
            ..StoreOptions::default()
        }));
        for (service, value) in [("api", 0.1), ("web", 0.01)] {
            let id = SeriesId::new("error_rate", Labels::new().with("service", service));
            store
                .ingest(id, MetricKind::Gauge, Sample::new(at(100), value))
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_evaluate_against_store() {
        let evaluator = RuleEvaluator::new(store().await);
        let rule = rule("error_rate > 0.05", "ok");

        let points = evaluator.evaluate(&rule, at(110)).await.unwrap();
        assert_eq!(points.len(), 2);

        let breaching: Vec<&str> = points
            .iter()
            .filter(|p| p.breaching)
            .map(|p| p.labels.value("service"))
            .collect();
        assert_eq!(breaching, vec!["api"]);
    }

    #[tokio::test]
    async fn test_range_function_fetch() {
        let store = Arc::new(SeriesStore::new(StoreOptions {
            ingestion_lag: Duration::zero(),
            ..StoreOptions::default()
        }));
        let id = SeriesId::new("requests_total", Labels::new());
        for (t, v) in [(0, 0.0), (60, 60.0), (120, 120.0)] {
            store.ingest(id.clone(), MetricKind::Counter, Sample::new(at(t), v)).await.unwrap();
        }

        let evaluator = RuleEvaluator::new(store);
        let rule = rule("rate(requests_total[2m]) >= 1", "ok");
        let points = evaluator.evaluate(&rule, at(120)).await.unwrap();

        assert_eq!(points.len(), 1);
        assert!(points[0].breaching);
    }

    #[tokio::test]
    async fn test_missing_series_is_no_data() {
        let evaluator = RuleEvaluator::new(store().await);
        let err = evaluator.evaluate(&rule("latency > 1", "ok"), at(110)).await.unwrap_err();
        assert!(err.is_no_data());
    }

    #[test]
    fn test_no_data_alerting_creates_instance() {
        let mut runtime = RuleRuntime::new(rule("latency > 1", "alerting"));
        let records = runtime.apply(Err(AblageError::no_data("empty")), at(0), retention());

        assert!(records.iter().any(|r| r.transition == Transition::Fired));
        let instance = runtime.instances().next().unwrap();
        assert_eq!(instance.state, AlertState::Firing);
        assert_eq!(instance.labels.value("alertname"), "Test");
        assert_eq!(runtime.health(), &RuleHealth::Ok);
    }

    #[test]
    fn test_no_data_keep_state_leaves_instances() {
        let mut runtime = RuleRuntime::new(rule("latency > 1", "keep_state"));
        let breach = vec![EvalPoint {
            labels: Labels::new().with("service", "api"),
            value: 2.0,
            breaching: true,
        }];
        runtime.apply(Ok(breach), at(0), retention());

        let records = runtime.apply(Err(AblageError::no_data("empty")), at(30), retention());
        assert!(records.is_empty());
        assert_eq!(runtime.instances().next().unwrap().state, AlertState::Firing);
    }

    #[test]
    fn test_no_data_ok_resolves() {
        let mut runtime = RuleRuntime::new(rule("latency > 1", "ok"));
        let breach = vec![EvalPoint {
            labels: Labels::new(),
            value: 2.0,
            breaching: true,
        }];
        runtime.apply(Ok(breach), at(0), retention());

        let records = runtime.apply(Err(AblageError::no_data("empty")), at(30), retention());
        assert_eq!(records[0].transition, Transition::Resolved);
    }

    #[test]
    fn test_evaluation_error_marks_unhealthy() {
        let mut runtime = RuleRuntime::new(rule("latency > 1", "ok"));
        let breach = vec![EvalPoint {
            labels: Labels::new(),
            value: 2.0,
            breaching: true,
        }];
        runtime.apply(Ok(breach), at(0), retention());

        let records = runtime.apply(Err(AblageError::evaluation("division by zero")), at(30), retention());
        assert!(records.is_empty());
        assert!(matches!(runtime.health(), RuleHealth::Err(msg) if msg.contains("division by zero")));
        assert_eq!(runtime.instances().next().unwrap().state, AlertState::Firing);
    }
}
