//! 告警状态机
//!
//! 每条规则持有一个状态机，按实例标签跟踪状态：
//!
//! ```text
//! Inactive --触发--> Pending --持续 >= for--> Firing --恢复--> Resolved --保留期满--> 删除
//!             Pending --恢复--> 删除（不通知）
//!             Resolved --再次触发--> Pending（重新计算 for）
//! ```

use crate::expr::EvalPoint;
use crate::rule::AlertRule;
use ablage_core::Labels;
use ablage_notify::{AlertEvent, EventState};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// 实例状态，不存在实例即为 Inactive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertState {
    Pending,
    Firing,
    Resolved,
}

impl AlertState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertState::Pending => "pending",
            AlertState::Firing => "firing",
            AlertState::Resolved => "resolved",
        }
    }
}

/// 状态迁移类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    /// Inactive → Pending
    Activated,
    /// Pending → Firing，发出 firing 通知
    Fired,
    /// Pending → Inactive
    Cleared,
    /// Firing → Resolved，发出 resolved 通知
    Resolved,
    /// Resolved → Pending
    Rearmed,
    /// Resolved → 删除
    Expired,
}

impl Transition {
    /// 是否需要通知
    pub fn is_notifiable(&self) -> bool {
        matches!(self, Transition::Fired | Transition::Resolved)
    }
}

/// 一条规则在某个标签组合上的运行时状态
#[derive(Debug, Clone, Serialize)]
pub struct AlertInstance {
    pub rule: String,
    pub labels: Labels,
    pub fingerprint: String,
    pub state: AlertState,
    /// 本轮告警周期首次触发的时间
    pub active_at: DateTime<Utc>,
    pub fired_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub last_evaluated: DateTime<Utc>,
    pub value: f64,
    pub annotations: BTreeMap<String, String>,
}

impl AlertInstance {
    fn new(rule: &AlertRule, labels: Labels, value: f64, now: DateTime<Utc>) -> Self {
        Self {
            rule: rule.name.clone(),
            fingerprint: labels.fingerprint(),
            annotations: rule.render_annotations(&labels, value),
            labels,
            state: AlertState::Pending,
            active_at: now,
            fired_at: None,
            resolved_at: None,
            last_evaluated: now,
            value,
        }
    }

    /// 转换为通知事件；Pending 实例没有对应的事件
    pub fn to_event(&self, rule: &AlertRule) -> Option<AlertEvent> {
        let state = match self.state {
            AlertState::Firing => EventState::Firing,
            AlertState::Resolved => EventState::Resolved,
            AlertState::Pending => return None,
        };

        let mut event = AlertEvent::new(self.rule.clone(), self.labels.clone(), state, self.active_at, self.value)
            .with_annotations(self.annotations.clone())
            .with_severity(rule.severity);
        if let Some(resolved_at) = self.resolved_at {
            event = event.with_resolved_at(resolved_at);
        }
        Some(event)
    }
}

/// 一次状态迁移
#[derive(Debug, Clone)]
pub struct TransitionRecord {
    pub transition: Transition,
    pub instance: AlertInstance,
}

/// 单条规则的实例状态机
///
/// 只由所属规则组的评估任务修改，同一实例的迁移天然串行。
#[derive(Debug, Default)]
pub struct AlertStateMachine {
    instances: BTreeMap<Labels, AlertInstance>,
}

impl AlertStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn instances(&self) -> impl Iterator<Item = &AlertInstance> {
        self.instances.values()
    }

    pub fn get(&self, labels: &Labels) -> Option<&AlertInstance> {
        self.instances.get(labels)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// 应用一轮评估结果，返回本轮全部状态迁移
    ///
    /// `points` 中未出现的实例视为不再触发。
    pub fn observe(
        &mut self,
        rule: &AlertRule,
        points: &[EvalPoint],
        now: DateTime<Utc>,
        default_retention: Duration,
    ) -> Vec<TransitionRecord> {
        let mut transitions = Vec::new();
        let mut breaching = BTreeSet::new();

        for point in points {
            let labels = rule.instance_labels(&point.labels);

            if !point.breaching {
                // 未触发的序列仍刷新当前值，供 resolved 通知使用
                if let Some(instance) = self.instances.get_mut(&labels) {
                    instance.value = point.value;
                    instance.last_evaluated = now;
                }
                continue;
            }

            breaching.insert(labels.clone());
            self.on_breach(rule, labels, point.value, now, &mut transitions);
        }

        let retention = rule.resolved_retention.unwrap_or(default_retention);
        let idle: Vec<Labels> = self
            .instances
            .keys()
            .filter(|labels| !breaching.contains(*labels))
            .cloned()
            .collect();

        for labels in idle {
            self.on_clear(rule, &labels, now, retention, &mut transitions);
        }

        for record in &transitions {
            debug!(
                rule = %rule.name,
                alert = %record.instance.fingerprint,
                transition = ?record.transition,
                state = record.instance.state.as_str(),
                "Alert state transition"
            );
        }
        transitions
    }

    fn on_breach(
        &mut self,
        rule: &AlertRule,
        labels: Labels,
        value: f64,
        now: DateTime<Utc>,
        transitions: &mut Vec<TransitionRecord>,
    ) {
        let instance = match self.instances.entry(labels) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let instance = AlertInstance::new(rule, entry.key().clone(), value, now);
                transitions.push(TransitionRecord {
                    transition: Transition::Activated,
                    instance: instance.clone(),
                });
                entry.insert(instance)
            }
        };

        instance.value = value;
        instance.last_evaluated = now;
        instance.annotations = rule.render_annotations(&instance.labels, value);

        if instance.state == AlertState::Resolved {
            instance.state = AlertState::Pending;
            instance.active_at = now;
            instance.fired_at = None;
            instance.resolved_at = None;
            transitions.push(TransitionRecord {
                transition: Transition::Rearmed,
                instance: instance.clone(),
            });
        }

        if instance.state == AlertState::Pending && now - instance.active_at >= rule.for_duration {
            instance.state = AlertState::Firing;
            instance.fired_at = Some(now);
            transitions.push(TransitionRecord {
                transition: Transition::Fired,
                instance: instance.clone(),
            });
        }
    }

    fn on_clear(
        &mut self,
        rule: &AlertRule,
        labels: &Labels,
        now: DateTime<Utc>,
        retention: Duration,
        transitions: &mut Vec<TransitionRecord>,
    ) {
        let Some(instance) = self.instances.get_mut(labels) else {
            return;
        };

        let state = instance.state;
        match state {
            AlertState::Pending => {
                if let Some(instance) = self.instances.remove(labels) {
                    transitions.push(TransitionRecord {
                        transition: Transition::Cleared,
                        instance,
                    });
                }
            }
            AlertState::Firing => {
                instance.state = AlertState::Resolved;
                instance.resolved_at = Some(now);
                instance.last_evaluated = now;
                instance.annotations = rule.render_annotations(&instance.labels, instance.value);
                transitions.push(TransitionRecord {
                    transition: Transition::Resolved,
                    instance: instance.clone(),
                });
            }
            AlertState::Resolved => {
                let expired = instance
                    .resolved_at
                    .map_or(true, |resolved_at| now - resolved_at >= retention);
                if expired {
                    if let Some(instance) = self.instances.remove(labels) {
                        transitions.push(TransitionRecord {
                            transition: Transition::Expired,
                            instance,
                        });
                    }
                }
            }
        }
    }
}
