//! 告警分组
//!
//! 按 `group_by` 标签把告警事件聚成组。新组先等待 `group_wait`，之后至多每
//! `group_interval` 刷新一次，且仅在可见成员或其状态变化时才产生通知批次。

use crate::inhibit::Suppression;
use ablage_core::Labels;
use ablage_notify::{AlertEvent, EventState, NotificationBatch};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

fn default_group_wait() -> Duration {
    Duration::from_secs(30)
}

fn default_group_interval() -> Duration {
    Duration::from_secs(300)
}

/// 分组配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// 为空时所有告警归入同一组
    #[serde(default)]
    pub group_by: Vec<String>,
    #[serde(default = "default_group_wait", with = "humantime_serde")]
    pub group_wait: Duration,
    #[serde(default = "default_group_interval", with = "humantime_serde")]
    pub group_interval: Duration,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            group_by: Vec::new(),
            group_wait: default_group_wait(),
            group_interval: default_group_interval(),
        }
    }
}

#[derive(Debug)]
struct AlertGroup {
    labels: Labels,
    members: BTreeMap<String, AlertEvent>,
    created_at: DateTime<Utc>,
    last_flush: Option<DateTime<Utc>>,
    /// 上次刷新后剩余可见成员的 dedup_key
    last_signature: Vec<String>,
}

impl AlertGroup {
    fn is_due(&self, now: DateTime<Utc>, config: &RouteConfig) -> bool {
        let (since, wait) = match self.last_flush {
            None => (self.created_at, config.group_wait),
            Some(last) => (last, config.group_interval),
        };
        (now - since).to_std().map_or(false, |elapsed| elapsed >= wait)
    }

    fn visible<'a>(
        &'a self,
        suppressed: &'a BTreeMap<String, Suppression>,
    ) -> impl Iterator<Item = &'a AlertEvent> + 'a {
        self.members
            .values()
            .filter(move |event| !suppressed.contains_key(&event.fingerprint))
    }
}

/// 分组路由器，由引擎的处理循环独占
#[derive(Debug)]
pub struct Router {
    config: RouteConfig,
    groups: BTreeMap<String, AlertGroup>,
}

impl Router {
    pub fn new(config: RouteConfig) -> Self {
        Self {
            config,
            groups: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &RouteConfig {
        &self.config
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// 所有组内成员的标签
    pub fn member_labels(&self) -> impl Iterator<Item = &Labels> {
        self.groups
            .values()
            .flat_map(|group| group.members.values().map(|event| &event.labels))
    }

    /// 接收一个 firing/resolved 事件；同一指纹的新事件替换旧事件
    pub fn observe(&mut self, event: AlertEvent, now: DateTime<Utc>) {
        let group_labels = event.labels.project(&self.config.group_by);
        let key = group_labels.fingerprint();

        let group = self.groups.entry(key).or_insert_with(|| {
            debug!(group = %group_labels, "Alert group created");
            AlertGroup {
                labels: group_labels,
                members: BTreeMap::new(),
                created_at: now,
                last_flush: None,
                last_signature: Vec::new(),
            }
        });
        group.members.insert(event.fingerprint.clone(), event);
    }

    /// 刷新到期的分组
    ///
    /// 被抑制的成员不进入批次。刷新之后 resolved 成员从组中移除，空组随之删除。
    pub fn flush(
        &mut self,
        now: DateTime<Utc>,
        suppressed: &BTreeMap<String, Suppression>,
    ) -> Vec<NotificationBatch> {
        let mut batches = Vec::new();

        for group in self.groups.values_mut() {
            if !group.is_due(now, &self.config) {
                continue;
            }

            let visible: Vec<AlertEvent> = group.visible(suppressed).cloned().collect();
            let signature: Vec<String> = visible.iter().map(|e| e.dedup_key.clone()).collect();

            if signature != group.last_signature && !visible.is_empty() {
                batches.push(NotificationBatch::new(group.labels.clone(), visible, now));
                group.last_flush = Some(now);
            }

            group
                .members
                .retain(|_, event| event.state != EventState::Resolved);
            group.last_signature = group
                .visible(suppressed)
                .map(|e| e.dedup_key.clone())
                .collect();
        }

        self.groups.retain(|_, group| !group.members.is_empty());
        batches
    }
}
