use ablage_core::{matches_all, LabelMatcher, MetricKind, Sample, SeriesId};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// 查询时间范围（闭区间）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// 以 `end` 结尾、长度为 `window` 的范围
    pub fn ending_at(end: DateTime<Utc>, window: Duration) -> Self {
        Self {
            start: end - window,
            end,
        }
    }

    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        timestamp >= self.start && timestamp <= self.end
    }
}

/// 序列选择器：可选的指标名 + 标签匹配器
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selector {
    pub metric: Option<String>,
    pub matchers: Vec<LabelMatcher>,
}

impl Selector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn metric(name: impl Into<String>) -> Self {
        Self {
            metric: Some(name.into()),
            matchers: Vec::new(),
        }
    }

    pub fn with_matcher(mut self, matcher: LabelMatcher) -> Self {
        self.matchers.push(matcher);
        self
    }

    pub fn matches(&self, id: &SeriesId) -> bool {
        if let Some(metric) = &self.metric {
            if metric != &id.name {
                return false;
            }
        }
        matches_all(&self.matchers, &id.labels)
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(metric) = &self.metric {
            f.write_str(metric)?;
        }
        let matchers = self
            .matchers
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        write!(f, "{{{}}}", matchers.join(","))
    }
}

/// 一条序列在查询范围内的数据快照
///
/// 快照在读锁内复制完成，之后的写入不会影响它；`iter()` 可重复调用，
/// 每次都从头按时间顺序惰性遍历。
#[derive(Debug, Clone)]
pub struct SeriesRange {
    pub id: SeriesId,
    pub kind: MetricKind,
    samples: Arc<[Sample]>,
}

impl SeriesRange {
    pub fn new(id: SeriesId, kind: MetricKind, samples: Vec<Sample>) -> Self {
        Self {
            id,
            kind,
            samples: samples.into(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Sample> + '_ {
        self.samples.iter().copied()
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn last(&self) -> Option<Sample> {
        self.samples.last().copied()
    }
}

/// 某一时刻的序列取值
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstantSample {
    pub id: SeriesId,
    pub sample: Sample,
}
