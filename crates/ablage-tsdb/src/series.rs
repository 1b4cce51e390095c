use ablage_core::{AblageError, MetricKind, OutOfOrderPolicy, Result, Sample, SeriesId};
use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;

/// 写入结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// 追加到序列末尾
    Appended,
    /// 覆盖了同一时间戳的数据点
    Overwritten,
    /// 按序插入到序列中间
    Inserted,
    /// 早于保留窗口，直接丢弃
    Expired,
}

impl IngestOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestOutcome::Appended => "appended",
            IngestOutcome::Overwritten => "overwritten",
            IngestOutcome::Inserted => "inserted",
            IngestOutcome::Expired => "expired",
        }
    }
}

/// 单条时间序列
///
/// 数据点按时间戳升序存放；过期数据在下一次写入时顺带淘汰。
#[derive(Debug)]
pub struct Series {
    id: SeriesId,
    kind: MetricKind,
    policy: OutOfOrderPolicy,
    samples: VecDeque<Sample>,
}

impl Series {
    pub fn new(id: SeriesId, kind: MetricKind, policy: OutOfOrderPolicy) -> Self {
        Self {
            id,
            kind,
            policy,
            samples: VecDeque::new(),
        }
    }

    pub fn id(&self) -> &SeriesId {
        &self.id
    }

    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    pub fn policy(&self) -> OutOfOrderPolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn last(&self) -> Option<&Sample> {
        self.samples.back()
    }

    /// 写入数据点
    pub fn append(&mut self, sample: Sample, retention: Duration) -> Result<IngestOutcome> {
        let Some(newest) = self.samples.back().map(|s| s.timestamp) else {
            self.samples.push_back(sample);
            return Ok(IngestOutcome::Appended);
        };

        if sample.timestamp == newest {
            if let Some(last) = self.samples.back_mut() {
                last.value = sample.value;
            }
            return Ok(IngestOutcome::Overwritten);
        }

        if sample.timestamp < newest {
            return match self.policy {
                OutOfOrderPolicy::Reject => Err(AblageError::OutOfOrderSample {
                    series: self.id.to_string(),
                    timestamp: sample.timestamp,
                    last: newest,
                }),
                OutOfOrderPolicy::Overwrite => Ok(self.backfill(sample, newest - retention)),
            };
        }

        self.samples.push_back(sample);
        self.evict(sample.timestamp - retention);
        Ok(IngestOutcome::Appended)
    }

    fn backfill(&mut self, sample: Sample, cutoff: DateTime<Utc>) -> IngestOutcome {
        if sample.timestamp < cutoff {
            return IngestOutcome::Expired;
        }

        match self
            .samples
            .binary_search_by(|s| s.timestamp.cmp(&sample.timestamp))
        {
            Ok(idx) => {
                self.samples[idx].value = sample.value;
                IngestOutcome::Overwritten
            }
            Err(idx) => {
                self.samples.insert(idx, sample);
                IngestOutcome::Inserted
            }
        }
    }

    fn evict(&mut self, cutoff: DateTime<Utc>) {
        while let Some(front) = self.samples.front() {
            if front.timestamp < cutoff {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// 闭区间 `[start, end]` 内的数据点
    pub fn range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<Sample> {
        if start > end {
            return Vec::new();
        }
        let from = self.samples.partition_point(|s| s.timestamp < start);
        let to = self.samples.partition_point(|s| s.timestamp <= end);
        self.samples.range(from..to).copied().collect()
    }

    /// `at` 时刻之前（含）且不早于 `at - lookback` 的最新数据点
    pub fn latest_at(&self, at: DateTime<Utc>, lookback: Duration) -> Option<Sample> {
        let idx = self.samples.partition_point(|s| s.timestamp <= at);
        if idx == 0 {
            return None;
        }
        let sample = self.samples[idx - 1];
        (sample.timestamp >= at - lookback).then_some(sample)
    }
}
