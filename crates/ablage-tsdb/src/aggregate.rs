//! 聚合原语
//!
//! 全部是无状态的纯函数，输入为查询快照，输出为数值或向量。

use crate::query::SeriesRange;
use ablage_core::{AblageError, Labels, Result, Sample, BUCKET_LABEL};
use chrono::Duration;
use serde::Serialize;
use std::collections::BTreeMap;

/// 瞬时向量中的一个元素
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VectorElement {
    pub labels: Labels,
    pub value: f64,
}

impl VectorElement {
    pub fn new(labels: Labels, value: f64) -> Self {
        Self { labels, value }
    }
}

/// 跨序列聚合操作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateOp {
    Sum,
    Avg,
    Min,
    Max,
    Count,
}

impl AggregateOp {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "sum" => Some(AggregateOp::Sum),
            "avg" => Some(AggregateOp::Avg),
            "min" => Some(AggregateOp::Min),
            "max" => Some(AggregateOp::Max),
            "count" => Some(AggregateOp::Count),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateOp::Sum => "sum",
            AggregateOp::Avg => "avg",
            AggregateOp::Min => "min",
            AggregateOp::Max => "max",
            AggregateOp::Count => "count",
        }
    }

    fn apply(&self, values: &[f64]) -> f64 {
        match self {
            AggregateOp::Sum => values.iter().sum(),
            AggregateOp::Avg => values.iter().sum::<f64>() / values.len() as f64,
            AggregateOp::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
            AggregateOp::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            AggregateOp::Count => values.len() as f64,
        }
    }
}

/// 作用于单条序列时间窗口的函数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RangeFunction {
    Rate,
    Increase,
    Delta,
    AvgOverTime,
    MinOverTime,
    MaxOverTime,
    SumOverTime,
    CountOverTime,
    LastOverTime,
}

impl RangeFunction {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "rate" => Some(RangeFunction::Rate),
            "increase" => Some(RangeFunction::Increase),
            "delta" => Some(RangeFunction::Delta),
            "avg_over_time" => Some(RangeFunction::AvgOverTime),
            "min_over_time" => Some(RangeFunction::MinOverTime),
            "max_over_time" => Some(RangeFunction::MaxOverTime),
            "sum_over_time" => Some(RangeFunction::SumOverTime),
            "count_over_time" => Some(RangeFunction::CountOverTime),
            "last_over_time" => Some(RangeFunction::LastOverTime),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RangeFunction::Rate => "rate",
            RangeFunction::Increase => "increase",
            RangeFunction::Delta => "delta",
            RangeFunction::AvgOverTime => "avg_over_time",
            RangeFunction::MinOverTime => "min_over_time",
            RangeFunction::MaxOverTime => "max_over_time",
            RangeFunction::SumOverTime => "sum_over_time",
            RangeFunction::CountOverTime => "count_over_time",
            RangeFunction::LastOverTime => "last_over_time",
        }
    }

    pub fn apply(&self, samples: &[Sample], window: Duration) -> Result<f64> {
        match self {
            RangeFunction::Rate => rate(samples, window),
            RangeFunction::Increase => increase(samples),
            RangeFunction::Delta => delta(samples),
            RangeFunction::AvgOverTime => over_time(samples, AggregateOp::Avg),
            RangeFunction::MinOverTime => over_time(samples, AggregateOp::Min),
            RangeFunction::MaxOverTime => over_time(samples, AggregateOp::Max),
            RangeFunction::SumOverTime => over_time(samples, AggregateOp::Sum),
            RangeFunction::CountOverTime => over_time(samples, AggregateOp::Count),
            RangeFunction::LastOverTime => samples
                .last()
                .map(|s| s.value)
                .ok_or_else(|| AblageError::no_data("last_over_time on empty window")),
        }
    }
}

/// 计数器在窗口内的增量
///
/// 值小于前一个点视为计数器重置：丢弃负差值，重置后的值按从零开始的增量计入。
pub fn increase(samples: &[Sample]) -> Result<f64> {
    if samples.len() < 2 {
        return Err(AblageError::no_data(format!(
            "increase needs at least 2 samples, got {}",
            samples.len()
        )));
    }

    let total = samples
        .windows(2)
        .map(|pair| {
            let (prev, cur) = (pair[0].value, pair[1].value);
            if cur >= prev {
                cur - prev
            } else {
                cur.max(0.0)
            }
        })
        .sum();
    Ok(total)
}

/// 窗口内每秒平均增长率，结果不会为负
pub fn rate(samples: &[Sample], window: Duration) -> Result<f64> {
    let seconds = window.num_milliseconds() as f64 / 1000.0;
    if seconds <= 0.0 {
        return Err(AblageError::evaluation("rate window must be positive"));
    }
    Ok(increase(samples)? / seconds)
}

/// 仪表类数据首尾差值
pub fn delta(samples: &[Sample]) -> Result<f64> {
    match (samples.first(), samples.last()) {
        (Some(first), Some(last)) if samples.len() >= 2 => Ok(last.value - first.value),
        _ => Err(AblageError::no_data(format!(
            "delta needs at least 2 samples, got {}",
            samples.len()
        ))),
    }
}

fn over_time(samples: &[Sample], op: AggregateOp) -> Result<f64> {
    if samples.is_empty() {
        return Err(AblageError::no_data(format!(
            "{}_over_time on empty window",
            op.as_str()
        )));
    }
    let values: Vec<f64> = samples.iter().map(|s| s.value).collect();
    Ok(op.apply(&values))
}

/// 按标签子集分组聚合
///
/// 输出标签只保留分组键，结果按标签排序。
pub fn aggregate_by(op: AggregateOp, elements: &[VectorElement], by: &[String]) -> Vec<VectorElement> {
    let mut groups: BTreeMap<Labels, Vec<f64>> = BTreeMap::new();
    for element in elements {
        groups
            .entry(element.labels.project(by))
            .or_default()
            .push(element.value);
    }

    groups
        .into_iter()
        .map(|(labels, values)| VectorElement::new(labels, op.apply(&values)))
        .collect()
}

/// 按标签子集分组，对每条序列在范围内的最新值求和
pub fn sum_by(set: &[SeriesRange], by: &[String]) -> Vec<VectorElement> {
    let latest: Vec<VectorElement> = set
        .iter()
        .filter_map(|range| {
            range
                .last()
                .map(|s| VectorElement::new(range.id.labels.clone(), s.value))
        })
        .collect();
    aggregate_by(AggregateOp::Sum, &latest, by)
}

/// 直方图累积桶
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Bucket {
    pub upper_bound: f64,
    pub count: f64,
}

impl Bucket {
    pub fn new(upper_bound: f64, count: f64) -> Self {
        Self { upper_bound, count }
    }
}

/// 解析 `le` 标签值
pub fn parse_bucket_bound(value: &str) -> Option<f64> {
    match value {
        "+Inf" | "Inf" | "inf" | "+inf" => Some(f64::INFINITY),
        other => other.parse::<f64>().ok().filter(|v| !v.is_nan()),
    }
}

/// 由累积桶计数估算分位数
///
/// 在包含第 `q * total` 个观测值的桶内线性插值，第一个桶的下界为 0。
pub fn histogram_quantile(q: f64, buckets: &[Bucket]) -> Result<f64> {
    if buckets.is_empty() {
        return Err(AblageError::no_data("histogram_quantile on empty bucket set"));
    }
    if q.is_nan() {
        return Ok(f64::NAN);
    }
    if q < 0.0 {
        return Ok(f64::NEG_INFINITY);
    }
    if q > 1.0 {
        return Ok(f64::INFINITY);
    }

    let mut sorted: Vec<Bucket> = buckets
        .iter()
        .copied()
        .filter(|b| !b.upper_bound.is_nan())
        .collect();
    sorted.sort_by(|a, b| a.upper_bound.total_cmp(&b.upper_bound));

    // 抓取时间差可能导致累积计数不单调，取前缀最大值修正
    let mut running = 0.0_f64;
    for bucket in &mut sorted {
        running = running.max(bucket.count);
        bucket.count = running;
    }

    let total = match sorted.last() {
        Some(last) => last.count,
        None => return Err(AblageError::no_data("histogram_quantile without valid buckets")),
    };
    if total <= 0.0 {
        return Ok(f64::NAN);
    }

    let rank = q * total;
    let idx = sorted.partition_point(|b| b.count < rank);
    let Some(bucket) = sorted.get(idx) else {
        return Ok(f64::INFINITY);
    };
    if bucket.upper_bound.is_infinite() {
        return Ok(f64::INFINITY);
    }

    let (lower, prev_count) = if idx == 0 {
        if bucket.upper_bound <= 0.0 {
            return Ok(bucket.upper_bound);
        }
        (0.0, 0.0)
    } else {
        (sorted[idx - 1].upper_bound, sorted[idx - 1].count)
    };

    let width = bucket.count - prev_count;
    if width <= 0.0 {
        return Ok(lower);
    }
    Ok(lower + (bucket.upper_bound - lower) * (rank - prev_count) / width)
}

/// 按除 `le` 外的全部标签分组后逐组计算分位数
///
/// 没有有效桶的分组不出现在结果中。
pub fn histogram_quantile_by(q: f64, elements: &[VectorElement]) -> Vec<VectorElement> {
    let mut groups: BTreeMap<Labels, Vec<Bucket>> = BTreeMap::new();
    for element in elements {
        let Some(bound) = element.labels.get(BUCKET_LABEL).and_then(parse_bucket_bound) else {
            continue;
        };
        groups
            .entry(element.labels.without(&[BUCKET_LABEL]))
            .or_default()
            .push(Bucket::new(bound, element.value));
    }

    groups
        .into_iter()
        .filter_map(|(labels, buckets)| {
            histogram_quantile(q, &buckets)
                .ok()
                .map(|value| VectorElement::new(labels, value))
        })
        .collect()
}

/// 错误预算燃烧速率：实际错误率 / (1 - SLO 目标)
pub fn burn_rate(error_ratio: f64, slo_target: f64) -> Result<f64> {
    let budget = 1.0 - slo_target;
    if budget <= 0.0 || budget > 1.0 || budget.is_nan() {
        return Err(AblageError::evaluation(format!(
            "invalid SLO target {} for burn rate",
            slo_target
        )));
    }
    Ok(error_ratio / budget)
}
