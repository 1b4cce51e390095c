use super::ast::{range_key, ArithOp, Condition, Expr, SelectorRef};
use ablage_core::{AblageError, Labels, Result};
use ablage_tsdb::{
    aggregate_by, burn_rate, histogram_quantile_by, InstantSample, SeriesRange, VectorElement,
};
use std::collections::{BTreeMap, HashMap};

/// 表达式求值结果
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Scalar(f64),
    Vector(Vec<VectorElement>),
}

/// 一次求值所需的全部数据
///
/// 由评估器在同一个水位线下一次性预取，求值过程本身不再访问存储。
#[derive(Debug, Default)]
pub struct EvalContext {
    instants: HashMap<String, Vec<InstantSample>>,
    ranges: HashMap<String, Vec<SeriesRange>>,
}

impl EvalContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, selector: &SelectorRef<'_>, data: Fetched) {
        match data {
            Fetched::Instant(samples) => {
                self.instants.insert(selector.key(), samples);
            }
            Fetched::Range(ranges) => {
                self.ranges.insert(selector.key(), ranges);
            }
        }
    }

    pub fn insert_instant(&mut self, key: impl Into<String>, samples: Vec<InstantSample>) {
        self.instants.insert(key.into(), samples);
    }

    pub fn insert_range(&mut self, key: impl Into<String>, ranges: Vec<SeriesRange>) {
        self.ranges.insert(key.into(), ranges);
    }
}

/// 预取结果
#[derive(Debug)]
pub enum Fetched {
    Instant(Vec<InstantSample>),
    Range(Vec<SeriesRange>),
}

/// 条件求值得到的一个点
#[derive(Debug, Clone, PartialEq)]
pub struct EvalPoint {
    pub labels: Labels,
    pub value: f64,
    pub breaching: bool,
}

/// 对规则条件求值
///
/// 结果为空时返回 `NoData`，由调用方按规则的无数据策略处理。
pub fn evaluate_condition(condition: &Condition, ctx: &EvalContext) -> Result<Vec<EvalPoint>> {
    let elements = match evaluate(&condition.expr, ctx)? {
        Value::Scalar(value) => vec![VectorElement::new(Labels::new(), value)],
        Value::Vector(elements) => elements,
    };

    if elements.is_empty() {
        return Err(AblageError::no_data(format!(
            "expression {} returned no series",
            condition.expr
        )));
    }

    Ok(elements
        .into_iter()
        .map(|e| EvalPoint {
            breaching: condition.is_breach(e.value),
            labels: e.labels,
            value: e.value,
        })
        .collect())
}

/// 对表达式求值
pub fn evaluate(expr: &Expr, ctx: &EvalContext) -> Result<Value> {
    match expr {
        Expr::Number(value) => Ok(Value::Scalar(*value)),
        Expr::Selector(selector) => {
            let samples = ctx
                .instants
                .get(&selector.to_string())
                .map(Vec::as_slice)
                .unwrap_or_default();
            Ok(Value::Vector(
                samples
                    .iter()
                    .map(|s| VectorElement::new(s.id.labels.clone(), s.sample.value))
                    .collect(),
            ))
        }
        Expr::RangeCall {
            func,
            selector,
            window,
        } => {
            let ranges = ctx
                .ranges
                .get(&range_key(selector, *window))
                .map(Vec::as_slice)
                .unwrap_or_default();

            let mut elements = Vec::with_capacity(ranges.len());
            for range in ranges {
                match func.apply(range.samples(), *window) {
                    Ok(value) => elements.push(VectorElement::new(range.id.labels.clone(), value)),
                    // 单条序列数据不足时不参与结果
                    Err(e) if e.is_no_data() => continue,
                    Err(e) => return Err(e),
                }
            }
            Ok(Value::Vector(elements))
        }
        Expr::Aggregate { op, by, expr } => match evaluate(expr, ctx)? {
            Value::Vector(elements) => Ok(Value::Vector(aggregate_by(*op, &elements, by))),
            Value::Scalar(_) => Err(AblageError::evaluation(format!(
                "{} expects a vector argument",
                op.as_str()
            ))),
        },
        Expr::HistogramQuantile { quantile, expr } => match evaluate(expr, ctx)? {
            Value::Vector(elements) => Ok(Value::Vector(histogram_quantile_by(*quantile, &elements))),
            Value::Scalar(_) => Err(AblageError::evaluation(
                "histogram_quantile expects a vector of buckets",
            )),
        },
        Expr::Abs(expr) => map_values(evaluate(expr, ctx)?, |v| Ok(v.abs())),
        Expr::BurnRate { expr, target } => {
            map_values(evaluate(expr, ctx)?, |v| burn_rate(v, *target))
        }
        Expr::Binary { op, lhs, rhs } => {
            let lhs = evaluate(lhs, ctx)?;
            let rhs = evaluate(rhs, ctx)?;
            binary(*op, lhs, rhs)
        }
    }
}

fn map_values(value: Value, f: impl Fn(f64) -> Result<f64>) -> Result<Value> {
    match value {
        Value::Scalar(v) => Ok(Value::Scalar(f(v)?)),
        Value::Vector(elements) => elements
            .into_iter()
            .map(|e| Ok(VectorElement::new(e.labels, f(e.value)?)))
            .collect::<Result<Vec<_>>>()
            .map(Value::Vector),
    }
}

fn apply(op: ArithOp, lhs: f64, rhs: f64) -> Result<f64> {
    match op {
        ArithOp::Add => Ok(lhs + rhs),
        ArithOp::Sub => Ok(lhs - rhs),
        ArithOp::Mul => Ok(lhs * rhs),
        ArithOp::Div => {
            if rhs == 0.0 {
                Err(AblageError::evaluation(format!("division by zero ({} / 0)", lhs)))
            } else {
                Ok(lhs / rhs)
            }
        }
    }
}

/// 向量之间按完全相同的标签集合一对一匹配，未匹配的元素丢弃
fn binary(op: ArithOp, lhs: Value, rhs: Value) -> Result<Value> {
    match (lhs, rhs) {
        (Value::Scalar(a), Value::Scalar(b)) => Ok(Value::Scalar(apply(op, a, b)?)),
        (Value::Vector(elements), Value::Scalar(b)) => elements
            .into_iter()
            .map(|e| Ok(VectorElement::new(e.labels, apply(op, e.value, b)?)))
            .collect::<Result<Vec<_>>>()
            .map(Value::Vector),
        (Value::Scalar(a), Value::Vector(elements)) => elements
            .into_iter()
            .map(|e| Ok(VectorElement::new(e.labels, apply(op, a, e.value)?)))
            .collect::<Result<Vec<_>>>()
            .map(Value::Vector),
        (Value::Vector(left), Value::Vector(right)) => {
            let mut right: BTreeMap<Labels, f64> =
                right.into_iter().map(|e| (e.labels, e.value)).collect();

            let mut result = Vec::new();
            for element in left {
                if let Some(other) = right.remove(&element.labels) {
                    let value = apply(op, element.value, other)?;
                    result.push(VectorElement::new(element.labels, value));
                }
            }
            Ok(Value::Vector(result))
        }
    }
}
