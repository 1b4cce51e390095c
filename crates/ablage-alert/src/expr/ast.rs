use ablage_tsdb::{AggregateOp, RangeFunction, Selector};
use chrono::Duration;
use serde::{Serialize, Serializer};
use std::fmt;

/// 算术运算符
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl ArithOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArithOp::Add => "+",
            ArithOp::Sub => "-",
            ArithOp::Mul => "*",
            ArithOp::Div => "/",
        }
    }

    pub(crate) fn precedence(&self) -> u8 {
        match self {
            ArithOp::Add | ArithOp::Sub => 1,
            ArithOp::Mul | ArithOp::Div => 2,
        }
    }
}

/// 比较运算符
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
    Equal,
    NotEqual,
}

impl Comparator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Comparator::Greater => ">",
            Comparator::GreaterEqual => ">=",
            Comparator::Less => "<",
            Comparator::LessEqual => "<=",
            Comparator::Equal => "==",
            Comparator::NotEqual => "!=",
        }
    }

    pub fn evaluate(&self, lhs: f64, rhs: f64) -> bool {
        match self {
            Comparator::Greater => lhs > rhs,
            Comparator::GreaterEqual => lhs >= rhs,
            Comparator::Less => lhs < rhs,
            Comparator::LessEqual => lhs <= rhs,
            Comparator::Equal => lhs == rhs,
            Comparator::NotEqual => lhs != rhs,
        }
    }
}

/// 表达式语法树
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    /// 瞬时向量选择器
    Selector(Selector),
    /// 作用于范围向量的函数，如 `rate(x[5m])`
    RangeCall {
        func: RangeFunction,
        selector: Selector,
        window: Duration,
    },
    Aggregate {
        op: AggregateOp,
        by: Vec<String>,
        expr: Box<Expr>,
    },
    HistogramQuantile {
        quantile: f64,
        expr: Box<Expr>,
    },
    Abs(Box<Expr>),
    BurnRate {
        expr: Box<Expr>,
        target: f64,
    },
    Binary {
        op: ArithOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

/// 表达式引用的一次数据读取
#[derive(Debug, Clone, PartialEq)]
pub enum SelectorRef<'a> {
    Instant(&'a Selector),
    Range(&'a Selector, Duration),
}

impl SelectorRef<'_> {
    /// 预取结果表中的键
    pub fn key(&self) -> String {
        match self {
            SelectorRef::Instant(selector) => selector.to_string(),
            SelectorRef::Range(selector, window) => range_key(selector, *window),
        }
    }
}

pub(crate) fn range_key(selector: &Selector, window: Duration) -> String {
    format!("{}[{}ms]", selector, window.num_milliseconds())
}

impl Expr {
    /// 按出现顺序收集全部数据读取
    pub fn selectors(&self) -> Vec<SelectorRef<'_>> {
        let mut refs = Vec::new();
        self.collect_selectors(&mut refs);
        refs
    }

    fn collect_selectors<'a>(&'a self, refs: &mut Vec<SelectorRef<'a>>) {
        match self {
            Expr::Number(_) => {}
            Expr::Selector(selector) => refs.push(SelectorRef::Instant(selector)),
            Expr::RangeCall {
                selector, window, ..
            } => refs.push(SelectorRef::Range(selector, *window)),
            Expr::Aggregate { expr, .. }
            | Expr::HistogramQuantile { expr, .. }
            | Expr::Abs(expr)
            | Expr::BurnRate { expr, .. } => expr.collect_selectors(refs),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.collect_selectors(refs);
                rhs.collect_selectors(refs);
            }
        }
    }
}

fn format_window(window: &Duration) -> String {
    match window.to_std() {
        Ok(std) => humantime::format_duration(std).to_string(),
        Err(_) => format!("{}s", window.num_seconds()),
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Number(value) => write!(f, "{}", value),
            Expr::Selector(selector) => write!(f, "{}", selector),
            Expr::RangeCall {
                func,
                selector,
                window,
            } => write!(f, "{}({}[{}])", func.as_str(), selector, format_window(window)),
            Expr::Aggregate { op, by, expr } => {
                if by.is_empty() {
                    write!(f, "{}({})", op.as_str(), expr)
                } else {
                    write!(f, "{} by ({}) ({})", op.as_str(), by.join(", "), expr)
                }
            }
            Expr::HistogramQuantile { quantile, expr } => {
                write!(f, "histogram_quantile({}, {})", quantile, expr)
            }
            Expr::Abs(expr) => write!(f, "abs({})", expr),
            Expr::BurnRate { expr, target } => write!(f, "burn_rate({}, {})", expr, target),
            Expr::Binary { op, lhs, rhs } => write!(f, "({} {} {})", lhs, op.as_str(), rhs),
        }
    }
}

/// 规则条件：表达式 + 顶层比较 + 阈值
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub expr: Expr,
    pub comparator: Comparator,
    pub threshold: f64,
}

impl Condition {
    pub fn is_breach(&self, value: f64) -> bool {
        self.comparator.evaluate(value, self.threshold)
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.expr, self.comparator.as_str(), self.threshold)
    }
}

impl Serialize for Condition {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_comparator() {
        assert!(Comparator::Greater.evaluate(0.06, 0.05));
        assert!(!Comparator::Greater.evaluate(0.05, 0.05));
        assert!(Comparator::GreaterEqual.evaluate(0.05, 0.05));
        assert!(Comparator::NotEqual.evaluate(1.0, 0.0));
    }

    #[test]
    fn test_selector_keys() {
        let expr = Expr::Binary {
            op: ArithOp::Div,
            lhs: Box::new(Expr::RangeCall {
                func: RangeFunction::Rate,
                selector: Selector::metric("errors"),
                window: Duration::minutes(5),
            }),
            rhs: Box::new(Expr::Selector(Selector::metric("total"))),
        };

        let keys: Vec<String> = expr.selectors().iter().map(SelectorRef::key).collect();
        assert_eq!(keys, vec!["errors{}[300000ms]".to_string(), "total{}".to_string()]);
    }

    #[test]
    fn test_subsecond_windows_have_distinct_keys() {
        let key = |window| {
            let expr = Expr::RangeCall {
                func: RangeFunction::Rate,
                selector: Selector::metric("errors"),
                window,
            };
            expr.selectors()[0].key()
        };

        assert_ne!(key(Duration::milliseconds(1500)), key(Duration::seconds(1)));
        assert_ne!(key(Duration::milliseconds(500)), key(Duration::zero()));
        assert_eq!(key(Duration::milliseconds(1500)), "errors{}[1500ms]");
    }
}
