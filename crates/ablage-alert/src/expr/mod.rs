//! 规则表达式：PromQL 的一个子集
//!
//! 支持选择器、范围函数、按标签聚合、`histogram_quantile`、`burn_rate`
//! 以及四则运算；规则条件必须以对标量的比较结尾。

mod ast;
mod eval;
mod lexer;
mod parser;

pub use ast::{ArithOp, Comparator, Condition, Expr, SelectorRef};
pub use eval::{evaluate, evaluate_condition, EvalContext, EvalPoint, Fetched, Value};
pub use lexer::{tokenize, Spanned, Token};
pub use parser::{parse_condition, parse_expr, parse_matchers};
