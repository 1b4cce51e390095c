use chrono::{DateTime, Utc};
use thiserror::Error;

/// Ablage 统一错误类型
#[derive(Error, Debug)]
pub enum AblageError {
    #[error("Out-of-order sample for {series}: {timestamp} precedes last sample at {last}")]
    OutOfOrderSample {
        series: String,
        timestamp: DateTime<Utc>,
        last: DateTime<Utc>,
    },

    #[error("No data: {0}")]
    NoData(String),

    #[error("Evaluation error: {0}")]
    Evaluation(String),

    #[error("Parse error at offset {offset}: {message}")]
    Parse { offset: usize, message: String },

    #[error("Invalid label matcher: {0}")]
    InvalidMatcher(String),

    #[error("Invalid sample: {0}")]
    InvalidSample(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, AblageError>;

impl AblageError {
    pub fn no_data(message: impl Into<String>) -> Self {
        AblageError::NoData(message.into())
    }

    pub fn evaluation(message: impl Into<String>) -> Self {
        AblageError::Evaluation(message.into())
    }

    pub fn is_no_data(&self) -> bool {
        matches!(self, AblageError::NoData(_))
    }

    /// 用于指标标签的简短错误类别
    pub fn kind(&self) -> &'static str {
        match self {
            AblageError::OutOfOrderSample { .. } => "out_of_order",
            AblageError::NoData(_) => "no_data",
            AblageError::Evaluation(_) => "evaluation",
            AblageError::Parse { .. } => "parse",
            AblageError::InvalidMatcher(_) => "invalid_matcher",
            AblageError::InvalidSample(_) => "invalid_sample",
            AblageError::Template(_) => "template",
            AblageError::Config(_) => "config",
        }
    }
}

impl From<regex::Error> for AblageError {
    fn from(err: regex::Error) -> Self {
        AblageError::InvalidMatcher(err.to_string())
    }
}
