pub mod error;
pub mod labels;
pub mod matcher;
pub mod types;

pub use error::{AblageError, Result};
pub use labels::{
    Labels, SeriesId, ALERT_NAME_LABEL, BUCKET_LABEL, QUANTILE_LABEL, SEVERITY_LABEL,
};
pub use matcher::{matches_all, LabelMatcher, MatchOp};
pub use types::{AlertSeverity, MetricKind, NoDataState, OutOfOrderPolicy, OverflowPolicy, Sample};
