pub mod aggregate;
pub mod ingest;
pub mod query;
pub mod series;
pub mod store;

pub use aggregate::{
    aggregate_by, burn_rate, delta, histogram_quantile, histogram_quantile_by, increase, rate,
    sum_by, AggregateOp, Bucket, RangeFunction, VectorElement,
};
pub use ingest::{IncomingSample, IngestReport, Ingestor};
pub use query::{InstantSample, Selector, SeriesRange, TimeRange};
pub use series::{IngestOutcome, Series};
pub use store::{SeriesReader, SeriesStore, StoreOptions, StoreStats};
