use crate::series::IngestOutcome;
use crate::store::SeriesStore;
use ablage_core::{AblageError, Labels, MetricKind, Result, Sample, SeriesId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// 外部推送的原始数据点
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingSample {
    pub name: String,
    #[serde(default)]
    pub labels: Labels,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    #[serde(default)]
    pub kind: MetricKind,
}

impl IncomingSample {
    pub fn new(
        name: impl Into<String>,
        labels: Labels,
        timestamp: DateTime<Utc>,
        value: f64,
        kind: MetricKind,
    ) -> Self {
        Self {
            name: name.into(),
            labels,
            timestamp,
            value,
            kind,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(AblageError::InvalidSample("metric name is empty".to_string()));
        }
        if self.labels.iter().any(|(k, _)| k.is_empty()) {
            return Err(AblageError::InvalidSample(format!(
                "empty label name on metric {}",
                self.name
            )));
        }
        Ok(())
    }
}

/// 批量写入结果
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub accepted: usize,
    pub rejected: usize,
    pub expired: usize,
    pub errors: Vec<String>,
}

/// 数据写入入口
///
/// 单个数据点失败只记入报告，不影响同批次其它数据点。
#[derive(Clone)]
pub struct Ingestor {
    store: Arc<SeriesStore>,
}

impl Ingestor {
    pub fn new(store: Arc<SeriesStore>) -> Self {
        Self { store }
    }

    pub async fn push(&self, sample: IncomingSample) -> Result<IngestOutcome> {
        sample.validate()?;

        let IncomingSample {
            name,
            labels,
            timestamp,
            value,
            kind,
        } = sample;

        self.store
            .ingest(SeriesId::new(name, labels), kind, Sample::new(timestamp, value))
            .await
    }

    pub async fn push_batch(&self, samples: Vec<IncomingSample>) -> IngestReport {
        let mut report = IngestReport::default();

        for sample in samples {
            match self.push(sample).await {
                Ok(IngestOutcome::Expired) => report.expired += 1,
                Ok(_) => report.accepted += 1,
                Err(e) => {
                    debug!(error = %e, "Sample rejected");
                    report.rejected += 1;
                    report.errors.push(e.to_string());
                }
            }
        }

        if report.rejected > 0 {
            warn!(
                accepted = report.accepted,
                rejected = report.rejected,
                "Batch ingested with rejections"
            );
        }
        report
    }
}
