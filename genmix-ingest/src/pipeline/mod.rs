use std::{pin::Pin, time::Duration};

use futures::Stream;
use genmix_client::domain::{GenerationRecord, RunStatus};
use time::OffsetDateTime;

use crate::{sources::RawRecord, transform::record_timestamp};

pub mod orchestrator;

pub use orchestrator::{Orchestrator, OrchestratorConfig, RunReport};

/// One page worth of loosely typed source records.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawBatch {
    pub records: Vec<RawRecord>,
    pub progress: FetchProgress,
}

impl RawBatch {
    pub fn new(records: Vec<RawRecord>) -> Self {
        let mut progress = FetchProgress::default();
        for r in &records {
            progress.observe(r);
        }
        Self { records, progress }
    }

    /// Mark this as the last batch before the source hit its page bound.
    pub fn truncated(mut self) -> Self {
        self.progress.truncated = true;
        self
    }
}

/// How far a fetch got through the source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchProgress {
    pub last_record_id: Option<i64>,
    /// Latest source timestamp seen, unaligned.
    pub last_source_ts: Option<OffsetDateTime>,
    /// The source stopped at its page bound with rows possibly left unread.
    pub truncated: bool,
}

impl FetchProgress {
    fn observe(&mut self, record: &RawRecord) {
        if let Some(id) = record.get("record_id").and_then(|v| v.as_i64()) {
            self.last_record_id = self.last_record_id.max(Some(id));
        }
        if let Ok(ts) = record_timestamp(record) {
            self.last_source_ts = self.last_source_ts.max(Some(ts));
        }
    }

    pub fn merge(&mut self, other: FetchProgress) {
        self.last_record_id = self.last_record_id.max(other.last_record_id);
        self.last_source_ts = self.last_source_ts.max(other.last_source_ts);
        self.truncated |= other.truncated;
    }
}

pub type BatchStream = Pin<Box<dyn Stream<Item = Result<RawBatch, PipelineError>> + Send>>;

/// Stage-level failures. Any of these aborts the current run only.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("source rejected request: {0}")]
    SourceRejected(String),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("run exceeded maximum duration of {0:?}")]
    DeadlineExceeded(Duration),
}

impl From<sqlx::Error> for PipelineError {
    fn from(e: sqlx::Error) -> Self {
        PipelineError::Persistence(e.to_string())
    }
}

/// Half-open time range `[start, end)` requested from the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchWindow {
    pub start: OffsetDateTime,
    pub end: OffsetDateTime,
}

/// Row counters accumulated over one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunCounts {
    pub rows_fetched: u64,
    pub rows_valid: u64,
    pub rows_rejected: u64,
    pub rows_flagged: u64,
    pub rows_upserted: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub status: RunStatus,
    /// Final window end; earlier than requested when the fetch was truncated.
    pub window_end: OffsetDateTime,
    pub counts: RunCounts,
    pub progress: FetchProgress,
    pub error_summary: Option<String>,
}

/// Paginated remote data. Each call starts a fresh, finite sequence of batches.
pub trait Source: Send + Sync {
    fn fetch(&self, window: FetchWindow, page_size: usize) -> BatchStream;
}

/// Durable store for deduplicated records and the run ledger.
///
/// Implementations assume a single writer at a time.
#[async_trait::async_trait]
pub trait Repository: Send + Sync {
    /// `window_end` of the latest SUCCEEDED run.
    async fn high_water_mark(&self) -> Result<Option<OffsetDateTime>, PipelineError>;

    async fn record_run_start(&self, window: FetchWindow) -> Result<i64, PipelineError>;

    /// Upsert keyed on `(ts, fuel_type)` in one transaction. Returns rows actually changed.
    async fn upsert_batch(&self, records: &[GenerationRecord]) -> Result<u64, PipelineError>;

    async fn record_run_finish(&self, run_id: i64, outcome: &RunOutcome) -> Result<(), PipelineError>;
}
