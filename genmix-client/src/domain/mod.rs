mod generation;
mod pipeline_run;

pub use generation::{FuelType, GenerationRecord, GenerationRow};
pub use pipeline_run::{PipelineRun, PipelineRunRow, RunStatus};

/// A stored value that does not map back onto a domain type.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unknown fuel type '{0}'")]
    UnknownFuelType(String),
    #[error("unknown run status '{0}'")]
    UnknownStatus(String),
    #[error("timestamp {0} out of range")]
    Timestamp(i64),
}
