pub mod config;
pub mod metrics_server;
pub mod observability;
pub mod pipeline;
pub mod scheduler;
pub mod sinks;
pub mod sources;
pub mod transform;

pub use pipeline::{FetchProgress, Orchestrator, PipelineError, RawBatch, RunReport};
pub use scheduler::{Scheduler, TriggerOutcome};
