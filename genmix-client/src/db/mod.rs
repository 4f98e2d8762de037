pub mod generation_queries;
pub mod run_history_queries;
pub mod schema;

pub use generation_queries::{
    data_version, downsampled_mix, generation_in_range, mix_at, Bucket, MixBucket,
};
pub use run_history_queries::{last_refresh, run_history};
