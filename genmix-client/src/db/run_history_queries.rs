use anyhow::Result;
use sqlx::SqlitePool;
use time::OffsetDateTime;

use crate::domain::{PipelineRun, PipelineRunRow};

/// Most recent ledger entries, newest first.
pub async fn run_history(pool: &SqlitePool, limit: u32) -> Result<Vec<PipelineRun>> {
    let rows = sqlx::query_as::<_, PipelineRunRow>(
        r#"
        SELECT
            id,
            started_at,
            finished_at,
            status,
            window_start,
            window_end,
            rows_fetched,
            rows_valid,
            rows_rejected,
            rows_flagged,
            rows_upserted,
            last_record_id,
            last_source_ts,
            truncated,
            error_summary
        FROM pipeline_run_history
        ORDER BY id DESC
        LIMIT ?1
        "#,
    )
    .bind(i64::from(limit))
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|row| PipelineRun::try_from(row).map_err(anyhow::Error::from))
        .collect()
}

/// Completion time of the latest successful run.
pub async fn last_refresh(pool: &SqlitePool) -> Result<Option<OffsetDateTime>> {
    let finished: Option<i64> = sqlx::query_scalar(
        r#"
        SELECT MAX(finished_at)
        FROM pipeline_run_history
        WHERE status = 'SUCCEEDED'
        "#,
    )
    .fetch_one(pool)
    .await?;

    Ok(finished.map(OffsetDateTime::from_unix_timestamp).transpose()?)
}
