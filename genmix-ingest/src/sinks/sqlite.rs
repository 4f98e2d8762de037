use std::{path::Path, time::Duration};

use genmix_client::{
    db::schema,
    domain::{GenerationRecord, RunStatus},
};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    QueryBuilder, Sqlite, SqlitePool,
};
use time::OffsetDateTime;

use crate::pipeline::{FetchWindow, PipelineError, Repository, RunOutcome};

/// Bound parameters per row of the upsert statement.
const UPSERT_COLUMNS: usize = 9;
/// Conservative limit on bound parameters per statement.
const MAX_BIND_PARAMS: usize = 999;

fn hash_str(hasher: &mut blake3::Hasher, s: &str) {
    let len = s.len() as u32;
    hasher.update(&len.to_le_bytes());
    hasher.update(s.as_bytes());
}

fn hash_f64(hasher: &mut blake3::Hasher, v: f64) {
    hasher.update(&v.to_bits().to_le_bytes());
}

fn hash_opt_i64(hasher: &mut blake3::Hasher, v: Option<i64>) {
    match v {
        Some(x) => {
            hasher.update(&[1]);
            hasher.update(&x.to_le_bytes());
        }
        None => {
            hasher.update(&[0]);
        }
    }
}

/// Content fingerprint of an observation. Leaves out `ingestion_version` and
/// `updated_at`: a re-fetch that only carries a newer version changes nothing,
/// and the stored row keeps its original version.
fn row_hash(r: &GenerationRecord) -> String {
    let mut h = blake3::Hasher::new();
    h.update(&r.ts.unix_timestamp().to_le_bytes());
    hash_str(&mut h, r.fuel_type.as_str());
    hash_f64(&mut h, r.generation_mw);
    hash_f64(&mut h, r.mix_percentage);
    hash_opt_i64(&mut h, r.record_id);
    h.update(&[u8::from(r.quality_suspect)]);
    h.finalize().to_hex().to_string()
}

#[derive(Debug, Clone, Copy)]
pub struct WriteConfig {
    pub max_connections: u32,
    pub max_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for WriteConfig {
    fn default() -> Self {
        Self {
            max_connections: 4,
            max_retries: 2,
            retry_backoff: Duration::from_millis(250),
        }
    }
}

/// SQLite-backed `Repository`.
///
/// Data writes and ledger writes never share a transaction, so a failed data
/// write still leaves a FAILED ledger row behind.
pub struct SqliteRepository {
    pool: SqlitePool,
    config: WriteConfig,
}

impl SqliteRepository {
    /// Open (creating if needed) the database file and apply the schema.
    pub async fn open(db_path: &str, config: WriteConfig) -> Result<Self, PipelineError> {
        if let Some(parent) = Path::new(db_path).parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| PipelineError::Persistence(format!("failed to create {}: {e}", parent.display())))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_with(options)
            .await?;
        schema::apply(&pool).await?;

        tracing::info!(db_path, "opened generation store");
        Ok(Self { pool, config })
    }

    pub fn with_pool(pool: SqlitePool, config: WriteConfig) -> Self {
        Self { pool, config }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close out ledger rows left RUNNING by a process that died mid-run.
    pub async fn recover_interrupted_runs(&self) -> Result<u64, PipelineError> {
        let res = sqlx::query(
            r#"
            UPDATE pipeline_run_history
            SET status = 'FAILED',
                finished_at = ?1,
                error_summary = 'interrupted: process exited before the run finished'
            WHERE status = 'RUNNING'
            "#,
        )
        .bind(OffsetDateTime::now_utc().unix_timestamp())
        .execute(&self.pool)
        .await?;

        let recovered = res.rows_affected();
        if recovered > 0 {
            tracing::warn!(runs = recovered, "marked interrupted runs as FAILED");
        }
        Ok(recovered)
    }

    async fn write_chunks(&self, records: &[GenerationRecord]) -> Result<u64, sqlx::Error> {
        let updated_at = OffsetDateTime::now_utc().unix_timestamp();
        let rows_per_statement = MAX_BIND_PARAMS / UPSERT_COLUMNS;

        let mut tx = self.pool.begin().await?;
        let mut changed = 0u64;

        for chunk in records.chunks(rows_per_statement) {
            let mut builder = QueryBuilder::<Sqlite>::new(
                "INSERT INTO generation (timestamp, fuel_type, generation_mw, mix_percentage, ingestion_version, record_id, quality_suspect, row_hash, updated_at) ",
            );

            builder.push_values(chunk, |mut b, r| {
                b.push_bind(r.ts.unix_timestamp())
                    .push_bind(r.fuel_type.as_str())
                    .push_bind(r.generation_mw)
                    .push_bind(r.mix_percentage)
                    .push_bind(r.ingestion_version)
                    .push_bind(r.record_id)
                    .push_bind(r.quality_suspect)
                    .push_bind(row_hash(r))
                    .push_bind(updated_at);
            });

            builder.push(
                r#"
                ON CONFLICT (timestamp, fuel_type) DO UPDATE SET
                    generation_mw     = excluded.generation_mw,
                    mix_percentage    = excluded.mix_percentage,
                    ingestion_version = excluded.ingestion_version,
                    record_id         = excluded.record_id,
                    quality_suspect   = excluded.quality_suspect,
                    row_hash          = excluded.row_hash,
                    updated_at        = excluded.updated_at
                WHERE excluded.ingestion_version >= generation.ingestion_version
                  AND excluded.row_hash <> generation.row_hash
                "#,
            );

            changed += builder.build().execute(&mut *tx).await?.rows_affected();
        }

        tx.commit().await?;
        Ok(changed)
    }
}

#[async_trait::async_trait]
impl Repository for SqliteRepository {
    async fn high_water_mark(&self) -> Result<Option<OffsetDateTime>, PipelineError> {
        let mark: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(window_end) FROM pipeline_run_history WHERE status = 'SUCCEEDED'",
        )
        .fetch_one(&self.pool)
        .await?;

        mark.map(OffsetDateTime::from_unix_timestamp)
            .transpose()
            .map_err(|e| PipelineError::Persistence(format!("stored high-water mark out of range: {e}")))
    }

    async fn record_run_start(&self, window: FetchWindow) -> Result<i64, PipelineError> {
        let res = sqlx::query(
            r#"
            INSERT INTO pipeline_run_history (started_at, status, window_start, window_end)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(OffsetDateTime::now_utc().unix_timestamp())
        .bind(RunStatus::Running.as_str())
        .bind(window.start.unix_timestamp())
        .bind(window.end.unix_timestamp())
        .execute(&self.pool)
        .await?;

        Ok(res.last_insert_rowid())
    }

    async fn upsert_batch(&self, records: &[GenerationRecord]) -> Result<u64, PipelineError> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut attempt: u32 = 0;
        loop {
            match self.write_chunks(records).await {
                Ok(changed) => {
                    metrics::counter!("genmix_rows_upserted_total").increment(changed);
                    tracing::debug!(attempted = records.len(), changed, "upserted batch");
                    return Ok(changed);
                }
                Err(e) if attempt < self.config.max_retries => {
                    attempt += 1;
                    let sleep_for = self.config.retry_backoff * attempt;
                    tracing::warn!(
                        error = %e,
                        attempt,
                        "generation upsert failed, retrying with backoff"
                    );
                    tokio::time::sleep(sleep_for).await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "generation upsert failed, giving up");
                    metrics::counter!("genmix_persistence_errors_total").increment(1);
                    return Err(e.into());
                }
            }
        }
    }

    async fn record_run_finish(&self, run_id: i64, outcome: &RunOutcome) -> Result<(), PipelineError> {
        let c = &outcome.counts;
        let p = &outcome.progress;
        let res = sqlx::query(
            r#"
            UPDATE pipeline_run_history
            SET finished_at    = ?1,
                status         = ?2,
                window_end     = ?3,
                rows_fetched   = ?4,
                rows_valid     = ?5,
                rows_rejected  = ?6,
                rows_flagged   = ?7,
                rows_upserted  = ?8,
                last_record_id = ?9,
                last_source_ts = ?10,
                truncated      = ?11,
                error_summary  = ?12
            WHERE id = ?13
              AND status = 'RUNNING'
            "#,
        )
        .bind(OffsetDateTime::now_utc().unix_timestamp())
        .bind(outcome.status.as_str())
        .bind(outcome.window_end.unix_timestamp())
        .bind(c.rows_fetched as i64)
        .bind(c.rows_valid as i64)
        .bind(c.rows_rejected as i64)
        .bind(c.rows_flagged as i64)
        .bind(c.rows_upserted as i64)
        .bind(p.last_record_id)
        .bind(p.last_source_ts.map(|ts| ts.unix_timestamp()))
        .bind(p.truncated)
        .bind(outcome.error_summary.as_deref())
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            return Err(PipelineError::Persistence(format!(
                "run {run_id} is not open in the ledger"
            )));
        }
        Ok(())
    }
}
