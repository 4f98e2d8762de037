use anyhow::Result;
use sqlx::SqlitePool;
use time::OffsetDateTime;

use crate::domain::{FuelType, GenerationRecord, GenerationRow};

/// Resampling granularity for `downsampled_mix`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    HalfHour,
    Hour,
    Day,
}

impl Bucket {
    pub fn seconds(&self) -> i64 {
        match self {
            Bucket::HalfHour => 30 * 60,
            Bucket::Hour => 60 * 60,
            Bucket::Day => 24 * 60 * 60,
        }
    }
}

/// Mean generation per fuel type over one bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct MixBucket {
    pub bucket_start: OffsetDateTime,
    pub fuel_type: FuelType,
    pub mean_generation_mw: f64,
    pub mean_mix_percentage: f64,
    pub samples: i64,
}

#[derive(sqlx::FromRow)]
struct MixBucketRow {
    bucket_start: i64,
    fuel_type: String,
    mean_generation_mw: f64,
    mean_mix_percentage: f64,
    samples: i64,
}

fn decode_rows(rows: Vec<GenerationRow>) -> Result<Vec<GenerationRecord>> {
    rows.into_iter()
        .map(|row| GenerationRecord::try_from(row).map_err(anyhow::Error::from))
        .collect()
}

/// Time-ordered generation mix in `[start, end)`.
pub async fn generation_in_range(
    pool: &SqlitePool,
    start: OffsetDateTime,
    end: OffsetDateTime,
) -> Result<Vec<GenerationRecord>> {
    let rows = sqlx::query_as::<_, GenerationRow>(
        r#"
        SELECT
            timestamp,
            fuel_type,
            generation_mw,
            mix_percentage,
            ingestion_version,
            record_id,
            quality_suspect
        FROM generation
        WHERE timestamp >= ?1
          AND timestamp <  ?2
        ORDER BY timestamp, fuel_type
        "#,
    )
    .bind(start.unix_timestamp())
    .bind(end.unix_timestamp())
    .fetch_all(pool)
    .await?;

    decode_rows(rows)
}

/// Every fuel row of a single settlement half hour.
pub async fn mix_at(pool: &SqlitePool, ts: OffsetDateTime) -> Result<Vec<GenerationRecord>> {
    let rows = sqlx::query_as::<_, GenerationRow>(
        r#"
        SELECT
            timestamp,
            fuel_type,
            generation_mw,
            mix_percentage,
            ingestion_version,
            record_id,
            quality_suspect
        FROM generation
        WHERE timestamp = ?1
        ORDER BY fuel_type
        "#,
    )
    .bind(ts.unix_timestamp())
    .fetch_all(pool)
    .await?;

    decode_rows(rows)
}

/// Mean generation and mix per fuel type, resampled to `bucket`.
pub async fn downsampled_mix(
    pool: &SqlitePool,
    start: OffsetDateTime,
    end: OffsetDateTime,
    bucket: Bucket,
) -> Result<Vec<MixBucket>> {
    let rows = sqlx::query_as::<_, MixBucketRow>(
        r#"
        SELECT
            (timestamp / ?1) * ?1  AS bucket_start,
            fuel_type,
            AVG(generation_mw)     AS mean_generation_mw,
            AVG(mix_percentage)    AS mean_mix_percentage,
            COUNT(*)               AS samples
        FROM generation
        WHERE timestamp >= ?2
          AND timestamp <  ?3
        GROUP BY bucket_start, fuel_type
        ORDER BY bucket_start, fuel_type
        "#,
    )
    .bind(bucket.seconds())
    .bind(start.unix_timestamp())
    .bind(end.unix_timestamp())
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|row| -> Result<MixBucket> {
            Ok(MixBucket {
                bucket_start: OffsetDateTime::from_unix_timestamp(row.bucket_start)?,
                fuel_type: row.fuel_type.parse()?,
                mean_generation_mw: row.mean_generation_mw,
                mean_mix_percentage: row.mean_mix_percentage,
                samples: row.samples,
            })
        })
        .collect()
}

/// Highest ingestion version present; readers compare it to decide whether a
/// cached copy of the table is stale.
pub async fn data_version(pool: &SqlitePool) -> Result<Option<i64>> {
    let version: Option<i64> = sqlx::query_scalar("SELECT MAX(ingestion_version) FROM generation")
        .fetch_one(pool)
        .await?;
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::in_memory_pool;
    use time::macros::datetime;

    async fn insert(pool: &SqlitePool, ts: OffsetDateTime, fuel: FuelType, mw: f64, mix: f64, version: i64) {
        sqlx::query(
            "INSERT INTO generation (timestamp, fuel_type, generation_mw, mix_percentage, ingestion_version, record_id, quality_suspect, row_hash, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, NULL, 0, 'h', 0)",
        )
        .bind(ts.unix_timestamp())
        .bind(fuel.as_str())
        .bind(mw)
        .bind(mix)
        .bind(version)
        .execute(pool)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn range_query_is_half_open_and_ordered() {
        let pool = in_memory_pool().await.unwrap();
        insert(&pool, datetime!(2025-01-01 00:30 UTC), FuelType::Wind, 40.0, 40.0, 1).await;
        insert(&pool, datetime!(2025-01-01 00:00 UTC), FuelType::Wind, 30.0, 30.0, 1).await;
        insert(&pool, datetime!(2025-01-01 00:00 UTC), FuelType::Gas, 70.0, 70.0, 1).await;
        insert(&pool, datetime!(2025-01-01 01:00 UTC), FuelType::Gas, 10.0, 10.0, 1).await;

        let rows = generation_in_range(
            &pool,
            datetime!(2025-01-01 00:00 UTC),
            datetime!(2025-01-01 01:00 UTC),
        )
        .await
        .unwrap();

        let keys: Vec<_> = rows.iter().map(|r| r.key()).collect();
        assert_eq!(
            keys,
            vec![
                (datetime!(2025-01-01 00:00 UTC), FuelType::Gas),
                (datetime!(2025-01-01 00:00 UTC), FuelType::Wind),
                (datetime!(2025-01-01 00:30 UTC), FuelType::Wind),
            ]
        );

        let at = mix_at(&pool, datetime!(2025-01-01 00:00 UTC)).await.unwrap();
        assert_eq!(at.len(), 2);
    }

    #[tokio::test]
    async fn downsampling_averages_per_fuel_and_bucket() {
        let pool = in_memory_pool().await.unwrap();
        insert(&pool, datetime!(2025-01-01 00:00 UTC), FuelType::Wind, 30.0, 30.0, 1).await;
        insert(&pool, datetime!(2025-01-01 00:30 UTC), FuelType::Wind, 50.0, 50.0, 2).await;
        insert(&pool, datetime!(2025-01-01 01:00 UTC), FuelType::Wind, 10.0, 10.0, 3).await;

        let buckets = downsampled_mix(
            &pool,
            datetime!(2025-01-01 00:00 UTC),
            datetime!(2025-01-02 00:00 UTC),
            Bucket::Hour,
        )
        .await
        .unwrap();

        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].bucket_start, datetime!(2025-01-01 00:00 UTC));
        assert_eq!(buckets[0].mean_generation_mw, 40.0);
        assert_eq!(buckets[0].samples, 2);
        assert_eq!(buckets[1].mean_mix_percentage, 10.0);

        assert_eq!(data_version(&pool).await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn empty_table_has_no_data_version() {
        let pool = in_memory_pool().await.unwrap();
        assert_eq!(data_version(&pool).await.unwrap(), None);
    }
}
