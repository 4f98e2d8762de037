use std::collections::HashMap;

use genmix_client::domain::{FuelType, GenerationRecord};
use serde_json::Value;
use time::{
    format_description::{well_known::Rfc3339, FormatItem},
    macros::{datetime, format_description},
    Date, Duration, OffsetDateTime, PrimitiveDateTime,
};

use crate::sources::RawRecord;

pub mod dedupe;

pub use dedupe::{dedupe, TieBreak};

const HALF_HOUR_SECS: i64 = 30 * 60;

const NAIVE_T: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");
const NAIVE_SPACE: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
const DATE_ONLY: &[FormatItem<'static>] = format_description!("[year]-[month]-[day]");

/// Thresholds for the quality checks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityConfig {
    /// Allowed deviation, in percentage points, before a record is flagged.
    pub tolerance: f64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self { tolerance: 1.0 }
    }
}

/// Why a raw record could not become a `GenerationRecord`.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum RejectReason {
    #[error("missing field '{0}'")]
    MissingField(&'static str),
    #[error("unparseable timestamp {0}")]
    UnparseableTimestamp(String),
    #[error("timestamp outside the accepted range")]
    TimestampOutOfRange,
    #[error("settlement period {0} outside 1..=50")]
    InvalidSettlementPeriod(i64),
    #[error("field '{field}' is not a finite number: {value}")]
    InvalidNumber { field: &'static str, value: String },
    #[error("unknown fuel type {0}")]
    UnknownFuelType(String),
    #[error("generation_mw must be non-negative, got {0}")]
    NegativeGeneration(f64),
    #[error("mix_percentage below zero beyond tolerance, got {0}")]
    NegativeMix(f64),
}

impl RejectReason {
    /// Low-cardinality label for metrics.
    pub fn code(&self) -> &'static str {
        match self {
            RejectReason::MissingField(_) => "missing_field",
            RejectReason::UnparseableTimestamp(_) => "unparseable_timestamp",
            RejectReason::TimestampOutOfRange => "timestamp_out_of_range",
            RejectReason::InvalidSettlementPeriod(_) => "invalid_settlement_period",
            RejectReason::InvalidNumber { .. } => "invalid_number",
            RejectReason::UnknownFuelType(_) => "unknown_fuel_type",
            RejectReason::NegativeGeneration(_) => "negative_generation",
            RejectReason::NegativeMix(_) => "negative_mix",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub record: RawRecord,
    pub reason: RejectReason,
}

/// Result of normalizing one batch.
#[derive(Debug, Default)]
pub struct Normalized {
    pub valid: Vec<GenerationRecord>,
    pub rejected: Vec<Rejection>,
}

impl Normalized {
    pub fn flagged(&self) -> usize {
        self.valid.iter().filter(|r| r.quality_suspect).count()
    }
}

/// A typed record plus the source's total for its half hour, if reported.
#[derive(Debug, Clone, PartialEq)]
pub struct Coerced {
    pub record: GenerationRecord,
    pub reported_total: Option<f64>,
}

fn number(raw: &RawRecord, field: &'static str) -> Result<Option<f64>, RejectReason> {
    let Some(value) = raw.get(field) else {
        return Ok(None);
    };

    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };

    match parsed {
        Some(v) if v.is_finite() => Ok(Some(v)),
        _ => Err(RejectReason::InvalidNumber {
            field,
            value: value.to_string(),
        }),
    }
}

fn required_number(raw: &RawRecord, field: &'static str) -> Result<f64, RejectReason> {
    number(raw, field)?.ok_or(RejectReason::MissingField(field))
}

fn integer(raw: &RawRecord, field: &'static str) -> Result<Option<i64>, RejectReason> {
    match number(raw, field)? {
        None => Ok(None),
        Some(v) if v.fract() == 0.0 && v >= i64::MIN as f64 && v <= i64::MAX as f64 => Ok(Some(v as i64)),
        Some(v) => Err(RejectReason::InvalidNumber {
            field,
            value: v.to_string(),
        }),
    }
}

/// RFC 3339, naive `YYYY-MM-DDTHH:MM:SS` (taken as UTC), or unix seconds.
pub fn parse_timestamp(value: &Value) -> Result<OffsetDateTime, RejectReason> {
    let unparseable = || RejectReason::UnparseableTimestamp(value.to_string());

    match value {
        Value::String(s) => {
            let s = s.trim();
            OffsetDateTime::parse(s, &Rfc3339)
                .or_else(|_| PrimitiveDateTime::parse(s, NAIVE_T).map(PrimitiveDateTime::assume_utc))
                .or_else(|_| PrimitiveDateTime::parse(s, NAIVE_SPACE).map(PrimitiveDateTime::assume_utc))
                .map_err(|_| unparseable())
        }
        Value::Number(n) => n
            .as_i64()
            .and_then(|secs| OffsetDateTime::from_unix_timestamp(secs).ok())
            .ok_or_else(unparseable),
        _ => Err(unparseable()),
    }
}

/// Start of a settlement period: period 1 begins at 00:00 UTC of the settlement date.
fn settlement_timestamp(raw: &RawRecord, date: &Value) -> Result<OffsetDateTime, RejectReason> {
    let date_str = date
        .as_str()
        .ok_or_else(|| RejectReason::UnparseableTimestamp(date.to_string()))?;
    let date = Date::parse(date_str.trim(), DATE_ONLY)
        .map_err(|_| RejectReason::UnparseableTimestamp(date_str.to_string()))?;

    let period = integer(raw, "settlement_period")?.ok_or(RejectReason::MissingField("settlement_period"))?;
    if !(1..=50).contains(&period) {
        return Err(RejectReason::InvalidSettlementPeriod(period));
    }

    Ok(date.midnight().assume_utc() + Duration::minutes(30 * (period - 1)))
}

/// Floor to the enclosing half-hour boundary (UTC), dropping sub-second parts.
pub fn align_half_hour(ts: OffsetDateTime) -> Result<OffsetDateTime, RejectReason> {
    let secs = ts.unix_timestamp();
    OffsetDateTime::from_unix_timestamp(secs - secs.rem_euclid(HALF_HOUR_SECS))
        .map_err(|_| RejectReason::TimestampOutOfRange)
}

/// Source timestamp of a raw record in UTC, before half-hour alignment.
pub fn record_timestamp(raw: &RawRecord) -> Result<OffsetDateTime, RejectReason> {
    let ts = match (raw.get("timestamp"), raw.get("settlement_date")) {
        (Some(ts), _) => parse_timestamp(ts)?,
        (None, Some(date)) => settlement_timestamp(raw, date)?,
        (None, None) => return Err(RejectReason::MissingField("timestamp")),
    };
    Ok(ts.to_offset(time::UtcOffset::UTC))
}

/// Type one raw record. Range violations that keep the record usable set
/// `quality_suspect` instead of rejecting.
pub fn coerce(raw: &RawRecord, cfg: &QualityConfig, default_version: i64) -> Result<Coerced, RejectReason> {
    let ts = align_half_hour(record_timestamp(raw)?)?;

    let min_ts = datetime!(2000-01-01 00:00:00 UTC);
    let max_ts = datetime!(2100-01-01 00:00:00 UTC);
    if ts < min_ts || ts >= max_ts {
        return Err(RejectReason::TimestampOutOfRange);
    }

    let fuel_value = raw.get("fuel_type").ok_or(RejectReason::MissingField("fuel_type"))?;
    let fuel_type = fuel_value
        .as_str()
        .and_then(|s| s.parse::<FuelType>().ok())
        .ok_or_else(|| RejectReason::UnknownFuelType(fuel_value.to_string()))?;

    let generation_mw = required_number(raw, "generation_mw")?;
    if generation_mw < 0.0 {
        return Err(RejectReason::NegativeGeneration(generation_mw));
    }

    let mix_percentage = required_number(raw, "mix_percentage")?;
    if mix_percentage < -cfg.tolerance {
        return Err(RejectReason::NegativeMix(mix_percentage));
    }

    let ingestion_version = integer(raw, "ingestion_version")?.unwrap_or(default_version);
    let record_id = integer(raw, "record_id")?;
    let reported_total = number(raw, "total_generation_mw")?;

    Ok(Coerced {
        record: GenerationRecord {
            ts,
            fuel_type,
            generation_mw,
            mix_percentage,
            ingestion_version,
            record_id,
            quality_suspect: mix_percentage > 100.0 + cfg.tolerance,
        },
        reported_total,
    })
}

fn implied_deviation(generation_mw: f64, mix_percentage: f64, total: f64) -> f64 {
    if total > 0.0 {
        (generation_mw / total * 100.0 - mix_percentage).abs()
    } else {
        mix_percentage.abs()
    }
}

/// Normalize and validate one batch.
///
/// Records missing a source revision get `default_version`. Each record's
/// percentage is recomputed from its generation against the reported total
/// for its half hour, or the batch's summed generation when none is reported.
pub fn normalize(records: Vec<RawRecord>, cfg: &QualityConfig, default_version: i64) -> Normalized {
    let mut coerced = Vec::with_capacity(records.len());
    let mut rejected = Vec::new();

    for raw in records {
        match coerce(&raw, cfg, default_version) {
            Ok(c) => coerced.push(c),
            Err(reason) => {
                metrics::counter!("genmix_rows_rejected_total", "reason" => reason.code()).increment(1);
                tracing::debug!(reason = %reason, "rejected record");
                rejected.push(Rejection { record: raw, reason });
            }
        }
    }

    // Per key the last occurrence counts, so re-sent rows are not double counted.
    let mut per_key = HashMap::new();
    for c in &coerced {
        per_key.insert(c.record.key(), c.record.generation_mw);
    }
    let mut batch_totals: HashMap<OffsetDateTime, f64> = HashMap::new();
    for ((ts, _), mw) in per_key {
        *batch_totals.entry(ts).or_default() += mw;
    }

    let valid: Vec<GenerationRecord> = coerced
        .into_iter()
        .map(|c| {
            let mut record = c.record;
            let total = c
                .reported_total
                .unwrap_or_else(|| batch_totals.get(&record.ts).copied().unwrap_or_default());
            if implied_deviation(record.generation_mw, record.mix_percentage, total) > cfg.tolerance {
                record.quality_suspect = true;
            }
            record
        })
        .collect();

    Normalized { valid, rejected }
}

/// Flag every record of a half hour whose mix percentages do not sum to 100
/// within tolerance. Expects deduplicated input. Returns how many records
/// were newly flagged.
pub fn flag_mix_sum_violations(records: &mut [GenerationRecord], cfg: &QualityConfig) -> usize {
    let mut sums: HashMap<OffsetDateTime, f64> = HashMap::new();
    for r in records.iter() {
        *sums.entry(r.ts).or_default() += r.mix_percentage;
    }

    let mut newly_flagged = 0;
    for r in records.iter_mut() {
        let sum = sums.get(&r.ts).copied().unwrap_or_default();
        if (sum - 100.0).abs() > cfg.tolerance && !r.quality_suspect {
            r.quality_suspect = true;
            newly_flagged += 1;
        }
    }

    if newly_flagged > 0 {
        tracing::warn!(records = newly_flagged, "mix percentages do not sum to 100");
    }
    newly_flagged
}
