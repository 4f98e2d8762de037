use std::{fmt, str::FromStr};

use time::OffsetDateTime;

use super::DecodeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Succeeded => "SUCCEEDED",
            RunStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RUNNING" => Ok(RunStatus::Running),
            "SUCCEEDED" => Ok(RunStatus::Succeeded),
            "FAILED" => Ok(RunStatus::Failed),
            other => Err(DecodeError::UnknownStatus(other.to_string())),
        }
    }
}

/// One entry of the append-only run ledger.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PipelineRun {
    pub id: i64,
    pub started_at: OffsetDateTime,
    pub finished_at: Option<OffsetDateTime>,
    pub status: RunStatus,
    pub window_start: OffsetDateTime,
    pub window_end: OffsetDateTime,
    pub rows_fetched: i64,
    pub rows_valid: i64,
    pub rows_rejected: i64,
    pub rows_flagged: i64,
    pub rows_upserted: i64,
    /// Highest upstream `_id` the run fetched.
    pub last_record_id: Option<i64>,
    /// Latest upstream timestamp the run fetched.
    pub last_source_ts: Option<OffsetDateTime>,
    /// The page bound stopped the fetch before the window was exhausted.
    pub truncated: bool,
    pub error_summary: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PipelineRunRow {
    pub id: i64,
    pub started_at: i64,
    pub finished_at: Option<i64>,
    pub status: String,
    pub window_start: i64,
    pub window_end: i64,
    pub rows_fetched: i64,
    pub rows_valid: i64,
    pub rows_rejected: i64,
    pub rows_flagged: i64,
    pub rows_upserted: i64,
    pub last_record_id: Option<i64>,
    pub last_source_ts: Option<i64>,
    pub truncated: bool,
    pub error_summary: Option<String>,
}

fn unix(ts: i64) -> Result<OffsetDateTime, DecodeError> {
    OffsetDateTime::from_unix_timestamp(ts).map_err(|_| DecodeError::Timestamp(ts))
}

impl TryFrom<PipelineRunRow> for PipelineRun {
    type Error = DecodeError;

    fn try_from(row: PipelineRunRow) -> Result<Self, Self::Error> {
        Ok(PipelineRun {
            id: row.id,
            started_at: unix(row.started_at)?,
            finished_at: row.finished_at.map(unix).transpose()?,
            status: row.status.parse()?,
            window_start: unix(row.window_start)?,
            window_end: unix(row.window_end)?,
            rows_fetched: row.rows_fetched,
            rows_valid: row.rows_valid,
            rows_rejected: row.rows_rejected,
            rows_flagged: row.rows_flagged,
            rows_upserted: row.rows_upserted,
            last_record_id: row.last_record_id,
            last_source_ts: row.last_source_ts.map(unix).transpose()?,
            truncated: row.truncated,
            error_summary: row.error_summary,
        })
    }
}
