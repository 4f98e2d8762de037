use std::time::Duration;

use futures::StreamExt;
use genmix_client::domain::RunStatus;
use time::OffsetDateTime;
use tokio::time::Instant;
use tracing::Instrument;

use super::{FetchProgress, FetchWindow, PipelineError, Repository, RunCounts, RunOutcome, Source};
use crate::transform::{dedupe, flag_mix_sum_violations, normalize, QualityConfig, TieBreak};

const HALF_HOUR: time::Duration = time::Duration::minutes(30);

#[derive(Debug, Clone, Copy)]
pub struct OrchestratorConfig {
    pub page_size: usize,
    /// How far back the first run reaches when the ledger has no successful run.
    pub backfill_window: Duration,
    /// Overlap with the previous window, to pick up late revisions.
    pub lookback: Duration,
    pub max_run_duration: Duration,
    pub quality: QualityConfig,
    pub tie_break: TieBreak,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            page_size: 1000,
            backfill_window: Duration::from_secs(24 * 3600),
            lookback: Duration::ZERO,
            max_run_duration: Duration::from_secs(600),
            quality: QualityConfig::default(),
            tie_break: TieBreak::default(),
        }
    }
}

/// What one run did. `run_id` is `None` when the run never made it into the ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub run_id: Option<i64>,
    pub status: RunStatus,
    /// Window as recorded; its end is pulled back when the fetch was truncated.
    pub window: Option<FetchWindow>,
    pub counts: RunCounts,
    pub progress: FetchProgress,
    pub error: Option<PipelineError>,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    fn failed_before_start(error: PipelineError, window: Option<FetchWindow>) -> Self {
        Self {
            run_id: None,
            status: RunStatus::Failed,
            window,
            counts: RunCounts::default(),
            progress: FetchProgress::default(),
            error: Some(error),
        }
    }
}

/// Where the next run picks up after a truncated fetch.
///
/// Rows are requested in timestamp order, so everything before the last
/// timestamp seen is complete; rows at that timestamp are read again.
fn resume_point(window: FetchWindow, last_seen: Option<OffsetDateTime>) -> OffsetDateTime {
    match last_seen {
        Some(ts) if ts > window.start => ts.min(window.end),
        _ => {
            tracing::warn!(
                window_start = %window.start,
                "page budget does not cover one half hour; rows past the budget at this timestamp are skipped"
            );
            (window.start + HALF_HOUR).min(window.end)
        }
    }
}

/// Drives fetch -> normalize -> dedupe -> upsert for one window and keeps
/// the run ledger in step.
pub struct Orchestrator<S, R> {
    source: S,
    repository: R,
    config: OrchestratorConfig,
    clock: fn() -> OffsetDateTime,
}

impl<S: Source, R: Repository> Orchestrator<S, R> {
    pub fn new(source: S, repository: R, config: OrchestratorConfig) -> Self {
        Self {
            source,
            repository,
            config,
            clock: OffsetDateTime::now_utc,
        }
    }

    pub fn with_clock(mut self, clock: fn() -> OffsetDateTime) -> Self {
        self.clock = clock;
        self
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }

    /// `[high_water - lookback, now)`, or `[now - backfill_window, now)` on a fresh store.
    async fn next_window(&self) -> Result<FetchWindow, PipelineError> {
        let now = (self.clock)();
        let start = match self.repository.high_water_mark().await? {
            Some(mark) => mark - self.config.lookback,
            None => now - self.config.backfill_window,
        };

        Ok(FetchWindow {
            start,
            end: now.max(start),
        })
    }

    fn check_deadline(&self, deadline: Instant) -> Result<(), PipelineError> {
        if Instant::now() >= deadline {
            return Err(PipelineError::DeadlineExceeded(self.config.max_run_duration));
        }
        Ok(())
    }

    async fn execute(
        &self,
        run_id: i64,
        window: FetchWindow,
        deadline: Instant,
        counts: &mut RunCounts,
        progress: &mut FetchProgress,
    ) -> Result<(), PipelineError> {
        let mut valid = Vec::new();

        if window.start < window.end {
            let mut batches = self.source.fetch(window, self.config.page_size);
            loop {
                let next = tokio::time::timeout_at(deadline, batches.next())
                    .await
                    .map_err(|_| PipelineError::DeadlineExceeded(self.config.max_run_duration))?;
                let Some(batch) = next else { break };
                let batch = batch?;

                counts.rows_fetched += batch.records.len() as u64;
                metrics::counter!("genmix_rows_fetched_total").increment(batch.records.len() as u64);
                progress.merge(batch.progress);

                let normalized = normalize(batch.records, &self.config.quality, run_id);
                counts.rows_valid += normalized.valid.len() as u64;
                counts.rows_rejected += normalized.rejected.len() as u64;
                valid.extend(normalized.valid);
            }
        } else {
            tracing::info!("empty window, nothing to fetch");
        }

        self.check_deadline(deadline)?;

        let mut records = dedupe(valid, self.config.tie_break);
        flag_mix_sum_violations(&mut records, &self.config.quality);
        counts.rows_flagged = records.iter().filter(|r| r.quality_suspect).count() as u64;
        metrics::counter!("genmix_rows_flagged_total").increment(counts.rows_flagged);

        self.check_deadline(deadline)?;

        counts.rows_upserted = self.repository.upsert_batch(&records).await?;
        Ok(())
    }

    /// Run one ingestion cycle. Never panics on stage failures; the outcome
    /// is returned and written to the ledger.
    pub async fn run(&self) -> RunReport {
        let started = Instant::now();
        let deadline = started + self.config.max_run_duration;

        let window = match self.next_window().await {
            Ok(w) => w,
            Err(e) => {
                tracing::error!(error = %e, "could not determine fetch window");
                metrics::counter!("genmix_runs_total", "status" => RunStatus::Failed.as_str()).increment(1);
                return RunReport::failed_before_start(e, None);
            }
        };

        let run_id = match self.repository.record_run_start(window).await {
            Ok(id) => id,
            Err(e) => {
                tracing::error!(error = %e, "could not open run in the ledger");
                metrics::counter!("genmix_runs_total", "status" => RunStatus::Failed.as_str()).increment(1);
                return RunReport::failed_before_start(e, Some(window));
            }
        };

        let span = tracing::info_span!(
            "pipeline_run",
            run_id,
            window_start = %window.start,
            window_end = %window.end
        );

        async move {
            tracing::info!("run started");

            let mut counts = RunCounts::default();
            let mut progress = FetchProgress::default();
            let result = self.execute(run_id, window, deadline, &mut counts, &mut progress).await;

            let window_end = if result.is_ok() && progress.truncated {
                let end = resume_point(window, progress.last_source_ts);
                tracing::warn!(resume_at = %end, "fetch truncated, high-water mark held back");
                end
            } else {
                window.end
            };

            let outcome = RunOutcome {
                status: if result.is_ok() { RunStatus::Succeeded } else { RunStatus::Failed },
                window_end,
                counts,
                progress,
                error_summary: result.as_ref().err().map(|e| e.to_string()),
            };

            let mut report = RunReport {
                run_id: Some(run_id),
                status: outcome.status,
                window: Some(FetchWindow { start: window.start, end: window_end }),
                counts,
                progress,
                error: result.err(),
            };

            if let Err(e) = self.repository.record_run_finish(run_id, &outcome).await {
                tracing::error!(error = %e, "could not close run in the ledger");
                report.status = RunStatus::Failed;
                if report.error.is_none() {
                    report.error = Some(e);
                }
            }

            let elapsed = started.elapsed();
            metrics::histogram!("genmix_run_duration_seconds").record(elapsed.as_secs_f64());
            metrics::counter!("genmix_runs_total", "status" => report.status.as_str()).increment(1);

            match &report.error {
                None => tracing::info!(
                    fetched = counts.rows_fetched,
                    valid = counts.rows_valid,
                    rejected = counts.rows_rejected,
                    flagged = counts.rows_flagged,
                    upserted = counts.rows_upserted,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "run succeeded"
                ),
                Some(e) => tracing::error!(
                    error = %e,
                    fetched = counts.rows_fetched,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "run failed"
                ),
            }

            report
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        pipeline::{BatchStream, RawBatch},
        sinks::sqlite::{SqliteRepository, WriteConfig},
        sources::{FetchError, PageClient, PageRequest, PagedSource, PagingConfig, RawRecord},
    };
    use genmix_client::{db, domain::FuelType};
    use serde_json::{json, Map, Value};
    use std::sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    };
    use time::macros::datetime;

    type Script = Vec<Result<Vec<RawRecord>, PipelineError>>;

    /// Each `fetch` call replays the next script and records the window asked for.
    struct ScriptedSource {
        scripts: Mutex<Vec<Script>>,
        windows: Mutex<Vec<FetchWindow>>,
    }

    impl ScriptedSource {
        fn new(mut scripts: Vec<Script>) -> Self {
            scripts.reverse();
            Self {
                scripts: Mutex::new(scripts),
                windows: Mutex::new(Vec::new()),
            }
        }
    }

    impl Source for ScriptedSource {
        fn fetch(&self, window: FetchWindow, _page_size: usize) -> BatchStream {
            self.windows.lock().unwrap().push(window);
            let script = self.scripts.lock().unwrap().pop().unwrap_or_default();
            Box::pin(futures::stream::iter(
                script.into_iter().map(|batch| batch.map(RawBatch::new)),
            ))
        }
    }

    /// Yields one batch, then stalls well past any test deadline.
    struct StallingSource {
        first: Vec<RawRecord>,
    }

    impl Source for StallingSource {
        fn fetch(&self, _window: FetchWindow, _page_size: usize) -> BatchStream {
            let first = futures::stream::iter(vec![Ok::<_, PipelineError>(RawBatch::new(self.first.clone()))]);
            let stalled = futures::stream::once(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, PipelineError>(RawBatch::default())
            });
            Box::pin(first.chain(stalled))
        }
    }

    /// Wide rows served the way the datastore query does: filtered to the
    /// window, ordered by timestamp then id, then offset and limit applied.
    struct WideTable {
        rows: Vec<(OffsetDateTime, Map<String, Value>)>,
    }

    impl WideTable {
        fn new(rows: Vec<(i64, OffsetDateTime)>) -> Self {
            let mut rows: Vec<_> = rows
                .into_iter()
                .map(|(id, ts)| {
                    let row = json!({
                        "_id": id,
                        "DATETIME": ts.unix_timestamp(),
                        "GAS": 100.0,
                        "GAS_perc": 100.0,
                        "GENERATION": 100.0
                    });
                    match row {
                        Value::Object(m) => (ts, m),
                        _ => unreachable!(),
                    }
                })
                .collect();
            rows.sort_by_key(|(ts, m)| (*ts, m["_id"].as_i64()));
            Self { rows }
        }
    }

    #[async_trait::async_trait]
    impl PageClient for WideTable {
        async fn fetch_page(&self, request: &PageRequest) -> Result<Vec<Map<String, Value>>, FetchError> {
            Ok(self
                .rows
                .iter()
                .filter(|(ts, _)| *ts >= request.window.start && *ts < request.window.end)
                .skip(request.offset)
                .take(request.limit)
                .map(|(_, row)| row.clone())
                .collect())
        }
    }

    fn row(ts: &str, fuel: &str, mw: f64, mix: f64) -> RawRecord {
        RawRecord::new()
            .with("timestamp", ts)
            .with("fuel_type", fuel)
            .with("generation_mw", mw)
            .with("mix_percentage", mix)
    }

    fn config() -> OrchestratorConfig {
        OrchestratorConfig {
            page_size: 100,
            quality: QualityConfig { tolerance: 2.0 },
            ..OrchestratorConfig::default()
        }
    }

    fn day_one() -> OffsetDateTime {
        datetime!(2025-01-01 12:00 UTC)
    }

    fn day_two() -> OffsetDateTime {
        datetime!(2025-01-02 12:00 UTC)
    }

    fn earlier() -> OffsetDateTime {
        datetime!(2024-12-31 12:00 UTC)
    }

    async fn orchestrator(scripts: Vec<Script>) -> Orchestrator<ScriptedSource, SqliteRepository> {
        Orchestrator::new(ScriptedSource::new(scripts), repository().await, config())
    }

    async fn repository() -> SqliteRepository {
        let pool = db::schema::in_memory_pool().await.unwrap();
        SqliteRepository::with_pool(pool, WriteConfig::default())
    }

    async fn stored<S: Source>(o: &Orchestrator<S, SqliteRepository>) -> Vec<genmix_client::domain::GenerationRecord> {
        db::generation_in_range(
            o.repository().pool(),
            datetime!(2000-01-01 00:00 UTC),
            datetime!(2100-01-01 00:00 UTC),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn later_run_revises_an_observation_in_place() {
        let first = row("2025-01-01T10:00:00Z", "gas", 100.0, 100.0).with("record_id", 42);
        let revised = row("2025-01-01T10:00:00Z", "gas", 120.0, 100.0).with("record_id", 42);

        let o = orchestrator(vec![vec![Ok(vec![first])], vec![Ok(vec![revised])]])
            .await
            .with_clock(day_one);

        let r1 = o.run().await;
        assert!(r1.succeeded());
        assert_eq!(r1.counts.rows_upserted, 1);

        let o = o.with_clock(day_two);
        let r2 = o.run().await;
        assert!(r2.succeeded());

        let rows = stored(&o).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].record_id, Some(42));
        assert_eq!(rows[0].generation_mw, 120.0);
        assert_eq!(Some(rows[0].ingestion_version), r2.run_id);
    }

    #[tokio::test]
    async fn newer_version_later_in_the_same_run_wins() {
        let v1 = row("2025-01-01T10:00:00Z", "gas", 100.0, 100.0)
            .with("record_id", 42)
            .with("ingestion_version", 1);
        let v2 = row("2025-01-01T10:00:00Z", "gas", 120.0, 100.0)
            .with("record_id", 42)
            .with("ingestion_version", 2);

        let o = orchestrator(vec![vec![Ok(vec![v1]), Ok(vec![v2])]])
            .await
            .with_clock(day_one);

        let report = o.run().await;

        assert!(report.succeeded());
        assert_eq!(report.counts.rows_fetched, 2);
        assert_eq!(report.counts.rows_valid, 2);
        assert_eq!(report.counts.rows_upserted, 1);

        let rows = stored(&o).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].record_id, Some(42));
        assert_eq!(rows[0].generation_mw, 120.0);
        assert_eq!(rows[0].ingestion_version, 2);
    }

    #[tokio::test]
    async fn out_of_range_mix_is_flagged_and_negative_generation_rejected() {
        let batch = vec![
            row("2025-01-01T10:00:00Z", "gas", 100.0, 105.0),
            row("2025-01-01T10:00:00Z", "coal", -5.0, 0.0),
        ];
        let o = orchestrator(vec![vec![Ok(batch)]]).await.with_clock(day_one);

        let report = o.run().await;

        assert!(report.succeeded());
        assert_eq!(
            report.counts,
            RunCounts {
                rows_fetched: 2,
                rows_valid: 1,
                rows_rejected: 1,
                rows_flagged: 1,
                rows_upserted: 1,
            }
        );
        let rows = stored(&o).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].fuel_type, FuelType::Gas);
        assert!(rows[0].quality_suspect);
    }

    /// Counts every counter increment by metric name.
    #[derive(Default)]
    struct CounterRecorder {
        counters: Mutex<std::collections::HashMap<String, Arc<AtomicU64>>>,
    }

    impl CounterRecorder {
        fn value(&self, name: &str) -> u64 {
            self.counters
                .lock()
                .unwrap()
                .get(name)
                .map_or(0, |c| c.load(Ordering::Relaxed))
        }
    }

    impl metrics::Recorder for CounterRecorder {
        fn describe_counter(&self, _: metrics::KeyName, _: Option<metrics::Unit>, _: metrics::SharedString) {}
        fn describe_gauge(&self, _: metrics::KeyName, _: Option<metrics::Unit>, _: metrics::SharedString) {}
        fn describe_histogram(&self, _: metrics::KeyName, _: Option<metrics::Unit>, _: metrics::SharedString) {}

        fn register_counter(&self, key: &metrics::Key, _: &metrics::Metadata<'_>) -> metrics::Counter {
            let counter = Arc::clone(self.counters.lock().unwrap().entry(key.name().to_string()).or_default());
            metrics::Counter::from_arc(counter)
        }

        fn register_gauge(&self, _: &metrics::Key, _: &metrics::Metadata<'_>) -> metrics::Gauge {
            metrics::Gauge::noop()
        }

        fn register_histogram(&self, _: &metrics::Key, _: &metrics::Metadata<'_>) -> metrics::Histogram {
            metrics::Histogram::noop()
        }
    }

    #[test]
    fn flagged_rows_are_counted_once_per_run() {
        let recorder = CounterRecorder::default();
        let report = metrics::with_local_recorder(&recorder, || {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            rt.block_on(async {
                let batch = vec![
                    row("2025-01-01T10:00:00Z", "gas", 100.0, 105.0),
                    row("2025-01-01T10:00:00Z", "wind", 10.0, 10.0),
                ];
                orchestrator(vec![vec![Ok(batch)]]).await.with_clock(day_one).run().await
            })
        });

        assert!(report.succeeded());
        assert_eq!(report.counts.rows_flagged, 2);
        assert_eq!(recorder.value("genmix_rows_flagged_total"), 2);
        assert_eq!(recorder.value("genmix_rows_fetched_total"), 2);
    }

    #[tokio::test]
    async fn rerunning_identical_revisions_changes_nothing() {
        let batch = || {
            vec![
                row("2025-01-01T10:00:00Z", "gas", 60.0, 60.0).with("ingestion_version", 7),
                row("2025-01-01T10:00:00Z", "wind", 40.0, 40.0).with("ingestion_version", 7),
            ]
        };
        let o = orchestrator(vec![vec![Ok(batch())], vec![Ok(batch())]])
            .await
            .with_clock(day_one);

        assert_eq!(o.run().await.counts.rows_upserted, 2);
        let before = stored(&o).await;

        let o = o.with_clock(day_two);
        let again = o.run().await;
        assert!(again.succeeded());
        assert_eq!(again.counts.rows_upserted, 0);
        assert_eq!(stored(&o).await, before);
    }

    #[tokio::test]
    async fn failed_fetch_leaves_the_high_water_mark_alone() {
        let o = orchestrator(vec![
            vec![Ok(vec![row("2025-01-01T10:00:00Z", "gas", 1.0, 100.0)])],
            vec![Err(PipelineError::SourceUnavailable("503".into()))],
        ])
        .await
        .with_clock(day_one);

        assert!(o.run().await.succeeded());
        assert_eq!(o.repository().high_water_mark().await.unwrap(), Some(day_one()));

        let o = o.with_clock(day_two);
        let failed = o.run().await;

        assert_eq!(failed.status, RunStatus::Failed);
        assert_eq!(failed.error, Some(PipelineError::SourceUnavailable("503".into())));
        assert_eq!(o.repository().high_water_mark().await.unwrap(), Some(day_one()));

        let history = db::run_history(o.repository().pool(), 10).await.unwrap();
        assert_eq!(history[0].status, RunStatus::Failed);
        assert!(history[0].error_summary.as_deref().unwrap_or_default().contains("503"));
    }

    #[tokio::test]
    async fn windows_resume_from_the_high_water_mark() {
        let o = orchestrator(vec![]).await.with_clock(day_one);
        o.run().await;
        let o = o.with_clock(day_two);
        o.run().await;

        let windows = o.source.windows.lock().unwrap().clone();
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].start, day_one() - Duration::from_secs(24 * 3600));
        assert_eq!(windows[1], FetchWindow { start: day_one(), end: day_two() });
    }

    #[tokio::test]
    async fn high_water_mark_never_regresses_when_the_clock_does() {
        let o = orchestrator(vec![]).await.with_clock(day_two);
        assert!(o.run().await.succeeded());

        let o = o.with_clock(earlier);
        let report = o.run().await;

        assert!(report.succeeded());
        assert_eq!(report.window, Some(FetchWindow { start: day_two(), end: day_two() }));
        assert_eq!(o.repository().high_water_mark().await.unwrap(), Some(day_two()));
    }

    #[tokio::test]
    async fn exceeding_the_run_deadline_fails_the_run() {
        let mut o = orchestrator(vec![vec![Ok(vec![row("2025-01-01T10:00:00Z", "gas", 1.0, 100.0)])]])
            .await
            .with_clock(day_one);
        o.config.max_run_duration = Duration::ZERO;

        let report = o.run().await;

        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.error, Some(PipelineError::DeadlineExceeded(Duration::ZERO)));
        assert!(stored(&o).await.is_empty());
        assert_eq!(o.repository().high_water_mark().await.unwrap(), None);
    }

    #[tokio::test]
    async fn deadline_between_pages_fails_without_writing() {
        let source = StallingSource {
            first: vec![row("2025-01-01T10:00:00Z", "gas", 1.0, 100.0)],
        };
        let o = Orchestrator::new(
            source,
            repository().await,
            OrchestratorConfig {
                max_run_duration: Duration::from_millis(200),
                ..config()
            },
        )
        .with_clock(day_one);

        let report = o.run().await;

        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(
            report.error,
            Some(PipelineError::DeadlineExceeded(Duration::from_millis(200)))
        );
        assert_eq!(report.counts.rows_fetched, 1);
        assert_eq!(report.counts.rows_upserted, 0);
        assert!(stored(&o).await.is_empty());
        assert_eq!(o.repository().high_water_mark().await.unwrap(), None);
    }

    #[tokio::test]
    async fn truncated_fetch_holds_the_high_water_mark_back_until_caught_up() {
        let nine = datetime!(2025-01-01 09:00 UTC);
        let ten = datetime!(2025-01-01 10:00 UTC);
        let source = PagedSource::new(
            WideTable::new(vec![(1, nine), (2, ten)]),
            PagingConfig {
                max_pages: 1,
                request_timeout: Duration::from_secs(1),
                max_retries: 0,
                retry_backoff: Duration::ZERO,
            },
        );
        let o = Orchestrator::new(
            source,
            repository().await,
            OrchestratorConfig { page_size: 1, ..config() },
        )
        .with_clock(day_one);

        let first = o.run().await;
        assert!(first.succeeded());
        assert!(first.progress.truncated);
        assert_eq!(first.window.map(|w| w.end), Some(nine));
        assert_eq!(o.repository().high_water_mark().await.unwrap(), Some(nine));

        let history = db::run_history(o.repository().pool(), 1).await.unwrap();
        assert!(history[0].truncated);
        assert_eq!(history[0].last_record_id, Some(1));
        assert_eq!(history[0].last_source_ts, Some(nine));
        assert_eq!(history[0].window_end, nine);

        let mut runs = 1;
        while o.repository().high_water_mark().await.unwrap() != Some(day_one()) {
            assert!(runs < 10, "high-water mark never reached the clock");
            assert!(o.run().await.succeeded());
            runs += 1;
        }

        let rows = stored(&o).await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].ts, nine);
        assert_eq!(rows[1].ts, ten);

        let history = db::run_history(o.repository().pool(), 1).await.unwrap();
        assert!(!history[0].truncated);
    }
}
