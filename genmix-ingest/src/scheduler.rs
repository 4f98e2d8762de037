//! Periodic trigger for ingestion runs.
//!
//! At most one run is in flight at a time. A trigger that arrives while a
//! run is active is skipped, never queued.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{sync::Mutex, task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::pipeline::{Orchestrator, Repository, RunReport, Source};

/// Anything the scheduler can run.
#[async_trait::async_trait]
pub trait Job: Send + Sync + 'static {
    async fn run(&self) -> RunReport;
}

#[async_trait::async_trait]
impl<S, R> Job for Orchestrator<S, R>
where
    S: Source + 'static,
    R: Repository + 'static,
{
    async fn run(&self) -> RunReport {
        Orchestrator::run(self).await
    }
}

#[derive(Debug)]
pub enum TriggerOutcome {
    Started(JoinHandle<RunReport>),
    /// A run was already in flight.
    OverlapSkipped,
    ShuttingDown,
}

pub struct Scheduler<J> {
    job: Arc<J>,
    interval: Duration,
    run_lock: Arc<Mutex<()>>,
    shutdown: CancellationToken,
    overlap_skips: AtomicU64,
}

impl<J: Job> Scheduler<J> {
    pub fn new(job: J, interval: Duration) -> Self {
        Self {
            job: Arc::new(job),
            interval,
            run_lock: Arc::new(Mutex::new(())),
            shutdown: CancellationToken::new(),
            overlap_skips: AtomicU64::new(0),
        }
    }

    /// Start a run in the background unless one is already in flight.
    pub fn trigger(&self) -> TriggerOutcome {
        if self.shutdown.is_cancelled() {
            return TriggerOutcome::ShuttingDown;
        }

        let Ok(guard) = Arc::clone(&self.run_lock).try_lock_owned() else {
            self.overlap_skips.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("genmix_overlap_skipped_total").increment(1);
            tracing::warn!("overlap skipped: previous run still in flight");
            return TriggerOutcome::OverlapSkipped;
        };

        let job = Arc::clone(&self.job);
        TriggerOutcome::Started(tokio::spawn(async move {
            let _guard = guard;
            job.run().await
        }))
    }

    /// Trigger and wait for the run. `None` if nothing was started.
    pub async fn run_now(&self) -> Option<RunReport> {
        match self.trigger() {
            TriggerOutcome::Started(handle) => match handle.await {
                Ok(report) => Some(report),
                Err(e) => {
                    tracing::error!(error = %e, "ingestion run task panicked");
                    None
                }
            },
            TriggerOutcome::OverlapSkipped | TriggerOutcome::ShuttingDown => None,
        }
    }

    /// Spawn the interval loop. The first tick fires immediately.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tracing::info!(interval_secs = this.interval.as_secs(), "scheduler started");
            let mut ticker = tokio::time::interval(this.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = this.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let TriggerOutcome::ShuttingDown = this.trigger() {
                            break;
                        }
                    }
                }
            }

            tracing::info!("scheduler stopped");
        })
    }

    /// Stop triggering and wait for any in-flight run to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        if self.is_running() {
            tracing::info!("waiting for in-flight run to finish");
        }
        let _idle = self.run_lock.lock().await;
    }

    pub fn is_running(&self) -> bool {
        self.run_lock.try_lock().is_err()
    }

    pub fn overlap_skips(&self) -> u64 {
        self.overlap_skips.load(Ordering::Relaxed)
    }
}
