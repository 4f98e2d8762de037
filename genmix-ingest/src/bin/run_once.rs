use anyhow::Result;
use genmix_ingest::{
    config::AppConfig,
    observability,
    pipeline::Orchestrator,
    sinks::SqliteRepository,
    sources::{CkanSqlClient, PagedSource},
};

/// One manual ingestion run. Exits non-zero when the run fails.
#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let cfg = AppConfig::load()?;

    let repository = SqliteRepository::open(&cfg.db_path, cfg.storage()).await?;
    repository.recover_interrupted_runs().await?;

    let paging = cfg.paging();
    let client = CkanSqlClient::new(&cfg.source.base_url, &cfg.source.resource_id, paging.request_timeout)?;
    let orchestrator = Orchestrator::new(PagedSource::new(client, paging), repository, cfg.orchestrator());

    let report = orchestrator.run().await;
    let c = &report.counts;
    println!(
        "run {} {}: fetched={} valid={} rejected={} flagged={} upserted={}",
        report.run_id.map(|id| id.to_string()).unwrap_or_else(|| "-".to_string()),
        report.status,
        c.rows_fetched,
        c.rows_valid,
        c.rows_rejected,
        c.rows_flagged,
        c.rows_upserted,
    );
    if report.progress.truncated {
        if let Some(w) = report.window {
            println!("fetch truncated at page limit; next run resumes from {}", w.end);
        }
    }

    match report.error {
        None => Ok(()),
        Some(e) => Err(anyhow::anyhow!("ingestion run failed: {e}")),
    }
}
