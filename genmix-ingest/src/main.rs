use anyhow::Result;
use genmix_ingest::{
    config::AppConfig,
    metrics_server,
    observability,
    pipeline::Orchestrator,
    scheduler::Scheduler,
    sinks::SqliteRepository,
    sources::{CkanSqlClient, PagedSource},
};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    // Load configuration
    let cfg = AppConfig::load()?;

    // Start metrics server if configured
    if let Some(metrics_cfg) = &cfg.metrics {
        metrics_server::init(&metrics_cfg.bind_addr)?;
    }

    let repository = SqliteRepository::open(&cfg.db_path, cfg.storage()).await?;
    repository.recover_interrupted_runs().await?;

    let paging = cfg.paging();
    let client = CkanSqlClient::new(&cfg.source.base_url, &cfg.source.resource_id, paging.request_timeout)?;
    let source = PagedSource::new(client, paging);

    let orchestrator = Orchestrator::new(source, repository, cfg.orchestrator());
    let scheduler = Arc::new(Scheduler::new(orchestrator, cfg.poll_interval()));
    let timer = scheduler.start();

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");

    scheduler.shutdown().await;
    if let Err(e) = timer.await {
        tracing::error!(error = %e, "scheduler task ended abnormally");
    }

    Ok(())
}
