use std::{sync::Arc, time::Duration};

use serde_json::{Map, Value};

use super::raw::explode_source_row;
use crate::pipeline::{BatchStream, FetchWindow, PipelineError, RawBatch, Source};

/// One page request against the remote table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub window: FetchWindow,
    pub offset: usize,
    pub limit: usize,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    /// Timeouts, connection failures, 5xx. Worth retrying.
    #[error("transient fetch failure: {0}")]
    Transient(String),
    /// Bad query, auth failure, undecodable payload. Retrying will not help.
    #[error("request rejected: {0}")]
    Rejected(String),
}

/// Transport for a single page of source rows.
#[async_trait::async_trait]
pub trait PageClient: Send + Sync + 'static {
    async fn fetch_page(&self, request: &PageRequest) -> Result<Vec<Map<String, Value>>, FetchError>;
}

#[derive(Debug, Clone, Copy)]
pub struct PagingConfig {
    pub max_pages: u32,
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,
}

/// Offset-paginated source over any `PageClient`.
///
/// Stops after a page shorter than `page_size`, or after `max_pages` pages
/// with the last batch marked truncated.
pub struct PagedSource<C> {
    client: Arc<C>,
    config: PagingConfig,
}

impl<C: PageClient> PagedSource<C> {
    pub fn new(client: C, config: PagingConfig) -> Self {
        Self {
            client: Arc::new(client),
            config,
        }
    }
}

async fn fetch_with_retry<C: PageClient>(
    client: &C,
    request: &PageRequest,
    config: &PagingConfig,
) -> Result<Vec<Map<String, Value>>, PipelineError> {
    let mut attempt: u32 = 0;
    loop {
        let res = match tokio::time::timeout(config.request_timeout, client.fetch_page(request)).await {
            Ok(res) => res,
            Err(_) => Err(FetchError::Transient(format!(
                "page request timed out after {:?}",
                config.request_timeout
            ))),
        };

        match res {
            Ok(rows) => return Ok(rows),
            Err(FetchError::Rejected(msg)) => {
                tracing::error!(error = %msg, offset = request.offset, "source rejected page request");
                return Err(PipelineError::SourceRejected(msg));
            }
            Err(FetchError::Transient(msg)) if attempt < config.max_retries => {
                attempt += 1;
                let sleep_for = config.retry_backoff * attempt;
                tracing::warn!(
                    error = %msg,
                    attempt,
                    offset = request.offset,
                    "page fetch failed, retrying with backoff"
                );
                metrics::counter!("genmix_fetch_retries_total").increment(1);
                tokio::time::sleep(sleep_for).await;
            }
            Err(FetchError::Transient(msg)) => {
                tracing::error!(error = %msg, attempt, "page fetch failed, giving up");
                metrics::counter!("genmix_fetch_errors_total").increment(1);
                return Err(PipelineError::SourceUnavailable(msg));
            }
        }
    }
}

impl<C: PageClient> Source for PagedSource<C> {
    fn fetch(&self, window: FetchWindow, page_size: usize) -> BatchStream {
        let client = Arc::clone(&self.client);
        let config = self.config;
        let page_size = page_size.max(1);

        let s = async_stream::try_stream! {
            let mut offset = 0usize;
            let mut pages = 0u32;

            while pages < config.max_pages {
                let request = PageRequest { window, offset, limit: page_size };
                let rows = fetch_with_retry(client.as_ref(), &request, &config).await?;
                pages += 1;

                let row_count = rows.len();
                offset += row_count;
                tracing::debug!(page = pages, rows = row_count, offset, "fetched page");

                let records: Vec<_> = rows.into_iter().flat_map(explode_source_row).collect();
                let batch = RawBatch::new(records);

                if row_count < page_size {
                    yield batch;
                    break;
                }
                if pages == config.max_pages {
                    tracing::warn!(
                        max_pages = config.max_pages,
                        offset,
                        "max page count reached, window truncated"
                    );
                    yield batch.truncated();
                    break;
                }
                yield batch;
            }
        };

        Box::pin(s)
    }
}
