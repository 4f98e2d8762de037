use serde::Deserialize;
use std::{fs, time::Duration};

use crate::{
    pipeline::OrchestratorConfig,
    sinks::sqlite::WriteConfig,
    sources::{ckan_http::DEFAULT_BASE_URL, PagingConfig},
    transform::{QualityConfig, TieBreak},
};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub base_url: String,
    pub resource_id: String,
    pub page_size: usize,
    pub max_pages: u32,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            resource_id: String::new(),
            page_size: 1000,
            max_pages: 500,
            request_timeout_secs: 30,
            max_retries: 3,
            retry_backoff_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QualitySettings {
    pub tolerance: f64,
    pub tie_break: TieBreak,
}

impl Default for QualitySettings {
    fn default() -> Self {
        Self {
            tolerance: QualityConfig::default().tolerance,
            tie_break: TieBreak::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub max_connections: u32,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let w = WriteConfig::default();
        Self {
            max_connections: w.max_connections,
            max_retries: w.max_retries,
            retry_backoff_ms: w.retry_backoff.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub bind_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub db_path: String,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_backfill_window_hours")]
    pub backfill_window_hours: u64,
    #[serde(default)]
    pub window_lookback_mins: u64,
    #[serde(default = "default_max_run_duration_secs")]
    pub max_run_duration_secs: u64,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub quality: QualitySettings,
    #[serde(default)]
    pub storage: StorageConfig,
    pub metrics: Option<MetricsConfig>,
}

fn default_poll_interval_secs() -> u64 {
    1800
}

fn default_backfill_window_hours() -> u64 {
    24
}

fn default_max_run_duration_secs() -> u64 {
    600
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        use std::env;

        let path = env::var("GENMIX_CONFIG").unwrap_or_else(|_| "genmix-config.toml".to_string());
        let contents = fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("failed to read config {path}: {e}"))?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        let cfg: AppConfig = toml::from_str(contents)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.db_path.trim().is_empty() {
            anyhow::bail!("db_path must not be empty");
        }
        if self.source.resource_id.trim().is_empty() {
            anyhow::bail!("source.resource_id must be set");
        }
        if self.source.page_size == 0 {
            anyhow::bail!("source.page_size must be greater than zero");
        }
        if self.source.max_pages == 0 {
            anyhow::bail!("source.max_pages must be greater than zero");
        }
        if self.poll_interval_secs == 0 {
            anyhow::bail!("poll_interval_secs must be greater than zero");
        }
        if self.max_run_duration_secs == 0 {
            anyhow::bail!("max_run_duration_secs must be greater than zero");
        }
        if !self.quality.tolerance.is_finite() || self.quality.tolerance < 0.0 {
            anyhow::bail!("quality.tolerance must be a non-negative number");
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            page_size: self.source.page_size,
            backfill_window: Duration::from_secs(self.backfill_window_hours * 3600),
            lookback: Duration::from_secs(self.window_lookback_mins * 60),
            max_run_duration: Duration::from_secs(self.max_run_duration_secs),
            quality: QualityConfig {
                tolerance: self.quality.tolerance,
            },
            tie_break: self.quality.tie_break,
        }
    }

    pub fn paging(&self) -> PagingConfig {
        PagingConfig {
            max_pages: self.source.max_pages,
            request_timeout: Duration::from_secs(self.source.request_timeout_secs),
            max_retries: self.source.max_retries,
            retry_backoff: Duration::from_millis(self.source.retry_backoff_ms),
        }
    }

    pub fn storage(&self) -> WriteConfig {
        WriteConfig {
            max_connections: self.storage.max_connections,
            max_retries: self.storage.max_retries,
            retry_backoff: Duration::from_millis(self.storage.retry_backoff_ms),
        }
    }
}
