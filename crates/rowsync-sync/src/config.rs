use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rowsync_adapters::HttpGateway;
use rowsync_core::ResourceType;
use rowsync_storage::{
    ApiClient, ApiClientConfig, FileStateStore, PgStateStore, RetryPolicy, StateStore,
    DEFAULT_MAX_PAGES,
};
use serde::Deserialize;

use crate::reconcile::ReconcileOptions;
use crate::scheduler::{BatchScheduler, SchedulerSettings};

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Comma-separated millisecond list; falls back to `default` when empty or malformed.
pub fn parse_delays_ms(raw: &str, default: &[u64]) -> Vec<Duration> {
    let parsed: Option<Vec<u64>> = raw
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| v.parse().ok())
        .collect();
    match parsed {
        Some(values) if !values.is_empty() => {
            values.into_iter().map(Duration::from_millis).collect()
        }
        _ => default.iter().copied().map(Duration::from_millis).collect(),
    }
}

pub const DEFAULT_BACKFILL_DELAYS_MS: [u64; 3] = [1000, 2000, 3000];

/// Row count above which a job is split into chunks, per resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub company: usize,
    pub note: usize,
    pub entity: usize,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            company: 100,
            note: 100,
            entity: 100,
        }
    }
}

impl Thresholds {
    pub fn for_resource(&self, resource: ResourceType) -> usize {
        match resource {
            ResourceType::Company => self.company,
            ResourceType::Note => self.note,
            ResourceType::Entity => self.entity,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    thresholds: Thresholds,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub api_base_url: String,
    pub api_token: Option<String>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub base_delay_ms: u64,
    pub max_attempts: u32,
    pub backfill_delays: Vec<Duration>,
    pub chunk_size: usize,
    pub max_chunks: usize,
    pub max_pages: usize,
    pub export_pages_per_chunk: usize,
    pub state_dir: PathBuf,
    /// Root for input and output files named by HTTP callers.
    pub data_dir: PathBuf,
    pub database_url: Option<String>,
    pub config_path: Option<PathBuf>,
    pub driver_cron: Option<String>,
    pub web_port: u16,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8080".to_string(),
            api_token: None,
            user_agent: "rowsync/0.1".to_string(),
            http_timeout_secs: 30,
            base_delay_ms: 50,
            max_attempts: 6,
            backfill_delays: DEFAULT_BACKFILL_DELAYS_MS
                .iter()
                .copied()
                .map(Duration::from_millis)
                .collect(),
            chunk_size: 50,
            max_chunks: 500,
            max_pages: DEFAULT_MAX_PAGES,
            export_pages_per_chunk: 10,
            state_dir: PathBuf::from("./state"),
            data_dir: PathBuf::from("./data"),
            database_url: None,
            config_path: None,
            driver_cron: None,
            web_port: 8000,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            api_base_url: env_opt("ROWSYNC_API_BASE_URL").unwrap_or(defaults.api_base_url),
            api_token: env_opt("ROWSYNC_API_TOKEN"),
            user_agent: env_opt("ROWSYNC_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_or("ROWSYNC_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            base_delay_ms: env_or("ROWSYNC_BASE_DELAY_MS", defaults.base_delay_ms),
            max_attempts: env_or("ROWSYNC_MAX_ATTEMPTS", defaults.max_attempts).max(1),
            backfill_delays: env_opt("ROWSYNC_BACKFILL_DELAYS_MS")
                .map(|raw| parse_delays_ms(&raw, &DEFAULT_BACKFILL_DELAYS_MS))
                .unwrap_or(defaults.backfill_delays),
            chunk_size: env_or("ROWSYNC_CHUNK_SIZE", defaults.chunk_size).max(1),
            max_chunks: env_or("ROWSYNC_MAX_CHUNKS", defaults.max_chunks).max(1),
            max_pages: env_or("ROWSYNC_MAX_PAGES", defaults.max_pages).max(1),
            export_pages_per_chunk: env_or(
                "ROWSYNC_EXPORT_PAGES_PER_CHUNK",
                defaults.export_pages_per_chunk,
            )
            .max(1),
            state_dir: env_opt("ROWSYNC_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.state_dir),
            data_dir: env_opt("ROWSYNC_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            database_url: env_opt("DATABASE_URL"),
            config_path: env_opt("ROWSYNC_CONFIG").map(PathBuf::from),
            driver_cron: env_opt("ROWSYNC_DRIVER_CRON"),
            web_port: env_or("ROWSYNC_WEB_PORT", defaults.web_port),
        }
    }

    pub fn api_client_config(&self) -> ApiClientConfig {
        ApiClientConfig {
            base_url: self.api_base_url.clone(),
            token: self.api_token.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            base_delay: Duration::from_millis(self.base_delay_ms),
            retry: RetryPolicy {
                max_attempts: self.max_attempts,
                ..RetryPolicy::default()
            },
        }
    }

    pub fn thresholds(&self) -> Result<Thresholds> {
        let Some(path) = &self.config_path else {
            return Ok(Thresholds::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let file: ConfigFile =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        Ok(file.thresholds)
    }

    pub fn scheduler_settings(&self) -> Result<SchedulerSettings> {
        Ok(SchedulerSettings {
            chunk_size: self.chunk_size,
            max_chunks: self.max_chunks,
            max_pages: self.max_pages,
            export_pages_per_chunk: self.export_pages_per_chunk,
            thresholds: self.thresholds()?,
            reconcile: ReconcileOptions {
                backfill_delays: self.backfill_delays.clone(),
            },
            ..SchedulerSettings::default()
        })
    }

    /// Postgres when `DATABASE_URL` is set, otherwise one JSON file per key under `state_dir`.
    pub async fn open_state_store(&self) -> Result<Arc<dyn StateStore>> {
        match &self.database_url {
            Some(url) => {
                let store = PgStateStore::connect(url)
                    .await
                    .context("connecting to the state database")?;
                store
                    .ensure_schema()
                    .await
                    .context("creating the rowsync_state table")?;
                Ok(Arc::new(store))
            }
            None => Ok(Arc::new(FileStateStore::new(self.state_dir.clone()))),
        }
    }

    /// Scheduler over the configured state store and the HTTP gateway.
    pub async fn build_scheduler(&self) -> Result<BatchScheduler> {
        let store = self.open_state_store().await?;
        let client = ApiClient::new(self.api_client_config()).context("building API client")?;
        Ok(BatchScheduler::new(
            store,
            Arc::new(HttpGateway::new(client)),
            self.scheduler_settings()?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn delay_list_parsing_falls_back_on_garbage() {
        assert_eq!(
            parse_delays_ms("500, 1500", &DEFAULT_BACKFILL_DELAYS_MS),
            vec![Duration::from_millis(500), Duration::from_millis(1500)]
        );
        assert_eq!(
            parse_delays_ms("soon", &DEFAULT_BACKFILL_DELAYS_MS),
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(3)
            ]
        );
    }

    #[test]
    fn thresholds_come_from_yaml_with_defaults() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("rowsync.yaml");
        std::fs::write(&path, "thresholds:\n  note: 250\n").unwrap();
        let config = SyncConfig {
            config_path: Some(path),
            ..SyncConfig::default()
        };
        let thresholds = config.thresholds().unwrap();
        assert_eq!(thresholds.for_resource(ResourceType::Note), 250);
        assert_eq!(thresholds.for_resource(ResourceType::Company), 100);
    }

    #[test]
    fn client_config_carries_attempt_budget() {
        let config = SyncConfig {
            max_attempts: 4,
            ..SyncConfig::default()
        };
        let client = config.api_client_config();
        assert_eq!(client.retry.max_attempts, 4);
        assert_eq!(client.base_delay, Duration::from_millis(50));
        assert_eq!(client.user_agent.as_deref(), Some("rowsync/0.1"));
    }
}
