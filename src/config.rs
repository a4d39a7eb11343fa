// ABOUTME: Runtime configuration for leases, queue expiry and storage paths
// ABOUTME: Loaded once from TOML (optional) and passed to every component

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::document::DocumentRef;
use crate::lease::RetryStrategy;

/// Timing for one lease role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseSettings {
    /// Lease time to live
    pub ttl_ms: u64,
    /// First backoff delay after a failed attempt
    pub initial_ms: u64,
    /// Upper bound for a single backoff delay
    pub max_delay_ms: u64,
    /// Total acquisition budget; defaults to the ttl
    pub max_wait_ms: Option<u64>,
}

impl LeaseSettings {
    pub const fn new(ttl_ms: u64, initial_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            ttl_ms,
            initial_ms,
            max_delay_ms,
            max_wait_ms: None,
        }
    }

    pub fn with_max_wait_ms(mut self, max_wait_ms: u64) -> Self {
        self.max_wait_ms = Some(max_wait_ms);
        self
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn retry(&self) -> RetryStrategy {
        RetryStrategy::exponential(
            Duration::from_millis(self.initial_ms),
            Duration::from_millis(self.max_delay_ms),
        )
        .with_max_wait(Duration::from_millis(self.max_wait_ms.unwrap_or(self.ttl_ms)))
    }
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self::new(5_000, 1_000, 10_000)
    }
}

/// Configuration shared by the lease coordinator, queue, watcher and serializer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Project that owns the document database
    pub project_id: String,
    /// Location of the local SQLite cache; defaults to ~/.billing-state/cache.db
    pub cache_path: Option<PathBuf>,
    /// Queue container time to live, refreshed by every access and liveness tick
    pub queue_expiry_ms: u64,
    /// Interval of the watcher's liveness tick
    pub liveness_ms: u64,
    pub watch_lease: LeaseSettings,
    pub enqueue_lease: LeaseSettings,
    pub dequeue_lease: LeaseSettings,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            project_id: "local".to_string(),
            cache_path: None,
            queue_expiry_ms: 5_000,
            liveness_ms: 1_000,
            watch_lease: LeaseSettings::new(5_000, 1_000, 15_000).with_max_wait_ms(30_000),
            enqueue_lease: LeaseSettings::new(5_000, 1_000, 10_000),
            dequeue_lease: LeaseSettings::new(5_000, 1_000, 5_000),
        }
    }
}

impl StateConfig {
    /// Load configuration from a TOML file. Missing keys keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: StateConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.project_id.trim().is_empty() {
            anyhow::bail!("project_id cannot be empty");
        }
        if self.queue_expiry_ms == 0 {
            anyhow::bail!("queue_expiry_ms must be greater than zero");
        }
        if self.liveness_ms == 0 || self.liveness_ms >= self.watch_lease.ttl_ms {
            anyhow::bail!(
                "liveness_ms ({}) must be non-zero and shorter than the watch lease ttl ({})",
                self.liveness_ms,
                self.watch_lease.ttl_ms
            );
        }
        Ok(())
    }

    pub fn database_path(&self) -> String {
        format!("projects/{}/databases/(default)", self.project_id)
    }

    /// Fully-qualified storage path of a document.
    pub fn document_path(&self, reference: &DocumentRef) -> String {
        format!("{}/documents/{}", self.database_path(), reference.path())
    }

    pub fn queue_expiry(&self) -> Duration {
        Duration::from_millis(self.queue_expiry_ms)
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_ms)
    }

    pub fn resolve_cache_path(&self) -> Result<PathBuf> {
        match &self.cache_path {
            Some(path) => Ok(path.clone()),
            None => {
                let home = dirs::home_dir()
                    .ok_or_else(|| anyhow!("unable to determine home directory"))?;
                Ok(home.join(".billing-state").join("cache.db"))
            }
        }
    }
}
