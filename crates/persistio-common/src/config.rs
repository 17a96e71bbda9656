//! Configuration types for persistio
//!
//! Every section has defaults, so a config file only needs the values it
//! overrides. Files are layered under `PERSISTIO__*` environment variables.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "PERSISTIO";

/// Root configuration for persistio
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Node identity
    pub node: NodeConfig,
    /// Version lineage configuration
    pub version: VersionConfig,
    /// Persistence cache configuration
    pub cache: CacheConfig,
    /// Write-behind flusher configuration
    pub flusher: FlusherConfig,
    /// Remote object proxy configuration
    pub proxy: ProxyConfig,
    /// Persister behavior
    pub persister: PersisterConfig,
}

impl Config {
    /// Load configuration from an optional file plus environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"));

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot work with
    pub fn validate(&self) -> Result<()> {
        self.node.validate()?;
        if self.version.max_same_node_run == 0 {
            return Err(Error::Configuration(
                "version.max_same_node_run must be at least 1".into(),
            ));
        }
        if self.cache.capacity == 0 {
            return Err(Error::Configuration("cache.capacity must be non-zero".into()));
        }
        if self.flusher.max_pending == 0 {
            return Err(Error::Configuration(
                "flusher.max_pending must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Node identity configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node id written into version tags and ownership markers
    pub id: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: "persistio-node".to_string(),
        }
    }
}

impl NodeConfig {
    /// Node ids end up inside lineage strings and identities
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::Configuration("node.id must not be empty".into()));
        }
        if let Some(c) = self.id.chars().find(|c| matches!(c, ';' | '@') || c.is_whitespace()) {
            return Err(Error::Configuration(format!(
                "node.id contains reserved character {c:?}"
            )));
        }
        Ok(())
    }
}

/// Version lineage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct VersionConfig {
    /// Maximum number of consecutive tags kept from the same node
    pub max_same_node_run: usize,
}

impl Default for VersionConfig {
    fn default() -> Self {
        Self {
            max_same_node_run: 5,
        }
    }
}

/// Persistence cache configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of live entries
    pub capacity: usize,
    /// Idle time after which a clean entry is evicted (0 = never)
    pub idle_timeout_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            idle_timeout_ms: 30 * 60 * 1000, // 30 minutes
        }
    }
}

impl CacheConfig {
    /// Idle eviction timeout, `None` when disabled
    #[must_use]
    pub const fn idle_timeout(&self) -> Option<Duration> {
        if self.idle_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.idle_timeout_ms))
        }
    }
}

/// Write-behind flusher configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FlusherConfig {
    /// Batch writes in the background instead of writing through
    pub write_behind: bool,
    /// Coalescing delay measured from the oldest pending task
    pub delay_ms: u64,
    /// Pending queue length that triggers an early flush
    pub max_pending: usize,
    /// Long cycle that also drives the retry lane
    pub period_ms: u64,
    /// Failed attempts before a task is dropped (0 = retry forever)
    pub retry_limit: u32,
    /// Extra attempts given to retry tasks while shutting down
    pub drain_attempts: u32,
    /// Pause after a resource exhaustion error
    pub oom_backoff_ms: u64,
}

impl Default for FlusherConfig {
    fn default() -> Self {
        Self {
            write_behind: true,
            delay_ms: 1000,
            max_pending: 1000,
            period_ms: 10_000,
            retry_limit: 0,
            drain_attempts: 3,
            oom_backoff_ms: 500,
        }
    }
}

impl FlusherConfig {
    #[must_use]
    pub const fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    #[must_use]
    pub const fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    #[must_use]
    pub const fn oom_backoff(&self) -> Duration {
        Duration::from_millis(self.oom_backoff_ms)
    }
}

/// Whether reloads go through one process-wide worker or one per object
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoaderMode {
    /// One delay-loader shared by every proxy
    #[default]
    Shared,
    /// A private delay-loader per proxied object
    Private,
}

/// Remote object proxy configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Freshness window in ms: negative blocks on reload, 0 never expires,
    /// positive reloads in the background
    pub expiry_ms: i64,
    /// Delay-loader placement
    pub loader: LoaderMode,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            expiry_ms: 60_000,
            loader: LoaderMode::Shared,
        }
    }
}

/// Persister behavior
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PersisterConfig {
    /// Hide records owned by other nodes
    pub owner_only: bool,
    /// Check generated ids against the backend
    pub check_duplicate_ids: bool,
    /// Attempts before id generation gives up
    pub id_retries: u32,
}

impl Default for PersisterConfig {
    fn default() -> Self {
        Self {
            owner_only: false,
            check_duplicate_ids: true,
            id_retries: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.node.id, "persistio-node");
        assert_eq!(config.version.max_same_node_run, 5);
        assert!(config.flusher.write_behind);
        assert_eq!(config.proxy.loader, LoaderMode::Shared);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[node]\nid = \"n7\"\n\n[flusher]\ndelay_ms = 25\n\n[proxy]\nexpiry_ms = -5000\nloader = \"private\""
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.node.id, "n7");
        assert_eq!(config.flusher.delay(), Duration::from_millis(25));
        assert_eq!(config.flusher.max_pending, 1000);
        assert_eq!(config.proxy.expiry_ms, -5000);
        assert_eq!(config.proxy.loader, LoaderMode::Private);
    }

    #[test]
    fn test_validate_rejects_bad_node_id() {
        let mut config = Config::default();
        config.node.id = "a;b".into();
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));

        config.node.id = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_run_cap() {
        let mut config = Config::default();
        config.version.max_same_node_run = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_idle_timeout_disabled() {
        let cache = CacheConfig {
            idle_timeout_ms: 0,
            ..CacheConfig::default()
        };
        assert_eq!(cache.idle_timeout(), None);
    }
}
