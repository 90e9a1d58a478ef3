use std::{path::Path, time::Duration};

use anyhow::{ensure, Context};

/// Default maximum nesting depth, root comments being at depth 0
pub const DEFAULT_MAX_DEPTH: usize = 3;
pub const DEFAULT_DELETED_PLACEHOLDER: &str = "This comment has been deleted";

#[derive(Clone, Debug, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    pub max_depth: usize,

    /// Number of top-level comments per listing page
    pub page_size: u32,

    /// How long an event can wait for its parent before a full resync is requested
    pub hold_timeout_ms: u64,
    pub max_held_events: usize,

    pub ping_interval_ms: u64,
    /// No pong for that long means the connection is lost
    pub disconnect_after_ms: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,

    /// Transparent retries for read requests. Mutations are never retried without the user.
    pub read_retries: u32,

    pub deleted_placeholder: String,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            max_depth: DEFAULT_MAX_DEPTH,
            page_size: crate::api::DEFAULT_PAGE_SIZE,
            hold_timeout_ms: 5_000,
            max_held_events: 256,
            ping_interval_ms: 10_000,
            disconnect_after_ms: 20_000,
            reconnect_base_ms: 500,
            reconnect_max_ms: 30_000,
            read_retries: 3,
            deleted_placeholder: String::from(DEFAULT_DELETED_PLACEHOLDER),
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> anyhow::Result<Config> {
        let contents = std::fs::read(path)
            .with_context(|| format!("reading configuration file {}", path.display()))?;
        let config: Config = serde_json::from_slice(&contents)
            .with_context(|| format!("parsing configuration file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(
            self.max_depth >= 2,
            "max_depth must be at least 2, got {}",
            self.max_depth
        );
        ensure!(self.page_size > 0, "page_size must be positive");
        ensure!(self.max_held_events > 0, "max_held_events must be positive");
        ensure!(
            self.ping_interval_ms < self.disconnect_after_ms,
            "ping_interval_ms ({}) must be shorter than disconnect_after_ms ({})",
            self.ping_interval_ms,
            self.disconnect_after_ms
        );
        ensure!(
            self.reconnect_base_ms > 0 && self.reconnect_base_ms <= self.reconnect_max_ms,
            "reconnect_base_ms must be positive and at most reconnect_max_ms"
        );
        crate::api::validate_string(&self.deleted_placeholder)
            .context("validating deleted_placeholder")?;
        Ok(())
    }

    pub fn hold_timeout(&self) -> Duration {
        Duration::from_millis(self.hold_timeout_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn disconnect_after(&self) -> Duration {
        Duration::from_millis(self.disconnect_after_ms)
    }

    pub fn reconnect_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_keeps_defaults() {
        let c: Config = serde_json::from_str(r#"{"max_depth": 5, "page_size": 20}"#).unwrap();
        assert_eq!(c.max_depth, 5);
        assert_eq!(c.page_size, 20);
        assert_eq!(c.hold_timeout_ms, 5_000);
        assert_eq!(c.deleted_placeholder, DEFAULT_DELETED_PLACEHOLDER);
        c.validate().unwrap();
    }

    #[test]
    fn rejects_shallow_depth() {
        let c = Config {
            max_depth: 1,
            ..Config::default()
        };
        assert!(c.validate().is_err());
    }
}
