// Pool Configuration
//
// Settings supplied by the hosting process, loadable from JSON.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Sequencer pool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Directory holding one sub-directory per table.
    pub root: PathBuf,

    /// How long an unlocked sequencer may sit idle before
    /// `release_inactive` closes it.
    #[serde(default = "default_inactive_ttl_ms")]
    pub inactive_ttl_ms: u64,

    /// Fresh opens attempted for a distressed table before giving up.
    #[serde(default = "default_recreate_distressed_attempts")]
    pub recreate_distressed_attempts: u32,
}

fn default_inactive_ttl_ms() -> u64 {
    120_000
}

fn default_recreate_distressed_attempts() -> u32 {
    3
}

impl PoolConfig {
    /// Built-in defaults for a given root.
    pub fn default_config(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            inactive_ttl_ms: default_inactive_ttl_ms(),
            recreate_distressed_attempts: default_recreate_distressed_attempts(),
        }
    }

    pub fn with_inactive_ttl_ms(mut self, inactive_ttl_ms: u64) -> Self {
        self.inactive_ttl_ms = inactive_ttl_ms;
        self
    }

    pub fn with_recreate_distressed_attempts(mut self, attempts: u32) -> Self {
        self.recreate_distressed_attempts = attempts;
        self
    }

    pub fn inactive_ttl_us(&self) -> u64 {
        self.inactive_ttl_ms.saturating_mul(1_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let config: PoolConfig = serde_json::from_str(r#"{ "root": "/var/db" }"#).unwrap();

        assert_eq!(config, PoolConfig::default_config("/var/db"));
        assert_eq!(config.inactive_ttl_us(), 120_000_000);
        assert_eq!(config.recreate_distressed_attempts, 3);
    }

    #[test]
    fn explicit_fields_override_defaults() {
        let config: PoolConfig = serde_json::from_str(
            r#"{ "root": "/db", "inactive_ttl_ms": 0, "recreate_distressed_attempts": 5 }"#,
        )
        .unwrap();

        assert_eq!(config.inactive_ttl_us(), 0);
        assert_eq!(config.recreate_distressed_attempts, 5);
    }
}
