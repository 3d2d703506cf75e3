//! YAML-backed startup configuration. Everything here has a `Default` that
//! matches the behavior the pipeline falls back to when a field is simply
//! absent from the document, so a config file only needs to mention what
//! it wants to override.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen_addr: String,
    pub listen_queue_size: i32,
    pub idle_timeout_secs: u64,
    pub enable_cork: bool,
    pub recycle_threshold: usize,
    pub max_connection_memory: usize,
    pub thread_pool: HashMap<String, usize>,
}

impl Config {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn from_yaml_str(text: &str) -> Result<Config> {
        serde_yaml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Config> {
        let text = std::fs::read_to_string(path)?;
        Config::from_yaml_str(&text)
    }

    pub fn thread_pool_size(&self, stage: &str) -> usize {
        self.thread_pool.get(stage).copied().unwrap_or(4)
    }
}

impl Default for Config {
    fn default() -> Config {
        Config {
            listen_addr: "127.0.0.1:7900".to_string(),
            listen_queue_size: 128,
            idle_timeout_secs: 15,
            enable_cork: true,
            recycle_threshold: 256,
            max_connection_memory: 4 * 1024 * 1024,
            thread_pool: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.listen_queue_size, 128);
        assert_eq!(cfg.idle_timeout_secs, 15);
        assert!(cfg.enable_cork);
        assert_eq!(cfg.max_connection_memory, 4 * 1024 * 1024);
    }

    #[test]
    fn partial_yaml_document_only_overrides_named_fields() {
        let cfg = Config::from_yaml_str("listen_addr: 0.0.0.0:9000\nidle_timeout_secs: 30\n").unwrap();
        assert_eq!(cfg.listen_addr, "0.0.0.0:9000");
        assert_eq!(cfg.idle_timeout_secs, 30);
        assert_eq!(cfg.listen_queue_size, 128);
    }

    #[test]
    fn malformed_yaml_is_a_config_error_not_a_panic() {
        assert!(Config::from_yaml_str(": not valid").is_err());
    }
}
