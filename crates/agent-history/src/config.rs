// agent-history/crates/agent-history/src/config.rs

use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

use crate::memory_db::schema::{KeyLayout, TtlPolicy};

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: PathBuf,
    pub pool_size: u32,
    pub ttl_attribute: Option<String>,
    pub ttl_seconds: u64,
    pub summary_threshold: usize,
    pub max_field_bytes: usize,
    pub cache_ttl_seconds: u64,
    pub per_agent_history: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/agent_history.db"),
            pool_size: 8,
            ttl_attribute: None,
            ttl_seconds: 3600,
            summary_threshold: 20,
            // Headroom below a 400 KB per-item limit for keys and metadata
            max_field_bytes: 350_000,
            cache_ttl_seconds: 10,
            per_agent_history: true,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }

        let defaults = Self::default();

        let ttl_attribute = env::var("AGENT_HISTORY_TTL_ATTRIBUTE")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        Ok(Self {
            database_path: env::var("AGENT_HISTORY_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            pool_size: parse_var("AGENT_HISTORY_POOL_SIZE", defaults.pool_size)?,
            ttl_attribute,
            ttl_seconds: parse_var("AGENT_HISTORY_TTL_SECONDS", defaults.ttl_seconds)?,
            summary_threshold: parse_var("AGENT_HISTORY_SUMMARY_THRESHOLD", defaults.summary_threshold)?,
            max_field_bytes: parse_var("AGENT_HISTORY_MAX_FIELD_BYTES", defaults.max_field_bytes)?,
            cache_ttl_seconds: parse_var("AGENT_HISTORY_CACHE_TTL_SECONDS", defaults.cache_ttl_seconds)?,
            per_agent_history: parse_var("AGENT_HISTORY_PER_AGENT", defaults.per_agent_history)?,
        })
    }

    pub fn store_options(&self) -> DurableStoreOptions {
        DurableStoreOptions {
            ttl: TtlPolicy {
                attribute: self.ttl_attribute.clone(),
                duration_seconds: self.ttl_seconds as i64,
            },
            summary_threshold: self.summary_threshold,
            max_field_bytes: self.max_field_bytes,
            aggregate_cache_ttl: Duration::from_secs(self.cache_ttl_seconds),
            layout: KeyLayout {
                per_agent_history: self.per_agent_history,
            },
        }
    }

    pub fn print_config(&self) {
        info!("Current Configuration:");
        info!("- Database: {}", self.database_path.display());
        info!("- Pool Size: {}", self.pool_size);
        match &self.ttl_attribute {
            Some(attribute) => info!("- TTL: {}s in attribute '{}'", self.ttl_seconds, attribute),
            None => info!("- TTL: disabled"),
        }
        info!("- Summary Threshold: {} messages", self.summary_threshold);
        info!("- Max Field Size: {} bytes", self.max_field_bytes);
        info!("- Aggregate Cache TTL: {}s", self.cache_ttl_seconds);
        info!("- Per-Agent History: {}", self.per_agent_history);
    }
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for {}: {:?}", name, raw)),
        Err(_) => Ok(default),
    }
}

/// Behaviour knobs for [`crate::memory_db::DurableChatStorage`].
#[derive(Debug, Clone)]
pub struct DurableStoreOptions {
    pub ttl: TtlPolicy,
    /// Live messages kept per session by summarization.
    pub summary_threshold: usize,
    /// Largest summary stored in a single field; larger ones are chunked.
    pub max_field_bytes: usize,
    pub aggregate_cache_ttl: Duration,
    pub layout: KeyLayout,
}

impl Default for DurableStoreOptions {
    fn default() -> Self {
        Config::default().store_options()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_config() -> Config {
        Config {
            database_path: PathBuf::from("/tmp/test/history.db"),
            pool_size: 4,
            ttl_attribute: Some("ttl".to_string()),
            ttl_seconds: 600,
            summary_threshold: 10,
            max_field_bytes: 1024,
            cache_ttl_seconds: 5,
            per_agent_history: true,
        }
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.summary_threshold, 20);
        assert!(config.ttl_attribute.is_none());
        assert!(config.per_agent_history);
        assert!(config.max_field_bytes < 400 * 1024);
    }

    #[test]
    fn test_store_options_carry_config() {
        let options = create_test_config().store_options();
        assert_eq!(options.ttl.attribute.as_deref(), Some("ttl"));
        assert_eq!(options.ttl.duration_seconds, 600);
        assert_eq!(options.summary_threshold, 10);
        assert_eq!(options.max_field_bytes, 1024);
        assert_eq!(options.aggregate_cache_ttl, Duration::from_secs(5));
        assert!(options.layout.per_agent_history);
    }

    #[test]
    fn test_parse_var_reads_and_rejects() {
        env::set_var("AGENT_HISTORY_TEST_THRESHOLD", " 42 ");
        assert_eq!(parse_var("AGENT_HISTORY_TEST_THRESHOLD", 1usize).unwrap(), 42);

        env::set_var("AGENT_HISTORY_TEST_THRESHOLD", "many");
        assert!(parse_var("AGENT_HISTORY_TEST_THRESHOLD", 1usize).is_err());

        env::remove_var("AGENT_HISTORY_TEST_THRESHOLD");
        assert_eq!(parse_var("AGENT_HISTORY_TEST_THRESHOLD", 7usize).unwrap(), 7);
    }

    #[test]
    fn test_parse_var_bool() {
        env::set_var("AGENT_HISTORY_TEST_FLAG", "false");
        assert!(!parse_var("AGENT_HISTORY_TEST_FLAG", true).unwrap());
        env::remove_var("AGENT_HISTORY_TEST_FLAG");
    }
}
