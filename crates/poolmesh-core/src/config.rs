//! Pool configuration
//!
//! Recognizes exactly the keys in spec.md §6: `pool.name`, `pool.public`,
//! `pool.private`, `pool.apps`, `pool.life-span-hours`, `cache.size-mb`,
//! `bandwidth`. Unknown top-level keys are rejected at parse time.

use crate::errors::{PoolError, Result};
use serde::{Deserialize, Serialize};

/// Replication/polling aggressiveness. Controls replica tick cadence
/// (spec.md §4.4 "GC & replica", §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Bandwidth {
    /// Replica ticker disabled entirely.
    Low,
    /// Access replication only, no feed replica sweep.
    #[default]
    Medium,
    /// Full replica: access, identities, and feed slots.
    High,
}

/// `[pool]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolSection {
    /// Forward-slash namespaced pool name, e.g. `example.org/team`.
    pub name: String,
    /// Public backend URLs, at least one required.
    pub public: Vec<String>,
    /// Private backend URLs, never shared via invite tokens.
    #[serde(default)]
    pub private: Vec<String>,
    /// Opaque application identifiers; not interpreted by the core.
    #[serde(default)]
    pub apps: Vec<String>,
    /// Garbage-collection threshold, in hours. Default 720 (30 days).
    #[serde(rename = "life-span-hours", default = "default_life_span_hours")]
    pub life_span_hours: u64,
}

fn default_life_span_hours() -> u64 {
    720
}

/// `[cache]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheSection {
    /// Local body-cache budget in megabytes. `0` disables caching.
    #[serde(rename = "size-mb", default = "default_cache_size_mb")]
    pub size_mb: u64,
}

fn default_cache_size_mb() -> u64 {
    16
}

impl Default for CacheSection {
    fn default() -> Self {
        Self { size_mb: default_cache_size_mb() }
    }
}

/// Top-level configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// `[pool]` table.
    pub pool: PoolSection,
    /// `[cache]` table.
    #[serde(default)]
    pub cache: CacheSection,
    /// Replica cadence.
    #[serde(default)]
    pub bandwidth: Bandwidth,
}

impl Config {
    /// Parse and validate a TOML configuration document.
    pub fn parse(toml_text: &str) -> Result<Self> {
        let config: Config = toml::from_str(toml_text)
            .map_err(|e| PoolError::invalid_version(format!("config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.pool.name.trim().is_empty() {
            return Err(PoolError::invalid_id("pool.name must not be empty"));
        }
        if self.pool.public.is_empty() {
            return Err(PoolError::no_backend("pool.public requires at least one backend URL"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config_with_defaults() {
        let cfg = Config::parse(
            r#"
            [pool]
            name = "example.org/team"
            public = ["file:/tmp/pool"]
            "#,
        )
        .unwrap();
        assert_eq!(cfg.pool.life_span_hours, 720);
        assert_eq!(cfg.cache.size_mb, 16);
        assert_eq!(cfg.bandwidth, Bandwidth::Medium);
    }

    #[test]
    fn rejects_unknown_top_level_key() {
        let err = Config::parse(
            r#"
            [pool]
            name = "t"
            public = ["file:/tmp/pool"]
            [unknown]
            x = 1
            "#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn rejects_missing_public_backends() {
        let err = Config::parse(
            r#"
            [pool]
            name = "t"
            public = []
            "#,
        );
        assert!(matches!(err, Err(PoolError::NoBackend { .. })));
    }
}
