//! Allocator configuration
//!
//! Loaded from TOML (file or string) with environment overrides:
//! - SPANCACHE_CONFIG: path to a TOML file
//! - SPANCACHE_ARENA_BYTES, SPANCACHE_MAX_HEAP_BYTES, SPANCACHE_SAMPLE_RATE,
//!   SPANCACHE_STACK_CACHE_BYTES, SPANCACHE_STATS_FLUSH_THRESHOLD

use crate::error::ConfigError;
use crate::sizeclass::PAGE_SIZE;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocConfig {
    /// Bytes requested from the system allocator per arena.
    #[serde(default = "default_arena_bytes")]
    pub arena_bytes: usize,

    /// Upper bound on arena memory; 0 means unlimited.
    #[serde(default)]
    pub max_heap_bytes: usize,

    /// Mean bytes between heap-profile samples; 0 disables sampling.
    #[serde(default = "default_sample_rate")]
    pub sample_rate: usize,

    /// Per-order stack cache budget.
    #[serde(default = "default_stack_cache_bytes")]
    pub stack_cache_bytes: usize,

    /// Local stat events that force a flush on the next refill; 0 flushes
    /// only at collection and teardown.
    #[serde(default = "default_stats_flush_threshold")]
    pub stats_flush_threshold: u64,
}

fn default_arena_bytes() -> usize {
    4 << 20
}

fn default_sample_rate() -> usize {
    512 * 1024
}

fn default_stack_cache_bytes() -> usize {
    32 * 1024
}

fn default_stats_flush_threshold() -> u64 {
    4096
}

impl Default for AllocConfig {
    fn default() -> Self {
        Self {
            arena_bytes: default_arena_bytes(),
            max_heap_bytes: 0,
            sample_rate: default_sample_rate(),
            stack_cache_bytes: default_stack_cache_bytes(),
            stats_flush_threshold: default_stats_flush_threshold(),
        }
    }
}

impl AllocConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `SPANCACHE_CONFIG` and environment overrides.
    ///
    /// Falls back to defaults (with a warning) on any error; the heap must
    /// come up even if the environment is broken.
    pub fn from_env() -> Self {
        match Self::try_from_env() {
            Ok(config) => config,
            Err(err) => {
                warn!(error = %err, "ignoring allocator config, using defaults");
                Self::default()
            }
        }
    }

    pub fn try_from_env() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("SPANCACHE_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };

        if let Some(v) = env_number("SPANCACHE_ARENA_BYTES")? {
            config.arena_bytes = v;
        }
        if let Some(v) = env_number("SPANCACHE_MAX_HEAP_BYTES")? {
            config.max_heap_bytes = v;
        }
        if let Some(v) = env_number("SPANCACHE_SAMPLE_RATE")? {
            config.sample_rate = v;
        }
        if let Some(v) = env_number("SPANCACHE_STACK_CACHE_BYTES")? {
            config.stack_cache_bytes = v;
        }
        if let Some(v) = env_number::<u64>("SPANCACHE_STATS_FLUSH_THRESHOLD")? {
            config.stats_flush_threshold = v;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.arena_bytes < PAGE_SIZE || self.arena_bytes % PAGE_SIZE != 0 {
            return Err(ConfigError::Invalid {
                field: "arena_bytes",
                reason: format!("{} is not a positive multiple of {}", self.arena_bytes, PAGE_SIZE),
            });
        }
        if self.max_heap_bytes != 0 && self.max_heap_bytes < self.arena_bytes {
            return Err(ConfigError::Invalid {
                field: "max_heap_bytes",
                reason: format!("{} is smaller than one arena", self.max_heap_bytes),
            });
        }
        if self.sample_rate > i32::MAX as usize {
            return Err(ConfigError::Invalid {
                field: "sample_rate",
                reason: format!("{} exceeds {}", self.sample_rate, i32::MAX),
            });
        }
        if self.stack_cache_bytes < PAGE_SIZE {
            return Err(ConfigError::Invalid {
                field: "stack_cache_bytes",
                reason: format!("{} is smaller than one page", self.stack_cache_bytes),
            });
        }
        Ok(())
    }
}

fn env_number<T: std::str::FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().map(Some).map_err(|_| ConfigError::Invalid {
            field: name,
            reason: format!("{:?} is not a number", raw),
        }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = AllocConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sample_rate, 512 * 1024);
        assert_eq!(config.stack_cache_bytes, 32 * 1024);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = AllocConfig::from_toml("sample_rate = 0\n").unwrap();
        assert_eq!(config.sample_rate, 0);
        assert_eq!(config.arena_bytes, AllocConfig::default().arena_bytes);
    }

    #[test]
    fn rejects_unaligned_arena() {
        let err = AllocConfig::from_toml("arena_bytes = 1000\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "arena_bytes", .. }));
    }

    #[test]
    fn rejects_limit_below_arena() {
        let err = AllocConfig::from_toml("arena_bytes = 65536\nmax_heap_bytes = 8192\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "max_heap_bytes", .. }));
    }

    #[test]
    fn rejects_bad_syntax() {
        let err = AllocConfig::from_toml("arena_bytes = [").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "arena_bytes = 1048576").unwrap();
        writeln!(file, "stats_flush_threshold = 0").unwrap();

        let config = AllocConfig::from_file(file.path()).unwrap();
        assert_eq!(config.arena_bytes, 1 << 20);
        assert_eq!(config.stats_flush_threshold, 0);
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = AllocConfig::from_file(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
