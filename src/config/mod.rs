//! Configuration module for the extent lock manager.

use crate::error::{DelmError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration for a lock namespace.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DelmConfig {
    /// Namespace-wide limits and timers.
    #[serde(default)]
    pub namespace: NamespaceConfig,
    /// Contention policy tunables.
    #[serde(default)]
    pub contention: ContentionConfig,
    /// Extent expansion tunables.
    #[serde(default)]
    pub expansion: ExpansionConfig,
    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl DelmConfig {
    /// Load configuration from a JSON or TOML file (chosen by extension).
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            DelmError::Config(format!("Failed to read config file: {}", e))
        })?;

        let config: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&content).map_err(|e| {
                DelmError::Config(format!("Failed to parse config: {}", e))
            })?,
            _ => serde_json::from_str(&content).map_err(|e| {
                DelmError::Config(format!("Failed to parse config: {}", e))
            })?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if !self.namespace.page_size.is_power_of_two() {
            return Err(DelmError::InvalidConfig {
                field: "namespace.page_size".to_string(),
                reason: "Page size must be a power of two".to_string(),
            });
        }

        if self.namespace.bucket_bits > 16 {
            return Err(DelmError::InvalidConfig {
                field: "namespace.bucket_bits".to_string(),
                reason: "At most 2^16 registry buckets are supported".to_string(),
            });
        }

        if self.namespace.max_locks == 0 {
            return Err(DelmError::InvalidConfig {
                field: "namespace.max_locks".to_string(),
                reason: "Lock limit must be non-zero".to_string(),
            });
        }

        if self.namespace.callback_timeout.is_zero() {
            return Err(DelmError::InvalidConfig {
                field: "namespace.callback_timeout".to_string(),
                reason: "Callback timeout must be non-zero".to_string(),
            });
        }

        if self.namespace.expiry_check_interval.is_zero() {
            return Err(DelmError::InvalidConfig {
                field: "namespace.expiry_check_interval".to_string(),
                reason: "Expiry check interval must be non-zero".to_string(),
            });
        }

        if self.expansion.grown_cap == 0 {
            return Err(DelmError::InvalidConfig {
                field: "expansion.grown_cap".to_string(),
                reason: "Grown extent cap must be non-zero".to_string(),
            });
        }

        Ok(())
    }

    /// Configuration with short timers for local development and tests.
    pub fn development() -> Self {
        Self {
            namespace: NamespaceConfig {
                name: "dev-ns".to_string(),
                callback_timeout: Duration::from_secs(5),
                expiry_check_interval: Duration::from_millis(200),
                ..Default::default()
            },
            contention: ContentionConfig::default(),
            expansion: ExpansionConfig::default(),
            observability: ObservabilityConfig {
                log_level: "debug".to_string(),
                ..Default::default()
            },
        }
    }
}

/// Namespace-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceConfig {
    /// Namespace name, used in logs and metrics.
    pub name: String,
    /// Maximum number of live lock records across all resources.
    pub max_locks: usize,
    /// Server page size; granted extents are aligned to it.
    pub page_size: u64,
    /// Registry shards are `2^bucket_bits`.
    pub bucket_bits: u32,
    /// Time a holder has to answer a blocking callback before eviction.
    #[serde(with = "humantime_serde")]
    pub callback_timeout: Duration,
    /// How often the expiry checker scans callback timers.
    #[serde(with = "humantime_serde")]
    pub expiry_check_interval: Duration,
    /// Capacity of the lock event channel.
    pub event_capacity: usize,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            name: "strata-delm".to_string(),
            max_locks: 1_000_000,
            page_size: 4096,
            bucket_bits: 6,
            callback_timeout: Duration::from_secs(100),
            expiry_check_interval: Duration::from_secs(1),
            event_capacity: 1024,
        }
    }
}

/// Contention policy tunables, passed to every resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentionConfig {
    /// Contended holders above which a resource counts as contended.
    pub max_contended: usize,
    /// How long a resource stays contended after the last contention.
    #[serde(with = "humantime_serde")]
    pub contention_window: Duration,
    /// Largest request that may be denied in favour of lockless I/O.
    pub max_nolock_size: u64,
}

impl Default for ContentionConfig {
    fn default() -> Self {
        Self {
            max_contended: 32,
            contention_window: Duration::from_secs(2),
            max_nolock_size: 1024 * 1024, // 1MB
        }
    }
}

/// Extent expansion tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpansionConfig {
    /// Upper bound on the growth of contended write locks.
    pub grown_cap: u64,
    /// Conflicting locks above which `grown_cap` applies.
    pub grow_cap_threshold: usize,
    /// Conflicting neighbours above which downward growth stops.
    pub max_downward_conflicts: usize,
}

impl Default for ExpansionConfig {
    fn default() -> Self {
        Self {
            grown_cap: 32 * 1024 * 1024 - 1,
            grow_cap_threshold: 32,
            max_downward_conflicts: 4,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level.
    pub log_level: String,
    /// Enable JSON logging.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Serde helper for Duration using humantime format.
pub mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub(crate) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        } else if let Some(s_val) = s.strip_suffix('s') {
            s_val
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| e.to_string())
        } else if let Some(m) = s.strip_suffix('m') {
            m.parse::<u64>()
                .map(|v| Duration::from_secs(v * 60))
                .map_err(|e| e.to_string())
        } else {
            s.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        }
    }
}
