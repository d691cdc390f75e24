//! Configuration schema for blobdir
//!
//! Configuration is stored at `~/.config/blobdir/config.toml`

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Remote store location
    pub store: StoreConfig,

    /// Local cache settings
    pub cache: CacheConfig,

    /// Lease lock timings
    pub lock: LockConfig,

    /// Remote call behaviour
    pub remote: RemoteConfig,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
        }
    }
}

/// Directory-backed remote store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Root directory holding containers
    pub root: PathBuf,

    /// Container name objects live in
    pub container: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("blobdir")
                .join("store"),
            container: "index".to_string(),
        }
    }
}

/// How the `CachedLastModified` metadata value is encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TimestampFormat {
    /// 100ns ticks since 0001-01-01, readable by existing stored objects
    #[default]
    DotnetTicks,
    /// Milliseconds since the Unix epoch
    UnixMillis,
}

/// Local cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory for cached copies
    pub dir: PathBuf,

    /// Inflate buffer size in bytes
    pub chunk_size: usize,

    /// Store matching objects deflated
    pub compress_blobs: bool,

    /// Extensions (with leading dot) that are compressed when enabled
    pub compressed_extensions: Vec<String>,

    /// Encoding of the last-modified metadata field
    pub timestamp_format: TimestampFormat,
}

/// Extensions of index files that compress well
pub const DEFAULT_COMPRESSED_EXTENSIONS: &[&str] = &[
    ".cfs", ".fdt", ".fdx", ".frq", ".tis", ".tii", ".nrm", ".tvx", ".tvd", ".tvf", ".prx",
];

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("blobdir"),
            chunk_size: 64 * 1024,
            compress_blobs: false,
            compressed_extensions: DEFAULT_COMPRESSED_EXTENSIONS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            timestamp_format: TimestampFormat::default(),
        }
    }
}

/// Lease lock timings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Remote lease duration in seconds
    pub lease_duration_secs: u64,

    /// Renewal period in seconds
    pub renewal_interval_secs: u64,

    /// Hold ceiling in seconds before the lease is broken
    pub max_hold_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease_duration_secs: 60,
            renewal_interval_secs: 30,
            max_hold_secs: 300,
        }
    }
}

impl LockConfig {
    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_duration_secs)
    }

    pub fn renewal_interval(&self) -> Duration {
        Duration::from_secs(self.renewal_interval_secs)
    }

    pub fn max_hold(&self) -> Duration {
        Duration::from_secs(self.max_hold_secs)
    }
}

/// Remote call behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Deadline for a single remote call in seconds
    pub call_timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            call_timeout_secs: 30,
        }
    }
}

impl RemoteConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

impl Config {
    /// Check cross-field constraints, returning the first violation
    pub fn validate(&self) -> Result<(), String> {
        let lock = &self.lock;
        if lock.renewal_interval_secs == 0 {
            return Err("lock.renewal_interval_secs must be positive".to_string());
        }
        if lock.lease_duration_secs <= lock.renewal_interval_secs {
            return Err(format!(
                "lock.lease_duration_secs ({}) must exceed lock.renewal_interval_secs ({})",
                lock.lease_duration_secs, lock.renewal_interval_secs
            ));
        }
        if lock.max_hold_secs < lock.renewal_interval_secs {
            return Err("lock.max_hold_secs must be at least one renewal interval".to_string());
        }
        if self.cache.chunk_size == 0 {
            return Err("cache.chunk_size must be positive".to_string());
        }
        if self.remote.call_timeout_secs == 0 {
            return Err("remote.call_timeout_secs must be positive".to_string());
        }
        if !matches!(self.general.log_format.as_str(), "text" | "json") {
            return Err(format!(
                "general.log_format must be \"text\" or \"json\", got {:?}",
                self.general.log_format
            ));
        }
        Ok(())
    }
}
