use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::retry::RetryPolicy;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub cache: CacheConfig,
    pub remote: RemoteConfig,
    /// Fallback log filter used when `RUST_LOG` is not set.
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            cache: CacheConfig::default(),
            remote: RemoteConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Interface to bind (e.g. `127.0.0.1`).
    pub host: String,
    pub port: u16,
    /// Directory receiving in-progress PUT bodies before they are handed to
    /// the cache backend.
    pub tmp_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7777,
            tmp_dir: runner_temp().join("bazel-remote-cache-tmp"),
        }
    }
}

impl ServerConfig {
    pub fn listen_addr(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

// ---------------------------------------------------------------------------
// Cache backend
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Prefix for every remote cache key.
    pub namespace: String,
    /// Root of the local staging tier.
    pub store_dir: PathBuf,
    /// Maximum simultaneous calls into the remote store.
    pub concurrency: usize,
    pub retry: RetryConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            namespace: "bazel-remote-cache".to_string(),
            store_dir: runner_temp().join("bazel-remote-cache-store"),
            concurrency: 4,
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    /// Multiplier applied to the delay after every failed attempt.
    pub factor: f64,
    /// Upper bound of the uniform random jitter added to each delay.
    pub max_jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 200,
            factor: 2.0,
            max_jitter_ms: 200,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            factor: self.factor,
            max_jitter: Duration::from_millis(self.max_jitter_ms),
        }
    }
}

// ---------------------------------------------------------------------------
// Remote store
// ---------------------------------------------------------------------------

/// Which durable store sits behind the staging tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteKind {
    /// A directory on durable (possibly network-mounted) storage.
    #[default]
    Directory,
    /// An S3 (or S3-compatible) bucket.
    S3,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub kind: RemoteKind,
    /// Environment variables that must be present for the remote store to be
    /// usable.  Checked by `/healthz`.
    pub required_env: Vec<String>,
    pub directory: DirectoryStoreConfig,
    pub s3: S3StoreConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DirectoryStoreConfig {
    pub path: PathBuf,
}

impl Default for DirectoryStoreConfig {
    fn default() -> Self {
        Self {
            path: runner_temp().join("bazel-remote-cache-remote"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct S3StoreConfig {
    pub bucket: String,
    pub prefix: String,
    pub region: String,
    /// Custom endpoint for S3-compatible services (MinIO, R2, ...).
    pub endpoint_url: Option<String>,
    /// Use the FIPS endpoints for S3 operations.
    pub use_fips: bool,
}

impl Default for S3StoreConfig {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            prefix: "bazel-remote-cache/".to_string(),
            region: "us-east-1".to_string(),
            endpoint_url: None,
            use_fips: false,
        }
    }
}

/// `$RUNNER_TEMP` when running on a CI runner, the system temp dir otherwise.
fn runner_temp() -> PathBuf {
    std::env::var_os("RUNNER_TEMP")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    parse_config(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))
}

fn parse_config(contents: &str) -> Result<Config> {
    // An empty document deserializes to unit, not to an empty mapping.
    if contents.trim().is_empty() {
        return Ok(Config::default());
    }
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
pub fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        config.cache.concurrency >= 1,
        "cache.concurrency must be at least 1"
    );
    anyhow::ensure!(
        config.cache.retry.max_attempts >= 1,
        "cache.retry.max_attempts must be at least 1"
    );
    anyhow::ensure!(
        config.cache.retry.factor >= 1.0,
        "cache.retry.factor must be >= 1.0"
    );
    if config.remote.kind == RemoteKind::S3 {
        anyhow::ensure!(
            !config.remote.s3.bucket.trim().is_empty(),
            "remote.s3.bucket is required when remote.kind is s3"
        );
    }
    Ok(())
}
