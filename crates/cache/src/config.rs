//! Cache configuration
//!
//! Sizes for the compressed page cache, the consumer page cache and the
//! pixel buffer pool. Configuration can be built programmatically, read
//! from `READIUM_*` environment variables, or loaded from a TOML file.

use std::fs;
use std::io;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

const MB: usize = 1024 * 1024;

/// Smallest memory pool budget accepted.
pub const MIN_MEMORY_POOL_SIZE: usize = 16 * MB;
/// Largest memory pool budget accepted.
pub const MAX_MEMORY_POOL_SIZE: usize = 512 * MB;
/// Smallest memory limit accepted for the page cache.
pub const MIN_PAGE_CACHE_MEMORY: usize = MB;

/// Configuration for the cache layer.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Byte capacity of the compressed page cache
    pub compressed_cache_size: usize,
    /// JPEG quality for compressed entries (1-100)
    pub compression_quality: u8,
    /// Whether rendered pages go through the compressed cache at all
    pub compression_enabled: bool,
    /// Pixel buffer pool budget in bytes (16-512 MB)
    pub memory_pool_size: usize,
    /// Maximum number of bitmaps in the consumer page cache
    pub page_cache_items: usize,
    /// Maximum bytes held by the consumer page cache
    pub page_cache_memory: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            compressed_cache_size: 32 * MB,
            compression_quality: 85,
            compression_enabled: true,
            memory_pool_size: 64 * MB,
            page_cache_items: 100,
            page_cache_memory: 128 * MB,
        }
    }
}

impl CacheConfig {
    pub fn with_compressed_cache_mb(mut self, mb: usize) -> Self {
        self.compressed_cache_size = mb * MB;
        self
    }

    pub fn with_compression_quality(mut self, quality: u8) -> Self {
        self.compression_quality = quality.clamp(1, 100);
        self
    }

    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.compression_enabled = enabled;
        self
    }

    /// Sets the memory pool budget, clamped to 16-512 MB.
    pub fn with_memory_pool_mb(mut self, mb: usize) -> Self {
        self.memory_pool_size = clamp_pool_size(mb * MB);
        self
    }

    pub fn with_page_cache_items(mut self, items: usize) -> Self {
        self.page_cache_items = items.max(1);
        self
    }

    pub fn with_page_cache_mb(mut self, mb: usize) -> Self {
        self.page_cache_memory = (mb * MB).max(MIN_PAGE_CACHE_MEMORY);
        self
    }

    /// Loads configuration from environment variables.
    ///
    /// Environment variables:
    /// - `READIUM_COMPRESSED_CACHE_MB`: compressed cache size in MB (default: 32)
    /// - `READIUM_COMPRESSION_QUALITY`: JPEG quality 1-100 (default: 85)
    /// - `READIUM_COMPRESSION`: `true`/`false` (default: true)
    /// - `READIUM_MEMORY_POOL_MB`: pool budget in MB (default: 64)
    /// - `READIUM_PAGE_CACHE_ITEMS`: page cache item limit (default: 100)
    /// - `READIUM_PAGE_CACHE_MB`: page cache memory limit in MB (default: 128)
    ///
    /// # Errors
    /// Returns an error if any variable holds an unparsable value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(mb) = env_var::<usize>("READIUM_COMPRESSED_CACHE_MB")? {
            config = config.with_compressed_cache_mb(mb);
        }
        if let Some(quality) = env_var::<u8>("READIUM_COMPRESSION_QUALITY")? {
            config = config.with_compression_quality(quality);
        }
        if let Some(enabled) = env_var::<bool>("READIUM_COMPRESSION")? {
            config = config.with_compression(enabled);
        }
        if let Some(mb) = env_var::<usize>("READIUM_MEMORY_POOL_MB")? {
            config = config.with_memory_pool_mb(mb);
        }
        if let Some(items) = env_var::<usize>("READIUM_PAGE_CACHE_ITEMS")? {
            config = config.with_page_cache_items(items);
        }
        if let Some(mb) = env_var::<usize>("READIUM_PAGE_CACHE_MB")? {
            config = config.with_page_cache_mb(mb);
        }

        Ok(config)
    }

    /// Loads configuration from a TOML file.
    ///
    /// Expected file format (every key optional):
    /// ```toml
    /// compressed_cache_mb = 32
    /// compression_quality = 85
    /// compression_enabled = true
    /// memory_pool_mb = 64
    /// page_cache_items = 100
    /// page_cache_mb = 128
    /// ```
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&contents)
    }

    /// Parses configuration from a TOML string.
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let file: CacheConfigFile = toml::from_str(toml_str)?;
        Ok(file.apply(Self::default()))
    }

    /// Saves configuration to a TOML file.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        fs::write(path.as_ref(), self.to_toml()?)?;
        Ok(())
    }

    /// Converts configuration to TOML format.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string(&CacheConfigFile::from(self))?)
    }

    pub fn compressed_cache_mb(&self) -> usize {
        self.compressed_cache_size / MB
    }

    pub fn memory_pool_mb(&self) -> usize {
        self.memory_pool_size / MB
    }

    pub fn page_cache_mb(&self) -> usize {
        self.page_cache_memory / MB
    }
}

/// Clamps a memory pool budget to the accepted range.
pub fn clamp_pool_size(bytes: usize) -> usize {
    bytes.clamp(MIN_MEMORY_POOL_SIZE, MAX_MEMORY_POOL_SIZE)
}

/// On-disk shape of [`CacheConfig`], sizes in megabytes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfigFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    compressed_cache_mb: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    compression_quality: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    compression_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    memory_pool_mb: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    page_cache_items: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    page_cache_mb: Option<usize>,
}

impl CacheConfigFile {
    pub fn apply(self, mut config: CacheConfig) -> CacheConfig {
        if let Some(mb) = self.compressed_cache_mb {
            config = config.with_compressed_cache_mb(mb);
        }
        if let Some(quality) = self.compression_quality {
            config = config.with_compression_quality(quality);
        }
        if let Some(enabled) = self.compression_enabled {
            config = config.with_compression(enabled);
        }
        if let Some(mb) = self.memory_pool_mb {
            config = config.with_memory_pool_mb(mb);
        }
        if let Some(items) = self.page_cache_items {
            config = config.with_page_cache_items(items);
        }
        if let Some(mb) = self.page_cache_mb {
            config = config.with_page_cache_mb(mb);
        }
        config
    }
}

impl From<&CacheConfig> for CacheConfigFile {
    fn from(config: &CacheConfig) -> Self {
        Self {
            compressed_cache_mb: Some(config.compressed_cache_mb()),
            compression_quality: Some(config.compression_quality),
            compression_enabled: Some(config.compression_enabled),
            memory_pool_mb: Some(config.memory_pool_mb()),
            page_cache_items: Some(config.page_cache_items),
            page_cache_mb: Some(config.page_cache_mb()),
        }
    }
}

/// Reads and parses an environment variable, `None` when unset.
pub fn env_var<T: FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: name.to_string(),
                value,
            }),
        Err(_) => Ok(None),
    }
}

/// Errors that can occur during configuration operations.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for configuration key {key}")]
    InvalidValue { key: String, value: String },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("cannot serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    const VARS: &[&str] = &[
        "READIUM_COMPRESSED_CACHE_MB",
        "READIUM_COMPRESSION_QUALITY",
        "READIUM_COMPRESSION",
        "READIUM_MEMORY_POOL_MB",
        "READIUM_PAGE_CACHE_ITEMS",
        "READIUM_PAGE_CACHE_MB",
    ];

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();
        assert_eq!(config.compressed_cache_mb(), 32);
        assert_eq!(config.compression_quality, 85);
        assert!(config.compression_enabled);
        assert_eq!(config.memory_pool_mb(), 64);
        assert_eq!(config.page_cache_items, 100);
        assert_eq!(config.page_cache_mb(), 128);
    }

    #[test]
    fn test_builder_clamps() {
        let config = CacheConfig::default()
            .with_memory_pool_mb(4)
            .with_compression_quality(0)
            .with_page_cache_items(0)
            .with_page_cache_mb(0);

        assert_eq!(config.memory_pool_size, MIN_MEMORY_POOL_SIZE);
        assert_eq!(config.compression_quality, 1);
        assert_eq!(config.page_cache_items, 1);
        assert_eq!(config.page_cache_memory, MIN_PAGE_CACHE_MEMORY);

        let config = CacheConfig::default().with_memory_pool_mb(4096);
        assert_eq!(config.memory_pool_size, MAX_MEMORY_POOL_SIZE);
    }

    #[test]
    #[serial]
    fn test_from_env() {
        let _guard = EnvGuard::new(VARS);

        env::set_var("READIUM_COMPRESSED_CACHE_MB", "8");
        env::set_var("READIUM_COMPRESSION_QUALITY", "70");
        env::set_var("READIUM_COMPRESSION", "false");
        env::set_var("READIUM_MEMORY_POOL_MB", "128");
        env::set_var("READIUM_PAGE_CACHE_ITEMS", "40");
        env::set_var("READIUM_PAGE_CACHE_MB", "16");

        let config = CacheConfig::from_env().unwrap();
        assert_eq!(config.compressed_cache_mb(), 8);
        assert_eq!(config.compression_quality, 70);
        assert!(!config.compression_enabled);
        assert_eq!(config.memory_pool_mb(), 128);
        assert_eq!(config.page_cache_items, 40);
        assert_eq!(config.page_cache_mb(), 16);
    }

    #[test]
    #[serial]
    fn test_from_env_partial() {
        let _guard = EnvGuard::new(VARS);
        for var in VARS {
            env::remove_var(var);
        }
        env::set_var("READIUM_MEMORY_POOL_MB", "1");

        let config = CacheConfig::from_env().unwrap();
        assert_eq!(config.memory_pool_size, MIN_MEMORY_POOL_SIZE);
        assert_eq!(config.compressed_cache_mb(), 32);
    }

    #[test]
    #[serial]
    fn test_from_env_invalid() {
        let _guard = EnvGuard::new(&["READIUM_PAGE_CACHE_ITEMS"]);

        env::set_var("READIUM_PAGE_CACHE_ITEMS", "lots");
        let err = CacheConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "READIUM_PAGE_CACHE_ITEMS"));
    }

    // Helper to save and restore environment variables
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new(var_names: &[&str]) -> Self {
            let vars = var_names
                .iter()
                .map(|name| (name.to_string(), env::var(name).ok()))
                .collect();
            Self { vars }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (name, value) in &self.vars {
                match value {
                    Some(v) => env::set_var(name, v),
                    None => env::remove_var(name),
                }
            }
        }
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = CacheConfig::default()
            .with_compressed_cache_mb(12)
            .with_compression(false)
            .with_memory_pool_mb(96);
        let toml = config.to_toml().unwrap();
        let parsed = CacheConfig::from_toml_str(&toml).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn test_from_toml_partial() {
        let config = CacheConfig::from_toml_str(
            r#"
            # only override the pool
            memory_pool_mb = 32
            "#,
        )
        .unwrap();
        assert_eq!(config.memory_pool_mb(), 32);
        assert_eq!(config.page_cache_items, 100);
    }

    #[test]
    fn test_from_toml_rejects_unknown_keys() {
        let result = CacheConfig::from_toml_str("ram_cache_mb = 10");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.toml");

        let config = CacheConfig::default().with_page_cache_items(7);
        config.save_to_file(&path).unwrap();

        let loaded = CacheConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_file() {
        let result = CacheConfig::from_file("/nonexistent/readium/cache.toml");
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }
}
