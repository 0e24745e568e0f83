//! Generator and model configuration
//!
//! [`GeneratorConfig`] embeds the cache layer's [`CacheConfig`]. Both can be
//! read from `READIUM_*` environment variables or from one TOML file, where
//! the cache settings live in a `[cache]` table.

use std::fs;
use std::path::Path;
use std::time::Duration;

use readium_cache::config::env_var;
use readium_cache::{CacheConfig, CacheConfigFile, CacheStrategy, ConfigError};
use readium_render::{BackendPreference, TargetSize};
use readium_scheduler::{SchedulerConfig, MAX_CONCURRENT_JOBS, MAX_RETRIES};
use serde::{Deserialize, Serialize};

pub const MIN_QUALITY: f64 = 0.1;
pub const MAX_QUALITY: f64 = 3.0;

/// Clamps a render quality multiplier to 0.1-3.0; NaN becomes 1.0.
pub fn clamp_quality(quality: f64) -> f64 {
    if quality.is_nan() {
        1.0
    } else {
        quality.clamp(MIN_QUALITY, MAX_QUALITY)
    }
}

/// Parses `cpu`, `gpu` or `hybrid`.
pub fn parse_render_mode(value: &str) -> Option<BackendPreference> {
    match value.trim().to_ascii_lowercase().as_str() {
        "cpu" | "cpu-only" => Some(BackendPreference::CpuOnly),
        "gpu" | "gpu-accelerated" => Some(BackendPreference::GpuAccelerated),
        "hybrid" => Some(BackendPreference::Hybrid),
        _ => None,
    }
}

pub fn render_mode_name(mode: BackendPreference) -> &'static str {
    match mode {
        BackendPreference::CpuOnly => "cpu",
        BackendPreference::GpuAccelerated => "gpu",
        BackendPreference::Hybrid => "hybrid",
    }
}

/// Parses `lru`, `lfu`, `adaptive` or `memory-aware`.
pub fn parse_cache_strategy(value: &str) -> Option<CacheStrategy> {
    match value.trim().to_ascii_lowercase().as_str() {
        "lru" => Some(CacheStrategy::Lru),
        "lfu" => Some(CacheStrategy::Lfu),
        "adaptive" => Some(CacheStrategy::Adaptive),
        "memory-aware" | "memory_aware" => Some(CacheStrategy::MemoryAware),
        _ => None,
    }
}

pub fn cache_strategy_name(strategy: CacheStrategy) -> &'static str {
    match strategy {
        CacheStrategy::Lru => "lru",
        CacheStrategy::Lfu => "lfu",
        CacheStrategy::Adaptive => "adaptive",
        CacheStrategy::MemoryAware => "memory-aware",
    }
}

/// Configuration for [`ThumbnailGenerator`](crate::ThumbnailGenerator).
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratorConfig {
    /// Default thumbnail box
    pub thumbnail_size: TargetSize,

    /// Default quality multiplier (0.1-3.0)
    pub quality: f64,

    /// Render jobs in flight (1-8)
    pub max_concurrent_jobs: usize,

    /// Retries after the first failed attempt (0-5)
    pub max_retries: u32,

    /// Use the GPU rasterizer when one is attached
    pub gpu_acceleration: bool,

    pub render_mode: BackendPreference,

    pub cache_strategy: CacheStrategy,

    /// Queue depth unit for adaptive concurrency
    pub batch_size: usize,

    /// How often the batch tick runs
    pub batch_interval: Duration,

    /// Tune concurrency from the queue depth on every batch tick
    pub adaptive_concurrency: bool,

    pub device_pixel_ratio: f64,

    pub cache: CacheConfig,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            thumbnail_size: TargetSize::default(),
            quality: 1.0,
            max_concurrent_jobs: 6,
            max_retries: 2,
            gpu_acceleration: true,
            render_mode: BackendPreference::Hybrid,
            cache_strategy: CacheStrategy::Adaptive,
            batch_size: 8,
            batch_interval: Duration::from_millis(50),
            adaptive_concurrency: true,
            device_pixel_ratio: 1.0,
            cache: CacheConfig::default(),
        }
    }
}

impl GeneratorConfig {
    pub fn with_thumbnail_size(mut self, width: u32, height: u32) -> Self {
        self.thumbnail_size = TargetSize::new(width, height);
        self
    }

    pub fn with_quality(mut self, quality: f64) -> Self {
        self.quality = clamp_quality(quality);
        self
    }

    pub fn with_max_concurrent_jobs(mut self, jobs: usize) -> Self {
        self.max_concurrent_jobs = jobs.clamp(1, MAX_CONCURRENT_JOBS);
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries.min(MAX_RETRIES);
        self
    }

    pub fn with_gpu_acceleration(mut self, enabled: bool) -> Self {
        self.gpu_acceleration = enabled;
        self
    }

    pub fn with_render_mode(mut self, mode: BackendPreference) -> Self {
        self.render_mode = mode;
        self
    }

    pub fn with_cache_strategy(mut self, strategy: CacheStrategy) -> Self {
        self.cache_strategy = strategy;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn with_batch_interval(mut self, interval: Duration) -> Self {
        self.batch_interval = interval;
        self
    }

    pub fn with_adaptive_concurrency(mut self, enabled: bool) -> Self {
        self.adaptive_concurrency = enabled;
        self
    }

    /// Non-positive or non-finite ratios become 1.0.
    pub fn with_device_pixel_ratio(mut self, ratio: f64) -> Self {
        self.device_pixel_ratio = if ratio > 0.0 && ratio.is_finite() {
            ratio
        } else {
            1.0
        };
        self
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Scheduler settings derived from this configuration.
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_concurrent_jobs: self.max_concurrent_jobs,
            max_retries: self.max_retries,
            batch_size: self.batch_size,
            adaptive_concurrency: self.adaptive_concurrency,
        }
    }

    /// Loads configuration from environment variables.
    ///
    /// Environment variables:
    /// - `READIUM_THUMBNAIL_WIDTH` / `READIUM_THUMBNAIL_HEIGHT`: default box (120x160)
    /// - `READIUM_QUALITY`: quality multiplier (default: 1.0)
    /// - `READIUM_MAX_JOBS`: concurrent render jobs (default: 6)
    /// - `READIUM_MAX_RETRIES`: retries per request (default: 2)
    /// - `READIUM_GPU`: `true`/`false` (default: true)
    /// - `READIUM_RENDER_MODE`: `cpu`, `gpu` or `hybrid` (default: hybrid)
    /// - `READIUM_CACHE_STRATEGY`: `lru`, `lfu`, `adaptive` or `memory-aware`
    /// - `READIUM_ADAPTIVE_CONCURRENCY`: `true`/`false` (default: true)
    /// - `READIUM_DEVICE_PIXEL_RATIO`: display scale (default: 1.0)
    ///
    /// plus every variable read by [`CacheConfig::from_env`].
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default().with_cache(CacheConfig::from_env()?);

        let width = env_var::<u32>("READIUM_THUMBNAIL_WIDTH")?;
        let height = env_var::<u32>("READIUM_THUMBNAIL_HEIGHT")?;
        if width.is_some() || height.is_some() {
            let current = config.thumbnail_size;
            config = config.with_thumbnail_size(
                width.unwrap_or(current.width),
                height.unwrap_or(current.height),
            );
        }
        if let Some(quality) = env_var::<f64>("READIUM_QUALITY")? {
            config = config.with_quality(quality);
        }
        if let Some(jobs) = env_var::<usize>("READIUM_MAX_JOBS")? {
            config = config.with_max_concurrent_jobs(jobs);
        }
        if let Some(retries) = env_var::<u32>("READIUM_MAX_RETRIES")? {
            config = config.with_max_retries(retries);
        }
        if let Some(enabled) = env_var::<bool>("READIUM_GPU")? {
            config = config.with_gpu_acceleration(enabled);
        }
        if let Some(mode) = env_var::<String>("READIUM_RENDER_MODE")? {
            config = config.with_render_mode(parse_named("READIUM_RENDER_MODE", &mode, parse_render_mode)?);
        }
        if let Some(strategy) = env_var::<String>("READIUM_CACHE_STRATEGY")? {
            config = config.with_cache_strategy(parse_named(
                "READIUM_CACHE_STRATEGY",
                &strategy,
                parse_cache_strategy,
            )?);
        }
        if let Some(enabled) = env_var::<bool>("READIUM_ADAPTIVE_CONCURRENCY")? {
            config = config.with_adaptive_concurrency(enabled);
        }
        if let Some(ratio) = env_var::<f64>("READIUM_DEVICE_PIXEL_RATIO")? {
            config = config.with_device_pixel_ratio(ratio);
        }

        Ok(config)
    }

    /// Loads configuration from a TOML file.
    ///
    /// Expected file format (every key optional):
    /// ```toml
    /// thumbnail_width = 120
    /// thumbnail_height = 160
    /// quality = 1.0
    /// max_concurrent_jobs = 6
    /// max_retries = 2
    /// render_mode = "hybrid"
    /// cache_strategy = "adaptive"
    ///
    /// [cache]
    /// compressed_cache_mb = 32
    /// memory_pool_mb = 64
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let file: GeneratorConfigFile = toml::from_str(toml_str)?;
        file.apply(Self::default())
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        fs::write(path.as_ref(), self.to_toml()?)?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string(&GeneratorConfigFile::from(self))?)
    }
}

fn parse_named<T>(
    key: &str,
    value: &str,
    parse: fn(&str) -> Option<T>,
) -> Result<T, ConfigError> {
    parse(value).ok_or_else(|| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

/// On-disk shape of [`GeneratorConfig`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct GeneratorConfigFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    thumbnail_width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thumbnail_height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    quality: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_concurrent_jobs: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_retries: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    gpu_acceleration: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    render_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cache_strategy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    batch_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    batch_interval_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    adaptive_concurrency: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_pixel_ratio: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cache: Option<CacheConfigFile>,
}

impl GeneratorConfigFile {
    fn apply(self, mut config: GeneratorConfig) -> Result<GeneratorConfig, ConfigError> {
        if self.thumbnail_width.is_some() || self.thumbnail_height.is_some() {
            let current = config.thumbnail_size;
            config = config.with_thumbnail_size(
                self.thumbnail_width.unwrap_or(current.width),
                self.thumbnail_height.unwrap_or(current.height),
            );
        }
        if let Some(quality) = self.quality {
            config = config.with_quality(quality);
        }
        if let Some(jobs) = self.max_concurrent_jobs {
            config = config.with_max_concurrent_jobs(jobs);
        }
        if let Some(retries) = self.max_retries {
            config = config.with_max_retries(retries);
        }
        if let Some(enabled) = self.gpu_acceleration {
            config = config.with_gpu_acceleration(enabled);
        }
        if let Some(mode) = self.render_mode {
            config = config.with_render_mode(parse_named("render_mode", &mode, parse_render_mode)?);
        }
        if let Some(strategy) = self.cache_strategy {
            config = config.with_cache_strategy(parse_named(
                "cache_strategy",
                &strategy,
                parse_cache_strategy,
            )?);
        }
        if let Some(size) = self.batch_size {
            config = config.with_batch_size(size);
        }
        if let Some(ms) = self.batch_interval_ms {
            config = config.with_batch_interval(Duration::from_millis(ms));
        }
        if let Some(enabled) = self.adaptive_concurrency {
            config = config.with_adaptive_concurrency(enabled);
        }
        if let Some(ratio) = self.device_pixel_ratio {
            config = config.with_device_pixel_ratio(ratio);
        }
        if let Some(cache) = self.cache {
            config.cache = cache.apply(config.cache);
        }
        Ok(config)
    }
}

impl From<&GeneratorConfig> for GeneratorConfigFile {
    fn from(config: &GeneratorConfig) -> Self {
        Self {
            thumbnail_width: Some(config.thumbnail_size.width),
            thumbnail_height: Some(config.thumbnail_size.height),
            quality: Some(config.quality),
            max_concurrent_jobs: Some(config.max_concurrent_jobs),
            max_retries: Some(config.max_retries),
            gpu_acceleration: Some(config.gpu_acceleration),
            render_mode: Some(render_mode_name(config.render_mode).to_string()),
            cache_strategy: Some(cache_strategy_name(config.cache_strategy).to_string()),
            batch_size: Some(config.batch_size),
            batch_interval_ms: Some(config.batch_interval.as_millis() as u64),
            adaptive_concurrency: Some(config.adaptive_concurrency),
            device_pixel_ratio: Some(config.device_pixel_ratio),
            cache: Some(CacheConfigFile::from(&config.cache)),
        }
    }
}

/// Configuration for [`ThumbnailModel`](crate::ThumbnailModel).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelConfig {
    /// Pages beyond the visible range that preloading covers
    pub preload_range: usize,

    /// Pages around the visible range that get the margin priority
    pub viewport_margin: usize,

    /// Only request pages near the viewport once one is set
    pub lazy_loading: bool,

    /// Let the page cache switch between LRU and LFU; plain LRU otherwise
    pub adaptive_caching: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            preload_range: 5,
            viewport_margin: 2,
            lazy_loading: true,
            adaptive_caching: true,
        }
    }
}

impl ModelConfig {
    pub fn with_preload_range(mut self, range: usize) -> Self {
        self.preload_range = range;
        self
    }

    pub fn with_viewport_margin(mut self, margin: usize) -> Self {
        self.viewport_margin = margin;
        self
    }

    pub fn with_lazy_loading(mut self, enabled: bool) -> Self {
        self.lazy_loading = enabled;
        self
    }

    pub fn with_adaptive_caching(mut self, enabled: bool) -> Self {
        self.adaptive_caching = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    const VARS: &[&str] = &[
        "READIUM_THUMBNAIL_WIDTH",
        "READIUM_THUMBNAIL_HEIGHT",
        "READIUM_QUALITY",
        "READIUM_MAX_JOBS",
        "READIUM_MAX_RETRIES",
        "READIUM_GPU",
        "READIUM_RENDER_MODE",
        "READIUM_CACHE_STRATEGY",
        "READIUM_ADAPTIVE_CONCURRENCY",
        "READIUM_DEVICE_PIXEL_RATIO",
        "READIUM_COMPRESSED_CACHE_MB",
        "READIUM_MEMORY_POOL_MB",
    ];

    /// Clears the variables on creation and restores them on drop.
    struct EnvGuard {
        saved: Vec<(&'static str, Option<String>)>,
    }

    impl EnvGuard {
        fn new(vars: &[&'static str]) -> Self {
            let saved = vars.iter().map(|var| (*var, env::var(var).ok())).collect();
            for var in vars {
                env::remove_var(var);
            }
            Self { saved }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (var, value) in &self.saved {
                match value {
                    Some(value) => env::set_var(var, value),
                    None => env::remove_var(var),
                }
            }
        }
    }

    #[test]
    fn test_defaults() {
        let config = GeneratorConfig::default();
        assert_eq!(config.thumbnail_size, TargetSize::new(120, 160));
        assert_eq!(config.quality, 1.0);
        assert_eq!(config.max_concurrent_jobs, 6);
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.render_mode, BackendPreference::Hybrid);
        assert_eq!(config.cache_strategy, CacheStrategy::Adaptive);
        assert_eq!(config.batch_interval, Duration::from_millis(50));
    }

    #[test]
    fn test_builder_clamps() {
        let config = GeneratorConfig::default()
            .with_quality(9.0)
            .with_max_concurrent_jobs(0)
            .with_max_retries(42)
            .with_device_pixel_ratio(-2.0);
        assert_eq!(config.quality, MAX_QUALITY);
        assert_eq!(config.max_concurrent_jobs, 1);
        assert_eq!(config.max_retries, MAX_RETRIES);
        assert_eq!(config.device_pixel_ratio, 1.0);

        assert_eq!(clamp_quality(0.0), MIN_QUALITY);
        assert_eq!(clamp_quality(f64::NAN), 1.0);
    }

    #[test]
    fn test_scheduler_config() {
        let config = GeneratorConfig::default()
            .with_max_concurrent_jobs(3)
            .with_adaptive_concurrency(false);
        let scheduler = config.scheduler_config();
        assert_eq!(scheduler.max_concurrent_jobs, 3);
        assert!(!scheduler.adaptive_concurrency);
    }

    #[test]
    fn test_parse_names() {
        assert_eq!(parse_render_mode("CPU"), Some(BackendPreference::CpuOnly));
        assert_eq!(parse_render_mode("gpu"), Some(BackendPreference::GpuAccelerated));
        assert_eq!(parse_render_mode("warp"), None);
        assert_eq!(parse_cache_strategy("memory-aware"), Some(CacheStrategy::MemoryAware));
        assert_eq!(parse_cache_strategy("lfu"), Some(CacheStrategy::Lfu));
        assert_eq!(parse_cache_strategy("random"), None);
    }

    #[test]
    #[serial]
    fn test_from_env() {
        let _guard = EnvGuard::new(VARS);
        env::set_var("READIUM_THUMBNAIL_WIDTH", "90");
        env::set_var("READIUM_QUALITY", "1.5");
        env::set_var("READIUM_MAX_JOBS", "3");
        env::set_var("READIUM_RENDER_MODE", "cpu");
        env::set_var("READIUM_CACHE_STRATEGY", "lru");
        env::set_var("READIUM_COMPRESSED_CACHE_MB", "8");

        let config = GeneratorConfig::from_env().unwrap();
        assert_eq!(config.thumbnail_size, TargetSize::new(90, 160));
        assert_eq!(config.quality, 1.5);
        assert_eq!(config.max_concurrent_jobs, 3);
        assert_eq!(config.render_mode, BackendPreference::CpuOnly);
        assert_eq!(config.cache_strategy, CacheStrategy::Lru);
        assert_eq!(config.cache.compressed_cache_mb(), 8);
    }

    #[test]
    #[serial]
    fn test_from_env_invalid() {
        let _guard = EnvGuard::new(VARS);
        env::set_var("READIUM_RENDER_MODE", "quantum");

        let err = GeneratorConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "READIUM_RENDER_MODE"));
    }

    #[test]
    fn test_from_toml_with_cache_table() {
        let config = GeneratorConfig::from_toml_str(
            r#"
            thumbnail_width = 200
            thumbnail_height = 260
            max_retries = 4
            cache_strategy = "memory-aware"

            [cache]
            compressed_cache_mb = 16
            memory_pool_mb = 32
            "#,
        )
        .unwrap();

        assert_eq!(config.thumbnail_size, TargetSize::new(200, 260));
        assert_eq!(config.max_retries, 4);
        assert_eq!(config.cache_strategy, CacheStrategy::MemoryAware);
        assert_eq!(config.cache.compressed_cache_mb(), 16);
        assert_eq!(config.cache.memory_pool_mb(), 32);
        assert_eq!(config.cache.compression_quality, 85);
    }

    #[test]
    fn test_toml_partial_size_keeps_other_dimension() {
        let config = GeneratorConfig::from_toml_str("thumbnail_height = 90").unwrap();
        assert_eq!(config.thumbnail_size, TargetSize::new(120, 90));

        let config = GeneratorConfig::from_toml_str("thumbnail_width = 64").unwrap();
        assert_eq!(config.thumbnail_size, TargetSize::new(64, 160));
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(GeneratorConfig::from_toml_str("thumbnail_depth = 3").is_err());
        assert!(GeneratorConfig::from_toml_str("render_mode = \"fast\"").is_err());
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("readium.toml");

        let config = GeneratorConfig::default()
            .with_thumbnail_size(64, 96)
            .with_render_mode(BackendPreference::GpuAccelerated)
            .with_cache(CacheConfig::default().with_compressed_cache_mb(12));
        config.save_to_file(&path).unwrap();

        let loaded = GeneratorConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_model_config_defaults() {
        let config = ModelConfig::default();
        assert_eq!(config.preload_range, 5);
        assert_eq!(config.viewport_margin, 2);
        assert!(config.lazy_loading);
        assert!(config.adaptive_caching);
    }
}
