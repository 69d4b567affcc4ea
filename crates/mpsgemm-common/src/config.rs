//! Engine configuration.
//!
//! Loads [`EngineConfig`] from a TOML file (`mpsgemm.toml`) with environment
//! variable overrides via `MPSGEMM_*` prefixed variables. Every field has a
//! default, so partial files are accepted.

use crate::types::BatchStatsMode;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Target number of resident blocks per multiprocessor used by the
/// occupancy heuristic.
pub const DEFAULT_OCCUPANCY_BLOCKS_PER_SM: u32 = 32;

/// `m * n` at or above which strided-batched calls are decomposed.
pub const DEFAULT_BATCH_DECOMPOSE_THRESHOLD: u64 = 1 << 24;

/// Smallest normal FP16 magnitude; values below it lose mantissa bits.
pub const DEFAULT_LOST_THRESHOLD: f32 = 1.0 / 16384.0;

/// Engine configuration with environment variable overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Magnitudes strictly below this are not inspected.
    /// Override: `MPSGEMM_IGNORE_THRESHOLD`
    pub ignore_threshold: f32,

    /// Non-zero magnitudes strictly below this are counted as lost.
    /// Override: `MPSGEMM_LOST_THRESHOLD`
    pub lost_threshold: f32,

    /// Lost/total ratio above which a call is considered unsafe.
    /// Override: `MPSGEMM_LOSS_RATIO_THRESHOLD`
    pub loss_ratio_threshold: f64,

    /// `m * n * k` strictly below this routes to the legacy path (0 = off).
    /// Override: `MPSGEMM_LEGACY_SIZE_THRESHOLD`
    pub legacy_size_threshold: u64,

    /// `m * n` at or above which batched calls are decomposed.
    /// Override: `MPSGEMM_BATCH_DECOMPOSE_THRESHOLD`
    pub batch_decompose_threshold: u64,

    /// Occupancy target, in blocks per multiprocessor.
    /// Override: `MPSGEMM_OCCUPANCY_BLOCKS_PER_SM`
    pub occupancy_blocks_per_sm: u32,

    /// Number of statistics slots.
    /// Override: `MPSGEMM_STATS_RING_SIZE`
    pub stats_ring_size: usize,

    /// Number of dynamic launch flag slots.
    /// Override: `MPSGEMM_FLAG_RING_SIZE`
    pub flag_ring_size: usize,

    /// Multiprocessor count; detected from the device when unset.
    /// Override: `MPSGEMM_MULTIPROCESSOR_COUNT`
    pub multiprocessor_count: Option<u32>,

    /// Collect statistics on every tensor-core GEMM.
    /// Override: `MPSGEMM_EXP_STATS`
    pub exp_stats_enabled: bool,

    /// Statistics attribution for strided-batched calls.
    /// Override: `MPSGEMM_BATCH_STATS_MODE`
    pub batch_stats_mode: BatchStatsMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ignore_threshold: 0.0,
            lost_threshold: DEFAULT_LOST_THRESHOLD,
            loss_ratio_threshold: 0.1,
            legacy_size_threshold: 0,
            batch_decompose_threshold: DEFAULT_BATCH_DECOMPOSE_THRESHOLD,
            occupancy_blocks_per_sm: DEFAULT_OCCUPANCY_BLOCKS_PER_SM,
            stats_ring_size: 64,
            flag_ring_size: 64,
            multiprocessor_count: None,
            exp_stats_enabled: false,
            batch_stats_mode: BatchStatsMode::Aggregate,
        }
    }
}

/// Errors that can occur when loading or validating an [`EngineConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("invalid environment override {key}={value}: {reason}")]
    EnvOverride { key: String, value: String, reason: String },
}

impl EngineConfig {
    /// Render the default configuration as TOML.
    pub fn default_toml() -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(&Self::default())?)
    }

    /// Load configuration from a TOML file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let cfg = Self::from_toml(&contents)?;
        tracing::debug!(path = %path.display(), "loaded engine configuration");
        Ok(cfg)
    }

    /// Load from a TOML string (useful for testing).
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut cfg: EngineConfig = toml::from_str(toml_str)?;
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load only from environment variables, starting from defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in
            [("ignore_threshold", self.ignore_threshold), ("lost_threshold", self.lost_threshold)]
        {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::Validation(format!(
                    "{name} must be finite and >= 0, got {value}"
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.loss_ratio_threshold) {
            return Err(ConfigError::Validation(format!(
                "loss_ratio_threshold must be within [0, 1], got {}",
                self.loss_ratio_threshold
            )));
        }
        if self.batch_decompose_threshold == 0 {
            return Err(ConfigError::Validation("batch_decompose_threshold must be > 0".into()));
        }
        if self.occupancy_blocks_per_sm == 0 {
            return Err(ConfigError::Validation("occupancy_blocks_per_sm must be > 0".into()));
        }
        if self.stats_ring_size == 0 {
            return Err(ConfigError::Validation("stats_ring_size must be > 0".into()));
        }
        if self.flag_ring_size == 0 {
            return Err(ConfigError::Validation("flag_ring_size must be > 0".into()));
        }
        if self.multiprocessor_count == Some(0) {
            return Err(ConfigError::Validation("multiprocessor_count must be > 0".into()));
        }
        Ok(())
    }

    /// Apply `MPSGEMM_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(v) = env_parse::<f32>("MPSGEMM_IGNORE_THRESHOLD")? {
            self.ignore_threshold = v;
        }
        if let Some(v) = env_parse::<f32>("MPSGEMM_LOST_THRESHOLD")? {
            self.lost_threshold = v;
        }
        if let Some(v) = env_parse::<f64>("MPSGEMM_LOSS_RATIO_THRESHOLD")? {
            self.loss_ratio_threshold = v;
        }
        if let Some(v) = env_parse::<u64>("MPSGEMM_LEGACY_SIZE_THRESHOLD")? {
            self.legacy_size_threshold = v;
        }
        if let Some(v) = env_parse::<u64>("MPSGEMM_BATCH_DECOMPOSE_THRESHOLD")? {
            self.batch_decompose_threshold = v;
        }
        if let Some(v) = env_parse::<u32>("MPSGEMM_OCCUPANCY_BLOCKS_PER_SM")? {
            self.occupancy_blocks_per_sm = v;
        }
        if let Some(v) = env_parse::<usize>("MPSGEMM_STATS_RING_SIZE")? {
            self.stats_ring_size = v;
        }
        if let Some(v) = env_parse::<usize>("MPSGEMM_FLAG_RING_SIZE")? {
            self.flag_ring_size = v;
        }
        if let Some(v) = env_parse::<u32>("MPSGEMM_MULTIPROCESSOR_COUNT")? {
            self.multiprocessor_count = Some(v);
        }
        if let Ok(val) = std::env::var("MPSGEMM_EXP_STATS") {
            self.exp_stats_enabled = matches!(val.as_str(), "1" | "true" | "yes");
        }
        if let Some(v) = env_parse::<BatchStatsMode>("MPSGEMM_BATCH_STATS_MODE")? {
            self.batch_stats_mode = v;
        }
        Ok(())
    }
}

fn env_parse<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(val) => val.trim().parse::<T>().map(Some).map_err(|e| ConfigError::EnvOverride {
            key: key.into(),
            value: val.clone(),
            reason: e.to_string(),
        }),
        Err(_) => Ok(None),
    }
}
