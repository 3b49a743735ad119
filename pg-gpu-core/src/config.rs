use anyhow::{ensure, Context, Result};
use arrow_interop::column_meta::DECIMAL128_MAX_PRECISION;
use arrow_interop::TypeDefaults;
use gpu_decode_kernels::{LaunchConfig, RoundingMode};
use gpu_memory_manager::BudgetRequest;
use serde::Deserialize;
use std::path::Path;

/// Decoder settings, usually loaded from a TOML file.
///
/// Every section and field is optional in the file; missing values take
/// their defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    pub device: DeviceConfig,
    pub memory: MemoryConfig,
    pub decode: DecodeConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Logical threads per block
    pub threads_per_block: u32,
    /// Grid size limit; larger launches use grid-stride loops
    pub max_blocks: u32,
    /// Worker threads of the device pool (0 = one per core)
    pub worker_threads: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            threads_per_block: 256,
            max_blocks: 65_535,
            worker_threads: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Explicit device memory budget (bytes); overrides probing
    pub budget_bytes: Option<usize>,
    /// Fraction of free device memory left untouched when probing
    pub reserve_fraction: f64,
    /// CUDA device ordinal to probe (needs the `cuda` feature)
    pub cuda_device: Option<usize>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            budget_bytes: None,
            reserve_fraction: 0.2,
            cuda_device: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DecodeConfig {
    /// Rows per chunk cut from a COPY stream
    pub rows_per_chunk: usize,
    /// Chunks decoding at the same time in a stream
    pub max_inflight_chunks: usize,
    pub rounding: RoundingMode,
    /// Scale of `numeric` columns declared without precision and scale
    pub unconstrained_numeric_scale: i8,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            rows_per_chunk: 1 << 20,
            max_inflight_chunks: 2,
            rounding: RoundingMode::Truncate,
            unconstrained_numeric_scale: 9,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directives
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

impl DecoderConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).context("Failed to parse decoder config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.device.threads_per_block > 0, "threads_per_block must be positive");
        ensure!(self.device.max_blocks > 0, "max_blocks must be positive");
        ensure!(self.decode.rows_per_chunk > 0, "rows_per_chunk must be positive");
        ensure!(self.decode.max_inflight_chunks > 0, "max_inflight_chunks must be positive");
        ensure!(
            (0.0..1.0).contains(&self.memory.reserve_fraction),
            "reserve_fraction {} is outside [0, 1)",
            self.memory.reserve_fraction
        );
        if let Some(budget) = self.memory.budget_bytes {
            ensure!(budget > 0, "budget_bytes must be positive");
        }
        let scale = self.decode.unconstrained_numeric_scale;
        ensure!(
            scale >= 0 && scale as u8 <= DECIMAL128_MAX_PRECISION,
            "unconstrained_numeric_scale {} is outside [0, {}]",
            scale,
            DECIMAL128_MAX_PRECISION
        );
        Ok(())
    }

    pub fn launch_config(&self) -> LaunchConfig {
        LaunchConfig {
            threads_per_block: self.device.threads_per_block,
            max_blocks: self.device.max_blocks,
        }
    }

    pub fn budget_request(&self) -> BudgetRequest {
        BudgetRequest {
            explicit: self.memory.budget_bytes,
            cuda_device: self.memory.cuda_device,
            reserve_fraction: self.memory.reserve_fraction,
        }
    }

    /// Install the global subscriber with `[logging] filter` as default.
    pub fn init_logging(&self) -> Result<()> {
        crate::logging::init(&self.logging.filter)
    }

    pub fn type_defaults(&self) -> TypeDefaults {
        TypeDefaults {
            unconstrained_numeric_scale: self.decode.unconstrained_numeric_scale,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = DecoderConfig::default();
        config.validate().unwrap();
        assert_eq!(config.launch_config(), LaunchConfig::default());
        assert_eq!(config.type_defaults(), TypeDefaults::default());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = DecoderConfig::from_toml_str(
            r#"
            [device]
            threads_per_block = 128

            [memory]
            budget_bytes = 1048576

            [decode]
            rounding = "half_away_from_zero"
            "#,
        )
        .unwrap();
        assert_eq!(config.device.threads_per_block, 128);
        assert_eq!(config.device.max_blocks, 65_535);
        assert_eq!(config.memory.budget_bytes, Some(1 << 20));
        assert_eq!(config.decode.rounding, RoundingMode::HalfAwayFromZero);
        assert_eq!(config.decode.rows_per_chunk, 1 << 20);
        assert_eq!(config.logging.filter, "info");
    }

    #[test]
    fn test_zero_sizes_are_rejected() {
        assert!(DecoderConfig::from_toml_str("[decode]\nrows_per_chunk = 0").is_err());
        assert!(DecoderConfig::from_toml_str("[device]\nthreads_per_block = 0").is_err());
        assert!(DecoderConfig::from_toml_str("[memory]\nreserve_fraction = 1.5").is_err());
        assert!(DecoderConfig::from_toml_str("[decode]\nrounding = \"banker\"").is_err());
    }

    #[test]
    fn test_shipped_config_matches_defaults() {
        let shipped =
            DecoderConfig::from_toml_str(include_str!("../../config/default.toml")).unwrap();
        let defaults = DecoderConfig::default();
        assert_eq!(shipped.launch_config(), defaults.launch_config());
        assert_eq!(shipped.budget_request(), defaults.budget_request());
        assert_eq!(shipped.decode.rows_per_chunk, defaults.decode.rows_per_chunk);
        assert_eq!(shipped.decode.rounding, defaults.decode.rounding);
        assert_eq!(shipped.logging.filter, defaults.logging.filter);
    }
}
