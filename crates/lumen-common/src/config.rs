//! Engine configuration.
//!
//! Loads [`EngineConfig`] from a TOML file (`lumen.toml`) with environment
//! variable overrides via `LUMEN_*` prefixed variables.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Upper bound for emulated block sizes; matches current CUDA hardware.
pub const MAX_BLOCK_THREADS: u32 = 1024;

/// Which backend drives the device registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Devices emulated on the host; no accelerator required.
    Host,
    /// NVIDIA devices through the CUDA driver API.
    Cuda,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Host => write!(f, "host"),
            Self::Cuda => write!(f, "cuda"),
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "host" => Ok(Self::Host),
            "cuda" => Ok(Self::Cuda),
            other => Err(format!("unknown backend: {other}")),
        }
    }
}

/// Engine configuration loaded from TOML with environment variable overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Backend used to enumerate devices and launch kernels.
    /// Override: `LUMEN_BACKEND`
    pub backend: BackendKind,

    /// Number of emulated devices when `backend = "host"`.
    /// Override: `LUMEN_HOST_DEVICES`
    pub host_devices: usize,

    /// Threads-per-block limit reported by each emulated device.
    /// Override: `LUMEN_HOST_MAX_THREADS`
    pub host_max_threads_per_block: u32,

    /// Device index new contexts bind to unless told otherwise.
    /// Override: `LUMEN_DEVICE`
    pub default_device: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Host,
            host_devices: 1,
            host_max_threads_per_block: MAX_BLOCK_THREADS,
            default_device: 0,
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
        Self::from_toml(&contents)
    }

    /// Load from a TOML string. Missing fields take their defaults.
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

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backend == BackendKind::Host {
            if self.host_devices == 0 {
                return Err(ConfigError::Validation("host_devices must be > 0".into()));
            }
            if self.default_device >= self.host_devices {
                return Err(ConfigError::Validation(format!(
                    "default_device {} out of range for {} host devices",
                    self.default_device, self.host_devices
                )));
            }
        }
        if self.host_max_threads_per_block == 0 {
            return Err(ConfigError::Validation("host_max_threads_per_block must be > 0".into()));
        }
        if self.host_max_threads_per_block > MAX_BLOCK_THREADS {
            return Err(ConfigError::Validation(format!(
                "host_max_threads_per_block must be <= {MAX_BLOCK_THREADS}, got {}",
                self.host_max_threads_per_block
            )));
        }
        Ok(())
    }

    /// Apply `LUMEN_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(val) = std::env::var("LUMEN_BACKEND") {
            self.backend = val.parse::<BackendKind>().map_err(|reason| {
                ConfigError::EnvOverride { key: "LUMEN_BACKEND".into(), value: val.clone(), reason }
            })?;
        }

        if let Ok(val) = std::env::var("LUMEN_HOST_DEVICES") {
            self.host_devices = val.parse::<usize>().map_err(|e| ConfigError::EnvOverride {
                key: "LUMEN_HOST_DEVICES".into(),
                value: val.clone(),
                reason: e.to_string(),
            })?;
        }

        if let Ok(val) = std::env::var("LUMEN_HOST_MAX_THREADS") {
            self.host_max_threads_per_block =
                val.parse::<u32>().map_err(|e| ConfigError::EnvOverride {
                    key: "LUMEN_HOST_MAX_THREADS".into(),
                    value: val.clone(),
                    reason: e.to_string(),
                })?;
        }

        if let Ok(val) = std::env::var("LUMEN_DEVICE") {
            self.default_device = val.parse::<usize>().map_err(|e| ConfigError::EnvOverride {
                key: "LUMEN_DEVICE".into(),
                value: val.clone(),
                reason: e.to_string(),
            })?;
        }

        Ok(())
    }
}
