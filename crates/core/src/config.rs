use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Environment variable holding a JSON [`RuntimeConfig`]
pub const RUNTIME_CONFIG_ENV: &str = "XSTREAM_RUNTIME_CONFIG";

/// Environment variable holding a JSON [`SimConfig`]
pub const SIM_CONFIG_ENV: &str = "XSTREAM_SIM_CONFIG";

/// Runtime-wide settings shared by every thread using a [`crate::Runtime`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Queues per priority class in each device's stream pool
    pub streams_per_priority: usize,
    /// Device every thread starts on
    pub default_device: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            streams_per_priority: 32,
            default_device: 0,
        }
    }
}

impl RuntimeConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| Error::invalid_config("RuntimeConfig::from_json", e.to_string()))
    }

    /// Read [`RUNTIME_CONFIG_ENV`], falling back to defaults when it is unset
    pub fn from_env() -> Result<Self> {
        match std::env::var(RUNTIME_CONFIG_ENV) {
            Ok(text) => Self::from_json(&text),
            Err(_) => Ok(Self::default()),
        }
    }

    pub fn validate(&self, device_count: usize) -> Result<()> {
        if self.streams_per_priority == 0 {
            return Err(Error::invalid_config(
                "RuntimeConfig::validate",
                "streams_per_priority must be at least 1",
            ));
        }
        if self.default_device >= device_count {
            return Err(Error::invalid_config(
                "RuntimeConfig::validate",
                format!(
                    "default_device {} out of range for {} devices",
                    self.default_device, device_count
                ),
            ));
        }
        Ok(())
    }
}

/// Settings for the simulated backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub device_count: usize,
    /// Non-blocking-sync events spin (yielding) instead of parking the waiter
    pub blocking_spin: bool,
    /// Hardware queues each device can hold at once; unlimited when `None`
    pub max_queues_per_device: Option<usize>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            device_count: 2,
            blocking_spin: true,
            max_queues_per_device: None,
        }
    }
}

impl SimConfig {
    pub fn with_devices(device_count: usize) -> Self {
        Self {
            device_count,
            ..Self::default()
        }
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| Error::invalid_config("SimConfig::from_json", e.to_string()))
    }

    pub fn from_env() -> Result<Self> {
        match std::env::var(SIM_CONFIG_ENV) {
            Ok(text) => Self::from_json(&text),
            Err(_) => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.device_count == 0 {
            return Err(Error::invalid_config(
                "SimConfig::validate",
                "device_count must be at least 1",
            ));
        }
        Ok(())
    }
}
