//! Fiber configuration (fiber.toml)
//!
//! Every key is optional; a missing key takes its default.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration for a [`Fiber`](crate::Fiber)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FiberConfig {
    /// Worker pool size (0 = number of CPUs)
    pub worker_threads: usize,

    /// Worker threads of the owned async runtime (0 = number of CPUs)
    pub async_threads: usize,

    /// Prefix for the names of every thread the fiber spawns
    pub thread_name: String,

    /// How long shutdown waits for pool and timer threads, in milliseconds
    pub shutdown_timeout_ms: u64,
}

fn default_thread_name() -> String {
    "fiber-worker".to_string()
}

impl Default for FiberConfig {
    fn default() -> Self {
        Self {
            worker_threads: 0,
            async_threads: 0,
            thread_name: default_thread_name(),
            shutdown_timeout_ms: 2000,
        }
    }
}

impl FiberConfig {
    /// Parse from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: FiberConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Render as TOML
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// Check that values are usable
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.thread_name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "thread_name must not be empty".to_string(),
            ));
        }
        if self.shutdown_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "shutdown_timeout_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Effective worker pool size
    pub fn worker_count(&self) -> usize {
        if self.worker_threads == 0 {
            num_cpus::get()
        } else {
            self.worker_threads
        }
    }

    /// Effective async runtime size
    pub fn async_worker_count(&self) -> usize {
        if self.async_threads == 0 {
            num_cpus::get()
        } else {
            self.async_threads
        }
    }

    /// Shutdown timeout as a duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}
