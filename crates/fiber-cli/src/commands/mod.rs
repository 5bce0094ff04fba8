//! CLI command implementations

pub mod config;
pub mod stress;

use anyhow::Context;
use fiber::FiberConfig;
use std::path::Path;

/// Load `path` if given, otherwise the default configuration
pub fn load_config(path: Option<&Path>) -> anyhow::Result<FiberConfig> {
    match path {
        Some(path) => FiberConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Ok(FiberConfig::default()),
    }
}
