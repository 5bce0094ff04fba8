//! Error types for the dispatch engine

use thiserror::Error;

/// Why a job did not produce a value.
///
/// Observed through [`JobHandle`](crate::JobHandle). A job error is local to
/// its own handle: it never affects sibling jobs or the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    /// The callable (or the future it returned) panicked
    #[error("job panicked: {0}")]
    Panicked(String),

    /// Submitted after the fiber was stopped
    #[error("scheduler stopped")]
    SchedulerStopped,

    /// The worker pool refused the job because it has shut down
    #[error("worker pool unavailable")]
    PoolUnavailable,

    /// The job was dropped before producing a result (async runtime gone)
    #[error("job abandoned before completion")]
    Abandoned,
}

/// Engine-level errors
#[derive(Debug, Error)]
pub enum FiberError {
    /// The scheduler no longer accepts submissions
    #[error("scheduler stopped")]
    SchedulerStopped,

    /// The worker pool has shut down
    #[error("worker pool unavailable")]
    PoolUnavailable,

    /// Failed to spawn a pool or timer thread
    #[error("failed to spawn thread: {0}")]
    ThreadSpawn(#[source] std::io::Error),

    /// Failed to build the async runtime
    #[error("failed to build async runtime: {0}")]
    Runtime(#[source] std::io::Error),

    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Errors that can occur while loading a [`FiberConfig`](crate::FiberConfig)
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the config file
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Engine result
pub type FiberResult<T> = Result<T, FiberError>;
