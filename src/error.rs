//! Error types for the proxy core.
//!
//! Low-level, matched-upon failures use `thiserror` enums so callers can
//! branch on the variant (e.g. distinguish "command not found" from a
//! generic spawn failure). Higher-level call sites (CLI entry point, setup
//! subcommand) wrap these in `anyhow::Result` for context-chained reporting.

use thiserror::Error;

/// Failures from the Process Controller.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The command could not be located on `PATH` (or as a direct path).
    #[error("command not found: {0}")]
    CommandNotFound(String),

    /// The OS refused to spawn the process for some other reason.
    #[error("failed to spawn '{command}': {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// A write to the child's stdin was attempted after it had exited.
    #[error("write to stdin failed, process has exited: {0}")]
    StdinClosed(std::io::Error),

    /// Sending a termination signal failed.
    #[error("failed to signal process {pid}: {source}")]
    SignalFailed {
        pid: u32,
        #[source]
        source: std::io::Error,
    },
}

/// Failures from the Change Source.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("failed to establish watch on {path}: {source}")]
    WatchSetupFailed {
        path: String,
        #[source]
        source: notify::Error,
    },
}

/// Failures surfaced by the Supervisor during startup. A `Startup` failure is fatal: the host process exits non-zero.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Watch(#[from] WatchError),

    #[error("no watch target given and none could be auto-detected")]
    NoWatchTarget,

    #[error("startup retry budget ({0}) exhausted")]
    RetriesExhausted(u32),
}
