//! Error types for the host driver.

use thiserror::Error;

/// Result type alias for host operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving a session.
#[derive(Debug, Error)]
pub enum Error {
    /// Wire-level failure.
    #[error(transparent)]
    Runtime(#[from] wp_runtime::Error),

    /// No automation-engine adapter is linked for the requested browser.
    #[error(
        "no automation engine adapter available for {0}; \
         supply one through the runner's engine seam"
    )]
    EngineUnavailable(String),

    /// Failure reported by the automation engine.
    #[error("engine error: {0}")]
    Engine(String),

    /// Handle id outside the target vector.
    #[error("unknown target id: {0}")]
    UnknownTarget(u32),

    /// Handle id whose slot was already disposed.
    #[error("target {0} is already disposed")]
    TargetDisposed(u32),

    /// Evaluate against a target that cannot run functions.
    #[error("target {0} is not evaluable")]
    NotEvaluable(u32),

    /// Route action referring to an unknown or already-finished slot.
    #[error("no parked route with id {0}")]
    UnknownRoute(u32),

    /// Failure in the bundler adapter.
    #[error("bundle error: {0}")]
    Bundler(String),

    /// HTTP server failure.
    #[error("server error: {0}")]
    Server(String),

    /// A request the engine aborted or could not perform.
    #[error("request failed: {0}")]
    RequestFailed(String),

    /// Malformed source map.
    #[error("source map error: {0}")]
    SourceMap(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Watch(#[from] notify::Error),
}
