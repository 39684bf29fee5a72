//! Error types for the in-page runtime.

use thiserror::Error;

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced to in-page test code.
#[derive(Debug, Error)]
pub enum Error {
    /// Wire-level failure.
    #[error(transparent)]
    Runtime(#[from] wp_runtime::Error),

    /// A second terminal action (or a fallback after one) on a route.
    #[error("Route is already handled!")]
    AlreadyHandled,

    /// Operation on a handle after its disposal.
    #[error("Handle #{0} is disposed")]
    HandleDisposed(u32),

    /// A value thrown on the host side, carried back over the bridge.
    #[error("{name}: {message}")]
    Remote {
        name: String,
        message: String,
        stack: Option<String>,
    },

    /// Invalid glob pattern for a route matcher.
    #[error("invalid route pattern {pattern:?}: {reason}")]
    Pattern { pattern: String, reason: String },

    /// Failure in the page environment (fetch or event dispatch).
    #[error("page environment error: {0}")]
    Env(String),
}

impl Error {
    /// Builds the client-side rendition of a serialized thrown value.
    pub(crate) fn from_thrown(value: &wp_runtime::remote::RemoteValue) -> Self {
        match value.node() {
            wp_runtime::remote::ValueNode::Error(error) => Error::Remote {
                name: error.name.clone(),
                message: error.message.clone(),
                stack: error.stack.clone(),
            },
            other => Error::Remote {
                name: "Error".into(),
                message: format!("{other:?}"),
                stack: None,
            },
        }
    }
}
