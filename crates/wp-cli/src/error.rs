use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CliError>;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("cannot read config file {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid test glob {pattern:?}: {reason}")]
    Glob { pattern: String, reason: String },

    #[error("invalid --browser-server-options: {0}")]
    ServerOptions(serde_json::Error),

    #[error(transparent)]
    Host(#[from] wp_host::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
