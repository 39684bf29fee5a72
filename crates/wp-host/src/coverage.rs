//! Coverage hand-off.
//!
//! The engine collects raw JS coverage (Chromium only); the runner hands
//! the entries to a sink after the first run. Converting to other report
//! formats is the sink's business, not the core's.

use std::path::PathBuf;

use crate::error::{Error, Result};

/// Receives the raw coverage entries of a run.
pub trait CoverageSink: Send + Sync {
    fn write(&self, entries: &[serde_json::Value]) -> Result<()>;
}

/// Writes V8-format coverage JSON into a directory, the shape tooling
/// reading `NODE_V8_COVERAGE` expects.
pub struct V8CoverageDir {
    dir: PathBuf,
}

impl V8CoverageDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The conventional environment hookup.
    pub fn from_env() -> Option<Self> {
        std::env::var_os("NODE_V8_COVERAGE")
            .filter(|value| !value.is_empty())
            .map(|value| Self::new(PathBuf::from(value)))
    }
}

impl CoverageSink for V8CoverageDir {
    fn write(&self, entries: &[serde_json::Value]) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let file = self
            .dir
            .join(format!("coverage-{}.json", uuid::Uuid::new_v4()));
        let payload = serde_json::json!({ "result": entries });
        std::fs::write(&file, serde_json::to_vec(&payload)?)
            .map_err(|err| Error::Server(format!("coverage write failed: {err}")))?;
        tracing::debug!(target: "wp", file = %file.display(), "coverage written");
        Ok(())
    }
}
