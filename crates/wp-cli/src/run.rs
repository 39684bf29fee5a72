//! Sequential run execution.

use std::sync::Arc;

use anyhow::Context;

use wp_host::coverage::{CoverageSink, V8CoverageDir};
use wp_host::runner::Runner;
use wp_host::{engine, PassthroughBundler};

use crate::cli::Cli;
use crate::config;

/// Executes every resolved run in order. The process exit code is the
/// maximum across runs, so a nonzero result is never overwritten by a
/// later zero.
pub async fn run(cli: Cli) -> anyhow::Result<i32> {
    let file_configs = match &cli.config {
        Some(path) => config::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => Vec::new(),
    };
    let runs = config::resolve_runs(&cli, file_configs)?;

    let mut exit = 0;
    for spec in runs {
        let engine = engine::launch(spec.browser, spec.launch.clone())
            .await
            .with_context(|| format!("launching {}", spec.browser))?;

        let mut runner = Runner::new(spec.config.clone(), engine, Arc::new(PassthroughBundler));
        if !spec.config.no_cov {
            if let Some(sink) = V8CoverageDir::from_env() {
                runner = runner.with_coverage(Arc::new(sink) as Arc<dyn CoverageSink>);
            }
        }

        let code = runner
            .run(async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await?;
        exit = exit.max(code);
    }
    Ok(exit)
}
