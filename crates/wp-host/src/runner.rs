//! Run orchestration.
//!
//! A single run: start the bundle server, build, launch a context and
//! page against the server's base URL, bind the bridge, navigate to `/`,
//! and await the page's done signal. Watch and headed modes keep the page
//! open, rebuilding on file change and observing reruns whenever the
//! bridge client reconnects after a reload.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;

use crate::bridge::Session;
use crate::bundler::{BuildRequest, Bundler};
use crate::coverage::CoverageSink;
use crate::engine::{BrowserEngine, ContextOptions};
use crate::error::Result;
use crate::server::{BundleServer, ServerConfig};
use crate::watch;

/// Debounce window for rebuild-triggering file changes.
const WATCH_DEBOUNCE: Duration = Duration::from_millis(100);

/// Everything one run needs to know.
#[derive(Clone, Debug)]
pub struct RunConfig {
    pub cwd: PathBuf,
    pub setup: Option<PathBuf>,
    /// Resolved test files, in deterministic order.
    pub tests: Vec<PathBuf>,
    pub entry_points: IndexMap<String, PathBuf>,
    pub watch: bool,
    pub headless: bool,
    pub no_cov: bool,
    pub static_dir: Option<PathBuf>,
}

impl RunConfig {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: cwd.into(),
            setup: None,
            tests: Vec::new(),
            entry_points: IndexMap::new(),
            watch: false,
            headless: true,
            no_cov: false,
            static_dir: None,
        }
    }
}

/// Drives one configured run against an engine and a bundler.
pub struct Runner {
    config: RunConfig,
    engine: Arc<dyn BrowserEngine>,
    bundler: Arc<dyn Bundler>,
    coverage: Option<Arc<dyn CoverageSink>>,
}

impl Runner {
    pub fn new(
        config: RunConfig,
        engine: Arc<dyn BrowserEngine>,
        bundler: Arc<dyn Bundler>,
    ) -> Self {
        Self {
            config,
            engine,
            bundler,
            coverage: None,
        }
    }

    pub fn with_coverage(mut self, sink: Arc<dyn CoverageSink>) -> Self {
        self.coverage = Some(sink);
        self
    }

    /// Runs to completion, or until `shutdown` resolves in watch/headed
    /// mode. Returns the maximum exit code observed across reruns.
    pub async fn run(&self, shutdown: impl Future<Output = ()> + Send) -> Result<i32> {
        if self.config.tests.is_empty() && !self.config.watch {
            tracing::error!(target: "wp", "no test file found");
            return Ok(1);
        }

        let session = Session::new();
        let server = BundleServer::start(
            ServerConfig {
                cwd: self.config.cwd.clone(),
                static_dir: self.config.static_dir.clone(),
            },
            Arc::clone(&session),
        )
        .await?;

        let request = BuildRequest {
            session_uuid: session.uuid().to_owned(),
            cwd: self.config.cwd.clone(),
            setup: self.config.setup.clone(),
            tests: self.config.tests.clone(),
            entry_points: self.config.entry_points.clone(),
        };
        // The first build must succeed; there are no prior artifacts to
        // fall back to.
        server.finish_build(self.bundler.build(&request).await)?;

        let context = self
            .engine
            .new_context(ContextOptions {
                base_url: Some(server.base_url()),
            })
            .await?;
        let page = context.new_page().await?;
        session.install_engine(Arc::clone(&context), Arc::clone(&page));

        let coverage = match (&self.coverage, self.config.no_cov) {
            (Some(sink), false) if page.supports_js_coverage() => Some(Arc::clone(sink)),
            _ => None,
        };
        if coverage.is_some() {
            page.start_js_coverage().await?;
        }

        page.goto(&format!("{}/", server.base_url())).await?;
        let mut exit = match page.wait_done().await {
            Ok(code) => code,
            Err(err) => {
                tracing::error!(target: "wp", error = %err, "run failed");
                1
            }
        };

        // Coverage is collected only for the first run.
        if let Some(sink) = coverage {
            match page.stop_js_coverage().await {
                Ok(entries) => {
                    if let Err(err) = sink.write(&entries) {
                        tracing::error!(target: "wp", error = %err, "coverage sink failed");
                    }
                }
                Err(err) => {
                    tracing::error!(target: "wp", error = %err, "coverage collection failed");
                }
            }
        }

        let keep_open = self.config.watch || !self.config.headless;
        if !keep_open {
            page.close().await?;
            context.close().await?;
            return Ok(exit);
        }

        let mut ticks = if self.config.watch {
            let (handle, ticks) = watch::watch_paths(&[self.config.cwd.clone()], WATCH_DEBOUNCE)?;
            Some((handle, ticks))
        } else {
            None
        };

        let mut seen_generation = session.generation();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                tick = next_tick(&mut ticks) => {
                    if tick.is_none() {
                        break;
                    }
                    server.begin_build();
                    match server.finish_build(self.bundler.build(&request).await) {
                        Ok(true) => {
                            tracing::info!(target: "wp", "bundle changed, reloading");
                            if let Err(err) = page.reload().await {
                                tracing::error!(target: "wp", error = %err, "reload failed");
                            }
                        }
                        Ok(false) => {}
                        Err(err) => {
                            // Old artifacts stay in place; the next edit
                            // retries.
                            tracing::error!(target: "wp", error = %err, "rebuild failed");
                        }
                    }
                }
                generation = session.wait_for_reconnect(seen_generation) => {
                    // Rerun observed only once the client actually
                    // reconnected, so one navigation is never counted
                    // twice.
                    seen_generation = generation;
                    let code = match page.wait_done().await {
                        Ok(code) => code,
                        Err(err) => {
                            tracing::error!(target: "wp", error = %err, "rerun failed");
                            1
                        }
                    };
                    exit = exit.max(code);
                }
            }
        }

        page.close().await?;
        context.close().await?;
        Ok(exit)
    }
}

async fn next_tick(
    ticks: &mut Option<(watch::WatchHandle, tokio::sync::mpsc::Receiver<()>)>,
) -> Option<()> {
    match ticks {
        Some((_, receiver)) => receiver.recv().await,
        None => std::future::pending().await,
    }
}
