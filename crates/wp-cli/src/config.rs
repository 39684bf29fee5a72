//! Configuration loading and run resolution.
//!
//! A config file is either one object or an ordered list of objects, each
//! describing a sequential run. CLI flags override whatever the file says;
//! test globs resolve relative to the effective working directory.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::Deserialize;

use wp_host::engine::{BrowserKind, LaunchOptions};
use wp_host::runner::RunConfig;

use crate::cli::{classify_inputs, Cli, Input};
use crate::error::{CliError, Result};

/// The recognized config-file options.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FileConfig {
    pub cwd: Option<PathBuf>,
    pub setup: Option<PathBuf>,
    pub tests: Option<Vec<String>>,
    pub entry_points: Option<IndexMap<String, PathBuf>>,
    pub watch: Option<bool>,
    pub browser: Option<String>,
    pub browser_server_options: Option<serde_json::Value>,
    pub headless: Option<bool>,
    pub no_cov: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ConfigFile {
    One(FileConfig),
    Many(Vec<FileConfig>),
}

/// Loads a config file: an object is a single run, a list is a sequence.
pub fn load(path: &Path) -> Result<Vec<FileConfig>> {
    let bytes = std::fs::read(path).map_err(|source| CliError::ConfigRead {
        path: path.to_owned(),
        source,
    })?;
    let parsed: ConfigFile =
        serde_json::from_slice(&bytes).map_err(|source| CliError::ConfigParse {
            path: path.to_owned(),
            source,
        })?;
    Ok(match parsed {
        ConfigFile::One(config) => vec![config],
        ConfigFile::Many(configs) => configs,
    })
}

/// One fully resolved run.
#[derive(Debug)]
pub struct RunSpec {
    pub config: RunConfig,
    pub browser: BrowserKind,
    pub launch: LaunchOptions,
}

/// Merges the CLI over the file configs and resolves globs into files.
pub fn resolve_runs(cli: &Cli, file_configs: Vec<FileConfig>) -> Result<Vec<RunSpec>> {
    let file_configs = if file_configs.is_empty() {
        vec![FileConfig::default()]
    } else {
        file_configs
    };

    let inputs = classify_inputs(&cli.inputs);
    let cli_globs: Vec<String> = inputs
        .iter()
        .filter_map(|input| match input {
            Input::TestGlob(glob) => Some(glob.clone()),
            Input::EntryPoint { .. } => None,
        })
        .collect();
    let cli_entry_points: IndexMap<String, PathBuf> = inputs
        .iter()
        .filter_map(|input| match input {
            Input::EntryPoint { name, path } => Some((name.clone(), path.clone())),
            Input::TestGlob(_) => None,
        })
        .collect();

    let cli_server_options = cli
        .browser_server_options
        .as_deref()
        .map(serde_json::from_str::<serde_json::Value>)
        .transpose()
        .map_err(CliError::ServerOptions)?;

    let mut runs = Vec::with_capacity(file_configs.len());
    for file in file_configs {
        let cwd = cli
            .cwd
            .clone()
            .or(file.cwd)
            .map_or_else(std::env::current_dir, Ok)?;

        let globs = if cli_globs.is_empty() {
            file.tests.unwrap_or_default()
        } else {
            cli_globs.clone()
        };
        let tests = expand_globs(&cwd, &globs)?;

        let mut entry_points = file.entry_points.unwrap_or_default();
        for (name, path) in &cli_entry_points {
            entry_points.insert(name.clone(), path.clone());
        }

        let setup = cli
            .setup
            .clone()
            .or(file.setup)
            .map(|path| absolute_in(&cwd, &path));

        let mut config = RunConfig::new(&cwd);
        config.setup = setup;
        config.tests = tests;
        config.entry_points = entry_points
            .into_iter()
            .map(|(name, path)| (name, absolute_in(&cwd, &path)))
            .collect();
        config.watch = cli.watch || file.watch.unwrap_or(false);
        // Debug implies a headed browser (and devtools).
        config.headless = !cli.debug && file.headless.unwrap_or(true);
        config.no_cov = cli.no_cov || file.no_cov.unwrap_or(false);

        let browser: BrowserKind = cli
            .browser
            .clone()
            .or(file.browser)
            .unwrap_or_else(|| "chromium".to_owned())
            .parse()?;

        let launch = LaunchOptions {
            headless: config.headless,
            devtools: cli.debug,
            server_options: cli_server_options
                .clone()
                .or(file.browser_server_options),
        };

        runs.push(RunSpec {
            config,
            browser,
            launch,
        });
    }
    Ok(runs)
}

fn absolute_in(cwd: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_owned()
    } else {
        cwd.join(path)
    }
}

/// Expands test globs relative to `cwd`, deduplicated and sorted.
fn expand_globs(cwd: &Path, globs: &[String]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for pattern in globs {
        let full = absolute_in(cwd, Path::new(pattern));
        let full = full.to_string_lossy().into_owned();
        let matches = glob::glob(&full).map_err(|err| CliError::Glob {
            pattern: pattern.clone(),
            reason: err.to_string(),
        })?;
        for entry in matches {
            match entry {
                Ok(path) if path.is_file() => files.push(path),
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(target: "wp", pattern = %pattern, error = %err, "glob entry skipped");
                }
            }
        }
    }
    files.sort();
    files.dedup();
    Ok(files)
}
