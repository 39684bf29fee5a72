use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug, Default)]
#[command(name = "wrightplay")]
#[command(about = "In-browser unit test runner driven from the host")]
#[command(version)]
pub struct Cli {
    /// Test file globs, plus name=path extra entry points
    pub inputs: Vec<String>,

    /// Working directory tests and globs resolve against
    #[arg(long, value_name = "DIR")]
    pub cwd: Option<PathBuf>,

    /// Configuration file
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Setup file imported before any test file
    #[arg(short, long, value_name = "FILE")]
    pub setup: Option<PathBuf>,

    /// Watch files and rerun on change
    #[arg(short, long)]
    pub watch: bool,

    /// Browser to run in
    #[arg(short, long, value_name = "chromium|firefox|webkit")]
    pub browser: Option<String>,

    /// Engine-specific browser server options (JSON)
    #[arg(long, value_name = "JSON")]
    pub browser_server_options: Option<String>,

    /// Run headed with devtools open
    #[arg(short, long)]
    pub debug: bool,

    /// Disable coverage collection
    #[arg(long = "no-cov")]
    pub no_cov: bool,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

/// One positional argument, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// A test file glob.
    TestGlob(String),
    /// A `name=path` extra entry point.
    EntryPoint { name: String, path: PathBuf },
}

/// Splits positionals into test globs and named entry points.
pub fn classify_inputs(inputs: &[String]) -> Vec<Input> {
    inputs
        .iter()
        .map(|input| match input.split_once('=') {
            Some((name, path)) if !name.is_empty() => Input::EntryPoint {
                name: name.to_owned(),
                path: PathBuf::from(path),
            },
            _ => Input::TestGlob(input.clone()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_mixed_positionals_and_flags() {
        let cli = Cli::parse_from([
            "wrightplay",
            "tests/**/*.test.js",
            "worker=src/worker.js",
            "-s",
            "setup.js",
            "-w",
            "-b",
            "firefox",
            "--no-cov",
        ]);
        assert_eq!(cli.inputs.len(), 2);
        assert_eq!(cli.setup.as_deref(), Some(std::path::Path::new("setup.js")));
        assert!(cli.watch);
        assert_eq!(cli.browser.as_deref(), Some("firefox"));
        assert!(cli.no_cov);

        let inputs = classify_inputs(&cli.inputs);
        assert_eq!(inputs[0], Input::TestGlob("tests/**/*.test.js".into()));
        assert_eq!(
            inputs[1],
            Input::EntryPoint {
                name: "worker".into(),
                path: PathBuf::from("src/worker.js"),
            }
        );
    }

    #[test]
    fn debug_flag_parses_short_and_long() {
        assert!(Cli::parse_from(["wrightplay", "-d"]).debug);
        assert!(Cli::parse_from(["wrightplay", "--debug"]).debug);
    }
}
