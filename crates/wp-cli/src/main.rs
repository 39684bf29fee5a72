use clap::Parser;
use tracing::error;
use wp_cli::{cli::Cli, logging, run};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose);

    match run::run(cli).await {
        Ok(exit) => std::process::exit(exit),
        Err(err) => {
            error!(target = "wp", error = %err, "run failed");
            std::process::exit(1);
        }
    }
}
