mod cli;
mod commands;
mod error;

use clap::Parser;
use cli::{Cli, Command};
use error::CliError;
use tracing_subscriber::EnvFilter;

/// Environment variable holding an `EnvFilter` directive that replaces `-v`.
const LOG_ENV: &str = "WAYPOINT_LOG";

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    setup_tracing(cli.verbose);

    let result = dispatch(cli).await;
    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn dispatch(cli: Cli) -> Result<(), CliError> {
    tracing::debug!(
        version = env!("CARGO_PKG_VERSION"),
        command = cli.command.name(),
        "waypoint starting"
    );

    match cli.command {
        Command::Serve(args) => commands::serve::serve(args).await,
        Command::Check => commands::check::check().await,
    }
}

/// Filter used when `WAYPOINT_LOG` is unset: `-v` raises waypoint's own
/// crates while dependencies stay at `warn`.
fn default_filter(verbose: u8) -> String {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    format!("warn,waypoint={level},waypoint_proxy={level}")
}

fn setup_tracing(verbose: u8) {
    let filter = std::env::var(LOG_ENV).unwrap_or_else(|_| default_filter(verbose));

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(verbose > 0)
        .with_writer(std::io::stderr)
        .init();
}
