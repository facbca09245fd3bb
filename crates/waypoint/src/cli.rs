use std::net::IpAddr;

use clap::{ArgAction, Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "waypoint",
    version,
    about = "Forward HTTP proxy with CONNECT tunnelling"
)]
pub struct Cli {
    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Accept proxy clients until interrupted
    Serve(ServeArgs),
    /// Start and stop the proxy on a loopback port to verify it works here
    Check,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Serve(_) => "serve",
            Command::Check => "check",
        }
    }
}

#[derive(Args)]
pub struct ServeArgs {
    /// Address to listen on
    #[arg(long, value_name = "ADDR", default_value = "0.0.0.0")]
    pub bind: IpAddr,

    /// Port to listen on
    #[arg(short, long, default_value_t = 8888)]
    pub port: u16,

    /// Idle and request-head timeout, in seconds
    #[arg(
        short,
        long,
        value_name = "SECS",
        default_value_t = 10,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub timeout: u64,

    /// Upstream connect timeout in seconds (defaults to --timeout)
    #[arg(long, value_name = "SECS", value_parser = clap::value_parser!(u64).range(1..))]
    pub connect_timeout: Option<u64>,
}
