use clap::{Parser, Subcommand};
use eyre::Result;

mod config;
mod fan;
mod serve;

#[derive(Parser)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Print the parsed configuration
    Config {
        #[arg(short, long, default_value = "config.yaml")]
        config: String,
    },

    /// Drive a single fan relay interactively
    Fan {
        #[arg(short, long)]
        pin: u8,
        /// Relay boards that energize on a high output level
        #[arg(long)]
        active_high: bool,
    },

    /// Run the controller and its HTTP API
    Serve {
        #[arg(short, long, default_value = "config.yaml")]
        config: String,
        #[arg(short, long)]
        port: Option<u16>,
    },
}

pub async fn run() -> Result<()> {
    match Cli::parse().command {
        Command::Config { config } => self::config::read_and_print(&config).await,
        Command::Fan { pin, active_high } => self::fan::run(pin, !active_high),
        Command::Serve { config, port } => self::serve::launch(&config, port).await,
    }
}
