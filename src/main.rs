mod commands;

use std::path::PathBuf;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "snapquota")]
#[command(about = "Inspect snap quota groups")]
struct Args {
    /// Path to the daemon state file
    #[arg(long, env = "SNAPQUOTA_STATE", default_value = "/var/lib/snapquota/state")]
    state: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List all quota groups
    List,

    /// Show one quota group
    Show {
        /// Group name
        name: String,
    },

    /// Check that the persisted groups are consistent
    Check,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")
    ).init();

    let args = Args::parse();

    match args.command {
        Command::List => {
            commands::list(&args.state).await?;
        }
        Command::Show { name } => {
            commands::show(&args.state, &name).await?;
        }
        Command::Check => {
            commands::check(&args.state).await?;
        }
    }

    Ok(())
}
