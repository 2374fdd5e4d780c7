mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands};
use tally::{Error as TallyError, RuntimeConfig};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_tracing();

    let exit_code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            if let Some(tally_error) = e.downcast_ref::<TallyError>() {
                eprintln!("Error: {}", tally_error);
                if let Some(suggestion) = tally_error.suggestion() {
                    eprintln!("\nHint: {}", suggestion);
                }
            } else {
                eprintln!("Error: {:#}", e);
            }
            1
        }
    };

    std::process::exit(exit_code);
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let mut config = RuntimeConfig::from_env()?;
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }

    match cli.command {
        Commands::Start { no_browser } => Ok(commands::run_start(config, no_browser).await),
        Commands::Stop => {
            commands::run_stop(config).await?;
            Ok(0)
        }
        Commands::Status { json } => {
            commands::run_status(config, json).await?;
            Ok(0)
        }
        Commands::Db(db_command) => {
            commands::run_db(db_command, config).await?;
            Ok(0)
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}
