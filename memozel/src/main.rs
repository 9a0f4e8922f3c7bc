//! Memozel - run build commands only when something they touched changed
//!
//! Thin caller over `convenient-memo`: parses the command line, merges it
//! over an optional JSON configuration, and hands requests to the driver.

use clap::Parser;
use convenient_memo::Driver;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

use commands::{Cli, Commands};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "memozel=debug,convenient_memo=debug"
    } else {
        "memozel=info,convenient_memo=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    convenient_memo::cancel::install()?;

    let config = cli.memo_config()?;
    let mut driver = Driver::new(config)?;
    tracing::debug!("Recording with the {} recorder", driver.recorder_kind());

    let ok = match &cli.command {
        Commands::Run { target } => commands::run::execute(&mut driver, &target.request()),
        Commands::Batch { file } => commands::run::execute_batch(&mut driver, file)?,
        Commands::Status { target } => commands::inspect::status(&driver, &target.request()),
        Commands::List { json } => {
            commands::inspect::list(&driver, *json)?;
            true
        }
        Commands::Clean => commands::clean::execute(&mut driver)?,
    };

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}
