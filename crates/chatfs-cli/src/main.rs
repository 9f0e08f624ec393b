mod commands;
mod config;
mod output;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::commands::{info, keygen, mount};

/// Command-line interface for mounting a chat service's attachment store as
/// a filesystem
#[derive(Parser)]
#[command(name = "chatfs")]
#[command(author, version)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to a TOML config file (defaults to `./chatfs.toml` if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mount the volume as a filesystem
    Mount(mount::Args),

    /// Generate the master key file used to encrypt file contents
    Keygen(keygen::Args),

    /// Report index statistics without mounting anything
    Info(info::Args),
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_tracing(cli.verbose);

    let rt = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: failed to start async runtime: {e:#}");
            return ExitCode::from(2);
        }
    };

    match rt.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            // Config errors never reach the mounted filesystem; reserve
            // exit code 2 for them.
            let code = if e.chain().count() == 1 && e.to_string().contains("configuration") { 2 } else { 1 };
            ExitCode::from(code)
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = config::load(cli.config.as_deref()).context("configuration")?;

    match cli.command {
        Commands::Mount(args) => mount::execute(&config, &args).await,
        Commands::Keygen(args) => keygen::execute(&config, &args),
        Commands::Info(args) => info::execute(&config, &args),
    }
}

fn setup_tracing(verbose: u8) {
    let filter = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with_writer(std::io::stderr)
        .init();
}
