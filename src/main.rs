//! execward - run untrusted code snippets under OS-level sandboxing
//!
//! Thin binary entry point that delegates to the CLI handlers in `cli`.

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use execward_config::{ConfigManager, ExecwardConfig, load_dotenv};
use tracing_subscriber::EnvFilter;

mod cli;

use cli::Cli;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("execward: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<ExitCode> {
    // Load .env (non-fatal if missing)
    load_dotenv().ok();

    let args = Cli::parse();
    let config = load_config(&args)?;
    initialize_tracing(&config);

    cli::dispatch(args.command, config, args.json).await
}

fn load_config(args: &Cli) -> Result<ExecwardConfig> {
    let manager = match (&args.config, &args.workspace) {
        (Some(path), _) => ConfigManager::load_from_file(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        (None, Some(workspace)) => ConfigManager::load_from_workspace(workspace)?,
        (None, None) => ConfigManager::load()?,
    };
    Ok(manager.into_config())
}

/// `RUST_LOG` takes precedence; otherwise `[debug]` decides. Logs go to
/// stderr so JSON output on stdout stays clean.
fn initialize_tracing(config: &ExecwardConfig) {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) if config.debug.enable_tracing => {
            EnvFilter::new(config.debug.filter_directive())
        }
        Err(_) => EnvFilter::new("warn"),
    };

    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init();

    if installed.is_ok() && config.debug.enable_tracing {
        tracing::info!(
            level = %config.debug.trace_level,
            "debug tracing enabled"
        );
    }
}
