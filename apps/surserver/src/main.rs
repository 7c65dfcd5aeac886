use anyhow::Result;
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use rest_bridge::RestBridgeModule;
use surkit::{AppHost, ShutdownCoordinator, ShutdownOptions};
use surkit_bootstrap::{AppConfig, CliArgs, DEFAULT_CONFIG_PATH};

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Surroundhome server - HTTP to message broker bridge
#[derive(Parser)]
#[command(name = "surserver")]
#[command(about = "Surroundhome server - HTTP to message broker bridge")]
#[command(version = "0.1.0")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Port override for HTTP server (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Print effective configuration (YAML) and exit
    #[arg(long)]
    print_config: bool,

    /// Log verbosity level (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server
    Run,
    /// Validate configuration and exit
    Check,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let args = CliArgs {
        port: cli.port,
        verbose: cli.verbose,
    };

    // defaults -> YAML -> env (SURSERVER__*) -> CLI overrides; a missing file is fatal
    let mut config = AppConfig::load_layered(&cli.config)?;
    config.apply_cli_overrides(&args);

    let logging_config = config.logging.clone().unwrap_or_default();
    surkit_bootstrap::init_logging(&logging_config, &std::env::current_dir()?);

    if cli.print_config {
        println!("{}", config.to_yaml()?);
        return Ok(ExitCode::SUCCESS);
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_server(config).await,
        Commands::Check => check_config(config),
    }
}

async fn run_server(config: AppConfig) -> Result<ExitCode> {
    tracing::info!(
        bind = %config.server.bind_addr(),
        broker = %config.broker.address,
        mode = ?config.broker.mode,
        "Surroundhome server starting"
    );

    let host = Arc::new(AppHost::new(config));
    host.add_module(RestBridgeModule::new())?;

    if let Err(e) = host.start().await {
        tracing::error!(error = %e, "startup failed");
        return Ok(ExitCode::FAILURE);
    }

    let outcome = ShutdownCoordinator::new(host)
        .run(ShutdownOptions::Signals)
        .await;
    tracing::info!(?outcome, "server stopped");
    Ok(ExitCode::from(outcome.exit_code()))
}

fn check_config(config: AppConfig) -> Result<ExitCode> {
    tracing::info!("Checking configuration...");
    config.validate()?;
    println!("Configuration is valid");
    println!("{}", config.to_yaml()?);
    Ok(ExitCode::SUCCESS)
}
