use std::path::PathBuf;

use clap::Parser;
use tollbridge_supervisor::SupervisorBuilder;
use tollbridge_supervisor::config::loader::load_config;
use tollbridge_supervisor::observability;

/// Tollbridge supervisor.
#[derive(Debug, Parser)]
#[command(name = "tollbridge-supervisor", version, about)]
struct Args {
    /// Path to the configuration file.
    #[arg(long, env = "TOLLBRIDGE_CONFIG", default_value = "tollbridge.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    // Load .env file if present (before anything else)
    if let Err(e) = dotenvy::dotenv() {
        // Not an error if .env doesn't exist - it's optional
        if !matches!(e, dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound)
        {
            eprintln!("Warning: Failed to load .env file: {e}");
        }
    }

    observability::init_tracing();

    let args = Args::parse();

    let cfg = match load_config(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {e:#}");
            std::process::exit(2);
        }
    };
    observability::apply_logging_level(&cfg.logging.level);
    tracing::info!(path = %args.config.display(), "Configuration loaded");

    let supervisor = match SupervisorBuilder::new(cfg).build().await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Supervisor initialization failed: {e:#}");
            std::process::exit(2);
        }
    };

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
        }
    };

    if let Err(err) = supervisor.run(shutdown).await {
        eprintln!("Supervisor error: {err:#}");
        std::process::exit(1);
    }
}
