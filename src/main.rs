use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;

#[derive(Parser)]
#[command(
    name = "babelgate",
    version,
    about = "Multi-protocol forwarding proxy",
    arg_required_else_help = true
)]
struct Cli {
    /// Path to the JSON config file
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match babelgate::config::load_config(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };

    let default_filter = if config.misc.verbose_log {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    info!(config = %cli.config.display(), "babelgate starting");
    let app = babelgate::app::App::new(config)?;
    app.run().await
}
