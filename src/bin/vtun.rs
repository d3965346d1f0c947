//! vtun endpoint
//!
//! Creates the virtual interface, runs the configured transport as server
//! or client, and tears everything down on Ctrl-C.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use vtun::config::{generate_example_config, Config};
use vtun::transport::StrategySet;
use vtun::tun::LinuxTunProvider;
use vtun::App;

/// vtun - IP tunnel over disguise transports
#[derive(Parser, Debug)]
#[command(name = "vtun")]
#[command(about = "vtun - IP tunnel over disguise transports")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Protocol name (overrides config)
    #[arg(short, long)]
    protocol: Option<String>,

    /// Run as server (overrides config)
    #[arg(short = 'S', long)]
    server: bool,

    /// Write an example configuration to the config path and exit
    #[arg(long)]
    generate_config: bool,

    /// Log level (trace, debug, info, warn, error); defaults to the config value
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.generate_config {
        generate_example_config()
            .save(&args.config)
            .context("Failed to write example config")?;
        println!("Example configuration written to {}", args.config);
        println!("Set a shared key before starting the endpoint.");
        return Ok(());
    }

    let mut config = Config::load(&args.config).context("Failed to load configuration")?;
    if let Some(protocol) = args.protocol {
        config.protocol = protocol;
    }
    if args.server {
        config.server_mode = true;
    }

    init_logging(&config, args.log_level.as_deref());

    let mut app = App::new(config, LinuxTunProvider::new(), StrategySet::builtin());
    app.init().await.context("Failed to initialize")?;

    tokio::select! {
        result = app.start() => {
            if let Err(e) = result {
                error!("Tunnel stopped: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }

    app.stop().await.context("Failed to release interface")?;
    Ok(())
}

fn init_logging(config: &Config, level: Option<&str>) {
    let level = match level {
        Some(level) => level,
        None => &config.logging.level,
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.logging.format == "compact" {
        builder.compact().init();
    } else {
        builder.init();
    }
}
