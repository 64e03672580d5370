//! stationsrv binary: load config, start one poller per device, run until
//! SIGINT/SIGTERM.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use stationsrv::config::{StationsrvConfig, DEFAULT_CONFIG_PATH};
use stationsrv::service::StationService;
use stationsrv::sink::LogSink;

#[derive(Debug, Parser)]
#[command(name = "stationsrv", version, about = "Station controller polling service")]
struct Args {
    /// Configuration file
    #[arg(short, long, env = "STATIONSRV_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log filter, overrides `logging.level`
    #[arg(long)]
    log_level: Option<String>,

    /// Load and validate the configuration, then exit
    #[arg(long)]
    validate: bool,

    /// Print the effective configuration (file + environment) as YAML, then exit
    #[arg(long)]
    print_config: bool,

    /// Disable colored console output
    #[arg(long)]
    no_color: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = StationsrvConfig::load(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;

    if args.print_config {
        print!("{}", serde_yaml::to_string(&config).context("Failed to render configuration")?);
        return Ok(());
    }

    common::init_with_config(common::LogConfig {
        service_name: config.service.name.clone(),
        filter: args
            .log_level
            .clone()
            .unwrap_or_else(|| config.logging.level.clone()),
        enable_json: config.logging.json,
        log_dir: config.logging.dir.as_ref().map(PathBuf::from),
        ansi: !args.no_color,
    })
    .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))?;

    if args.validate {
        config.validate().context("Invalid configuration")?;
        info!(
            "Configuration {} is valid ({} devices)",
            args.config.display(),
            config.devices.len()
        );
        return Ok(());
    }

    if config.devices.is_empty() {
        info!("No devices configured");
    }

    let cancel = common::shutdown_token();
    let sink = Arc::new(LogSink);
    let service = StationService::start(&config, sink.clone(), sink, cancel.clone())
        .await
        .context("Failed to start service")?;
    if let Some(listener) = service.rendezvous() {
        info!("Waiting for controllers on {}", listener.local_addr());
    }
    info!(
        "{} started with {} devices",
        config.service.name,
        service.registry().len()
    );

    cancel.cancelled().await;
    info!("Shutdown requested, stopping pollers");
    service.join().await;
    info!("{} stopped", config.service.name);
    Ok(())
}
