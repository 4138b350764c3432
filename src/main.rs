use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser;
use log::{error, info};

mod availability;
mod backoff;
mod config;
mod device;
mod error;
mod logging;
mod mqtt;
mod presence;
mod publisher;
mod scanner;
mod tracker;

use availability::HomeAssistantApi;
use config::AppConfig;
use mqtt::MqttClient;
use scanner::BtleProbe;
use tracker::Tracker;

/// Track Bluetooth devices and report their presence to Home Assistant over MQTT.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Configuration file. Created with defaults on first run.
    #[arg(short, long, default_value = "bluetracker_config.toml")]
    config: PathBuf,

    /// Log level for this program (error, warn, info, debug, trace).
    #[arg(long)]
    log_level: Option<log::LevelFilter>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if !args.config.exists() {
        return match first_run(&args.config) {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                eprintln!("Fatal error: {err}");
                ExitCode::FAILURE
            }
        };
    }
    println!("Configuration file found at {}", args.config.display());

    let config = match AppConfig::load(&args.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Fatal error: {err}");
            return ExitCode::FAILURE;
        }
    };

    logging::init(config.environment, args.log_level);

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn first_run(path: &Path) -> std::io::Result<()> {
    fs::write(path, config::DEFAULT_CONFIG)?;
    println!("First run, configuration file copied to {}", path.display());
    println!("Modify as required and restart.");
    Ok(())
}

async fn run(config: AppConfig) -> anyhow::Result<()> {
    let devices = config.devices();
    info!(
        "Devices: {:?}",
        devices.iter().map(|d| d.name()).collect::<Vec<_>>()
    );

    let probe = BtleProbe::first_adapter()
        .await
        .context("Bluetooth is not available")?;

    let api = HomeAssistantApi::new(
        config.mqtt.homeassistant_url(),
        &config.mqtt.homeassistant_token,
    )
    .context("Failed to create Home Assistant client")?;

    let tracker = Tracker::new(
        config.scan,
        devices,
        probe,
        MqttClient::new(&config.mqtt),
        api,
        config.mqtt.discovery_prefix(),
    );
    tracker.run().await
}
