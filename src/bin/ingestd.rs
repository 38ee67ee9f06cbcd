//! Ingestion service - bridges physical scan events to the dispatcher
//!
//! Usage:
//!   cargo run --bin ingestd
//!   cargo run --bin ingestd -- --config /etc/zaparoo/ingest.toml
//!   cargo run --bin ingestd -- --barcode /dev/ttyUSB0

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use zaparoo_ingest::common::shutdown_token;
use zaparoo_ingest::config::Config;
use zaparoo_ingest::hub::{ScanHub, SCAN_CHANNEL_DEPTH};
use zaparoo_ingest::publisher::MqttPublisher;
use zaparoo_ingest::reader::barcode::BarcodeReader;
use zaparoo_ingest::reader::external_drive::ExternalDriveReader;
use zaparoo_ingest::token::Notification;

#[derive(Parser, Debug)]
#[command(name = "ingestd", about = "Zaparoo token ingestion service")]
struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long = "config", default_value = "config.toml")]
    config_file: String,

    /// Serial device of a barcode scanner (overrides the config file)
    #[arg(long)]
    barcode: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("zaparoo_ingest=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let config = if std::path::Path::new(&args.config_file).exists() {
        Config::load(&args.config_file)?
    } else {
        warn!(path = %args.config_file, "config file not found, using defaults");
        Config::default()
    };

    let (mut hub, mut scans) = ScanHub::new(SCAN_CHANNEL_DEPTH);

    if config.readers.external_drive {
        let reader = ExternalDriveReader::new(config.external_drive_options());
        if let Err(err) = hub.open_reader(Box::new(reader), "externaldrive:").await {
            warn!(error = %err, "external drive reader unavailable");
        }
    }

    if let Some(port) = args.barcode.or_else(|| config.readers.barcode_port.clone()) {
        let descriptor = format!("barcode:{port}");
        if let Err(err) = hub.open_reader(Box::new(BarcodeReader::new()), &descriptor).await {
            warn!(error = %err, port = %port, "barcode reader unavailable");
        }
    }

    if hub.devices().is_empty() {
        anyhow::bail!("no readers available");
    }
    info!(readers = ?hub.devices(), "ingest service started");

    let publisher = match config.publisher_options() {
        Some(options) => {
            let publisher = MqttPublisher::new(options);
            match publisher.start().await {
                Ok(()) => Some(publisher),
                Err(err) => {
                    warn!(error = %err, "MQTT publisher disabled");
                    None
                }
            }
        }
        None => None,
    };

    let shutdown = shutdown_token();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,

            scan = scans.recv() => {
                let Some(scan) = scan else { break };
                match &scan.token {
                    Some(token) => {
                        info!(source = %scan.source, text = %token.text, "token scanned");
                    }
                    None => info!(source = %scan.source, "token removed"),
                }
                if let Some(publisher) = &publisher {
                    let notification = Notification::from_scan(&scan);
                    if let Err(err) = publisher.publish(&notification).await {
                        warn!(error = %err, "notification publish failed");
                    }
                }
            }
        }
    }

    hub.close_all().await;
    if let Some(publisher) = publisher {
        publisher.stop().await;
    }
    info!("ingest service stopped");
    Ok(())
}
