//! Voltage Gateway
//!
//! Runs the gateway described by a JSON configuration file until Ctrl-C,
//! a fatal bus failure or a stalled worker.
//!
//! Usage: cargo run --bin gateway -- --config gateway.json
//! Example: cargo run --bin gateway -- --config site.json --json-logs --stdin-control
//!
//! Exit codes: 0 graceful, 1 configuration, 2 transport, 3 watchdog.

use std::path::PathBuf;

use bytes::Bytes;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use voltage_gateway::{logging, GatewayConfig, GatewayError, Supervisor};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the gateway configuration file
    #[arg(short, long, value_name = "FILE", env = "GATEWAY_CONFIG")]
    config: PathBuf,

    /// Override the configured log filter
    #[arg(long, value_name = "FILTER")]
    log_level: Option<String>,

    /// Emit JSON log lines
    #[arg(long)]
    json_logs: bool,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,

    /// Read control envelopes from stdin, one JSON object per line
    #[arg(long)]
    stdin_control: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match GatewayConfig::from_file(&args.config).and_then(|c| c.validate()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("gateway: {}", e);
            std::process::exit(e.exit_code());
        }
    };

    let mut log_config = config.logging.clone();
    if let Some(level) = args.log_level {
        log_config.level = level;
    }
    log_config.json |= args.json_logs;
    logging::init(&log_config);

    if args.check {
        println!(
            "{}: {} bus(es), {} device(s)",
            args.config.display(),
            config.buses.len(),
            config.devices.len()
        );
        return;
    }

    info!(version = voltage_gateway::VERSION, config = %args.config.display(), "starting gateway");

    let mut supervisor = Supervisor::new(config);
    if args.stdin_control {
        supervisor = supervisor.with_intake(spawn_stdin_intake());
    }

    let exit = supervisor
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "cannot listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        })
        .await;

    if exit.is_graceful() {
        info!("gateway stopped");
    } else {
        eprintln!("gateway: {}", exit.reason);
    }
    std::process::exit(exit.code);
}

/// Forward stdin lines to the control intake
fn spawn_stdin_intake() -> mpsc::Receiver<Bytes> {
    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => {
                    if tx.send(Bytes::from(line)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %GatewayError::from(e), "stdin intake closed");
                    break;
                }
            }
        }
    });
    rx
}
