//! collector_server - Session server for edge telemetry clients.
//!
//! Accepts edge connections, acknowledges register/reconnect/disconnect
//! actions and logs the telemetry bound clients send.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};
use std::time::Duration;

use telemetry_relay::config::ServerConfig;
use telemetry_relay::server::{LogSink, SessionRegistry, SessionServer};

const LIVENESS_CHECK: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(author, version, about = "Collect telemetry from edge clients")]
struct Args {
    /// Config file (.json, otherwise TOML).
    #[arg(long, env = "TELEMETRY_CONFIG")]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = ServerConfig::load_from(args.config.as_deref())?;
    let registry = Arc::new(SessionRegistry::new());
    let handle = SessionServer::new(config, registry, Arc::new(LogSink)).spawn()?;
    log::info!("collector_server listening on {}", handle.addr);

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!("collector_server waiting for shutdown signal (Ctrl-C)...");
    loop {
        match rx.recv_timeout(LIVENESS_CHECK) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) if !handle.is_running() => {
                let addr = handle.addr;
                handle.stop()?;
                return Err(anyhow!("session server on {} stopped accepting clients", addr));
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
        }
    }
    log::info!("shutdown signal received, stopping session server...");
    handle.stop()?;

    Ok(())
}
