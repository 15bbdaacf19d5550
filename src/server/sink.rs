use anyhow::{anyhow, Result};
use serde_json::Value;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;

/// Telemetry received from a bound client.
#[derive(Clone, Debug, PartialEq)]
pub struct TelemetryEvent {
    pub client_id: String,
    pub payload: Value,
}

/// Consumer of telemetry the registry accepted.
pub trait TelemetrySink: Send + Sync {
    fn deliver(&self, event: TelemetryEvent) -> Result<()>;
}

/// Writes every event to the log.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogSink;

impl TelemetrySink for LogSink {
    fn deliver(&self, event: TelemetryEvent) -> Result<()> {
        log::info!("telemetry from {}: {}", event.client_id, event.payload);
        Ok(())
    }
}

/// Forwards events to an in-process receiver.
#[derive(Debug)]
pub struct ChannelSink {
    tx: Mutex<Sender<TelemetryEvent>>,
}

impl ChannelSink {
    pub fn new() -> (Self, Receiver<TelemetryEvent>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx: Mutex::new(tx) }, rx)
    }
}

impl TelemetrySink for ChannelSink {
    fn deliver(&self, event: TelemetryEvent) -> Result<()> {
        self.tx
            .lock()
            .map_err(|_| anyhow!("telemetry channel lock poisoned"))?
            .send(event)
            .map_err(|_| anyhow!("telemetry receiver dropped"))
    }
}
