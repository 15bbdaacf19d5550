//! Telemetry relay
//!
//! Streams stabilized object-tracking telemetry from an edge device to a
//! collector over a persistent connection, surviving network interruptions
//! without losing in-flight detections.
//!
//! # Pipeline
//!
//! tracker backend → `ConfirmationEngine` → snapshot → `Collector` →
//! `DeliveryQueue` → `ConnectionManager` → wire → `SessionServer` /
//! `SessionRegistry` → `TelemetrySink`.
//!
//! # Module Structure
//!
//! - `detect`: tracker backends and raw-track normalisation
//! - `tracking`: track confirmation and the per-frame pipeline
//! - `delivery`: bounded, deduplicated delivery queue
//! - `transport`: wire protocol and line-framed links
//! - `client`: connection state machine with reconnect backoff
//! - `server`: session registry and connection handling
//! - `config`: layered configuration (file, environment, validation)

use anyhow::{anyhow, Result};
use std::sync::OnceLock;

pub mod client;
pub mod config;
pub mod delivery;
pub mod detect;
pub mod server;
pub mod tracking;
pub mod transport;

pub use client::{ConnectionManager, ConnectionState, ManagerSettings, ReconnectPolicy};
pub use config::{ClientConfig, ServerConfig};
pub use delivery::{Collector, DeliveryQueue, SharedQueue};
pub use detect::{RawTrack, TrackId, TrackerBackend, TrackerOutput};
pub use server::{ServerHandle, SessionRegistry, SessionServer, TelemetrySink};
pub use tracking::{ConfirmationEngine, ConfirmedDetection, TrackingPipeline};

/// Validate a client identifier.
///
/// Allowed: "edge-1", "cam_03.lot-a", "site:42"
/// Disallowed: empty, longer than 64 bytes, whitespace, slashes, quotes.
pub fn validate_client_id(client_id: &str) -> Result<()> {
    // Compile once for hot paths.
    static CLIENT_ID_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = CLIENT_ID_RE
        .get_or_init(|| regex::Regex::new(r"^[A-Za-z0-9_.:-]{1,64}$").unwrap());

    if !re.is_match(client_id) {
        return Err(anyhow!(
            "client_id '{}' must match ^[A-Za-z0-9_.:-]{{1,64}}$",
            client_id
        ));
    }
    Ok(())
}
