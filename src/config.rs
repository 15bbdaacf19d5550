use anyhow::{anyhow, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::client::{ManagerSettings, ReconnectPolicy};
use crate::delivery::DEFAULT_QUEUE_CAPACITY;
use crate::tracking::{ConfirmationConfig, DEFAULT_BOOTSTRAP_WINDOW, DEFAULT_STABLE_FRAMES_THRESHOLD};
use crate::transport::DEFAULT_MAX_MESSAGE_BYTES;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:4000";
const DEFAULT_SEND_INTERVAL_MS: u64 = 1000;
const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;
const MIN_MESSAGE_BYTES: usize = 256;

#[derive(Debug, Deserialize, Default)]
struct ClientConfigFile {
    server: Option<String>,
    client_id: Option<String>,
    detect_interval_ms: Option<u64>,
    send_interval_ms: Option<u64>,
    handshake_timeout_ms: Option<u64>,
    tracking: Option<TrackingConfigFile>,
    queue: Option<QueueConfigFile>,
    reconnect: Option<ReconnectConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct TrackingConfigFile {
    stable_frames_threshold: Option<u32>,
    bootstrap_window: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct QueueConfigFile {
    capacity: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct ReconnectConfigFile {
    initial_backoff_ms: Option<u64>,
    max_backoff_ms: Option<u64>,
    multiplier: Option<f64>,
    max_retries: Option<u32>,
    jitter: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct ServerConfigFile {
    bind_addr: Option<String>,
    max_message_bytes: Option<usize>,
}

/// Edge client settings.
///
/// `server`, `client_id` and `detect_interval_ms` have no defaults and must
/// come from the file or the environment.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server: String,
    pub client_id: String,
    pub detect_interval: Duration,
    pub send_interval: Duration,
    pub handshake_timeout: Duration,
    pub confirmation: ConfirmationConfig,
    pub queue_capacity: usize,
    pub reconnect: ReconnectPolicy,
}

impl ClientConfig {
    /// Load from `TELEMETRY_CONFIG` (if set) plus environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("TELEMETRY_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ClientConfigFile) -> Self {
        let tracking = file.tracking.unwrap_or_default();
        let reconnect = file.reconnect.unwrap_or_default();
        let defaults = ReconnectPolicy::default();
        Self {
            server: file.server.unwrap_or_default(),
            client_id: file.client_id.unwrap_or_default(),
            detect_interval: Duration::from_millis(file.detect_interval_ms.unwrap_or(0)),
            send_interval: Duration::from_millis(
                file.send_interval_ms.unwrap_or(DEFAULT_SEND_INTERVAL_MS),
            ),
            handshake_timeout: Duration::from_millis(
                file.handshake_timeout_ms.unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT_MS),
            ),
            confirmation: ConfirmationConfig {
                stable_frames_threshold: tracking
                    .stable_frames_threshold
                    .unwrap_or(DEFAULT_STABLE_FRAMES_THRESHOLD),
                bootstrap_window: tracking
                    .bootstrap_window
                    .unwrap_or(DEFAULT_BOOTSTRAP_WINDOW),
            },
            queue_capacity: file
                .queue
                .and_then(|queue| queue.capacity)
                .unwrap_or(DEFAULT_QUEUE_CAPACITY),
            reconnect: ReconnectPolicy {
                initial_backoff: reconnect
                    .initial_backoff_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.initial_backoff),
                max_backoff: reconnect
                    .max_backoff_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.max_backoff),
                multiplier: reconnect.multiplier.unwrap_or(defaults.multiplier),
                max_retries: reconnect.max_retries.unwrap_or(defaults.max_retries),
                jitter: reconnect.jitter.unwrap_or(defaults.jitter),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(server) = std::env::var("TELEMETRY_SERVER") {
            if !server.trim().is_empty() {
                self.server = server.trim().to_string();
            }
        }
        if let Ok(client_id) = std::env::var("TELEMETRY_CLIENT_ID") {
            if !client_id.trim().is_empty() {
                self.client_id = client_id.trim().to_string();
            }
        }
        if let Some(ms) = env_number::<u64>("TELEMETRY_DETECT_INTERVAL_MS")? {
            self.detect_interval = Duration::from_millis(ms);
        }
        if let Some(frames) = env_number::<u32>("TELEMETRY_STABLE_FRAMES")? {
            self.confirmation.stable_frames_threshold = frames;
        }
        if let Some(capacity) = env_number::<usize>("TELEMETRY_QUEUE_CAPACITY")? {
            self.queue_capacity = capacity;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.server.is_empty() {
            return Err(anyhow!(
                "missing required key 'server' (set it in the config file or TELEMETRY_SERVER)"
            ));
        }
        if !self.server.contains(':') {
            return Err(anyhow!("server must be host:port, got '{}'", self.server));
        }
        if self.client_id.is_empty() {
            return Err(anyhow!(
                "missing required key 'client_id' (set it in the config file or TELEMETRY_CLIENT_ID)"
            ));
        }
        crate::validate_client_id(&self.client_id)?;
        if self.detect_interval.is_zero() {
            return Err(anyhow!(
                "missing required key 'detect_interval_ms' (must be greater than zero)"
            ));
        }
        if self.send_interval.is_zero() {
            return Err(anyhow!("send_interval_ms must be greater than zero"));
        }
        if self.handshake_timeout.is_zero() {
            return Err(anyhow!("handshake_timeout_ms must be greater than zero"));
        }
        if self.confirmation.stable_frames_threshold == 0 {
            return Err(anyhow!("tracking.stable_frames_threshold must be at least 1"));
        }
        if self.queue_capacity == 0 {
            return Err(anyhow!("queue.capacity must be at least 1"));
        }
        if self.reconnect.multiplier < 1.0 {
            return Err(anyhow!("reconnect.multiplier must be at least 1.0"));
        }
        if self.reconnect.initial_backoff > self.reconnect.max_backoff {
            return Err(anyhow!(
                "reconnect.initial_backoff_ms must not exceed reconnect.max_backoff_ms"
            ));
        }
        Ok(())
    }

    pub fn manager_settings(&self) -> ManagerSettings {
        ManagerSettings {
            client_id: self.client_id.clone(),
            policy: self.reconnect.clone(),
            handshake_timeout: self.handshake_timeout,
            send_interval: self.send_interval,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub max_message_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }
}

impl ServerConfig {
    /// Load from an optional file plus the `TELEMETRY_BIND_ADDR` override.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file: ServerConfigFile = match path {
            Some(path) => read_config_file(path)?,
            None => ServerConfigFile::default(),
        };
        let defaults = Self::default();
        let mut cfg = Self {
            bind_addr: file.bind_addr.unwrap_or(defaults.bind_addr),
            max_message_bytes: file.max_message_bytes.unwrap_or(defaults.max_message_bytes),
        };
        if let Ok(addr) = std::env::var("TELEMETRY_BIND_ADDR") {
            if !addr.trim().is_empty() {
                cfg.bind_addr = addr.trim().to_string();
            }
        }
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        self.bind_addr
            .parse::<SocketAddr>()
            .map_err(|e| anyhow!("invalid bind_addr '{}': {}", self.bind_addr, e))?;
        if self.max_message_bytes < MIN_MESSAGE_BYTES {
            return Err(anyhow!(
                "max_message_bytes must be at least {}",
                MIN_MESSAGE_BYTES
            ));
        }
        Ok(())
    }
}

/// `.json` files are JSON; anything else is TOML.
fn read_config_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let cfg = if is_json {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn env_number<T: FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a non-negative integer", name)),
        _ => Ok(None),
    }
}
