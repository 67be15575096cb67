/// Provider and worker configuration.
///
/// [`ProviderConfig`] is what the supervisor runs with. For each device it
/// stamps out a [`WorkerConfig`], which crosses the process boundary as
/// JSON and is validated once when the worker starts.
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::ports::WorkerPorts;

/// When the device's audio is muted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum MuteMaster {
    Always,
    Inuse,
    Never,
}

/// How the worker reaches its device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Through an adb server.
    Adb,
    /// Commands run on the host.
    Local,
}

/// Device-control policy, passed through to workers untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerPolicy {
    pub allow_remote: bool,
    pub cleanup: bool,
    pub lock_rotation: bool,
    pub screen_reset: bool,
}

impl Default for WorkerPolicy {
    fn default() -> Self {
        Self {
            allow_remote: false,
            cleanup: true,
            lock_rotation: false,
            screen_reset: true,
        }
    }
}

/// Everything a worker needs that is the same for every device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSettings {
    pub public_ip: String,
    pub connect_sub: Vec<String>,
    pub connect_push: Vec<String>,
    pub backend: BackendKind,
    pub adb_host: String,
    pub adb_port: u16,
    pub heartbeat_interval_ms: u64,
    pub boot_complete_timeout_ms: u64,
    pub group_timeout_secs: u64,
    pub screen_jpeg_quality: u8,
    pub screen_ping_interval_ms: u64,
    pub screen_ws_url_pattern: String,
    pub connect_url_pattern: String,
    pub vnc_initial_size: (u32, u32),
    pub mute_master: MuteMaster,
    pub storage_url: Option<String>,
    pub policy: WorkerPolicy,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            public_ip: "localhost".to_string(),
            connect_sub: Vec::new(),
            connect_push: Vec::new(),
            backend: BackendKind::Adb,
            adb_host: "127.0.0.1".to_string(),
            adb_port: 5037,
            heartbeat_interval_ms: 10_000,
            boot_complete_timeout_ms: 60_000,
            group_timeout_secs: 900,
            screen_jpeg_quality: 80,
            screen_ping_interval_ms: 30_000,
            screen_ws_url_pattern: "ws://${publicIp}:${publicPort}".to_string(),
            connect_url_pattern: "${publicIp}:${publicPort}".to_string(),
            vnc_initial_size: (600, 800),
            mute_master: MuteMaster::Never,
            storage_url: None,
            policy: WorkerPolicy::default(),
        }
    }
}

/// Configuration of one worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub serial: String,
    pub provider: String,
    pub ports: WorkerPorts,
    pub settings: WorkerSettings,
}

impl WorkerConfig {
    pub fn to_json(&self) -> Result<String, ProviderError> {
        serde_json::to_string(self).map_err(Into::into)
    }

    /// Parse and validate.
    pub fn from_json(json: &str) -> Result<Self, ProviderError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ProviderError> {
        let s = &self.settings;
        if self.serial.is_empty() {
            return Err(ProviderError::InvalidConfig("empty serial".into()));
        }
        if !self.ports.is_valid() {
            return Err(ProviderError::InvalidConfig(format!(
                "ports must be distinct and non-zero: {:?}",
                self.ports
            )));
        }
        if s.connect_sub.is_empty() || s.connect_push.is_empty() {
            return Err(ProviderError::InvalidConfig(
                "at least one sub and one push endpoint required".into(),
            ));
        }
        if !(1..=100).contains(&s.screen_jpeg_quality) {
            return Err(ProviderError::InvalidConfig(format!(
                "jpeg quality {} outside 1..=100",
                s.screen_jpeg_quality
            )));
        }
        if s.heartbeat_interval_ms == 0 {
            return Err(ProviderError::InvalidConfig("heartbeat interval is zero".into()));
        }
        Ok(())
    }

    /// Address remote clients use for the connect port.
    pub fn connect_url(&self) -> String {
        render_url_pattern(
            &self.settings.connect_url_pattern,
            &self.settings.public_ip,
            self.ports.connect,
        )
    }

    /// Address of the screen stream.
    pub fn screen_ws_url(&self) -> String {
        render_url_pattern(
            &self.settings.screen_ws_url_pattern,
            &self.settings.public_ip,
            self.ports.screen,
        )
    }
}

/// Substitute `${publicIp}` and `${publicPort}`.
pub fn render_url_pattern(pattern: &str, public_ip: &str, port: u16) -> String {
    pattern
        .replace("${publicIp}", public_ip)
        .replace("${publicPort}", &port.to_string())
}

/// Parse a `WIDTHxHEIGHT` size.
pub fn parse_size(s: &str) -> Result<(u32, u32), String> {
    let (w, h) = s
        .split_once('x')
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got {s:?}"))?;
    let w = w.trim().parse().map_err(|e| format!("width {w:?}: {e}"))?;
    let h = h.trim().parse().map_err(|e| format!("height {h:?}: {e}"))?;
    Ok((w, h))
}

// ── Provider ──────────────────────────────────────────────────────────

/// Supervisor configuration.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub(crate) name: String,
    pub(crate) serials: Vec<String>,
    pub(crate) min_port: u16,
    pub(crate) max_port: u16,
    pub(crate) kill_timeout: Duration,
    pub(crate) restart_delay: Duration,
    pub(crate) worker: WorkerSettings,
}

impl ProviderConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            serials: Vec::new(),
            min_port: 7700,
            max_port: 7900,
            kill_timeout: Duration::from_secs(10),
            restart_delay: Duration::from_secs(1),
            worker: WorkerSettings::default(),
        }
    }

    /// Only manage these devices. Empty means all.
    pub fn serials(mut self, serials: Vec<String>) -> Self {
        self.serials = serials;
        self
    }

    pub fn port_range(mut self, min: u16, max: u16) -> Self {
        self.min_port = min;
        self.max_port = max;
        self
    }

    pub fn kill_timeout(mut self, timeout: Duration) -> Self {
        self.kill_timeout = timeout;
        self
    }

    pub fn restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    pub fn worker(mut self, settings: WorkerSettings) -> Self {
        self.worker = settings;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Allow-list check. An empty list accepts every device.
    pub fn accepts(&self, serial: &str) -> bool {
        self.serials.is_empty() || self.serials.iter().any(|s| s == serial)
    }

    /// The configuration handed to the worker for `serial`.
    pub fn worker_config(&self, serial: &str, ports: WorkerPorts) -> WorkerConfig {
        WorkerConfig {
            serial: serial.to_string(),
            provider: self.name.clone(),
            ports,
            settings: self.worker.clone(),
        }
    }
}
