/// Device session, one per attached device.
///
/// The session listens on the global channel and its private channel,
/// joins group channels on request, answers probes, streams command output
/// and pokes the global channel so controllers know it is alive.
mod effect;
mod executor;
mod r#loop;
mod state;
mod transport;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::Instrument;

use crate::backend::DeviceBackend;
use crate::error::ProtocolError;
use crate::store::DeviceStore;
use crate::types::{make_private_channel, DEFAULT_GLOBAL_CHANNEL};

pub use effect::SessionEffect;
pub use state::{SessionInput, SessionState};
pub use transport::Bus;

// ── Configuration ─────────────────────────────────────────────────────

/// Configuration for a device session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub(crate) serial: String,
    pub(crate) global_channel: String,
    pub(crate) solo_channel: String,
    pub(crate) heartbeat_interval: Duration,
    pub(crate) sweep_interval: Duration,
}

impl SessionConfig {
    /// Defaults: global channel `ALL`, a fresh private channel, a poke every
    /// 10 s, a channel sweep every second.
    pub fn new(serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            global_channel: DEFAULT_GLOBAL_CHANNEL.to_string(),
            solo_channel: make_private_channel(),
            heartbeat_interval: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(1),
        }
    }

    pub fn global_channel(mut self, channel: impl Into<String>) -> Self {
        self.global_channel = channel.into();
        self
    }

    pub fn solo_channel(mut self, channel: impl Into<String>) -> Self {
        self.solo_channel = channel.into();
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Both timer intervals must be non-zero.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.heartbeat_interval.is_zero() {
            return Err(ProtocolError::InvalidConfig("heartbeat interval is zero".into()));
        }
        if self.sweep_interval.is_zero() {
            return Err(ProtocolError::InvalidConfig("sweep interval is zero".into()));
        }
        Ok(())
    }
}

// ── Session ───────────────────────────────────────────────────────────

pub struct DeviceSession {
    config: SessionConfig,
    backend: Arc<dyn DeviceBackend>,
    store: Option<Arc<dyn DeviceStore>>,
}

impl DeviceSession {
    pub fn new(config: SessionConfig, backend: Arc<dyn DeviceBackend>) -> Self {
        Self {
            config,
            backend,
            store: None,
        }
    }

    /// Record identities in `store` after each successful probe.
    pub fn with_store(mut self, store: Arc<dyn DeviceStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Run until `shutdown` resolves (`Ok`) or the bus goes away (`Err`).
    pub async fn run<B, F>(self, bus: B, shutdown: F) -> Result<(), ProtocolError>
    where
        B: Bus,
        F: Future<Output = ()>,
    {
        self.config.validate()?;
        let span = tracing::info_span!("session", serial = %self.config.serial);
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let ctx = executor::ExecContext {
            serial: self.config.serial.clone(),
            backend: self.backend,
            store: self.store,
            input_tx,
        };
        r#loop::session_loop(bus, self.config, ctx, input_rx, shutdown)
            .instrument(span)
            .await
    }
}
