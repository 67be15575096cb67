/// Device discovery.
///
/// The supervisor consumes a feed of appeared/disappeared events and does
/// not care where they come from. [`CommandDiscovery`] is the stock
/// source: it polls a listing command (`adb devices` by default) and diffs
/// consecutive listings.
use std::collections::{BTreeMap, HashMap};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::ProviderError;

/// State string that marks a usable device in a listing.
const READY_STATE: &str = "device";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    Appeared {
        serial: String,
        attrs: HashMap<String, String>,
    },
    Disappeared {
        serial: String,
    },
}

impl DiscoveryEvent {
    pub fn serial(&self) -> &str {
        match self {
            DiscoveryEvent::Appeared { serial, .. } | DiscoveryEvent::Disappeared { serial } => {
                serial
            }
        }
    }
}

/// Feed the supervisor reads.
pub type DiscoveryFeed = mpsc::Receiver<DiscoveryEvent>;

/// Parse `adb devices` style output into `serial -> state`. The header
/// line and anything without a tab-separated state are skipped.
pub fn parse_device_listing(output: &str) -> BTreeMap<String, String> {
    output
        .lines()
        .filter_map(|line| {
            let (serial, state) = line.split_once('\t')?;
            let serial = serial.trim();
            let state = state.trim();
            if serial.is_empty() || state.is_empty() {
                return None;
            }
            Some((serial.to_string(), state.to_string()))
        })
        .collect()
}

/// Turns successive listings into events.
#[derive(Debug, Default)]
pub struct DeviceTracker {
    present: BTreeMap<String, String>,
}

impl DeviceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Diff `listing` against the previous one. Only devices in the ready
    /// state count as present.
    pub fn update(&mut self, listing: BTreeMap<String, String>) -> Vec<DiscoveryEvent> {
        let ready: BTreeMap<String, String> = listing
            .into_iter()
            .filter(|(_, state)| state == READY_STATE)
            .collect();

        let mut events = Vec::new();
        for serial in self.present.keys() {
            if !ready.contains_key(serial) {
                events.push(DiscoveryEvent::Disappeared {
                    serial: serial.clone(),
                });
            }
        }
        for (serial, state) in &ready {
            if !self.present.contains_key(serial) {
                events.push(DiscoveryEvent::Appeared {
                    serial: serial.clone(),
                    attrs: HashMap::from([("state".to_string(), state.clone())]),
                });
            }
        }
        self.present = ready;
        events
    }

    pub fn present(&self) -> impl Iterator<Item = &str> {
        self.present.keys().map(String::as_str)
    }
}

/// Polls a listing command on a fixed interval.
#[derive(Debug, Clone)]
pub struct CommandDiscovery {
    command: Vec<String>,
    interval: Duration,
}

impl Default for CommandDiscovery {
    fn default() -> Self {
        Self {
            command: vec!["adb".into(), "devices".into()],
            interval: Duration::from_secs(5),
        }
    }
}

impl CommandDiscovery {
    /// Poll `command` every `interval`. Both must be non-empty.
    pub fn new(command: Vec<String>, interval: Duration) -> Result<Self, ProviderError> {
        if command.is_empty() {
            return Err(ProviderError::InvalidConfig("empty discovery command".into()));
        }
        if interval.is_zero() {
            return Err(ProviderError::InvalidConfig("discovery interval is zero".into()));
        }
        Ok(Self { command, interval })
    }

    /// Start polling. The task ends when the feed is dropped.
    pub fn spawn(self) -> (DiscoveryFeed, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(64);
        let handle = tokio::spawn(self.run(tx));
        (rx, handle)
    }

    async fn run(self, tx: mpsc::Sender<DiscoveryEvent>) {
        let mut tracker = DeviceTracker::new();
        let mut poll = tokio::time::interval(self.interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = poll.tick() => {}
                _ = tx.closed() => return,
            }
            let listing = match self.list().await {
                Ok(l) => l,
                Err(e) => {
                    // Keep the previous view; a failed poll is not a detach.
                    tracing::warn!("{e}");
                    continue;
                }
            };
            for event in tracker.update(listing) {
                tracing::debug!(?event, "discovery");
                if tx.send(event).await.is_err() {
                    return;
                }
            }
        }
    }

    async fn list(&self) -> Result<BTreeMap<String, String>, ProviderError> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| ProviderError::Discovery("empty discovery command".into()))?;
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| ProviderError::Discovery(format!("{program}: {e}")))?;
        if !output.status.success() {
            return Err(ProviderError::Discovery(format!(
                "{program} exited with {}",
                output.status
            )));
        }
        Ok(parse_device_listing(&String::from_utf8_lossy(&output.stdout)))
    }
}
