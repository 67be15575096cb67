//! Provider supervisor.
//!
//! One task owns the port pool and the slot table. It reacts to discovery
//! events, worker exits and handle commands; nothing else mutates either.
//!
//! Per device: `discovered → filtered out`, or
//! `discovered → launching → running → stopping → reaped`.
//! A reaped slot is removed from the table and its ports go back to the
//! pool.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use farm_protocol::{DeviceStatus, DeviceStore};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::ProviderConfig;
use crate::discovery::{DiscoveryEvent, DiscoveryFeed};
use crate::error::ProviderError;
use crate::launcher::{Worker, WorkerExit, WorkerLauncher};
use crate::ports::{PortPool, WorkerPorts};

// ── Slots ─────────────────────────────────────────────────────────────

/// Lifecycle state of a worker slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Ports reserved, process being started.
    Launching,
    /// Process running.
    Running {
        pid: Option<u32>,
        started_at: Instant,
    },
    /// Stop requested, waiting for the process to exit.
    Stopping { requested_at: Instant },
}

/// Snapshot of one slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    pub serial: String,
    pub ports: WorkerPorts,
    pub state: SlotState,
}

struct Slot {
    ports: WorkerPorts,
    state: SlotState,
    generation: u64,
    stop_tx: Option<oneshot::Sender<()>>,
}

// ── Handle ────────────────────────────────────────────────────────────

enum SupervisorCommand {
    Release(String),
    Slots(oneshot::Sender<Vec<SlotInfo>>),
    Shutdown(oneshot::Sender<()>),
}

/// Control handle for a running supervisor. Cheap to clone.
#[derive(Clone)]
pub struct SupervisorHandle {
    cmd_tx: mpsc::Sender<SupervisorCommand>,
}

impl SupervisorHandle {
    /// Stop the worker for `serial` and forget the device until discovery
    /// reports it again.
    pub async fn release(&self, serial: &str) -> Result<(), ProviderError> {
        self.cmd_tx
            .send(SupervisorCommand::Release(serial.to_string()))
            .await
            .map_err(|_| ProviderError::SupervisorGone)
    }

    /// Current slots, sorted by serial.
    pub async fn slots(&self) -> Result<Vec<SlotInfo>, ProviderError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(SupervisorCommand::Slots(reply_tx))
            .await
            .map_err(|_| ProviderError::SupervisorGone)?;
        reply_rx.await.map_err(|_| ProviderError::SupervisorGone)
    }

    /// Stop every worker (honouring the kill timeout) and end the
    /// supervisor. Returns once all workers are reaped.
    pub async fn shutdown(&self) -> Result<(), ProviderError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.cmd_tx
            .send(SupervisorCommand::Shutdown(done_tx))
            .await
            .map_err(|_| ProviderError::SupervisorGone)?;
        done_rx.await.map_err(|_| ProviderError::SupervisorGone)
    }
}

// ── Supervisor ────────────────────────────────────────────────────────

/// Messages from worker watchers and retry timers back to the loop.
enum Internal {
    Exited {
        serial: String,
        generation: u64,
        exit: Result<WorkerExit, ProviderError>,
        requested: bool,
        forced: bool,
    },
    Retry(String),
}

pub struct Supervisor {
    config: ProviderConfig,
    launcher: Arc<dyn WorkerLauncher>,
    store: Arc<dyn DeviceStore>,
    pool: PortPool,
    slots: HashMap<String, Slot>,
    /// Accepted devices the discovery feed currently reports.
    present: HashSet<String>,
    /// Devices waiting for a port block or for their old worker to go.
    waiting: VecDeque<String>,
    next_generation: u64,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
}

impl Supervisor {
    pub fn new(
        config: ProviderConfig,
        launcher: Arc<dyn WorkerLauncher>,
        store: Arc<dyn DeviceStore>,
    ) -> Result<Self, ProviderError> {
        let pool = PortPool::new(config.min_port, config.max_port)?;
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        Ok(Self {
            config,
            launcher,
            store,
            pool,
            slots: HashMap::new(),
            present: HashSet::new(),
            waiting: VecDeque::new(),
            next_generation: 0,
            internal_tx,
            internal_rx,
        })
    }

    /// Run on a new task.
    pub fn spawn(self, feed: DiscoveryFeed) -> (SupervisorHandle, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let span = tracing::info_span!("provider", name = %self.config.name);
        let task = tokio::spawn(tracing::Instrument::instrument(self.run(feed, cmd_rx), span));
        (SupervisorHandle { cmd_tx }, task)
    }

    async fn run(mut self, mut feed: DiscoveryFeed, mut cmd_rx: mpsc::Receiver<SupervisorCommand>) {
        let (min, max) = self.pool.range();
        tracing::info!("supervising devices with ports {min}..={max}");

        let mut feed_open = true;
        let mut cmd_open = true;
        let mut shutdown_waiters: Vec<oneshot::Sender<()>> = Vec::new();
        let mut shutting_down = false;

        loop {
            tokio::select! {
                event = feed.recv(), if feed_open && !shutting_down => match event {
                    Some(event) => self.handle_discovery(event),
                    None => {
                        tracing::warn!("discovery feed closed");
                        feed_open = false;
                    }
                },

                Some(internal) = self.internal_rx.recv() => match internal {
                    Internal::Exited { serial, generation, exit, requested, forced } => {
                        self.handle_exit(&serial, generation, exit, requested, forced);
                    }
                    Internal::Retry(serial) => {
                        if !shutting_down {
                            self.try_start(&serial);
                        }
                    }
                },

                cmd = cmd_rx.recv(), if cmd_open => match cmd {
                    Some(SupervisorCommand::Release(serial)) => self.release(&serial),
                    Some(SupervisorCommand::Slots(reply)) => {
                        let _ = reply.send(self.snapshot());
                    }
                    Some(SupervisorCommand::Shutdown(done)) => {
                        shutdown_waiters.push(done);
                        if !shutting_down {
                            shutting_down = true;
                            self.stop_all();
                        }
                    }
                    None => {
                        // Every handle dropped: same as a shutdown nobody waits on.
                        cmd_open = false;
                        if !shutting_down {
                            shutting_down = true;
                            self.stop_all();
                        }
                    }
                },
            }

            if shutting_down && self.slots.is_empty() {
                tracing::info!("all workers reaped");
                for done in shutdown_waiters.drain(..) {
                    let _ = done.send(());
                }
                return;
            }
        }
    }

    // ── Discovery ──────────────────────────────────────────────────────

    fn handle_discovery(&mut self, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::Appeared { serial, .. } => {
                if !self.config.accepts(&serial) {
                    tracing::info!(serial = %serial, "filtered out");
                    return;
                }
                tracing::info!(serial = %serial, "device appeared");
                self.store.set_present(&serial, &self.config.name);
                self.present.insert(serial.clone());
                self.try_start(&serial);
            }
            DiscoveryEvent::Disappeared { serial } => {
                if !self.present.remove(&serial) {
                    return;
                }
                tracing::info!(serial = %serial, "device disappeared");
                self.waiting.retain(|s| s != &serial);
                self.store.set_absent(&serial);
                self.stop(&serial);
            }
        }
    }

    fn release(&mut self, serial: &str) {
        tracing::info!(serial, "release requested");
        self.present.remove(serial);
        self.waiting.retain(|s| s != serial);
        self.stop(serial);
    }

    // ── Launching ──────────────────────────────────────────────────────

    /// Start a worker for `serial` if it is present and has none. Queues
    /// the device when no port block is free or its old worker is still
    /// on its way out.
    fn try_start(&mut self, serial: &str) {
        if !self.present.contains(serial) {
            return;
        }
        if let Some(slot) = self.slots.get(serial) {
            if matches!(slot.state, SlotState::Stopping { .. }) {
                self.enqueue(serial);
            } else {
                tracing::debug!(serial, "worker already running");
            }
            return;
        }

        let ports = match self.pool.reserve() {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(serial, "{e}; device queued");
                self.enqueue(serial);
                return;
            }
        };

        let generation = self.next_generation;
        self.next_generation += 1;
        self.slots.insert(
            serial.to_string(),
            Slot {
                ports,
                state: SlotState::Launching,
                generation,
                stop_tx: None,
            },
        );
        self.store.set_status(serial, DeviceStatus::Connecting);

        let worker_config = self.config.worker_config(serial, ports);
        match self.launcher.launch(&worker_config) {
            Ok(worker) => {
                let pid = worker.pid();
                let (stop_tx, stop_rx) = oneshot::channel();
                tokio::spawn(watch_worker(
                    serial.to_string(),
                    generation,
                    worker,
                    stop_rx,
                    self.config.kill_timeout,
                    self.internal_tx.clone(),
                ));
                if let Some(slot) = self.slots.get_mut(serial) {
                    slot.state = SlotState::Running {
                        pid,
                        started_at: Instant::now(),
                    };
                    slot.stop_tx = Some(stop_tx);
                }
                self.store.set_status(serial, DeviceStatus::Online);
                tracing::info!(serial, ?pid, ports = ?ports.to_array(), "worker running");
            }
            Err(e) => {
                tracing::error!(serial, "{e}");
                self.reap(serial);
                self.schedule_retry(serial);
            }
        }
    }

    fn enqueue(&mut self, serial: &str) {
        if !self.waiting.iter().any(|s| s == serial) {
            self.waiting.push_back(serial.to_string());
        }
    }

    /// Give every waiting device another chance, in arrival order.
    fn drain_waiting(&mut self) {
        let queued: Vec<String> = self.waiting.drain(..).collect();
        for serial in queued {
            self.try_start(&serial);
        }
    }

    fn schedule_retry(&self, serial: &str) {
        let tx = self.internal_tx.clone();
        let serial = serial.to_string();
        let delay = self.config.restart_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Internal::Retry(serial));
        });
    }

    // ── Stopping ───────────────────────────────────────────────────────

    fn stop(&mut self, serial: &str) {
        let Some(slot) = self.slots.get_mut(serial) else {
            return;
        };
        if let Some(stop_tx) = slot.stop_tx.take() {
            tracing::info!(serial, "stopping worker");
            let _ = stop_tx.send(());
            slot.state = SlotState::Stopping {
                requested_at: Instant::now(),
            };
        }
    }

    fn stop_all(&mut self) {
        tracing::info!("stopping {} workers", self.slots.len());
        self.present.clear();
        self.waiting.clear();
        let serials: Vec<String> = self.slots.keys().cloned().collect();
        for serial in serials {
            self.stop(&serial);
        }
    }

    fn handle_exit(
        &mut self,
        serial: &str,
        generation: u64,
        exit: Result<WorkerExit, ProviderError>,
        requested: bool,
        forced: bool,
    ) {
        match self.slots.get(serial) {
            Some(slot) if slot.generation == generation => {}
            _ => {
                tracing::debug!(serial, generation, "exit of a stale worker");
                return;
            }
        }

        match (&exit, requested) {
            (_, true) if forced => {
                tracing::warn!(serial, "worker killed after {:?}", self.config.kill_timeout)
            }
            (Ok(status), true) => tracing::info!(serial, "worker stopped ({status})"),
            (Ok(status), false) => tracing::warn!(serial, "worker exited unexpectedly ({status})"),
            (Err(e), _) => tracing::warn!(serial, "worker wait failed: {e}"),
        }

        self.reap(serial);

        if !requested && self.present.contains(serial) {
            self.schedule_retry(serial);
        }
        self.drain_waiting();
    }

    /// Remove the slot and return its ports.
    fn reap(&mut self, serial: &str) {
        if let Some(slot) = self.slots.remove(serial) {
            self.pool.release(&slot.ports);
            self.store.set_status(serial, DeviceStatus::Offline);
        }
    }

    fn snapshot(&self) -> Vec<SlotInfo> {
        let mut slots: Vec<SlotInfo> = self
            .slots
            .iter()
            .map(|(serial, slot)| SlotInfo {
                serial: serial.clone(),
                ports: slot.ports,
                state: slot.state,
            })
            .collect();
        slots.sort_by(|a, b| a.serial.cmp(&b.serial));
        slots
    }
}

/// Waits for the worker to exit, or for a stop request. A stop sends
/// SIGTERM and escalates to SIGKILL after `kill_timeout`.
async fn watch_worker(
    serial: String,
    generation: u64,
    mut worker: Box<dyn Worker>,
    stop_rx: oneshot::Receiver<()>,
    kill_timeout: Duration,
    tx: mpsc::UnboundedSender<Internal>,
) {
    let (exit, requested, forced) = tokio::select! {
        exit = worker.wait() => (exit, false, false),
        _ = stop_rx => {
            if let Err(e) = worker.terminate() {
                tracing::warn!(serial = %serial, "{e}");
            }
            match tokio::time::timeout(kill_timeout, worker.wait()).await {
                Ok(exit) => (exit, true, false),
                Err(_) => {
                    if let Err(e) = worker.kill() {
                        tracing::warn!(serial = %serial, "{e}");
                    }
                    (worker.wait().await, true, true)
                }
            }
        }
    };
    let _ = tx.send(Internal::Exited {
        serial,
        generation,
        exit,
        requested,
        forced,
    });
}
