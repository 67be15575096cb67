//! Device farm provider.
//!
//! Watches a discovery feed, reserves a port block per accepted device and
//! runs one worker process per device, stopping and reaping workers when
//! their device goes away. Workers run a `farm_protocol` device session.

pub mod config;
pub mod discovery;
pub mod error;
pub mod launcher;
pub mod ports;
pub mod signals;
pub mod supervisor;

pub use config::{
    BackendKind, MuteMaster, ProviderConfig, WorkerConfig, WorkerPolicy, WorkerSettings,
};
pub use discovery::{CommandDiscovery, DeviceTracker, DiscoveryEvent, DiscoveryFeed};
pub use error::ProviderError;
pub use launcher::{ChildWorker, ProcessLauncher, Worker, WorkerExit, WorkerLauncher};
pub use ports::{PortPool, WorkerPorts, PORTS_PER_WORKER};
pub use signals::wait_for_shutdown_signal;
pub use supervisor::{SlotInfo, SlotState, Supervisor, SupervisorHandle};
