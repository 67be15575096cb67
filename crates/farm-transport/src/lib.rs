//! Device farm bus transport.
//!
//! Participants attach to the bus with a [`BusEndpoint`]: one subscriber
//! connection per configured publisher endpoint and one push connection per
//! configured pull endpoint. Messages are `(channel, bytes)` pairs.
//! Delivery is best-effort and at-most-once per hop; reliability is built
//! above this layer with keepalives and heartbeats.
//!
//! The dashboard side runs a [`BusHub`] that forwards pushed messages to
//! matching subscribers.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use farm_transport::{BusConfig, BusEndpoint, BusHub};
//!
//! # async fn example() -> Result<(), farm_transport::BusError> {
//! let hub = BusHub::bind("127.0.0.1:0", "127.0.0.1:0").await?;
//!
//! let config = BusConfig::new()
//!     .sub_endpoint(format!("tcp://{}", hub.pub_addr()))
//!     .push_endpoint(format!("tcp://{}", hub.pull_addr()));
//! let mut bus = BusEndpoint::connect(config).await?;
//!
//! bus.subscribe("ALL");
//! bus.publish("ALL", b"hello".to_vec());
//! let (channel, data) = bus.recv().await.expect("bus closed");
//! # Ok(())
//! # }
//! ```

mod config;
mod endpoint;
mod error;
mod frame;
mod hub;

pub use config::BusConfig;
pub use endpoint::{parse_endpoint, BusEndpoint, Publisher};
pub use error::BusError;
pub use frame::Frame;
pub use hub::BusHub;

/// Default maximum frame size (1 MB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;
