use crate::envelope::Message;
use crate::identity::Identity;

/// Intention produced by the pure logic of [`SessionState`](super::SessionState).
///
/// Every `handle_*` / `tick_*` method returns `Vec<SessionEffect>`; the
/// session loop executes them against the bus and the device backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEffect {
    /// Start listening on a channel.
    Subscribe(String),
    /// Stop listening on a channel.
    Unsubscribe(String),
    /// Push a message onto the bus.
    Publish { channel: String, message: Message },
    /// Read device properties; the answer goes back to `channel`.
    Probe { channel: String },
    /// Start a command; its events come back tagged with `stream_id`.
    Shell { stream_id: u64, command: Vec<String> },
    /// Hand the new identity to persistence.
    SaveIdentity(Identity),
}
