/// Core protocol types: message type tags, device status, channel names.
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

/// Channel every device session listens on.
pub const DEFAULT_GLOBAL_CHANNEL: &str = "ALL";

/// Wire tag of every message carried in an [`Envelope`](crate::Envelope).
///
/// Tags are stable numbers; an unknown tag is reported, never guessed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum MessageType {
    /// Controller → device: join a group channel if requirements match.
    Group = 1,
    /// Controller → device: report device properties.
    Probe = 2,
    /// Controller → device: run a command, stream output back.
    ShellCommand = 3,
    /// Device → controller: one chunk of command output.
    DeviceData = 4,
    /// Device → controller: command finished.
    DeviceDone = 5,
    /// Device → controller: command failed.
    DeviceFail = 6,
    /// Device → controller: liveness ping carrying the private channel.
    DevicePoke = 7,
    /// Device → controller: device joined a group channel.
    JoinGroup = 8,
    /// Device → controller: device left a group channel.
    LeaveGroup = 9,
    /// Device → controller: identity after a probe.
    DeviceIdentity = 10,
    /// Provider → persistence: device attached.
    DevicePresent = 11,
    /// Provider → persistence: device detached.
    DeviceAbsent = 12,
    /// Provider → persistence: device status change.
    DeviceStatus = 13,
}

impl MessageType {
    pub const ALL: [MessageType; 13] = [
        MessageType::Group,
        MessageType::Probe,
        MessageType::ShellCommand,
        MessageType::DeviceData,
        MessageType::DeviceDone,
        MessageType::DeviceFail,
        MessageType::DevicePoke,
        MessageType::JoinGroup,
        MessageType::LeaveGroup,
        MessageType::DeviceIdentity,
        MessageType::DevicePresent,
        MessageType::DeviceAbsent,
        MessageType::DeviceStatus,
    ];

    pub fn tag(self) -> u32 {
        self as u32
    }

    pub fn from_tag(tag: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.tag() == tag)
    }
}

/// Device status as recorded by persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceStatus {
    Offline,
    Connecting,
    Online,
    Unauthorized,
}

/// A fresh private channel name: a random UUID, URL-safe base64.
pub fn make_private_channel() -> String {
    URL_SAFE_NO_PAD.encode(uuid::Uuid::new_v4().as_bytes())
}
