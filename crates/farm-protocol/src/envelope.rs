/// Envelope codec.
///
/// An envelope is a type tag plus an opaque payload. The payload of every
/// known tag decodes into exactly one [`Message`] variant; tags outside the
/// catalogue surface as [`ProtocolError::UnknownType`].
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::identity::{Identity, Requirement};
use crate::types::{DeviceStatus, MessageType};

/// Immutable wire container: `(type tag, payload bytes)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    msg_type: u32,
    #[serde(with = "serde_bytes")]
    payload: Vec<u8>,
}

impl Envelope {
    pub fn new(msg_type: MessageType, payload: Vec<u8>) -> Self {
        Self {
            msg_type: msg_type.tag(),
            payload,
        }
    }

    /// Raw tag as found on the wire.
    pub fn tag(&self) -> u32 {
        self.msg_type
    }

    pub fn message_type(&self) -> Result<MessageType, ProtocolError> {
        MessageType::from_tag(self.msg_type).ok_or(ProtocolError::UnknownType(self.msg_type))
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        rmp_serde::to_vec(self).map_err(Into::into)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        rmp_serde::from_slice(data).map_err(Into::into)
    }
}

// ── Payloads ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMessage {
    pub channel: String,
    pub timeout_ms: u64,
    pub requirements: Vec<Requirement>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeMessage {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellCommandMessage {
    /// Where output goes.
    pub channel: String,
    pub command: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDataMessage {
    pub serial: String,
    pub seq: u64,
    #[serde(with = "serde_bytes")]
    pub chunk: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDoneMessage {
    pub serial: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceFailMessage {
    pub serial: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevicePokeMessage {
    pub serial: String,
    /// The session's private channel.
    pub channel: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinGroupMessage {
    pub serial: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaveGroupMessage {
    pub serial: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentityMessage {
    pub serial: String,
    pub identity: Identity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevicePresentMessage {
    pub serial: String,
    pub provider: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAbsentMessage {
    pub serial: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatusMessage {
    pub serial: String,
    pub status: DeviceStatus,
}

// ── Messages ──────────────────────────────────────────────────────────

/// Every message the farm speaks, one variant per [`MessageType`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Group(GroupMessage),
    Probe(ProbeMessage),
    ShellCommand(ShellCommandMessage),
    DeviceData(DeviceDataMessage),
    DeviceDone(DeviceDoneMessage),
    DeviceFail(DeviceFailMessage),
    DevicePoke(DevicePokeMessage),
    JoinGroup(JoinGroupMessage),
    LeaveGroup(LeaveGroupMessage),
    DeviceIdentity(DeviceIdentityMessage),
    DevicePresent(DevicePresentMessage),
    DeviceAbsent(DeviceAbsentMessage),
    DeviceStatus(DeviceStatusMessage),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Group(_) => MessageType::Group,
            Message::Probe(_) => MessageType::Probe,
            Message::ShellCommand(_) => MessageType::ShellCommand,
            Message::DeviceData(_) => MessageType::DeviceData,
            Message::DeviceDone(_) => MessageType::DeviceDone,
            Message::DeviceFail(_) => MessageType::DeviceFail,
            Message::DevicePoke(_) => MessageType::DevicePoke,
            Message::JoinGroup(_) => MessageType::JoinGroup,
            Message::LeaveGroup(_) => MessageType::LeaveGroup,
            Message::DeviceIdentity(_) => MessageType::DeviceIdentity,
            Message::DevicePresent(_) => MessageType::DevicePresent,
            Message::DeviceAbsent(_) => MessageType::DeviceAbsent,
            Message::DeviceStatus(_) => MessageType::DeviceStatus,
        }
    }

    pub fn to_envelope(&self) -> Result<Envelope, ProtocolError> {
        let payload = match self {
            Message::Group(m) => rmp_serde::to_vec(m)?,
            Message::Probe(m) => rmp_serde::to_vec(m)?,
            Message::ShellCommand(m) => rmp_serde::to_vec(m)?,
            Message::DeviceData(m) => rmp_serde::to_vec(m)?,
            Message::DeviceDone(m) => rmp_serde::to_vec(m)?,
            Message::DeviceFail(m) => rmp_serde::to_vec(m)?,
            Message::DevicePoke(m) => rmp_serde::to_vec(m)?,
            Message::JoinGroup(m) => rmp_serde::to_vec(m)?,
            Message::LeaveGroup(m) => rmp_serde::to_vec(m)?,
            Message::DeviceIdentity(m) => rmp_serde::to_vec(m)?,
            Message::DevicePresent(m) => rmp_serde::to_vec(m)?,
            Message::DeviceAbsent(m) => rmp_serde::to_vec(m)?,
            Message::DeviceStatus(m) => rmp_serde::to_vec(m)?,
        };
        Ok(Envelope::new(self.message_type(), payload))
    }

    pub fn from_envelope(envelope: &Envelope) -> Result<Self, ProtocolError> {
        let msg_type = envelope.message_type()?;
        let payload = envelope.payload();
        Ok(match msg_type {
            MessageType::Group => Message::Group(payload_of(msg_type, payload)?),
            MessageType::Probe => Message::Probe(payload_of(msg_type, payload)?),
            MessageType::ShellCommand => Message::ShellCommand(payload_of(msg_type, payload)?),
            MessageType::DeviceData => Message::DeviceData(payload_of(msg_type, payload)?),
            MessageType::DeviceDone => Message::DeviceDone(payload_of(msg_type, payload)?),
            MessageType::DeviceFail => Message::DeviceFail(payload_of(msg_type, payload)?),
            MessageType::DevicePoke => Message::DevicePoke(payload_of(msg_type, payload)?),
            MessageType::JoinGroup => Message::JoinGroup(payload_of(msg_type, payload)?),
            MessageType::LeaveGroup => Message::LeaveGroup(payload_of(msg_type, payload)?),
            MessageType::DeviceIdentity => Message::DeviceIdentity(payload_of(msg_type, payload)?),
            MessageType::DevicePresent => Message::DevicePresent(payload_of(msg_type, payload)?),
            MessageType::DeviceAbsent => Message::DeviceAbsent(payload_of(msg_type, payload)?),
            MessageType::DeviceStatus => Message::DeviceStatus(payload_of(msg_type, payload)?),
        })
    }
}

fn payload_of<T: DeserializeOwned>(msg_type: MessageType, payload: &[u8]) -> Result<T, ProtocolError> {
    rmp_serde::from_slice(payload).map_err(|e| ProtocolError::InvalidEnvelope {
        reason: format!("{msg_type:?} payload: {e}"),
    })
}

/// Encode a message into wire bytes.
pub fn encode(message: &Message) -> Result<Vec<u8>, ProtocolError> {
    message.to_envelope()?.to_bytes()
}

/// Decode wire bytes into a message.
pub fn decode(data: &[u8]) -> Result<Message, ProtocolError> {
    Message::from_envelope(&Envelope::from_bytes(data)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::RequirementKind;

    fn group() -> Message {
        Message::Group(GroupMessage {
            channel: "g1".into(),
            timeout_ms: 5_000,
            requirements: vec![Requirement {
                name: "platform".into(),
                value: "Android".into(),
                kind: RequirementKind::Exact,
            }],
        })
    }

    #[test]
    fn group_roundtrip() {
        let bytes = encode(&group()).unwrap();
        assert_eq!(decode(&bytes).unwrap(), group());
    }

    #[test]
    fn shell_output_keeps_binary_chunks() {
        let msg = Message::DeviceData(DeviceDataMessage {
            serial: "emulator-5554".into(),
            seq: 7,
            chunk: vec![0, 0xff, b'\n', 0x80],
        });
        let decoded = decode(&encode(&msg).unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn envelope_carries_the_tag() {
        let envelope = group().to_envelope().unwrap();
        assert_eq!(envelope.tag(), 1);
        assert_eq!(envelope.message_type().unwrap(), MessageType::Group);
    }

    #[test]
    fn unknown_tag_is_reported() {
        let envelope = Envelope {
            msg_type: 42,
            payload: vec![],
        };
        let bytes = envelope.to_bytes().unwrap();
        let err = decode(&bytes).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownType(42)));
    }

    #[test]
    fn payload_for_wrong_type_is_invalid() {
        let done = rmp_serde::to_vec(&DeviceDoneMessage {
            serial: "x".into(),
        })
        .unwrap();
        let envelope = Envelope::new(MessageType::Group, done);
        let err = Message::from_envelope(&envelope).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidEnvelope { .. }));
    }

    #[test]
    fn garbage_is_deserialization_error() {
        let err = decode(&[0xc1, 0x00, 0x01]).unwrap_err();
        assert!(matches!(err, ProtocolError::Deserialization(_)));
    }

    #[test]
    fn every_type_maps_back() {
        let messages = vec![
            group(),
            Message::Probe(ProbeMessage {}),
            Message::DevicePoke(DevicePokeMessage {
                serial: "s".into(),
                channel: "c".into(),
            }),
            Message::DeviceStatus(DeviceStatusMessage {
                serial: "s".into(),
                status: DeviceStatus::Online,
            }),
        ];
        for msg in messages {
            let envelope = msg.to_envelope().unwrap();
            assert_eq!(envelope.message_type().unwrap(), msg.message_type());
            assert_eq!(Message::from_envelope(&envelope).unwrap(), msg);
        }
    }
}
