use crate::types::MessageType;

/// Protocol-level errors for the device farm.
///
/// Wraps bus errors and adds codec, routing and device-backend variants.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("transport error: {0}")]
    Transport(#[from] farm_transport::BusError),

    #[error("invalid envelope: {reason}")]
    InvalidEnvelope { reason: String },

    #[error("unknown message type tag {0}")]
    UnknownType(u32),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("handler already registered for {0:?}")]
    DuplicateHandler(MessageType),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("device backend error: {0}")]
    Backend(String),

    #[error("bus closed")]
    BusClosed,
}

impl From<rmp_serde::encode::Error> for ProtocolError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        ProtocolError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ProtocolError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        ProtocolError::Deserialization(e.to_string())
    }
}
