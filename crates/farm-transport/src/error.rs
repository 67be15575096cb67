/// Errors returned by the bus transport layer.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("invalid endpoint address: {0}")]
    InvalidEndpoint(String),

    #[error("connection to {endpoint} failed: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no reachable {direction} endpoint among {candidates:?}")]
    NoEndpoint {
        direction: &'static str,
        candidates: Vec<String>,
    },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame serialization failed: {0}")]
    Serialization(String),

    #[error("frame deserialization failed: {0}")]
    Deserialization(String),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },
}

impl From<rmp_serde::encode::Error> for BusError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        BusError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for BusError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        BusError::Deserialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_no_endpoint() {
        let err = BusError::NoEndpoint {
            direction: "push",
            candidates: vec!["127.0.0.1:7116".into()],
        };
        assert_eq!(
            err.to_string(),
            "no reachable push endpoint among [\"127.0.0.1:7116\"]"
        );
    }

    #[test]
    fn test_display_frame_too_large() {
        let err = BusError::FrameTooLarge { size: 10, max: 4 };
        assert_eq!(err.to_string(), "frame too large: 10 bytes (max 4)");
    }
}
