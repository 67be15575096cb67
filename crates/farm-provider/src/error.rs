/// Provider errors.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// No free port block. Not fatal: the device waits for one.
    #[error("port pool exhausted: need {needed} ports, {available} free")]
    PoolExhausted { needed: usize, available: usize },

    #[error("invalid port range {min}..={max}")]
    InvalidPortRange { min: u16, max: u16 },

    #[error("invalid worker configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to launch worker for {serial}: {source}")]
    Launch {
        serial: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to signal worker {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("discovery command failed: {0}")]
    Discovery(String),

    #[error("supervisor is gone")]
    SupervisorGone,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
