use thiserror::Error;

#[derive(Debug, Error)]
pub enum TopologyError {
    /// DNS, connect, timeout or I/O failures talking to a peer.
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Signature missing/invalid, or peer not whitelisted.
    #[error("message not trusted: {0}")]
    Untrusted(String),

    #[error("incompatible protocol version {found} (expected {expected})")]
    IncompatibleVersion { expected: u32, found: u32 },

    #[error("owner id mismatch: selector {selector} vs payload {payload}")]
    OwnerMismatch { selector: String, payload: String },

    #[error("payload exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration: {0}")]
    Config(String),

    #[error("local cluster view is not yet defined")]
    UndefinedClusterView,

    #[error("invalid connector endpoint {0}")]
    InvalidEndpoint(String),

    #[error("crypto: {0}")]
    Crypto(String),
}

impl TopologyError {
    /// HTTP status the receiver answers with for this failure.
    ///
    /// Untrusted requests get 404 so that an unauthorized caller cannot
    /// tell whether the connector endpoint exists.
    pub fn status_code(&self) -> u16 {
        match self {
            TopologyError::Untrusted(_) => 404,
            TopologyError::Protocol(_)
            | TopologyError::IncompatibleVersion { .. }
            | TopologyError::OwnerMismatch { .. }
            | TopologyError::PayloadTooLarge { .. }
            | TopologyError::Json(_) => 400,
            TopologyError::UndefinedClusterView => 503,
            _ => 500,
        }
    }
}
