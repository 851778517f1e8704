use thiserror::Error;

/// Error kinds surfaced at component boundaries.
///
/// Per-connection failures are logged at info by the connection task and the
/// connection is closed; `BadConfig` and `BadRulesStore` are fatal at startup.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    BadConfig(String),

    #[error("bad address: {0}")]
    BadAddress(String),

    #[error("rules store error: {0}")]
    BadRulesStore(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("authentication failed: {0}")]
    AuthFailure(String),

    #[error("replay detected due to repeated salt")]
    Replay,

    #[error("timestamp outside the 30s window: {0}")]
    ClockSkew(String),

    #[error("upstream failure: {0}")]
    UpstreamFailure(String),

    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        std::io::Error::other(e.to_string())
    }
}
