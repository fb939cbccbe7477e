use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParleyError {
    #[error("Config error: {0}")]
    Config(String),

    /// A required routing parameter (API key, voice id, ...) is missing or
    /// invalid. Never retried.
    #[error("Protocol configuration error: {0}")]
    ProtocolConfiguration(String),

    #[error("Upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ParleyError {
    /// Whether this error must tear the whole session down instead of just
    /// dropping the current turn.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ProtocolConfiguration(_) | Self::Config(_))
    }
}

/// Failure of one outbound backend connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpstreamError {
    #[error("{0} connection is not open")]
    NotReady(String),

    #[error("{0} connection is closed")]
    Closed(String),

    #[error("{upstream} connect failed: {reason}")]
    Connect { upstream: String, reason: String },

    #[error("{upstream} timed out: {what}")]
    Timeout { upstream: String, what: String },

    #[error("{upstream} rejected the request: {reason}")]
    Rejected { upstream: String, reason: String },
}

pub type Result<T> = std::result::Result<T, ParleyError>;
