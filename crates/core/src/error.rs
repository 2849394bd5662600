use thiserror::Error;

/// Substrings that mark a browser failure as a lost session rather than a
/// page-level problem. Compared case-insensitively.
const SESSION_LOSS_MARKERS: &[&str] = &[
    "websocket",
    "channel closed",
    "connection refused",
    "connection reset",
    "broken pipe",
    "target crashed",
    "target closed",
    "session closed",
    "no such session",
    "failed to send cdp command",
];

#[derive(Error, Debug)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Sync error: {0}")]
    Sync(String),

    #[error("UI element not found: {0}")]
    UiElementNotFound(String),

    #[error("Session lost: {0}")]
    SessionLost(String),

    #[error("Browser error: {0}")]
    Browser(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether this failure means the underlying session/connection is gone and
    /// must be replaced before another task can run.
    pub fn is_session_lost(&self) -> bool {
        match self {
            Error::SessionLost(_) => true,
            Error::Browser(msg) | Error::Other(msg) => {
                let lower = msg.to_lowercase();
                SESSION_LOSS_MARKERS.iter().any(|m| lower.contains(m))
            }
            _ => false,
        }
    }

    /// Whether the failure is an absent or late UI control (the protocol may
    /// recover from these by reloading the view).
    pub fn is_missing_element(&self) -> bool {
        matches!(self, Error::UiElementNotFound(_) | Error::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
