use thiserror::Error;

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("sensor already running")]
    AlreadyRunning,

    #[error("sensor not running")]
    NotRunning,

    #[error("sensing unavailable: {0}")]
    Unavailable(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("no ranging session for peer {0}")]
    UnknownPeer(String),
}

pub type Result<T> = std::result::Result<T, SensorError>;
