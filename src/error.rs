use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Every operation resolves with a value or exactly one of these.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("operation timed out")]
    Timeout,
    #[error("link to peripheral lost")]
    LinkLost,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("transport rejected operation: {0}")]
    TransportRejected(String),
    #[error("service discovery failed: {0}")]
    DiscoveryFailed(String),
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::LinkLost
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for Error {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        Error::LinkLost
    }
}
