use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transport unavailable: {0}")]
    Unavailable(String),

    #[error("Link lost")]
    Disconnected,

    #[error("Timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Request rejected by device: {0}")]
    Rejected(String),

    #[error("Remote file not found: {0}")]
    FileNotFound(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl TransportError {
    pub fn is_link_loss(&self) -> bool {
        matches!(self, TransportError::Disconnected)
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        TransportError::Protocol(err.to_string())
    }
}

pub type TransportResult<T> = Result<T, TransportError>;
