use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Upload queue is paused")]
    Paused,

    #[error("Queue entry not found: {0}")]
    EntryNotFound(String),

    #[error("Upload rejected: {0}")]
    Upload(String),

    #[error("Local artifact unusable: {0}")]
    Artifact(String),

    #[error("Store error: {0}")]
    Store(#[from] crate::store::StoreError),
}

pub type QueueResult<T> = Result<T, QueueError>;
