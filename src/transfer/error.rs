use crate::transfer::types::TransferPhase;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("Invalid phase transition: {from} -> {to}")]
    InvalidTransition {
        from: TransferPhase,
        to: TransferPhase,
    },
}

pub type TransferResult<T> = Result<T, TransferError>;
