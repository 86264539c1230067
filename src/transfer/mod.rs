//! Transfer orchestration
//!
//! A job walks `idle → initializing → connecting → probing → downloading →
//! storing → uploading → cleanup → completed`, re-entering `initializing`
//! after a backoff delay when a connect, download or upload fails.

pub mod error;
pub mod orchestrator;
pub mod state_machine;
pub mod types;

pub use error::{TransferError, TransferResult};
pub use orchestrator::TransferOrchestrator;
pub use state_machine::JobStateMachine;
pub use types::{ProgressCallback, TransferJob, TransferPhase, TransferProgress, TransferRequest};
