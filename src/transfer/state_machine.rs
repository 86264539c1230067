use crate::transfer::error::{TransferError, TransferResult};
use crate::transfer::types::TransferPhase;
use parking_lot::RwLock;
use std::sync::Arc;

/// Guards the phase order of one job.
#[derive(Clone)]
pub struct JobStateMachine {
    phase: Arc<RwLock<TransferPhase>>,
}

impl Default for JobStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl JobStateMachine {
    pub fn new() -> Self {
        Self {
            phase: Arc::new(RwLock::new(TransferPhase::Idle)),
        }
    }

    pub fn current(&self) -> TransferPhase {
        *self.phase.read()
    }

    pub fn transition(&self, to: TransferPhase) -> TransferResult<TransferPhase> {
        use TransferPhase::*;

        let mut phase = self.phase.write();
        let allowed = match (*phase, to) {
            (Idle, Initializing) => true,
            (Initializing, Connecting) => true,
            (Connecting, Probing) => true,
            (Probing, Downloading) => true,
            (Downloading, Storing) => true,
            (Storing, Uploading) => true,
            (Uploading, Cleanup) => true,
            (Cleanup, Completed) => true,
            // Retry loop: a failed attempt starts over
            (Initializing | Connecting | Probing | Downloading | Storing | Uploading, Initializing) => {
                true
            }
            (from, Error) => !from.is_terminal(),
            _ => false,
        };

        if !allowed {
            return Err(TransferError::InvalidTransition { from: *phase, to });
        }
        *phase = to;
        Ok(to)
    }
}
