//! Durable upload queue
//!
//! Locally stored artifacts wait here until the backend confirms them.
//! Entries for one device are attempted in enqueue order; devices proceed
//! independently.

pub mod error;
pub mod types;
pub mod upload;

pub use error::{QueueError, QueueResult};
pub use types::{ProcessReport, QueueStats, UploadQueueEntry};
pub use upload::UploadQueue;
