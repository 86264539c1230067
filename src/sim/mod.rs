//! In-memory stand-ins for the external collaborators
//!
//! Simulated radio, bulk transport, backend and notification sink with
//! failure injection and call counters. Used by the test-suite and handy
//! for embedding applications that want a demo mode without hardware.

mod backend;
mod notify;
mod radio;

pub use backend::{RecordedUpload, SimBackend};
pub use notify::RecordingSink;
pub use radio::{SimBulk, SimRadio};
