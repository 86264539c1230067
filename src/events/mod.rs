//! Cross-component signalling
//!
//! Components publish typed [`FleetEvent`]s on the [`EventBus`]; the
//! [`Synchronizer`] consumes them and applies the derived effects (teardown
//! on logout, the global activity flag, auto-probe on connect).

pub mod bus;
pub mod notify;
pub mod synchronizer;
pub mod types;

pub use bus::EventBus;
pub use notify::{NotificationSink, TracingSink};
pub use synchronizer::Synchronizer;
pub use types::{FleetEvent, Notification, NotificationLevel};
