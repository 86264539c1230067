//! Device connection and file transfer orchestration for fleets of
//! battery-powered GNSS field recorders.
//!
//! The crate is a library: an embedding application wires a radio driver,
//! an optional bulk (local network) driver, a backend client and a
//! notification sink into a [`Fleet`], then drives discovery, sessions,
//! probes and transfer jobs through it.

pub mod backend;
pub mod config;
pub mod connection;
pub mod device;
pub mod discovery;
pub mod error;
pub mod events;
pub mod fleet;
pub mod metrics;
pub mod probe;
pub mod queue;
pub mod session;
pub mod sim;
pub mod store;
pub mod telemetry;
pub mod transfer;
pub mod transport;

pub use config::FleetConfig;
pub use error::{FleetError, FleetResult};
pub use fleet::{Fleet, FleetBuilder};
