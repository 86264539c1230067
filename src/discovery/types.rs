use crate::device::{DeviceIdentity, HardwareAddress};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub timeout: Duration,
    /// Drop advertisements that do not resolve to a known device
    pub only_known_addresses: bool,
    /// Re-emit every advertisement instead of keeping the strongest per address
    pub allow_duplicates: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            only_known_addresses: false,
            allow_duplicates: false,
        }
    }
}

impl ScanOptions {
    pub fn known_only(timeout: Duration) -> Self {
        Self {
            timeout,
            only_known_addresses: true,
            allow_duplicates: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryResult {
    /// Address as advertised (or recovered from the advertised name)
    pub address: HardwareAddress,
    pub name: Option<String>,
    pub rssi: i16,
    pub seen_at: DateTime<Utc>,
    pub device: Option<DeviceIdentity>,
}

impl DiscoveryResult {
    pub fn is_known(&self) -> bool {
        self.device.is_some()
    }
}
