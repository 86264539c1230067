use crate::device::address::HardwareAddress;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable numeric machine id assigned by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub u64);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for DeviceId {
    fn from(id: u64) -> Self {
        DeviceId(id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub id: DeviceId,
    pub address: Option<HardwareAddress>,
    pub name: Option<String>,
    pub site_id: Option<u64>,
    pub installation_id: Option<u64>,
}

impl DeviceIdentity {
    pub fn new(id: impl Into<DeviceId>, address: HardwareAddress) -> Self {
        Self {
            id: id.into(),
            address: Some(address),
            name: None,
            site_id: None,
            installation_id: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_site(mut self, site_id: u64) -> Self {
        self.site_id = Some(site_id);
        self
    }

    pub fn with_installation(mut self, installation_id: u64) -> Self {
        self.installation_id = Some(installation_id);
        self
    }

    /// Context attached to every backend upload for this device
    pub fn upload_context(&self) -> UploadContext {
        UploadContext {
            machine_id: self.id,
            site_id: self.site_id,
            installation_id: self.installation_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadContext {
    pub machine_id: DeviceId,
    pub site_id: Option<u64>,
    pub installation_id: Option<u64>,
}
