use crate::device::DeviceId;
use crate::transport::{RemoteFile, SessionHandle};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }
}

/// Conflicting operations on one device. A session holds at most one.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Activity {
    Scanning,
    Connecting,
    Probing,
    Downloading,
}

impl fmt::Display for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Activity::Scanning => "scanning",
            Activity::Connecting => "connecting",
            Activity::Probing => "probing",
            Activity::Downloading => "downloading",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CampaignFiles {
    pub campaign_id: u64,
    pub files: Vec<RemoteFile>,
    pub probed_at: DateTime<Utc>,
}

impl CampaignFiles {
    pub fn new(campaign_id: u64, files: Vec<RemoteFile>) -> Self {
        Self {
            campaign_id,
            files,
            probed_at: Utc::now(),
        }
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSession {
    pub device_id: DeviceId,
    pub status: ConnectionStatus,
    pub handle: Option<SessionHandle>,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub activity: Option<Activity>,
    /// Keyed by campaign id, so a campaign appears at most once
    pub campaigns: HashMap<u64, CampaignFiles>,
}

impl ConnectionSession {
    pub fn new(device_id: DeviceId) -> Self {
        Self {
            device_id,
            status: ConnectionStatus::Disconnected,
            handle: None,
            last_connected_at: None,
            last_error: None,
            activity: None,
            campaigns: HashMap::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status.is_connected() && self.handle.is_some()
    }

    pub fn is_scanning(&self) -> bool {
        self.activity == Some(Activity::Scanning)
    }

    pub fn is_connecting(&self) -> bool {
        self.activity == Some(Activity::Connecting)
    }

    pub fn is_probing(&self) -> bool {
        self.activity == Some(Activity::Probing)
    }

    pub fn is_downloading(&self) -> bool {
        self.activity == Some(Activity::Downloading)
    }

    pub fn campaign(&self, campaign_id: u64) -> Option<&CampaignFiles> {
        self.campaigns.get(&campaign_id)
    }

    pub fn apply(&mut self, update: SessionUpdate) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(handle) = update.handle {
            self.handle = handle;
        }
        if let Some(at) = update.last_connected_at {
            self.last_connected_at = Some(at);
        }
        if let Some(error) = update.last_error {
            self.last_error = error;
        }
        if update.clear_campaigns {
            self.campaigns.clear();
        }
        if let Some(files) = update.campaign {
            self.campaigns.insert(files.campaign_id, files);
        }
    }
}

/// Partial update applied atomically by the registry.
#[derive(Debug, Clone, Default)]
pub struct SessionUpdate {
    pub status: Option<ConnectionStatus>,
    pub handle: Option<Option<SessionHandle>>,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub last_error: Option<Option<String>>,
    pub campaign: Option<CampaignFiles>,
    pub clear_campaigns: bool,
}

impl SessionUpdate {
    pub fn status(status: ConnectionStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_handle(mut self, handle: SessionHandle) -> Self {
        self.handle = Some(Some(handle));
        self
    }

    pub fn without_handle(mut self) -> Self {
        self.handle = Some(None);
        self
    }

    pub fn connected_at(mut self, at: DateTime<Utc>) -> Self {
        self.last_connected_at = Some(at);
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.last_error = Some(Some(message.into()));
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.last_error = Some(None);
        self
    }

    pub fn with_campaign(mut self, files: CampaignFiles) -> Self {
        self.campaign = Some(files);
        self
    }

    pub fn clear_campaigns(mut self) -> Self {
        self.clear_campaigns = true;
        self
    }
}
