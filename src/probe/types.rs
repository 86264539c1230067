use crate::session::CampaignFiles;
use crate::transport::RemoteFile;
use serde::{Deserialize, Serialize};

/// Outcome of a successful probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeSummary {
    pub campaign_id: u64,
    pub file_count: usize,
    pub total_size: u64,
    pub files: Vec<RemoteFile>,
}

impl From<&CampaignFiles> for ProbeSummary {
    fn from(set: &CampaignFiles) -> Self {
        Self {
            campaign_id: set.campaign_id,
            file_count: set.file_count(),
            total_size: set.total_size(),
            files: set.files.clone(),
        }
    }
}
