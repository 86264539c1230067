use crate::config::FleetConfig;
use crate::connection::ConnectionManager;
use crate::device::DeviceId;
use crate::error::{FleetError, FleetResult};
use crate::events::{EventBus, FleetEvent};
use crate::metrics;
use crate::probe::types::ProbeSummary;
use crate::session::{Activity, CampaignFiles, SessionRegistry, SessionUpdate};
use crate::transport::{parse_file_listing, Opcode};
use std::time::Duration;

/// Enumerates the files a connected device holds for a campaign.
#[derive(Clone)]
pub struct FileProbe {
    connections: ConnectionManager,
    registry: SessionRegistry,
    bus: EventBus,
    request_timeout: Duration,
}

impl FileProbe {
    pub fn new(
        connections: ConnectionManager,
        registry: SessionRegistry,
        bus: EventBus,
        config: &FleetConfig,
    ) -> Self {
        Self {
            connections,
            registry,
            bus,
            request_timeout: config.task_timeout(),
        }
    }

    /// Issue one listing request and replace the stored file set for
    /// `campaign_id`. On failure the previous set is left untouched.
    pub async fn probe(&self, device_id: DeviceId, campaign_id: u64) -> FleetResult<ProbeSummary> {
        if !self.connections.is_connected(device_id) {
            return Err(FleetError::NotConnected(device_id));
        }
        let _guard = self.registry.try_begin(device_id, Activity::Probing)?;

        let files = match self.list(device_id, campaign_id).await {
            Ok(files) => files,
            Err(e) => {
                metrics::record_probe(false, 0);
                tracing::warn!(%device_id, campaign_id, "Probe failed: {}", e);
                return Err(e);
            }
        };

        let set = CampaignFiles::new(campaign_id, files);
        let summary = ProbeSummary::from(&set);
        self.registry
            .upsert(device_id, SessionUpdate::default().with_campaign(set));

        metrics::record_probe(true, summary.file_count);
        tracing::info!(
            %device_id,
            campaign_id,
            file_count = summary.file_count,
            total_size = summary.total_size,
            "Probe completed"
        );
        self.bus.publish(FleetEvent::ProbeCompleted {
            device_id,
            campaign_id,
            file_count: summary.file_count,
            total_size: summary.total_size,
        });
        Ok(summary)
    }

    async fn list(
        &self,
        device_id: DeviceId,
        campaign_id: u64,
    ) -> FleetResult<Vec<crate::transport::RemoteFile>> {
        let payload = self
            .connections
            .request(device_id, campaign_id, Opcode::ListFiles, self.request_timeout)
            .await
            .map_err(|e| FleetError::ProbeFailed(e.to_string()))?;
        parse_file_listing(&payload).map_err(|e| FleetError::ProbeFailed(e.to_string()))
    }

    /// Files known from the last successful probe, without touching the device
    pub fn cached(&self, device_id: DeviceId, campaign_id: u64) -> Option<ProbeSummary> {
        self.registry
            .get(device_id)
            .and_then(|s| s.campaign(campaign_id).map(ProbeSummary::from))
    }
}
