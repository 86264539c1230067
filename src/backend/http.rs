use crate::backend::api::BackendApi;
use crate::backend::error::{BackendError, BackendResult};
use crate::backend::types::{parse_upload_response, BleStatus, UploadReceipt, UploadRequest};
use crate::device::{parse_machine_list, DeviceId, DeviceIdentity};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Response};
use std::time::Duration;

/// JSON/multipart client for the fleet backend.
pub struct HttpBackend {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> BackendResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Known machines, parsed through the tolerant record parser
    pub async fn list_machines(&self) -> BackendResult<Vec<DeviceIdentity>> {
        let url = format!("{}/machines", self.base_url);
        let response = Self::check(self.authorize(self.client.get(url)).send().await?).await?;
        let value: serde_json::Value = response.json().await?;
        parse_machine_list(&value).map_err(|e| BackendError::InvalidResponse(e.to_string()))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn check(response: Response) -> BackendResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(BackendError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl BackendApi for HttpBackend {
    async fn post_ble_status(&self, device_id: DeviceId, status: BleStatus) -> BackendResult<()> {
        let url = format!("{}/machine/{}/ble-status", self.base_url, device_id);
        let request = self.authorize(self.client.post(url).json(&status));
        Self::check(request.send().await?).await?;
        Ok(())
    }

    async fn upload_file(&self, request: UploadRequest) -> BackendResult<UploadReceipt> {
        let url = format!("{}/files/upload", self.base_url);
        let context = &request.context;

        let part = Part::bytes(request.data.to_vec()).file_name(request.file_name.clone());
        let mut form = Form::new()
            .part("file", part)
            .text("machineId", context.machine_id.to_string())
            .text("campaignId", request.campaign_id.to_string());
        if let Some(site_id) = context.site_id {
            form = form.text("siteId", site_id.to_string());
        }
        if let Some(installation_id) = context.installation_id {
            form = form.text("installationId", installation_id.to_string());
        }

        let response = self
            .authorize(self.client.post(url).multipart(form))
            .send()
            .await?;
        let body = Self::check(response).await?.text().await?;
        parse_upload_response(&body)
    }
}
