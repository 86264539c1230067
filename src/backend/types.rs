use crate::backend::error::{BackendError, BackendResult};
use crate::device::UploadContext;
use crate::session::ConnectionStatus;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BleStatus {
    pub status: ConnectionStatus,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl BleStatus {
    pub fn new(status: ConnectionStatus) -> Self {
        Self {
            status,
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: ConnectionStatus::Error,
            error: Some(error.into()),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub context: UploadContext,
    pub campaign_id: u64,
    pub file_name: String,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadReceipt {
    /// Backend-side id of the stored file, when the response carries one
    pub remote_id: Option<String>,
}

/// Interpret an upload response body.
///
/// Rules: an explicit `"success": false` (or `"ok": false`) is a rejection,
/// with `message`/`error` as the reason. The remote id comes from `id`,
/// then `file_id`/`fileId`, then `file.id`, then `data.id`; ids may be
/// numbers or strings. An empty body counts as accepted without an id.
pub fn parse_upload_response(body: &str) -> BackendResult<UploadReceipt> {
    if body.trim().is_empty() {
        return Ok(UploadReceipt { remote_id: None });
    }

    let value: Value = serde_json::from_str(body)?;
    if !value.is_object() {
        return Err(BackendError::InvalidResponse(format!(
            "expected an object, got {body}"
        )));
    }

    let flagged_failure = ["success", "ok"]
        .iter()
        .filter_map(|key| value.get(*key).and_then(Value::as_bool))
        .any(|flag| !flag);
    if flagged_failure {
        let reason = ["message", "error"]
            .iter()
            .filter_map(|key| value.get(*key).and_then(Value::as_str))
            .next()
            .unwrap_or("no reason given");
        return Err(BackendError::Rejected(reason.to_string()));
    }

    let candidates = [
        value.get("id"),
        value.get("file_id"),
        value.get("fileId"),
        value.get("file").and_then(|f| f.get("id")),
        value.get("data").and_then(|d| d.get("id")),
    ];
    let remote_id = candidates.into_iter().flatten().find_map(|v| match v {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    });

    Ok(UploadReceipt { remote_id })
}
