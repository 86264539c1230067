//! File listing payloads returned by `Opcode::ListFiles`.
//!
//! Accepted shapes: `{"files": [...]}` or a bare array. Per entry:
//! - name: `name`, then `filename`; entries without one are dropped
//! - size: `size`, then `bytes`; missing means 0
//! - modified: `modified`, `mtime`, `last_modified`; unix seconds or RFC 3339

use crate::transport::error::{TransportError, TransportResult};
use crate::transport::types::{FileKind, RemoteFile};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

pub fn parse_file_listing(payload: &[u8]) -> TransportResult<Vec<RemoteFile>> {
    let value: Value = serde_json::from_slice(payload)?;

    let entries = value
        .as_array()
        .or_else(|| value.get("files").and_then(Value::as_array))
        .ok_or_else(|| TransportError::Protocol("listing is not an array".into()))?;

    let mut files: Vec<RemoteFile> = Vec::with_capacity(entries.len());
    for entry in entries {
        let Some(file) = parse_entry(entry) else {
            tracing::debug!("Dropping listing entry without a name: {}", entry);
            continue;
        };
        // Firmware occasionally repeats an entry; keep the last one.
        if let Some(existing) = files.iter_mut().find(|f| f.name == file.name) {
            *existing = file;
        } else {
            files.push(file);
        }
    }
    Ok(files)
}

fn parse_entry(entry: &Value) -> Option<RemoteFile> {
    let name = ["name", "filename"]
        .iter()
        .filter_map(|key| entry.get(*key).and_then(Value::as_str))
        .find(|name| !name.is_empty())?
        .to_string();

    let size = ["size", "bytes"]
        .iter()
        .filter_map(|key| entry.get(*key))
        .find_map(|v| match v {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        })
        .unwrap_or(0);

    let modified = ["modified", "mtime", "last_modified"]
        .iter()
        .filter_map(|key| entry.get(*key))
        .find_map(parse_timestamp);

    let kind = FileKind::infer(&name);
    Some(RemoteFile {
        name,
        size,
        modified,
        kind,
    })
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n.as_i64().and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| s.parse::<i64>().ok().and_then(|secs| Utc.timestamp_opt(secs, 0).single())),
        _ => None,
    }
}
