//! Backend machine payload parsing
//!
//! The backend has served two machine shapes over time. Fallback rules, in
//! order of preference:
//!
//! - id: `id`, `machine_id`, `machineId` (number or numeric string)
//! - address: `mac_address`, `macAddress`, `ble_mac`, `bleMac`; an
//!   unparseable or empty value yields `address: None`
//! - name: `name`, `machine_name`
//! - site: `site_id`, `siteId`, then `site.id`
//! - installation: `installation_id`, `installationId`, then `installation.id`

use crate::device::address::HardwareAddress;
use crate::device::types::{DeviceId, DeviceIdentity};
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("Machine record is not an object")]
    NotAnObject,

    #[error("Machine record has no usable id")]
    MissingId,

    #[error("Machine list is not an array")]
    NotAList,
}

const ID_KEYS: &[&str] = &["id", "machine_id", "machineId"];
const ADDRESS_KEYS: &[&str] = &["mac_address", "macAddress", "ble_mac", "bleMac"];
const NAME_KEYS: &[&str] = &["name", "machine_name"];
const SITE_KEYS: &[&str] = &["site_id", "siteId"];
const INSTALLATION_KEYS: &[&str] = &["installation_id", "installationId"];

pub fn parse_machine_record(value: &Value) -> Result<DeviceIdentity, RecordError> {
    let object = value.as_object().ok_or(RecordError::NotAnObject)?;

    let id = first_u64(value, ID_KEYS).ok_or(RecordError::MissingId)?;

    let address = ADDRESS_KEYS
        .iter()
        .filter_map(|key| object.get(*key).and_then(Value::as_str))
        .find_map(|raw| raw.parse::<HardwareAddress>().ok());

    let name = NAME_KEYS
        .iter()
        .filter_map(|key| object.get(*key).and_then(Value::as_str))
        .find(|name| !name.is_empty())
        .map(str::to_string);

    let site_id = first_u64(value, SITE_KEYS).or_else(|| nested_id(value, "site"));
    let installation_id =
        first_u64(value, INSTALLATION_KEYS).or_else(|| nested_id(value, "installation"));

    Ok(DeviceIdentity {
        id: DeviceId(id),
        address,
        name,
        site_id,
        installation_id,
    })
}

/// Accepts a bare array or `{"machines": [...]}` / `{"data": [...]}`.
/// Records that fail to parse are skipped with a warning.
pub fn parse_machine_list(value: &Value) -> Result<Vec<DeviceIdentity>, RecordError> {
    let items = value
        .as_array()
        .or_else(|| value.get("machines").and_then(Value::as_array))
        .or_else(|| value.get("data").and_then(Value::as_array))
        .ok_or(RecordError::NotAList)?;

    Ok(items
        .iter()
        .filter_map(|item| match parse_machine_record(item) {
            Ok(identity) => Some(identity),
            Err(e) => {
                tracing::warn!("Skipping machine record: {}", e);
                None
            }
        })
        .collect())
}

fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn first_u64(value: &Value, keys: &[&str]) -> Option<u64> {
    keys.iter().filter_map(|key| value.get(*key)).find_map(as_u64)
}

fn nested_id(value: &Value, key: &str) -> Option<u64> {
    value.get(key).and_then(|nested| nested.get("id")).and_then(as_u64)
}
