use crate::device::HardwareAddress;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Opaque handle the radio driver assigns to a live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionHandle(pub u64);

/// Raw radio advertisement as reported by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub address: Option<HardwareAddress>,
    pub name: Option<String>,
    pub rssi: i16,
}

#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub timeout: Duration,
    /// Filter hint for drivers that can filter in hardware; empty = all
    pub known_addresses: Vec<HardwareAddress>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Opcode {
    ListFiles,
    ReadFile { name: String },
    DeleteFiles { names: Vec<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Wifi,
    Ble,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Wifi => write!(f, "wifi"),
            TransportKind::Ble => write!(f, "ble"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Raw,
    RinexObs,
    RinexNav,
    Log,
    Unknown,
}

impl FileKind {
    /// Inferred from the extension; RINEX 2 short names (`.24o`, `.24n`) count.
    pub fn infer(name: &str) -> Self {
        let ext = match name.rsplit_once('.') {
            Some((_, ext)) => ext.to_ascii_lowercase(),
            None => return FileKind::Unknown,
        };

        match ext.as_str() {
            "ubx" | "sbf" | "raw" => FileKind::Raw,
            "obs" | "rnx" => FileKind::RinexObs,
            "nav" => FileKind::RinexNav,
            "log" | "txt" => FileKind::Log,
            short if short.is_ascii() && short.len() == 3 && short[..2].chars().all(|c| c.is_ascii_digit()) => {
                match &short[2..] {
                    "o" => FileKind::RinexObs,
                    "n" | "g" => FileKind::RinexNav,
                    _ => FileKind::Unknown,
                }
            }
            _ => FileKind::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    pub name: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    pub kind: FileKind,
}

impl RemoteFile {
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        let name = name.into();
        let kind = FileKind::infer(&name);
        Self {
            name,
            size,
            modified: None,
            kind,
        }
    }
}
