use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("Empty hardware address")]
    Empty,

    #[error("Malformed hardware address: {0}")]
    Malformed(String),
}

/// 48-bit radio hardware address, displayed as `AA:BB:CC:DD:EE:FF`.
///
/// Firmware and backend disagree on byte order for some device batches, so
/// equality checks between the two sources go through [`HardwareAddress::matches`]
/// which accepts either order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HardwareAddress([u8; 6]);

impl HardwareAddress {
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    pub fn bytes(&self) -> [u8; 6] {
        self.0
    }

    pub fn reversed(&self) -> Self {
        let mut bytes = self.0;
        bytes.reverse();
        Self(bytes)
    }

    /// Direct or byte-reversed equality.
    pub fn matches(&self, other: &HardwareAddress) -> bool {
        *self == *other || *self == other.reversed()
    }

    /// Pull an address out of an advertised name such as `REC-54320401E641`
    /// or `REC_54:32:04:01:E6:41`. The last token that parses wins.
    pub fn from_advertised_name(name: &str) -> Option<Self> {
        name.split(|c: char| c == '-' || c == '_' || c.is_whitespace())
            .rev()
            .find_map(|token| token.parse().ok())
    }
}

impl FromStr for HardwareAddress {
    type Err = AddressError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(AddressError::Empty);
        }

        let hex: String = trimmed.chars().filter(|c| *c != ':' && *c != '-').collect();
        let separators = trimmed.len() - hex.len();
        if hex.len() != 12
            || !(separators == 0 || separators == 5)
            || !hex.chars().all(|c| c.is_ascii_hexdigit())
        {
            return Err(AddressError::Malformed(raw.to_string()));
        }

        let mut bytes = [0u8; 6];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
                .map_err(|_| AddressError::Malformed(raw.to_string()))?;
        }
        Ok(Self(bytes))
    }
}

impl fmt::Display for HardwareAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

impl Serialize for HardwareAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for HardwareAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
