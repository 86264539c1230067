mod address;
mod parse;
mod types;

pub use address::{AddressError, HardwareAddress};
pub use parse::{parse_machine_list, parse_machine_record, RecordError};
pub use types::{DeviceId, DeviceIdentity, UploadContext};
