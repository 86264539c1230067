pub mod driver;
pub mod error;
pub mod listing;
pub mod types;

pub use driver::{BulkDriver, RadioDriver};
pub use error::{TransportError, TransportResult};
pub use listing::parse_file_listing;
pub use types::{Advertisement, FileKind, Opcode, RemoteFile, ScanRequest, SessionHandle, TransportKind};
