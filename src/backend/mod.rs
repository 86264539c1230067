pub mod api;
pub mod error;
pub mod http;
pub mod types;

pub use api::BackendApi;
pub use error::{BackendError, BackendResult};
pub use http::HttpBackend;
pub use types::{parse_upload_response, BleStatus, UploadReceipt, UploadRequest};
