pub mod scanner;
pub mod types;

pub use scanner::DiscoveryScanner;
pub use types::{DiscoveryResult, ScanOptions};
