pub mod registry;
pub mod types;

pub use registry::{ActivityGuard, SessionRegistry};
pub use types::{Activity, CampaignFiles, ConnectionSession, ConnectionStatus, SessionUpdate};
