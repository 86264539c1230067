pub mod prober;
pub mod types;

pub use prober::FileProbe;
pub use types::ProbeSummary;
