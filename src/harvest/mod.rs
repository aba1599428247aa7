pub mod coordinator;
pub mod partition;
pub mod progress;
pub mod shutdown;
pub mod worker;

pub use coordinator::{Coordinator, HarvestSummary, RunOptions};
pub use progress::ProgressSnapshot;
