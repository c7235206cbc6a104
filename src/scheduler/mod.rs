pub mod phase;
pub mod queue;
pub mod registry;

pub use phase::derive_phase;
pub use queue::{PriorityQueue, QueuedJob};
pub use registry::{QueueRegistry, SharedQueue};
