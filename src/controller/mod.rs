//! Control loops driven by object-store events.
//!
//! - [`JobController`]: admission. Derives each job's phase and moves it
//!   through its named queue, launching the next admitted job.
//! - [`TaskController`]: accounting. Turns task-instance phase transitions
//!   into counter updates on the owning job, exactly once per transition.
//! - [`Launcher`]: bounded worker pool that performs task creation and
//!   deletion off the reconcile path.
//! - [`retry`]: read-modify-write-if-changed with version checks.
//!
//! Both loops tolerate duplicate, concurrent and out-of-order passes: every
//! decision is re-derived from a fresh read before it is written.

pub mod job;
pub mod launcher;
pub mod retry;
pub mod task;

pub use job::JobController;
pub use launcher::{LaunchRequest, LaunchSnapshot, Launcher};
pub use retry::{update_with_retry, Versioned, WriteResult};
pub use task::TaskController;
