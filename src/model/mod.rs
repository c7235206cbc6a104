//! Cluster object records consumed by the scheduler.
//!
//! These mirror the persisted shape of the objects held by the external
//! object store:
//! - [`Job`]: a gang of task templates with a quorum threshold and a queue
//! - [`TaskInstance`]: one launched unit of work, owned by exactly one job
//! - [`ObjectMeta`]: identity, versioning, finalizers and owner links
//!
//! Status fields serialize with the same names they carry on the cluster so
//! they round-trip through the store unchanged.

pub mod job;
pub mod meta;
pub mod task;

pub use job::{Job, JobPhase, JobSpec, JobStatus};
pub use meta::{LabelSelector, ObjectKey, ObjectMeta, OwnerReference};
pub use task::{TaskInstance, TaskPhase, TaskStatus, TaskTemplate};

/// Finalizer placed on jobs and task instances while the scheduler still has
/// cleanup to do for them.
pub const SCHEDULING_FINALIZER: &str = "scheduling.gang.io/finalizer";

/// Label recording which of the job's task templates an instance was
/// launched from.
pub const TASK_INDEX_LABEL: &str = "scheduling.gang.io/task-index";

/// API version carried by owner links that point at a [`Job`].
pub const JOB_API_VERSION: &str = "gang.io/v1";

/// Kind carried by owner links that point at a [`Job`].
pub const JOB_KIND: &str = "GangJob";
