//! Object store seam.
//!
//! The scheduler never owns authoritative job or task state. It reads and
//! writes through [`ObjectStore`], which models the cluster API:
//!
//! - **CAS updates**: `update_*` fails with [`SchedError::Conflict`] when the
//!   stored `resource_version` moved since the caller read the object
//! - **Finalizer-gated deletion**: `delete_*` only marks objects that still
//!   carry finalizers; they are reclaimed once the last finalizer is removed
//! - **Watch**: every write is published as a [`WatchEvent`], at least once,
//!   with no ordering across identities
//!
//! [`memory::InMemoryStore`] implements the trait for tests and the bundled
//! binary.
//!
//! [`SchedError::Conflict`]: crate::error::SchedError::Conflict

pub mod memory;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::model::{Job, LabelSelector, ObjectKey, TaskInstance};

pub use memory::InMemoryStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ResourceKind {
    Job,
    Task,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventAction {
    Added,
    Modified,
    Deleted,
}

/// Change notification for one object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WatchEvent {
    pub kind: ResourceKind,
    pub action: EventAction,
    pub key: ObjectKey,
}

impl WatchEvent {
    pub fn new(kind: ResourceKind, action: EventAction, key: ObjectKey) -> Self {
        Self { kind, action, key }
    }
}

/// Storage abstraction for jobs and task instances.
///
/// All methods are `Send + Sync` so both control loops can share one store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    // --- Jobs ---

    async fn get_job(&self, key: &ObjectKey) -> Result<Job>;

    /// Jobs in `namespace`, or in every namespace when `None`.
    async fn list_jobs(&self, namespace: Option<&str>) -> Result<Vec<Job>>;

    async fn create_job(&self, job: Job) -> Result<Job>;

    /// Compare-and-swap on `metadata.resource_version`.
    async fn update_job(&self, job: &Job) -> Result<Job>;

    async fn delete_job(&self, key: &ObjectKey) -> Result<()>;

    // --- Task instances ---

    async fn get_task(&self, key: &ObjectKey) -> Result<TaskInstance>;

    async fn list_tasks(
        &self,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<Vec<TaskInstance>>;

    async fn create_task(&self, task: TaskInstance) -> Result<TaskInstance>;

    /// Compare-and-swap on `metadata.resource_version`.
    async fn update_task(&self, task: &TaskInstance) -> Result<TaskInstance>;

    async fn delete_task(&self, key: &ObjectKey) -> Result<()>;

    // --- Watch ---

    fn watch(&self) -> broadcast::Receiver<WatchEvent>;
}
