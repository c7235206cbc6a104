//! In-memory object store.
//!
//! Implements [`ObjectStore`] with the same versioning, finalizer and watch
//! semantics as the cluster API, minus durability. Used by the integration
//! tests and by the bundled binary.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::{EventAction, ObjectStore, ResourceKind, WatchEvent};
use crate::error::{Result, SchedError};
use crate::model::{Job, LabelSelector, ObjectKey, ObjectMeta, TaskInstance, TaskPhase};

const EVENT_CAPACITY: usize = 1024;
const NAME_SUFFIX_LEN: usize = 5;
const NAME_ALPHABET: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";

trait Stored: Clone {
    const KIND: ResourceKind;
    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;
}

impl Stored for Job {
    const KIND: ResourceKind = ResourceKind::Job;
    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }
    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl Stored for TaskInstance {
    const KIND: ResourceKind = ResourceKind::Task;
    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }
    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

type Table<T> = RwLock<HashMap<ObjectKey, T>>;

fn poison_err<T>(_: PoisonError<T>) -> SchedError {
    SchedError::StoreUnavailable("lock poisoned".to_string())
}

fn random_suffix() -> String {
    let mut rng = rand::thread_rng();
    (0..NAME_SUFFIX_LEN)
        .map(|_| NAME_ALPHABET[rng.gen_range(0..NAME_ALPHABET.len())] as char)
        .collect()
}

#[derive(Debug)]
pub struct InMemoryStore {
    jobs: Table<Job>,
    tasks: Table<TaskInstance>,
    events: broadcast::Sender<WatchEvent>,
    failures: AtomicU32,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            jobs: RwLock::new(HashMap::new()),
            tasks: RwLock::new(HashMap::new()),
            events,
            failures: AtomicU32::new(0),
        }
    }

    /// Make the next `count` store calls fail with `StoreUnavailable`.
    pub fn inject_failures(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Report a platform phase change for a task instance. Bypasses the
    /// version check, as the platform's status writes do.
    pub fn set_task_phase(
        &self,
        key: &ObjectKey,
        phase: Option<TaskPhase>,
    ) -> Result<TaskInstance> {
        let mut tasks = self.tasks.write().map_err(poison_err)?;
        let task = tasks
            .get_mut(key)
            .ok_or_else(|| SchedError::NotFound(key.to_string()))?;
        task.status.phase = phase;
        task.metadata.resource_version += 1;
        let updated = task.clone();
        drop(tasks);
        self.emit(ResourceKind::Task, EventAction::Modified, key.clone());
        Ok(updated)
    }

    pub fn job_count(&self) -> Result<usize> {
        Ok(self.jobs.read().map_err(poison_err)?.len())
    }

    pub fn task_count(&self) -> Result<usize> {
        Ok(self.tasks.read().map_err(poison_err)?.len())
    }

    fn check_failure(&self) -> Result<()> {
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(SchedError::StoreUnavailable("injected failure".to_string()));
        }
        Ok(())
    }

    fn emit(&self, kind: ResourceKind, action: EventAction, key: ObjectKey) {
        // no receivers is fine
        let _ = self.events.send(WatchEvent::new(kind, action, key));
    }

    fn get_in<T: Stored>(&self, table: &Table<T>, key: &ObjectKey) -> Result<T> {
        self.check_failure()?;
        let objects = table.read().map_err(poison_err)?;
        objects
            .get(key)
            .cloned()
            .ok_or_else(|| SchedError::NotFound(key.to_string()))
    }

    fn create_in<T: Stored>(&self, table: &Table<T>, mut obj: T) -> Result<T> {
        self.check_failure()?;
        if obj.meta().namespace.is_empty() {
            return Err(SchedError::InvalidObject("namespace is required".to_string()));
        }
        let mut objects = table.write().map_err(poison_err)?;

        if obj.meta().name.is_empty() {
            let prefix = obj.meta().generate_name.clone().ok_or_else(|| {
                SchedError::InvalidObject("name or generate_name is required".to_string())
            })?;
            let namespace = obj.meta().namespace.clone();
            let name = loop {
                let candidate = format!("{}{}", prefix, random_suffix());
                if !objects.contains_key(&ObjectKey::new(namespace.clone(), candidate.clone())) {
                    break candidate;
                }
            };
            obj.meta_mut().name = name;
        }

        let key = obj.meta().key();
        if objects.contains_key(&key) {
            return Err(SchedError::AlreadyExists(key.to_string()));
        }

        let meta = obj.meta_mut();
        meta.uid = Some(Uuid::new_v4());
        meta.resource_version = 1;
        meta.deletion_timestamp = None;

        objects.insert(key.clone(), obj.clone());
        drop(objects);
        self.emit(T::KIND, EventAction::Added, key);
        Ok(obj)
    }

    fn update_in<T: Stored>(&self, table: &Table<T>, obj: &T) -> Result<T> {
        self.check_failure()?;
        let key = obj.meta().key();
        let mut objects = table.write().map_err(poison_err)?;
        let existing = objects
            .get(&key)
            .ok_or_else(|| SchedError::NotFound(key.to_string()))?;

        let actual = existing.meta().resource_version;
        if actual != obj.meta().resource_version {
            return Err(SchedError::Conflict {
                key: key.to_string(),
                expected: obj.meta().resource_version,
                actual,
            });
        }

        let mut next = obj.clone();
        {
            let prev = existing.meta();
            let meta = next.meta_mut();
            meta.uid = prev.uid;
            meta.resource_version = actual + 1;
            // creation is stamped once, deletion is only requested via delete
            meta.creation_timestamp = prev.creation_timestamp.or(meta.creation_timestamp);
            meta.deletion_timestamp = prev.deletion_timestamp;
        }

        let reclaim = next.meta().is_deleting() && next.meta().finalizers.is_empty();
        let action = if reclaim {
            objects.remove(&key);
            EventAction::Deleted
        } else {
            objects.insert(key.clone(), next.clone());
            EventAction::Modified
        };
        drop(objects);
        self.emit(T::KIND, action, key);
        Ok(next)
    }

    fn delete_in<T: Stored>(&self, table: &Table<T>, key: &ObjectKey) -> Result<()> {
        self.check_failure()?;
        let mut objects = table.write().map_err(poison_err)?;
        let obj = objects
            .get_mut(key)
            .ok_or_else(|| SchedError::NotFound(key.to_string()))?;

        if obj.meta().is_deleting() {
            return Ok(());
        }
        let action = if obj.meta().finalizers.is_empty() {
            EventAction::Deleted
        } else {
            let meta = obj.meta_mut();
            meta.deletion_timestamp = Some(Utc::now());
            meta.resource_version += 1;
            EventAction::Modified
        };
        if action == EventAction::Deleted {
            objects.remove(key);
        }
        drop(objects);
        self.emit(T::KIND, action, key.clone());
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for InMemoryStore {
    async fn get_job(&self, key: &ObjectKey) -> Result<Job> {
        self.get_in(&self.jobs, key)
    }

    async fn list_jobs(&self, namespace: Option<&str>) -> Result<Vec<Job>> {
        self.check_failure()?;
        let jobs = self.jobs.read().map_err(poison_err)?;
        let mut result: Vec<Job> = jobs
            .values()
            .filter(|j| namespace.map_or(true, |ns| j.metadata.namespace == ns))
            .cloned()
            .collect();
        result.sort_by(|a, b| a.key().cmp(&b.key()));
        Ok(result)
    }

    async fn create_job(&self, job: Job) -> Result<Job> {
        self.create_in(&self.jobs, job)
    }

    async fn update_job(&self, job: &Job) -> Result<Job> {
        self.update_in(&self.jobs, job)
    }

    async fn delete_job(&self, key: &ObjectKey) -> Result<()> {
        self.delete_in(&self.jobs, key)
    }

    async fn get_task(&self, key: &ObjectKey) -> Result<TaskInstance> {
        self.get_in(&self.tasks, key)
    }

    async fn list_tasks(
        &self,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<Vec<TaskInstance>> {
        self.check_failure()?;
        let tasks = self.tasks.read().map_err(poison_err)?;
        let mut result: Vec<TaskInstance> = tasks
            .values()
            .filter(|t| namespace.map_or(true, |ns| t.metadata.namespace == ns))
            .filter(|t| selector.matches(&t.metadata.labels))
            .cloned()
            .collect();
        result.sort_by(|a, b| a.key().cmp(&b.key()));
        Ok(result)
    }

    async fn create_task(&self, mut task: TaskInstance) -> Result<TaskInstance> {
        task.metadata.creation_timestamp = Some(Utc::now());
        self.create_in(&self.tasks, task)
    }

    async fn update_task(&self, task: &TaskInstance) -> Result<TaskInstance> {
        self.update_in(&self.tasks, task)
    }

    async fn delete_task(&self, key: &ObjectKey) -> Result<()> {
        self.delete_in(&self.tasks, key)
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::JobSpec;

    fn job(name: &str) -> Job {
        Job::new("default", name, JobSpec::default())
    }

    #[tokio::test]
    async fn create_assigns_identity_and_version() {
        let store = InMemoryStore::new();
        let created = store.create_job(job("a")).await.unwrap();
        assert!(created.metadata.uid.is_some());
        assert_eq!(created.metadata.resource_version, 1);
        // jobs are stamped by the admission controller, not the store
        assert!(created.metadata.creation_timestamp.is_none());

        let err = store.create_job(job("a")).await.unwrap_err();
        assert_eq!(err, SchedError::AlreadyExists("default/a".to_string()));
    }

    #[tokio::test]
    async fn create_resolves_generate_name() {
        let store = InMemoryStore::new();
        let mut task = TaskInstance::default();
        task.metadata.namespace = "default".to_string();
        task.metadata.generate_name = Some("train-".to_string());

        let created = store.create_task(task).await.unwrap();
        assert!(created.metadata.name.starts_with("train-"));
        assert_eq!(created.metadata.name.len(), "train-".len() + NAME_SUFFIX_LEN);
        assert!(created.metadata.creation_timestamp.is_some());
    }

    #[tokio::test]
    async fn update_is_compare_and_swap() {
        let store = InMemoryStore::new();
        let created = store.create_job(job("a")).await.unwrap();

        let mut first = created.clone();
        first.spec.level = 3;
        let updated = store.update_job(&first).await.unwrap();
        assert_eq!(updated.metadata.resource_version, 2);

        let mut stale = created;
        stale.spec.level = 9;
        let err = store.update_job(&stale).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.get_job(&stale.key()).await.unwrap().spec.level, 3);
    }

    #[tokio::test]
    async fn delete_waits_for_finalizers() {
        let store = InMemoryStore::new();
        let mut j = job("a");
        j.metadata.finalizers.push("keep".to_string());
        let created = store.create_job(j).await.unwrap();
        let key = created.key();

        store.delete_job(&key).await.unwrap();
        let marked = store.get_job(&key).await.unwrap();
        let stamp = marked.metadata.deletion_timestamp;
        assert!(stamp.is_some());

        // a second request does not move the marker
        store.delete_job(&key).await.unwrap();
        assert_eq!(store.get_job(&key).await.unwrap().metadata.deletion_timestamp, stamp);

        let mut released = marked;
        released.metadata.finalizers.clear();
        store.update_job(&released).await.unwrap();
        assert!(store.get_job(&key).await.unwrap_err().is_not_found());
        assert!(store.delete_job(&key).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn watch_reports_writes() {
        let store = InMemoryStore::new();
        let mut rx = store.watch();
        let created = store.create_job(job("a")).await.unwrap();
        store.delete_job(&created.key()).await.unwrap();

        let added = rx.recv().await.unwrap();
        assert_eq!(added.action, EventAction::Added);
        assert_eq!(added.kind, ResourceKind::Job);
        let deleted = rx.recv().await.unwrap();
        assert_eq!(deleted.action, EventAction::Deleted);
        assert_eq!(deleted.key, created.key());
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let store = InMemoryStore::new();
        store.inject_failures(1);
        let err = store.list_jobs(None).await.unwrap_err();
        assert_eq!(err, SchedError::StoreUnavailable("injected failure".to_string()));
        assert!(store.list_jobs(None).await.unwrap().is_empty());
    }
}
