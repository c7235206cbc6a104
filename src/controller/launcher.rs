use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};

use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::LaunchConfig;
use crate::model::{ObjectKey, TaskInstance};
use crate::store::ObjectStore;

/// Background store write handed off by a control-loop pass
#[derive(Debug)]
pub enum LaunchRequest {
    Create(Box<TaskInstance>),
    Delete(ObjectKey),
}

impl LaunchRequest {
    fn describe(&self) -> String {
        match self {
            LaunchRequest::Create(task) => format!(
                "create {}/{}",
                task.metadata.namespace,
                task.metadata
                    .generate_name
                    .as_deref()
                    .unwrap_or(&task.metadata.name)
            ),
            LaunchRequest::Delete(key) => format!("delete {}", key),
        }
    }

    /// Owning job and template index of a create request
    fn slot(&self) -> Option<Slot> {
        match self {
            LaunchRequest::Create(task) => {
                let owner = task.metadata.job_owner()?;
                let job = ObjectKey::new(task.metadata.namespace.clone(), owner.name.clone());
                Some((job, task.template_index()?))
            }
            LaunchRequest::Delete(_) => None,
        }
    }
}

type Slot = (ObjectKey, usize);

/// Create requests accepted but not yet written, by job and template index
#[derive(Debug, Default)]
struct Outstanding(std::sync::Mutex<HashSet<Slot>>);

impl Outstanding {
    fn insert(&self, slot: Option<Slot>) {
        if let Some(slot) = slot {
            self.0.lock().unwrap_or_else(PoisonError::into_inner).insert(slot);
        }
    }

    fn remove(&self, slot: Option<&Slot>) {
        if let Some(slot) = slot {
            self.0.lock().unwrap_or_else(PoisonError::into_inner).remove(slot);
        }
    }

    fn for_job(&self, job: &ObjectKey) -> HashSet<usize> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(owner, _)| owner == job)
            .map(|(_, index)| *index)
            .collect()
    }
}

#[derive(Debug, Default)]
struct LaunchStats {
    submitted: AtomicU64,
    created: AtomicU64,
    deleted: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    in_flight: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LaunchSnapshot {
    pub submitted: u64,
    pub created: u64,
    pub deleted: u64,
    pub failed: u64,
    pub dropped: u64,
    pub in_flight: u64,
}

/// Bounded worker pool for task creation and deletion.
///
/// Passes submit with [`Launcher::submit`] and never wait for the outcome;
/// failures are logged and counted and show up on a later pass as a missing
/// or lingering instance.
#[derive(Debug, Clone)]
pub struct Launcher {
    tx: mpsc::Sender<LaunchRequest>,
    stats: Arc<LaunchStats>,
    outstanding: Arc<Outstanding>,
}

impl Launcher {
    /// Spawn the workers. They stop when `token` is cancelled.
    pub fn start(
        store: Arc<dyn ObjectStore>,
        config: &LaunchConfig,
        token: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let stats = Arc::new(LaunchStats::default());
        let outstanding = Arc::new(Outstanding::default());

        for worker_id in 0..config.workers.max(1) {
            let store = store.clone();
            let rx = rx.clone();
            let stats = stats.clone();
            let outstanding = outstanding.clone();
            let token = token.clone();
            tokio::spawn(async move {
                Self::worker_loop(worker_id, store, rx, stats, outstanding, token).await;
            });
        }

        Self {
            tx,
            stats,
            outstanding,
        }
    }

    /// Hand a request to the pool without waiting. Returns false if the
    /// request was dropped because the channel is full or closed.
    pub fn submit(&self, request: LaunchRequest) -> bool {
        let slot = request.slot();
        self.stats.in_flight.fetch_add(1, Ordering::SeqCst);
        self.outstanding.insert(slot.clone());
        match self.tx.try_send(request) {
            Ok(()) => {
                self.stats.submitted.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(request)) | Err(TrySendError::Closed(request)) => {
                self.stats.in_flight.fetch_sub(1, Ordering::SeqCst);
                self.outstanding.remove(slot.as_ref());
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    request = %request.describe(),
                    "Launch channel unavailable, request dropped",
                );
                false
            }
        }
    }

    pub fn create_task(&self, task: TaskInstance) -> bool {
        self.submit(LaunchRequest::Create(Box::new(task)))
    }

    pub fn delete_task(&self, key: ObjectKey) -> bool {
        self.submit(LaunchRequest::Delete(key))
    }

    /// Template indices of `job` whose create requests are accepted but not
    /// yet written to the store.
    pub fn outstanding_creates(&self, job: &ObjectKey) -> HashSet<usize> {
        self.outstanding.for_job(job)
    }

    /// Requests accepted but not yet finished
    pub fn in_flight(&self) -> u64 {
        self.stats.in_flight.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> LaunchSnapshot {
        LaunchSnapshot {
            submitted: self.stats.submitted.load(Ordering::Relaxed),
            created: self.stats.created.load(Ordering::Relaxed),
            deleted: self.stats.deleted.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
            in_flight: self.stats.in_flight.load(Ordering::SeqCst),
        }
    }

    async fn worker_loop(
        worker_id: usize,
        store: Arc<dyn ObjectStore>,
        rx: Arc<Mutex<mpsc::Receiver<LaunchRequest>>>,
        stats: Arc<LaunchStats>,
        outstanding: Arc<Outstanding>,
        token: CancellationToken,
    ) {
        loop {
            let request = {
                let mut rx = rx.lock().await;
                tokio::select! {
                    biased;
                    _ = token.cancelled() => None,
                    request = rx.recv() => request,
                }
            };
            let Some(request) = request else {
                break;
            };
            let slot = request.slot();
            Self::execute(store.as_ref(), request, &stats).await;
            outstanding.remove(slot.as_ref());
            stats.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
        tracing::debug!(worker_id, "Launch worker stopped");
    }

    async fn execute(store: &dyn ObjectStore, request: LaunchRequest, stats: &LaunchStats) {
        match request {
            LaunchRequest::Create(task) => {
                let owner = task
                    .metadata
                    .job_owner()
                    .map(|o| o.name.clone())
                    .unwrap_or_default();
                match store.create_task(*task).await {
                    Ok(created) => {
                        stats.created.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(
                            task = %created.key(),
                            job = %owner,
                            "Task instance created",
                        );
                    }
                    Err(e) => {
                        stats.failed.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(job = %owner, error = %e, "Failed to create task instance");
                    }
                }
            }
            LaunchRequest::Delete(key) => match store.delete_task(&key).await {
                Ok(()) => {
                    stats.deleted.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(task = %key, "Task instance deletion requested");
                }
                Err(e) if e.is_not_found() => {
                    stats.deleted.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(task = %key, error = %e, "Failed to delete task instance");
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Job, JobSpec, LabelSelector, TaskTemplate};
    use crate::store::InMemoryStore;
    use std::time::Duration;

    async fn drained(launcher: &Launcher) {
        for _ in 0..500 {
            if launcher.in_flight() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("launcher did not drain");
    }

    #[tokio::test]
    async fn creates_and_deletes_through_workers() {
        let store = Arc::new(InMemoryStore::new());
        let launcher = Launcher::start(
            store.clone(),
            &LaunchConfig::default(),
            CancellationToken::new(),
        );
        let job = Job::new("default", "train", JobSpec::default());

        for _ in 0..3 {
            let task = TaskInstance::from_template(&job, &TaskTemplate::default());
            assert!(launcher.create_task(task));
        }
        drained(&launcher).await;
        assert_eq!(store.task_count().unwrap(), 3);

        let tasks = store
            .list_tasks(Some("default"), &LabelSelector::everything())
            .await
            .unwrap();
        assert!(tasks.iter().all(|t| t.metadata.name.starts_with("train-")));

        assert!(launcher.delete_task(tasks[0].key()));
        // already gone counts as done
        assert!(launcher.delete_task(ObjectKey::new("default", "missing")));
        drained(&launcher).await;

        let stats = launcher.stats();
        assert_eq!(stats.submitted, 5);
        assert_eq!(stats.created, 3);
        assert_eq!(stats.deleted, 2);
        assert_eq!(stats.failed, 0);
        assert_eq!(store.task_count().unwrap(), 2);
    }

    #[tokio::test]
    async fn store_failures_are_counted() {
        let store = Arc::new(InMemoryStore::new());
        let launcher = Launcher::start(
            store.clone(),
            &LaunchConfig::default(),
            CancellationToken::new(),
        );
        let job = Job::new("default", "train", JobSpec::default());

        store.inject_failures(1);
        launcher.create_task(TaskInstance::from_template(&job, &TaskTemplate::default()));
        drained(&launcher).await;

        assert_eq!(launcher.stats().failed, 1);
        assert_eq!(store.task_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn stopped_pool_drops_requests() {
        let store = Arc::new(InMemoryStore::new());
        let token = CancellationToken::new();
        token.cancel();
        let config = LaunchConfig {
            workers: 1,
            channel_capacity: 1,
        };
        let launcher = Launcher::start(store, &config, token);

        let accepted = (0..3)
            .filter(|_| launcher.delete_task(ObjectKey::new("default", "a")))
            .count();

        let stats = launcher.stats();
        assert!(accepted <= 1);
        assert_eq!(stats.dropped as usize, 3 - accepted);
    }

    #[tokio::test]
    async fn create_slots_are_outstanding_until_written() {
        let store = Arc::new(InMemoryStore::new());
        let config = LaunchConfig {
            workers: 1,
            channel_capacity: 2,
        };
        let launcher = Launcher::start(store.clone(), &config, CancellationToken::new());
        let job = Job::new("default", "train", JobSpec::default());
        let key = ObjectKey::new("default", "train");

        // no await between submissions, so the worker has not run yet
        for index in 0..3 {
            let task = TaskInstance::from_template(&job, &TaskTemplate::default())
                .with_template_index(index);
            launcher.create_task(task);
        }
        assert_eq!(launcher.outstanding_creates(&key), HashSet::from([0, 1]));
        assert_eq!(launcher.stats().dropped, 1);
        assert!(launcher
            .outstanding_creates(&ObjectKey::new("default", "other"))
            .is_empty());

        drained(&launcher).await;
        assert!(launcher.outstanding_creates(&key).is_empty());
        assert_eq!(store.task_count().unwrap(), 2);
    }
}
