use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{OwnedRwLockWriteGuard, RwLock};

use crate::model::ObjectKey;
use crate::scheduler::queue::PriorityQueue;

pub type SharedQueue = Arc<RwLock<PriorityQueue>>;

/// Named priority queues plus the set of jobs parked as unschedulable.
///
/// Constructed once and shared by both control loops. Queues are created on
/// first reference and retired explicitly once empty.
#[derive(Debug)]
pub struct QueueRegistry {
    queues: RwLock<HashMap<String, SharedQueue>>,
    unschedulable: RwLock<HashSet<ObjectKey>>,
}

impl QueueRegistry {
    /// Create a registry with `default_queue` already present.
    pub fn new(default_queue: &str) -> Self {
        let mut queues = HashMap::new();
        queues.insert(
            default_queue.to_string(),
            Arc::new(RwLock::new(PriorityQueue::new(default_queue))),
        );
        Self {
            queues: RwLock::new(queues),
            unschedulable: RwLock::new(HashSet::new()),
        }
    }

    /// Return the named queue, creating an empty one on first access.
    pub async fn get_or_create(&self, name: &str) -> SharedQueue {
        if let Some(queue) = self.queues.read().await.get(name) {
            return queue.clone();
        }
        let mut queues = self.queues.write().await;
        queues
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::debug!(queue = name, "Queue created");
                Arc::new(RwLock::new(PriorityQueue::new(name)))
            })
            .clone()
    }

    /// Look up a queue without creating it
    pub async fn get(&self, name: &str) -> Option<SharedQueue> {
        self.queues.read().await.get(name).cloned()
    }

    /// Remove a named queue. Any members it still holds are dropped, so
    /// callers retire queues through [`QueueRegistry::retire`].
    pub async fn delete(&self, name: &str) -> Option<SharedQueue> {
        self.queues.write().await.remove(name)
    }

    /// Retire `queue` if it is empty. The caller holds the queue's write
    /// lock, so no member can slip in between the check and the removal;
    /// anyone still holding the old handle sees it as retired and re-resolves.
    pub async fn retire(&self, queue: &mut PriorityQueue) -> bool {
        if !queue.is_empty() {
            return false;
        }
        queue.mark_retired();
        self.delete(queue.name()).await;
        tracing::info!(queue = queue.name(), "Queue retired");
        true
    }

    /// Write-lock the named queue, creating it if needed and skipping
    /// handles that were retired while we waited for the lock.
    pub async fn lock_queue(&self, name: &str) -> OwnedRwLockWriteGuard<PriorityQueue> {
        loop {
            let guard = self.get_or_create(name).await.write_owned().await;
            if !guard.is_retired() {
                return guard;
            }
        }
    }

    /// Names of live queues, sorted
    pub async fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Returns true if the job was newly marked.
    pub async fn mark_unschedulable(&self, key: &ObjectKey) -> bool {
        self.unschedulable.write().await.insert(key.clone())
    }

    /// Returns true if the job was marked.
    pub async fn clear_unschedulable(&self, key: &ObjectKey) -> bool {
        self.unschedulable.write().await.remove(key)
    }

    pub async fn is_unschedulable(&self, key: &ObjectKey) -> bool {
        self.unschedulable.read().await.contains(key)
    }

    pub async fn unschedulable_keys(&self) -> Vec<ObjectKey> {
        let mut keys: Vec<ObjectKey> = self.unschedulable.read().await.iter().cloned().collect();
        keys.sort();
        keys
    }
}
