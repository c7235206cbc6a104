use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};

use crate::error::{Result, SchedError};
use crate::model::{Job, ObjectKey};

/// Identity record of a job held by a queue. Authoritative job state lives in
/// the object store; the queue only keeps what it needs for ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedJob {
    pub key: ObjectKey,
    pub level: i32,
    pub created_at: DateTime<Utc>,
}

impl QueuedJob {
    pub fn new(key: ObjectKey, level: i32, created_at: DateTime<Utc>) -> Self {
        Self {
            key,
            level,
            created_at,
        }
    }

    pub fn from_job(job: &Job) -> Self {
        Self {
            key: job.key(),
            level: job.spec.level,
            created_at: job.metadata.creation_timestamp.unwrap_or_else(Utc::now),
        }
    }
}

/// Promotion order: higher level first, then earlier creation. The key breaks
/// any remaining tie so the order is total.
impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .level
            .cmp(&self.level)
            .then_with(|| self.created_at.cmp(&other.created_at))
            .then_with(|| self.key.cmp(&other.key))
    }
}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Pending jobs of one named queue plus the single admitted job.
///
/// A key is either pending or current, never both. Operations never touch the
/// object store.
#[derive(Debug)]
pub struct PriorityQueue {
    name: String,
    order: BTreeSet<QueuedJob>,
    index: HashMap<ObjectKey, QueuedJob>,
    current: Option<QueuedJob>,
    retired: bool,
}

impl PriorityQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            order: BTreeSet::new(),
            index: HashMap::new(),
            current: None,
            retired: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Insert a job into the pending set.
    pub fn admit_pending(&mut self, job: QueuedJob) -> Result<()> {
        let is_current = self.current.as_ref().is_some_and(|c| c.key == job.key);
        if is_current || self.index.contains_key(&job.key) {
            return Err(SchedError::DuplicateKey(job.key.to_string()));
        }
        self.index.insert(job.key.clone(), job.clone());
        self.order.insert(job);
        Ok(())
    }

    /// Look up a pending job by key
    pub fn get(&self, key: &ObjectKey) -> Option<&QueuedJob> {
        self.index.get(key)
    }

    /// Remove a job from the pending set. Returns whether it was present.
    pub fn remove(&mut self, key: &ObjectKey) -> bool {
        match self.index.remove(key) {
            Some(job) => {
                self.order.remove(&job);
                true
            }
            None => false,
        }
    }

    /// Pop the highest-priority pending job into the current slot, replacing
    /// the previous occupant. Leaves the slot empty when nothing is pending.
    pub fn promote_next(&mut self) -> Option<&QueuedJob> {
        self.current = self.order.pop_first();
        if let Some(ref job) = self.current {
            self.index.remove(&job.key);
        }
        self.current.as_ref()
    }

    pub fn peek_current(&self) -> Option<&QueuedJob> {
        self.current.as_ref()
    }

    pub fn is_current(&self, key: &ObjectKey) -> bool {
        self.current.as_ref().is_some_and(|c| &c.key == key)
    }

    /// Number of pending jobs; the current slot is not counted.
    pub fn size(&self) -> usize {
        self.order.len()
    }

    /// True when nothing is pending and the current slot is empty
    pub fn is_empty(&self) -> bool {
        self.order.is_empty() && self.current.is_none()
    }

    /// Pending keys in promotion order
    pub fn pending_keys(&self) -> Vec<ObjectKey> {
        self.order.iter().map(|j| j.key.clone()).collect()
    }

    pub fn is_retired(&self) -> bool {
        self.retired
    }

    pub(crate) fn mark_retired(&mut self) {
        self.retired = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn queued(name: &str, level: i32, secs: i64) -> QueuedJob {
        QueuedJob::new(ObjectKey::new("default", name), level, at(secs))
    }

    #[test]
    fn ordering_prefers_level_then_age() {
        let high = queued("high", 10, 50);
        let old = queued("old", 5, 0);
        let young = queued("young", 5, 10);
        assert!(high < old);
        assert!(old < young);
    }

    #[test]
    fn admit_rejects_duplicates() {
        let mut q = PriorityQueue::new("batch");
        q.admit_pending(queued("a", 1, 0)).unwrap();
        let err = q.admit_pending(queued("a", 1, 0)).unwrap_err();
        assert_eq!(err, SchedError::DuplicateKey("default/a".to_string()));

        q.promote_next();
        // the current occupant is also rejected
        assert!(q.admit_pending(queued("a", 1, 0)).is_err());
    }

    #[test]
    fn remove_absent_is_noop() {
        let mut q = PriorityQueue::new("batch");
        assert!(!q.remove(&ObjectKey::new("default", "ghost")));
        q.admit_pending(queued("a", 1, 0)).unwrap();
        assert!(q.remove(&ObjectKey::new("default", "a")));
        assert_eq!(q.size(), 0);
        assert!(q.get(&ObjectKey::new("default", "a")).is_none());
    }

    #[test]
    fn promote_moves_head_into_current_slot() {
        let mut q = PriorityQueue::new("batch");
        q.admit_pending(queued("low", 1, 0)).unwrap();
        q.admit_pending(queued("high", 9, 5)).unwrap();
        assert_eq!(q.size(), 2);

        let promoted = q.promote_next().map(|j| j.key.name.clone());
        assert_eq!(promoted.as_deref(), Some("high"));
        assert!(q.is_current(&ObjectKey::new("default", "high")));
        assert!(q.get(&ObjectKey::new("default", "high")).is_none());
        assert_eq!(q.size(), 1);

        q.promote_next();
        assert_eq!(
            q.peek_current().map(|j| j.key.name.as_str()),
            Some("low")
        );

        assert!(q.promote_next().is_none());
        assert!(q.peek_current().is_none());
        assert!(q.is_empty());
    }

    #[test]
    fn pending_keys_follow_promotion_order() {
        let mut q = PriorityQueue::new("batch");
        q.admit_pending(queued("j2", 5, 20)).unwrap();
        q.admit_pending(queued("j3", 5, 10)).unwrap();
        q.admit_pending(queued("j4", 7, 30)).unwrap();
        let names: Vec<String> = q.pending_keys().into_iter().map(|k| k.name).collect();
        assert_eq!(names, vec!["j4", "j3", "j2"]);
    }
}
