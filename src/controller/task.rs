use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::ControllerConfig;
use crate::controller::retry::{update_with_retry, WriteResult};
use crate::error::Result;
use crate::model::{Job, ObjectKey, TaskInstance, TaskPhase, SCHEDULING_FINALIZER};
use crate::store::ObjectStore;

/// What the accountant last recorded for one task instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Observation {
    /// Counted under this phase (`None` until the platform reports one)
    Seen(Option<TaskPhase>),
    /// Decrement applied; only the finalizer removal is outstanding
    Retired,
}

/// Task-instance control loop: turns phase transitions into +1/-1 updates of
/// the owning job's counters.
///
/// The first observation of an instance only records a baseline. Each later
/// transition moves one unit between counters. A deletion releases the last
/// counted phase exactly once: the scheduling finalizer gates it, and the
/// `Retired` marker covers a pass that fails between the decrement and the
/// finalizer removal.
pub struct TaskController {
    store: Arc<dyn ObjectStore>,
    last_seen: Mutex<HashMap<ObjectKey, Observation>>,
    max_conflict_retries: u32,
}

impl TaskController {
    pub fn new(store: Arc<dyn ObjectStore>, config: &ControllerConfig) -> Self {
        Self {
            store,
            last_seen: Mutex::new(HashMap::new()),
            max_conflict_retries: config.retry.max_conflict_retries,
        }
    }

    /// Number of instances currently tracked
    pub async fn tracked(&self) -> usize {
        self.last_seen.lock().await.len()
    }

    /// Last phase recorded for an instance, if it is tracked and not retiring.
    pub async fn last_seen(&self, key: &ObjectKey) -> Option<Option<TaskPhase>> {
        match self.last_seen.lock().await.get(key) {
            Some(Observation::Seen(phase)) => Some(*phase),
            _ => None,
        }
    }

    /// Run one pass over the task instance identified by `key`.
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<()> {
        let task = match self.store.get_task(key).await {
            Ok(task) => task,
            Err(e) if e.is_not_found() => {
                self.forget(key).await;
                tracing::debug!(task = %key, "Task instance no longer exists");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        // instances launched by anything else are not ours to count
        let Some(owner) = task.metadata.job_owner() else {
            return Ok(());
        };
        let job_key = ObjectKey::new(task.metadata.namespace.clone(), owner.name.clone());
        let owner_uid = owner.uid;

        let observed = self.last_seen.lock().await.get(key).copied();
        let gated = task.metadata.has_finalizer(SCHEDULING_FINALIZER);

        if task.metadata.is_deleting() {
            match observed {
                Some(Observation::Seen(last)) if gated => {
                    self.sync_job(&job_key, owner_uid, last, None).await?;
                    self.last_seen
                        .lock()
                        .await
                        .insert(key.clone(), Observation::Retired);
                    tracing::debug!(
                        task = %key,
                        job = %job_key,
                        phase = ?last,
                        "Task instance released",
                    );
                    self.release(&task).await
                }
                Some(Observation::Retired) if gated => self.release(&task).await,
                None if gated => {
                    // counted by an earlier process, if at all; the unit stays
                    tracing::warn!(
                        task = %key,
                        job = %job_key,
                        phase = ?task.phase(),
                        "Releasing deleted task instance without a recorded phase",
                    );
                    self.release(&task).await
                }
                _ => {
                    self.forget(key).await;
                    Ok(())
                }
            }
        } else {
            match observed {
                None => self.first_observation(&task).await,
                Some(Observation::Seen(last)) => {
                    let current = task.phase();
                    if current == last {
                        return Ok(());
                    }
                    if !self.sync_job(&job_key, owner_uid, last, current).await? {
                        self.orphaned(&task, &job_key).await?;
                    }
                    self.last_seen
                        .lock()
                        .await
                        .insert(key.clone(), Observation::Seen(current));
                    tracing::debug!(
                        task = %key,
                        job = %job_key,
                        from = ?last,
                        to = ?current,
                        "Task phase changed",
                    );
                    Ok(())
                }
                // deletion marker is never cleared, so a retired instance
                // seen without one is a stale read
                Some(Observation::Retired) => Ok(()),
            }
        }
    }

    /// Attach the finalizer and record the baseline phase without counting it.
    async fn first_observation(&self, task: &TaskInstance) -> Result<()> {
        let key = task.key();
        let result = self
            .update_task(&key, |t| {
                if !t.metadata.is_deleting() {
                    t.metadata.add_finalizer(SCHEDULING_FINALIZER);
                }
            })
            .await;

        let latest = match result {
            Ok(written) => written.object,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        if latest.metadata.is_deleting() {
            // deletion raced the first read; the next pass releases it
            return Ok(());
        }

        self.last_seen
            .lock()
            .await
            .insert(key.clone(), Observation::Seen(latest.phase()));
        tracing::debug!(task = %key, phase = ?latest.phase(), "Task instance observed");
        Ok(())
    }

    /// Apply one transition to the owning job's counters. Returns false when
    /// the job no longer exists, or when a job of the same name but another
    /// uid has replaced it; nothing is counted then.
    async fn sync_job(
        &self,
        job_key: &ObjectKey,
        owner_uid: Option<Uuid>,
        from: Option<TaskPhase>,
        to: Option<TaskPhase>,
    ) -> Result<bool> {
        if from == to {
            return Ok(true);
        }
        let mut consistent = true;
        let mut replaced = false;
        let result = update_with_retry(
            self.store.as_ref(),
            job_key,
            self.max_conflict_retries,
            |job: &mut Job| {
                replaced = owner_uid.is_some() && job.metadata.uid != owner_uid;
                if !replaced {
                    consistent = job.status.apply_transition(from, to);
                }
            },
        )
        .await;

        match result {
            Ok(_) if replaced => {
                tracing::debug!(
                    job = %job_key,
                    from = ?from,
                    to = ?to,
                    "Owning job was replaced, transition not counted",
                );
                Ok(false)
            }
            Ok(_) => {
                if !consistent {
                    tracing::warn!(
                        job = %job_key,
                        from = ?from,
                        to = ?to,
                        "Counter already at zero, left unchanged",
                    );
                }
                Ok(true)
            }
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Remove the scheduling finalizer and stop tracking the instance.
    async fn release(&self, task: &TaskInstance) -> Result<()> {
        let key = task.key();
        match self
            .update_task(&key, |t| {
                t.metadata.remove_finalizer(SCHEDULING_FINALIZER);
            })
            .await
        {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        self.forget(&key).await;
        Ok(())
    }

    /// The owning job is gone; ask for the instance to be deleted too.
    async fn orphaned(&self, task: &TaskInstance, job_key: &ObjectKey) -> Result<()> {
        tracing::info!(
            task = %task.key(),
            job = %job_key,
            "Owning job is gone, deleting task instance",
        );
        match self.store.delete_task(&task.key()).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn forget(&self, key: &ObjectKey) {
        self.last_seen.lock().await.remove(key);
    }

    async fn update_task<M>(&self, key: &ObjectKey, mutate: M) -> Result<WriteResult<TaskInstance>>
    where
        M: FnMut(&mut TaskInstance) + Send,
    {
        update_with_retry(self.store.as_ref(), key, self.max_conflict_retries, mutate).await
    }
}
