use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;

use crate::config::ControllerConfig;
use crate::controller::launcher::Launcher;
use crate::controller::retry::{update_with_retry, WriteResult};
use crate::error::{Result, SchedError};
use crate::model::{
    Job, JobPhase, LabelSelector, ObjectKey, TaskInstance, TaskPhase, SCHEDULING_FINALIZER,
};
use crate::scheduler::{derive_phase, PriorityQueue, QueueRegistry, QueuedJob};
use crate::store::ObjectStore;

/// Job control loop: derives each job's phase and drives its queue.
///
/// Every pass re-reads the job, decides against the in-process queue state,
/// and writes back only what changed. Task creation and deletion go through
/// the [`Launcher`] and are never awaited.
///
/// Launching is idempotent: each instance carries its template index, and a
/// launch only submits templates with neither a stored instance nor an
/// outstanding create. A launch that fails leaves the job in the queue's
/// slot and in the owed set; the next pass over any job of that queue
/// retries it before doing anything else.
pub struct JobController {
    store: Arc<dyn ObjectStore>,
    registry: Arc<QueueRegistry>,
    launcher: Launcher,
    default_queue: String,
    max_conflict_retries: u32,
    owed: Mutex<HashSet<ObjectKey>>,
}

impl JobController {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        registry: Arc<QueueRegistry>,
        launcher: Launcher,
        config: &ControllerConfig,
    ) -> Self {
        Self {
            store,
            registry,
            launcher,
            default_queue: config.default_queue.clone(),
            max_conflict_retries: config.retry.max_conflict_retries,
            owed: Mutex::new(HashSet::new()),
        }
    }

    /// Whether an admitted job still has a launch to be retried
    pub async fn launch_owed(&self, key: &ObjectKey) -> bool {
        self.owed.lock().await.contains(key)
    }

    /// Run one pass over the job identified by `key`.
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<()> {
        let job = match self.store.get_job(key).await {
            Ok(job) => job,
            Err(e) if e.is_not_found() => {
                tracing::debug!(job = %key, "Job no longer exists");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let queue_name = job.queue_name(&self.default_queue).to_string();

        if job.metadata.is_deleting() {
            return self.on_delete(&job, &queue_name).await;
        }
        if !job.metadata.has_finalizer(SCHEDULING_FINALIZER) {
            return self.on_create(&job, &queue_name).await;
        }

        let phase = derive_phase(&job.status, job.spec.min_gang);
        if phase != job.status.phase {
            tracing::info!(
                job = %key,
                from = %job.status.phase,
                to = %phase,
                pending = job.status.pending,
                running = job.status.running,
                succeeded = job.status.succeeded,
                failed = job.status.failed,
                unknown = job.status.unknown,
                "Job phase changed"
            );
        }

        if phase == JobPhase::Failed {
            self.release_failed(&job).await?;
        }
        self.transition(&job, &queue_name, phase).await?;

        // counters may have moved since the read above; derive from the fresh copy
        self.update_job(key, |j| {
            j.status.phase = derive_phase(&j.status, j.spec.min_gang);
        })
        .await?;
        Ok(())
    }

    async fn on_create(&self, job: &Job, queue_name: &str) -> Result<()> {
        let key = job.key();
        let created_at = job.metadata.creation_timestamp.unwrap_or_else(Utc::now);
        {
            let mut queue = self.registry.lock_queue(queue_name).await;
            self.resume_launch(&queue, &key).await?;
            if !queue.is_current(&key) && queue.get(&key).is_none() {
                queue.admit_pending(QueuedJob::new(key.clone(), job.spec.level, created_at))?;
            }
        }

        self.update_job(&key, |j| {
            j.metadata.creation_timestamp.get_or_insert(created_at);
            j.metadata.add_finalizer(SCHEDULING_FINALIZER);
            j.status.phase = JobPhase::Pending;
        })
        .await?;

        tracing::info!(
            job = %key,
            queue = queue_name,
            level = job.spec.level,
            min_gang = job.spec.min_gang,
            tasks = job.spec.tasks.len(),
            "Job created"
        );
        Ok(())
    }

    async fn on_delete(&self, job: &Job, queue_name: &str) -> Result<()> {
        let key = job.key();
        for task in self.owned_tasks(job).await? {
            if !task.metadata.is_deleting() {
                self.launcher.delete_task(task.key());
            }
        }

        {
            let mut queue = self.registry.lock_queue(queue_name).await;
            self.resume_launch(&queue, &key).await?;
            if queue.is_current(&key) {
                self.advance(&mut queue).await?;
            } else {
                queue.remove(&key);
                self.retire_if_idle(&mut queue).await;
            }
        }
        self.owed.lock().await.remove(&key);
        self.registry.clear_unschedulable(&key).await;

        match self
            .update_job(&key, |j| {
                j.metadata.remove_finalizer(SCHEDULING_FINALIZER);
            })
            .await
        {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        tracing::info!(job = %key, queue = queue_name, "Job deleted");
        Ok(())
    }

    /// Request deletion of every instance that has not itself failed; failed
    /// ones are kept for inspection.
    async fn release_failed(&self, job: &Job) -> Result<()> {
        for task in self.owned_tasks(job).await? {
            if task.phase() != Some(TaskPhase::Failed) && !task.metadata.is_deleting() {
                self.launcher.delete_task(task.key());
            }
        }
        if self.registry.mark_unschedulable(&job.key()).await {
            tracing::warn!(
                job = %job.key(),
                failed = job.status.failed,
                unknown = job.status.unknown,
                "Job failed, marked unschedulable"
            );
        }
        Ok(())
    }

    async fn transition(&self, job: &Job, queue_name: &str, phase: JobPhase) -> Result<()> {
        let key = job.key();
        let mut queue = self.registry.lock_queue(queue_name).await;
        self.resume_launch(&queue, &key).await?;
        let is_current = queue.is_current(&key);

        match phase {
            JobPhase::Failed => {
                if is_current {
                    self.advance(&mut queue).await?;
                } else {
                    queue.remove(&key);
                    self.retire_if_idle(&mut queue).await;
                }
            }
            // A finished gang holding the slot releases it like a running one.
            // One that is not current is dropped from the pending set rather
            // than re-registered: readmitting it would launch the gang again.
            JobPhase::Running | JobPhase::Succeeded => {
                if is_current {
                    tracing::info!(
                        job = %key,
                        queue = queue_name,
                        phase = %phase,
                        "Job reached quorum, releasing queue",
                    );
                    self.advance(&mut queue).await?;
                } else {
                    if queue.remove(&key) {
                        tracing::debug!(
                            job = %key,
                            queue = queue_name,
                            "Dropped stale pending entry",
                        );
                    }
                    self.retire_if_idle(&mut queue).await;
                }
            }
            JobPhase::Pending => {
                if self.registry.is_unschedulable(&key).await {
                    tracing::debug!(job = %key, "Job is parked as unschedulable");
                } else if is_current {
                    // nothing counted yet; create whatever a lost launch left out
                    self.ensure_launched(&key).await?;
                } else if queue.get(&key).is_none() {
                    queue.admit_pending(QueuedJob::from_job(job))?;
                }
                if queue.peek_current().is_none() {
                    self.advance(&mut queue).await?;
                }
            }
            JobPhase::Scheduling => {
                if !is_current && queue.get(&key).is_none() {
                    queue.admit_pending(QueuedJob::from_job(job))?;
                }
                if self.registry.clear_unschedulable(&key).await {
                    tracing::info!(job = %key, "Job no longer unschedulable");
                }
            }
        }
        Ok(())
    }

    /// Promote the next schedulable pending job and launch it, or retire the
    /// queue when nothing is left.
    async fn advance(&self, queue: &mut PriorityQueue) -> Result<()> {
        if let Some(leaving) = queue.peek_current() {
            self.owed.lock().await.remove(&leaving.key);
        }
        loop {
            let next = queue.promote_next().cloned();
            match next {
                Some(next) if self.registry.is_unschedulable(&next.key).await => {
                    tracing::info!(
                        job = %next.key,
                        queue = queue.name(),
                        "Skipping unschedulable job",
                    );
                }
                Some(next) => {
                    tracing::info!(
                        job = %next.key,
                        queue = queue.name(),
                        level = next.level,
                        "Job admitted",
                    );
                    return self.ensure_launched(&next.key).await;
                }
                None => {
                    tracing::debug!(queue = queue.name(), "No pending jobs left");
                    self.retire_if_idle(queue).await;
                    return Ok(());
                }
            }
        }
    }

    /// Retry the launch of the queue's current job if an earlier one failed.
    /// `key` is the job this pass is for; its own branch handles it.
    async fn resume_launch(&self, queue: &PriorityQueue, key: &ObjectKey) -> Result<()> {
        let Some(current) = queue.peek_current() else {
            return Ok(());
        };
        if current.key == *key || !self.launch_owed(&current.key).await {
            return Ok(());
        }
        tracing::info!(job = %current.key, queue = queue.name(), "Retrying launch");
        self.ensure_launched(&current.key).await
    }

    /// Launch `key`, recording it as owed when the launch does not complete.
    async fn ensure_launched(&self, key: &ObjectKey) -> Result<()> {
        match self.launch(key).await {
            Ok(()) => {
                self.owed.lock().await.remove(key);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(job = %key, error = %e, "Launch incomplete, will retry");
                self.owed.lock().await.insert(key.clone());
                Err(e)
            }
        }
    }

    /// Submit one create request per task template that has neither an
    /// instance in the store nor a create in flight.
    async fn launch(&self, key: &ObjectKey) -> Result<()> {
        let job = match self.store.get_job(key).await {
            Ok(job) => job,
            Err(e) if e.is_not_found() => {
                tracing::debug!(job = %key, "Admitted job no longer exists");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if job.metadata.is_deleting() {
            tracing::debug!(job = %key, "Admitted job is being deleted, skipping launch");
            return Ok(());
        }

        // read before listing: a create that finishes in between is then
        // visible in the listing
        let outstanding = self.launcher.outstanding_creates(key);
        let existing: HashSet<usize> = self
            .store
            .list_tasks(Some(&job.metadata.namespace), &LabelSelector::everything())
            .await?
            .iter()
            .filter(|t| t.is_owned_by(&job))
            .filter_map(TaskInstance::template_index)
            .collect();

        let mut submitted = 0;
        let mut dropped = 0;
        for (index, template) in job.spec.tasks.iter().enumerate() {
            if existing.contains(&index) || outstanding.contains(&index) {
                continue;
            }
            let task = TaskInstance::from_template(&job, template).with_template_index(index);
            if self.launcher.create_task(task) {
                submitted += 1;
            } else {
                dropped += 1;
            }
        }

        if submitted + dropped > 0 {
            tracing::info!(
                job = %key,
                tasks = job.spec.tasks.len(),
                submitted,
                dropped,
                "Launching job tasks",
            );
        }
        if dropped > 0 {
            return Err(SchedError::LaunchIncomplete {
                job: key.to_string(),
                dropped,
            });
        }
        Ok(())
    }

    async fn retire_if_idle(&self, queue: &mut PriorityQueue) {
        if queue.name() != self.default_queue && queue.is_empty() {
            self.registry.retire(queue).await;
        }
    }

    async fn owned_tasks(&self, job: &Job) -> Result<Vec<TaskInstance>> {
        let selector = LabelSelector::from(job.spec.selector.clone());
        let tasks = self
            .store
            .list_tasks(Some(&job.metadata.namespace), &selector)
            .await?;
        Ok(tasks.into_iter().filter(|t| t.is_owned_by(job)).collect())
    }

    async fn update_job<M>(&self, key: &ObjectKey, mutate: M) -> Result<WriteResult<Job>>
    where
        M: FnMut(&mut Job) + Send,
    {
        update_with_retry(self.store.as_ref(), key, self.max_conflict_retries, mutate).await
    }
}
