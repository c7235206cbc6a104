use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::config::ControllerConfig;
use crate::controller::{JobController, Launcher, TaskController};
use crate::dashboard::{run_dashboard, DashboardState};
use crate::error::Result;
use crate::model::{LabelSelector, ObjectKey};
use crate::scheduler::QueueRegistry;
use crate::store::{ObjectStore, ResourceKind, WatchEvent};

/// One identity a control loop can be run for
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    Job(ObjectKey),
    Task(ObjectKey),
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::Job(key) => write!(f, "job {}", key),
            Target::Task(key) => write!(f, "task {}", key),
        }
    }
}

/// Wires the store, the queue registry and both control loops together and
/// feeds them from the store's watch stream.
pub struct Manager {
    pub config: ControllerConfig,
    pub store: Arc<dyn ObjectStore>,
    pub registry: Arc<QueueRegistry>,
    pub launcher: Launcher,
    pub jobs: Arc<JobController>,
    pub tasks: Arc<TaskController>,
    token: CancellationToken,
    /// Identities with a pass running; `true` means another event arrived
    /// meanwhile and one more pass is owed.
    inflight: Mutex<HashMap<Target, bool>>,
}

impl Manager {
    /// Build the manager and start the launcher workers. Must be called
    /// inside a tokio runtime.
    pub fn new(
        store: Arc<dyn ObjectStore>,
        config: ControllerConfig,
        token: CancellationToken,
    ) -> Arc<Self> {
        let registry = Arc::new(QueueRegistry::new(&config.default_queue));
        let launcher = Launcher::start(store.clone(), &config.launch, token.child_token());
        let jobs = Arc::new(JobController::new(
            store.clone(),
            registry.clone(),
            launcher.clone(),
            &config,
        ));
        let tasks = Arc::new(TaskController::new(store.clone(), &config));

        Arc::new(Self {
            config,
            store,
            registry,
            launcher,
            jobs,
            tasks,
            token,
            inflight: Mutex::new(HashMap::new()),
        })
    }

    /// Run until the cancellation token fires.
    ///
    /// 1. Subscribes to the store's watch stream
    /// 2. Queues a pass for every existing job and task instance, rebuilding
    ///    queue state and baselines after a restart
    /// 3. Optionally spawns the dashboard
    /// 4. Dispatches one pass per event until shutdown
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut events = BroadcastStream::new(self.store.watch());
        self.resync().await?;

        if let Some(addr) = self.config.dashboard_addr {
            let state = DashboardState {
                store: self.store.clone(),
                registry: self.registry.clone(),
                launcher: self.launcher.clone(),
            };
            let token = self.token.clone();
            tokio::spawn(async move {
                run_dashboard(addr, state, token).await;
            });
        }

        tracing::info!(
            namespace = self.config.watch_namespace.as_deref().unwrap_or("*"),
            default_queue = %self.config.default_queue,
            workers = self.config.launch.workers,
            "Scheduler started"
        );

        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                item = events.next() => match item {
                    Some(Ok(event)) => self.handle_event(event).await,
                    Some(Err(BroadcastStreamRecvError::Lagged(missed))) => {
                        tracing::warn!(missed, "Watch stream lagged, resyncing");
                        if let Err(e) = self.resync().await {
                            tracing::warn!(error = %e, "Resync failed");
                        }
                    }
                    None => {
                        tracing::warn!("Watch stream closed");
                        break;
                    }
                },
            }
        }

        tracing::info!("Scheduler stopped");
        Ok(())
    }

    async fn handle_event(self: &Arc<Self>, event: WatchEvent) {
        if !self.config.watches(&event.key.namespace) {
            return;
        }
        let target = match event.kind {
            ResourceKind::Job => Target::Job(event.key),
            ResourceKind::Task => Target::Task(event.key),
        };
        self.dispatch(target).await;
    }

    /// Queue a pass for every object currently in the watched namespace.
    pub async fn resync(self: &Arc<Self>) -> Result<()> {
        let namespace = self.config.watch_namespace.as_deref();
        let jobs = self.store.list_jobs(namespace).await?;
        let tasks = self
            .store
            .list_tasks(namespace, &LabelSelector::everything())
            .await?;
        tracing::debug!(jobs = jobs.len(), tasks = tasks.len(), "Resync");

        for task in tasks {
            self.dispatch(Target::Task(task.key())).await;
        }
        for job in jobs {
            self.dispatch(Target::Job(job.key())).await;
        }
        Ok(())
    }

    /// Start a pass for `target` unless one is already running, in which
    /// case that pass runs once more when it finishes. Distinct identities
    /// proceed in parallel; one identity never runs twice at once.
    pub async fn dispatch(self: &Arc<Self>, target: Target) {
        {
            let mut inflight = self.inflight.lock().await;
            if let Some(dirty) = inflight.get_mut(&target) {
                *dirty = true;
                return;
            }
            inflight.insert(target.clone(), false);
        }

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.drive(target).await;
        });
    }

    async fn drive(&self, target: Target) {
        loop {
            self.reconcile_with_requeue(&target).await;

            let mut inflight = self.inflight.lock().await;
            let owed = inflight.get(&target).copied().unwrap_or(false);
            if owed {
                inflight.insert(target.clone(), false);
            } else {
                inflight.remove(&target);
                return;
            }
        }
    }

    async fn reconcile_with_requeue(&self, target: &Target) {
        let delay = Duration::from_millis(self.config.retry.requeue_delay_ms);
        let mut attempt = 0;
        loop {
            let result = match target {
                Target::Job(key) => self.jobs.reconcile(key).await,
                Target::Task(key) => self.tasks.reconcile(key).await,
            };
            let Err(e) = result else {
                return;
            };

            attempt += 1;
            if attempt > self.config.retry.max_requeues {
                tracing::warn!(
                    identity = %target,
                    error = %e,
                    attempts = attempt,
                    "Giving up until next event",
                );
                return;
            }
            tracing::warn!(identity = %target, error = %e, attempt, "Reconcile failed, requeueing");
            tokio::select! {
                _ = self.token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// True when no pass is running and no launch request is outstanding
    pub async fn is_idle(&self) -> bool {
        self.inflight.lock().await.is_empty() && self.launcher.in_flight() == 0
    }
}
