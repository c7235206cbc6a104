use std::net::SocketAddr;

/// Queue used by jobs that do not name one.
pub const DEFAULT_QUEUE: &str = "default";

/// Configuration for the background launch/delete worker pool.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    /// Number of worker tasks draining the request channel
    pub workers: usize,
    /// Capacity of the request channel. Requests submitted while it is full
    /// are dropped and counted, never awaited.
    pub channel_capacity: usize,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            channel_capacity: 256,
        }
    }
}

/// Retry policy for optimistic writes and failed reconcile passes.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Re-read and retry attempts after a version conflict before the write
    /// is deferred to the next pass.
    pub max_conflict_retries: u32,
    /// Delay before a failed pass over an identity is re-run.
    pub requeue_delay_ms: u64,
    /// Re-runs of a failed pass before it is dropped until the next event.
    pub max_requeues: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_conflict_retries: 3,
            requeue_delay_ms: 500,
            max_requeues: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// When set, events for objects outside this namespace are ignored.
    pub watch_namespace: Option<String>,
    pub default_queue: String,
    pub launch: LaunchConfig,
    pub retry: RetryConfig,
    pub dashboard_addr: Option<SocketAddr>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            watch_namespace: None,
            default_queue: DEFAULT_QUEUE.to_string(),
            launch: LaunchConfig::default(),
            retry: RetryConfig::default(),
            dashboard_addr: None,
        }
    }
}

impl ControllerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.watch_namespace = Some(namespace.into());
        self
    }

    pub fn with_default_queue(mut self, queue: impl Into<String>) -> Self {
        self.default_queue = queue.into();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.launch.workers = workers.max(1);
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.launch.channel_capacity = capacity.max(1);
        self
    }

    pub fn with_dashboard(mut self, addr: SocketAddr) -> Self {
        self.dashboard_addr = Some(addr);
        self
    }

    /// Whether events for an object in `namespace` should be processed.
    pub fn watches(&self, namespace: &str) -> bool {
        self.watch_namespace
            .as_deref()
            .map_or(true, |ns| ns == namespace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_config_default() {
        let cfg = LaunchConfig::default();
        assert_eq!(cfg.workers, 4);
        assert_eq!(cfg.channel_capacity, 256);
    }

    #[test]
    fn retry_config_default() {
        let cfg = RetryConfig::default();
        assert_eq!(cfg.max_conflict_retries, 3);
        assert_eq!(cfg.requeue_delay_ms, 500);
        assert_eq!(cfg.max_requeues, 5);
    }

    #[test]
    fn controller_config_default() {
        let cfg = ControllerConfig::default();
        assert!(cfg.watch_namespace.is_none());
        assert_eq!(cfg.default_queue, "default");
        assert!(cfg.dashboard_addr.is_none());
    }

    #[test]
    fn controller_config_builders() {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let cfg = ControllerConfig::new()
            .with_namespace("batch")
            .with_default_queue("main")
            .with_workers(0)
            .with_channel_capacity(0)
            .with_dashboard(addr);
        assert_eq!(cfg.watch_namespace.as_deref(), Some("batch"));
        assert_eq!(cfg.default_queue, "main");
        // at least one worker is always kept
        assert_eq!(cfg.launch.workers, 1);
        assert_eq!(cfg.launch.channel_capacity, 1);
        assert_eq!(cfg.dashboard_addr, Some(addr));
    }

    #[test]
    fn namespace_filter() {
        let all = ControllerConfig::default();
        assert!(all.watches("default"));
        assert!(all.watches("team-a"));

        let scoped = ControllerConfig::default().with_namespace("default");
        assert!(scoped.watches("default"));
        assert!(!scoped.watches("team-a"));
    }
}
