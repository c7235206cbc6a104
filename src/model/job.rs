use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::meta::{ObjectKey, ObjectMeta};
use crate::model::task::{TaskPhase, TaskTemplate};

/// Aggregate lifecycle phase of a job, derived from its task counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobPhase {
    /// No task instance has been counted yet
    #[default]
    Pending,
    /// Fewer than `minGang` instances are running or succeeded
    Scheduling,
    /// Quorum reached and work still in progress
    Running,
    /// Quorum reached and every counted instance succeeded
    Succeeded,
    /// At least one instance failed or became unreachable
    Failed,
}

impl std::fmt::Display for JobPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobPhase::Pending => write!(f, "Pending"),
            JobPhase::Scheduling => write!(f, "Scheduling"),
            JobPhase::Running => write!(f, "Running"),
            JobPhase::Succeeded => write!(f, "Succeeded"),
            JobPhase::Failed => write!(f, "Failed"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    /// Instances that must be running or succeeded for the gang to count as
    /// admitted.
    #[serde(default)]
    pub min_gang: u32,
    /// Priority level; higher is more urgent.
    #[serde(default)]
    pub level: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
    /// Labels selecting the instances this job owns.
    #[serde(default)]
    pub selector: BTreeMap<String, String>,
    #[serde(default)]
    pub tasks: Vec<TaskTemplate>,
}

/// Persisted status. Counters track the last observed phase of every task
/// instance the accountant has seen for this job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    #[serde(default)]
    pub phase: JobPhase,
    #[serde(default)]
    pub pending: u32,
    #[serde(default)]
    pub running: u32,
    #[serde(default)]
    pub succeeded: u32,
    #[serde(default)]
    pub failed: u32,
    #[serde(default)]
    pub unknown: u32,
}

impl JobStatus {
    pub fn total(&self) -> u32 {
        self.pending + self.running + self.succeeded + self.failed + self.unknown
    }

    fn counter_mut(&mut self, phase: TaskPhase) -> &mut u32 {
        match phase {
            TaskPhase::Pending => &mut self.pending,
            TaskPhase::Running => &mut self.running,
            TaskPhase::Succeeded => &mut self.succeeded,
            TaskPhase::Failed => &mut self.failed,
            TaskPhase::Unknown => &mut self.unknown,
        }
    }

    /// Move one instance from `from` to `to`. An empty side is skipped.
    ///
    /// Counters never drop below zero; a decrement of an empty counter is
    /// reported as `false` so the caller can log the drift.
    pub fn apply_transition(&mut self, from: Option<TaskPhase>, to: Option<TaskPhase>) -> bool {
        if from == to {
            return true;
        }
        let mut consistent = true;
        if let Some(phase) = from {
            let counter = self.counter_mut(phase);
            match counter.checked_sub(1) {
                Some(v) => *counter = v,
                None => consistent = false,
            }
        }
        if let Some(phase) = to {
            *self.counter_mut(phase) += 1;
        }
        consistent
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: JobSpec,
    #[serde(default)]
    pub status: JobStatus,
}

impl Job {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, spec: JobSpec) -> Self {
        Self {
            metadata: ObjectMeta::new(namespace, name),
            spec,
            status: JobStatus::default(),
        }
    }

    pub fn key(&self) -> ObjectKey {
        self.metadata.key()
    }

    /// Queue this job is scheduled through, falling back to `default_queue`
    /// when unset or empty.
    pub fn queue_name<'a>(&'a self, default_queue: &'a str) -> &'a str {
        match self.spec.queue.as_deref() {
            Some(q) if !q.is_empty() => q,
            _ => default_queue,
        }
    }
}
