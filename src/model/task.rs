use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::job::Job;
use crate::model::meta::{ObjectKey, ObjectMeta, OwnerReference};
use crate::model::TASK_INDEX_LABEL;

/// Lifecycle phase reported by the platform for a task instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl std::fmt::Display for TaskPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskPhase::Pending => write!(f, "Pending"),
            TaskPhase::Running => write!(f, "Running"),
            TaskPhase::Succeeded => write!(f, "Succeeded"),
            TaskPhase::Failed => write!(f, "Failed"),
            TaskPhase::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Template a job launches one instance from. `spec` is passed through to
/// the platform untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskTemplate {
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub finalizers: Vec<String>,
    #[serde(default)]
    pub spec: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatus {
    /// `None` until the platform reports a phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<TaskPhase>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInstance {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: serde_json::Value,
    #[serde(default)]
    pub status: TaskStatus,
}

impl TaskInstance {
    /// Build an unsaved instance of `template` for `job`. The store fills in
    /// the name from the `<job>-` prefix.
    pub fn from_template(job: &Job, template: &TaskTemplate) -> Self {
        let metadata = ObjectMeta {
            namespace: job.metadata.namespace.clone(),
            generate_name: Some(format!("{}-", job.metadata.name)),
            labels: template.labels.clone(),
            annotations: template.annotations.clone(),
            finalizers: template.finalizers.clone(),
            owner_references: vec![OwnerReference::job(
                job.metadata.name.clone(),
                job.metadata.uid,
            )],
            ..Default::default()
        };
        Self {
            metadata,
            spec: template.spec.clone(),
            status: TaskStatus::default(),
        }
    }

    /// Tag the instance with the position of its template in the job spec.
    pub fn with_template_index(mut self, index: usize) -> Self {
        self.metadata
            .labels
            .insert(TASK_INDEX_LABEL.to_string(), index.to_string());
        self
    }

    pub fn template_index(&self) -> Option<usize> {
        self.metadata
            .labels
            .get(TASK_INDEX_LABEL)
            .and_then(|v| v.parse().ok())
    }

    pub fn key(&self) -> ObjectKey {
        self.metadata.key()
    }

    pub fn phase(&self) -> Option<TaskPhase> {
        self.status.phase
    }

    /// Whether `job` is this instance's controlling owner. Matches on uid
    /// when both sides carry one, so a recreated job with the same name does
    /// not adopt its predecessor's instances.
    pub fn is_owned_by(&self, job: &Job) -> bool {
        if self.metadata.namespace != job.metadata.namespace {
            return false;
        }
        self.metadata.job_owner().is_some_and(|owner| {
            owner.name == job.metadata.name
                && match (owner.uid, job.metadata.uid) {
                    (Some(a), Some(b)) => a == b,
                    _ => true,
                }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::job::JobSpec;
    use uuid::Uuid;

    fn template() -> TaskTemplate {
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), "train".to_string());
        let mut annotations = BTreeMap::new();
        annotations.insert("note".to_string(), "x".to_string());
        TaskTemplate {
            labels,
            annotations,
            finalizers: vec!["platform/cleanup".to_string()],
            spec: serde_json::json!({"image": "busybox"}),
        }
    }

    #[test]
    fn from_template_copies_template_and_links_owner() {
        let mut job = Job::new("default", "train", JobSpec::default());
        job.metadata.uid = Some(Uuid::new_v4());

        let task = TaskInstance::from_template(&job, &template());
        assert_eq!(task.metadata.namespace, "default");
        assert!(task.metadata.name.is_empty());
        assert_eq!(task.metadata.generate_name.as_deref(), Some("train-"));
        assert_eq!(task.metadata.labels.get("app").map(String::as_str), Some("train"));
        assert_eq!(task.metadata.annotations.len(), 1);
        assert_eq!(task.metadata.finalizers, vec!["platform/cleanup".to_string()]);
        assert_eq!(task.spec["image"], "busybox");
        assert!(task.phase().is_none());
        assert_eq!(task.template_index(), None);

        let owner = task.metadata.job_owner().unwrap();
        assert!(owner.controller);
        assert_eq!(owner.uid, job.metadata.uid);
        assert!(task.is_owned_by(&job));
    }

    #[test]
    fn ownership_checks_uid_and_namespace() {
        let mut job = Job::new("default", "train", JobSpec::default());
        job.metadata.uid = Some(Uuid::new_v4());
        let task = TaskInstance::from_template(&job, &template());

        let mut recreated = job.clone();
        recreated.metadata.uid = Some(Uuid::new_v4());
        assert!(!task.is_owned_by(&recreated));

        let mut elsewhere = job.clone();
        elsewhere.metadata.namespace = "other".to_string();
        assert!(!task.is_owned_by(&elsewhere));
    }

    #[test]
    fn template_index_is_carried_as_a_label() {
        let job = Job::new("default", "train", JobSpec::default());
        let task = TaskInstance::from_template(&job, &template()).with_template_index(2);
        assert_eq!(task.template_index(), Some(2));
        assert_eq!(task.metadata.labels.get("app").map(String::as_str), Some("train"));

        let mut garbled = task.clone();
        garbled
            .metadata
            .labels
            .insert(crate::model::TASK_INDEX_LABEL.to_string(), "x".to_string());
        assert_eq!(garbled.template_index(), None);
    }
}
