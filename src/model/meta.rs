use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{JOB_API_VERSION, JOB_KIND};

/// Namespaced identity of a cluster object. Immutable after creation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Link from a task instance back to the job that launched it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: Option<Uuid>,
    #[serde(default)]
    pub controller: bool,
}

impl OwnerReference {
    /// Controlling owner link to a job with the given name and uid.
    pub fn job(name: impl Into<String>, uid: Option<Uuid>) -> Self {
        Self {
            api_version: JOB_API_VERSION.to_string(),
            kind: JOB_KIND.to_string(),
            name: name.into(),
            uid,
            controller: true,
        }
    }

    /// Whether this link points at a job managed by this scheduler.
    pub fn is_job(&self) -> bool {
        self.api_version == JOB_API_VERSION && self.kind == JOB_KIND
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,
    /// Prefix used by the store to generate `name` when it is empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generate_name: Option<String>,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<Uuid>,
    /// Version token for compare-and-swap updates. Bumped by the store on
    /// every successful write.
    #[serde(default)]
    pub resource_version: u64,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub finalizers: Vec<String>,
    #[serde(default)]
    pub owner_references: Vec<OwnerReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
    /// Set once when deletion is requested; never cleared or moved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace.clone(), self.name.clone())
    }

    pub fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }

    /// Returns true if the finalizer was added.
    pub fn add_finalizer(&mut self, finalizer: &str) -> bool {
        if self.has_finalizer(finalizer) {
            return false;
        }
        self.finalizers.push(finalizer.to_string());
        true
    }

    /// Returns true if the finalizer was present.
    pub fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        let before = self.finalizers.len();
        self.finalizers.retain(|f| f != finalizer);
        before != self.finalizers.len()
    }

    /// First owner link that points at a scheduler job.
    pub fn job_owner(&self) -> Option<&OwnerReference> {
        self.owner_references.iter().find(|o| o.is_job())
    }
}

/// Equality-based label selector. An empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
}

impl LabelSelector {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v))
    }
}

impl From<BTreeMap<String, String>> for LabelSelector {
    fn from(match_labels: BTreeMap<String, String>) -> Self {
        Self { match_labels }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_display() {
        assert_eq!(ObjectKey::new("default", "train").to_string(), "default/train");
    }

    #[test]
    fn finalizers_are_idempotent() {
        let mut meta = ObjectMeta::new("default", "a");
        assert!(meta.add_finalizer("x"));
        assert!(!meta.add_finalizer("x"));
        assert_eq!(meta.finalizers, vec!["x".to_string()]);
        assert!(meta.remove_finalizer("x"));
        assert!(!meta.remove_finalizer("x"));
        assert!(meta.finalizers.is_empty());
    }

    #[test]
    fn job_owner_ignores_foreign_links() {
        let mut meta = ObjectMeta::new("default", "pod-1");
        meta.owner_references.push(OwnerReference {
            api_version: "apps/v1".into(),
            kind: "ReplicaSet".into(),
            name: "web".into(),
            uid: None,
            controller: true,
        });
        assert!(meta.job_owner().is_none());

        meta.owner_references.push(OwnerReference::job("train", None));
        assert_eq!(meta.job_owner().map(|o| o.name.as_str()), Some("train"));
    }

    #[test]
    fn selector_matching() {
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), "train".to_string());
        labels.insert("tier".to_string(), "gpu".to_string());

        assert!(LabelSelector::everything().matches(&labels));

        let mut wanted = BTreeMap::new();
        wanted.insert("app".to_string(), "train".to_string());
        assert!(LabelSelector::from(wanted.clone()).matches(&labels));

        wanted.insert("tier".to_string(), "cpu".to_string());
        assert!(!LabelSelector::from(wanted).matches(&labels));
    }
}
