use std::future::Future;
use std::pin::Pin;

use crate::error::Result;
use crate::model::{Job, ObjectKey, TaskInstance};
use crate::store::ObjectStore;

pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// A stored object that can be re-read and written back with a version check.
pub trait Versioned: Clone + PartialEq + Send + Sync + Sized {
    fn fetch<'a>(store: &'a dyn ObjectStore, key: &'a ObjectKey) -> StoreFuture<'a, Self>;
    fn write<'a>(store: &'a dyn ObjectStore, obj: &'a Self) -> StoreFuture<'a, Self>;
}

impl Versioned for Job {
    fn fetch<'a>(store: &'a dyn ObjectStore, key: &'a ObjectKey) -> StoreFuture<'a, Self> {
        store.get_job(key)
    }

    fn write<'a>(store: &'a dyn ObjectStore, obj: &'a Self) -> StoreFuture<'a, Self> {
        store.update_job(obj)
    }
}

impl Versioned for TaskInstance {
    fn fetch<'a>(store: &'a dyn ObjectStore, key: &'a ObjectKey) -> StoreFuture<'a, Self> {
        store.get_task(key)
    }

    fn write<'a>(store: &'a dyn ObjectStore, obj: &'a Self) -> StoreFuture<'a, Self> {
        store.update_task(obj)
    }
}

#[derive(Debug, Clone)]
pub struct WriteResult<T> {
    /// Latest stored version, whether or not this call wrote it
    pub object: T,
    pub written: bool,
}

/// Read, mutate, and write back only if the mutation changed something.
///
/// `mutate` is re-applied to a fresh read after every version conflict, so
/// it must compute its change from the object it is handed. After
/// `max_retries` conflicts the last conflict is returned and the write is
/// left to the next pass.
pub async fn update_with_retry<T, M>(
    store: &dyn ObjectStore,
    key: &ObjectKey,
    max_retries: u32,
    mut mutate: M,
) -> Result<WriteResult<T>>
where
    T: Versioned,
    M: FnMut(&mut T) + Send,
{
    let mut attempt = 0;
    loop {
        let current = T::fetch(store, key).await?;
        let mut desired = current.clone();
        mutate(&mut desired);
        if desired == current {
            return Ok(WriteResult {
                object: current,
                written: false,
            });
        }

        match T::write(store, &desired).await {
            Ok(object) => {
                return Ok(WriteResult {
                    object,
                    written: true,
                })
            }
            Err(e) if e.is_conflict() && attempt < max_retries => {
                attempt += 1;
                tracing::debug!(key = %key, attempt, "Write conflict, re-reading");
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{JobSpec, TaskPhase, TaskTemplate};
    use crate::store::InMemoryStore;

    async fn seeded_task(store: &InMemoryStore) -> ObjectKey {
        let job = Job::new("default", "train", JobSpec::default());
        let task = TaskInstance::from_template(&job, &TaskTemplate::default());
        store.create_task(task).await.unwrap().key()
    }

    #[tokio::test]
    async fn unchanged_object_is_not_written() {
        let store = InMemoryStore::new();
        let key = seeded_task(&store).await;

        let result = update_with_retry(&store, &key, 3, |_: &mut TaskInstance| {})
            .await
            .unwrap();
        assert!(!result.written);
        assert_eq!(result.object.metadata.resource_version, 1);
    }

    #[tokio::test]
    async fn conflict_reapplies_mutation_to_fresh_read() {
        let store = InMemoryStore::new();
        let key = seeded_task(&store).await;

        let mut calls = 0;
        let result = update_with_retry(&store, &key, 3, |t: &mut TaskInstance| {
            calls += 1;
            if calls == 1 {
                // concurrent status write lands between our read and write
                store.set_task_phase(&key, Some(TaskPhase::Running)).unwrap();
            }
            t.metadata.add_finalizer("example.io/keep");
        })
        .await
        .unwrap();

        assert_eq!(calls, 2);
        assert!(result.written);
        assert_eq!(result.object.phase(), Some(TaskPhase::Running));
        assert!(result.object.metadata.has_finalizer("example.io/keep"));
        assert_eq!(result.object.metadata.resource_version, 3);
    }

    #[tokio::test]
    async fn conflict_is_returned_once_retries_run_out() {
        let store = InMemoryStore::new();
        let key = seeded_task(&store).await;

        let result = update_with_retry(&store, &key, 0, |t: &mut TaskInstance| {
            store.set_task_phase(&key, Some(TaskPhase::Pending)).unwrap();
            t.metadata.add_finalizer("example.io/keep");
        })
        .await;

        assert!(result.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let store = InMemoryStore::new();
        let key = ObjectKey::new("default", "absent");

        let result = update_with_retry(&store, &key, 3, |j: &mut Job| {
            j.spec.level = 1;
        })
        .await;
        assert!(result.unwrap_err().is_not_found());
    }
}
