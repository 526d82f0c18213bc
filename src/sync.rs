use std::fmt::Debug;

use tracing::*;

use crate::store::ObjectStore;
use crate::{Error, Result};

pub mod differ;
pub use differ::{Differ, Mutation};

/// What a call to [`sync`] did to the live object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    Created,
    Updated,
    Unchanged,
}

impl SyncOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOutcome::Created => "Created",
            SyncOutcome::Updated => "Updated",
            SyncOutcome::Unchanged => "Unchanged",
        }
    }
}

/// Kind and name of an object, for messages
pub fn describe<K: Differ>(obj: &K) -> (String, String) {
    (
        obj.kind_name(),
        obj.meta().name.clone().unwrap_or_default(),
    )
}

/// Converge the live object towards `desired`.
///
/// Fetches the object, creates it when absent, otherwise applies the owned
/// fields that differ with a single update. Never writes more than once.
pub async fn sync<K, S>(store: &S, desired: K) -> Result<SyncOutcome>
where
    K: Differ + Clone + Debug + Send + Sync + 'static,
    S: ObjectStore<K> + ?Sized,
{
    let (kind, name) = describe(&desired);
    let apply_error = |action: &'static str, e: Error| Error::ApplyError {
        action,
        kind: kind.clone(),
        name: name.clone(),
        source: Box::new(e),
    };

    let existing = store
        .fetch(&name)
        .await
        .map_err(|e| apply_error("get", e))?;
    let Some(mut existing) = existing else {
        debug!("Creating {} {}", kind, name);
        store
            .insert(&desired)
            .await
            .map_err(|e| apply_error("create", e))?;
        return Ok(SyncOutcome::Created);
    };

    match K::diff(&existing, &desired) {
        Some(mutate) => {
            debug!("Updating {} {}", kind, name);
            mutate(&mut existing);
            store
                .update(&existing)
                .await
                .map_err(|e| apply_error("update", e))?;
            Ok(SyncOutcome::Updated)
        }
        None => {
            trace!("{} {} is up to date", kind, name);
            Ok(SyncOutcome::Unchanged)
        }
    }
}

/// Delete an object, treating an already missing object as success
pub async fn ensure_deleted<K, S>(store: &S, kind: &str, name: &str) -> Result<bool>
where
    K: Send + Sync + 'static,
    S: ObjectStore<K> + ?Sized,
{
    let deleted = store.remove(name).await.map_err(|e| Error::ApplyError {
        action: "delete",
        kind: kind.to_string(),
        name: name.to_string(),
        source: Box::new(e),
    })?;
    if deleted {
        debug!("Deleted {} {}", kind, name);
    }
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn cm(data: &[(&str, &str)]) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some("search-postgres".into()),
                ..ObjectMeta::default()
            },
            data: Some(
                data.iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect::<BTreeMap<_, _>>(),
            ),
            ..ConfigMap::default()
        }
    }

    #[tokio::test]
    async fn create_update_then_nothing() {
        let store = MemoryStore::<ConfigMap>::new("ConfigMap");
        assert_eq!(sync(&store, cm(&[("a", "1")])).await.unwrap(), SyncOutcome::Created);
        assert_eq!(sync(&store, cm(&[("a", "2")])).await.unwrap(), SyncOutcome::Updated);
        assert_eq!(sync(&store, cm(&[("a", "2")])).await.unwrap(), SyncOutcome::Unchanged);
        let calls = store.calls();
        assert_eq!((calls.inserts, calls.updates), (1, 1));
    }

    #[tokio::test]
    async fn failed_write_names_the_object() {
        let store = MemoryStore::<ConfigMap>::new("ConfigMap");
        store.fail_writes();
        let err = sync(&store, cm(&[])).await.unwrap_err();
        match &err {
            Error::ApplyError { action, kind, name, .. } => {
                assert_eq!(*action, "create");
                assert_eq!(kind, "ConfigMap");
                assert_eq!(name, "search-postgres");
            }
            other => panic!("unexpected error {other}"),
        }
        assert!(err.to_string().starts_with("failed to create ConfigMap `search-postgres`"));
    }

    #[tokio::test]
    async fn deleting_twice_is_fine() {
        let store = MemoryStore::<ConfigMap>::new("ConfigMap");
        sync(&store, cm(&[])).await.unwrap();
        assert!(ensure_deleted::<ConfigMap, _>(&store, "ConfigMap", "search-postgres").await.unwrap());
        assert!(!ensure_deleted::<ConfigMap, _>(&store, "ConfigMap", "search-postgres").await.unwrap());
    }
}
