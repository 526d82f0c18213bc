//! In-memory stores with call accounting and failure injection.
//!
//! They follow the API server closely enough for reconcile logic: names are
//! unique per store, `resourceVersion` is bumped on every write and an update
//! carrying a stale version is rejected. Status writes are JSON merge patches.

use std::any::{Any, TypeId};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use kube::{
    Resource,
    api::{ApiResource, DynamicObject},
};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Value, json};

use super::{ObjectStore, Scoped, StoreProvider};
use crate::{Error, Result};

/// Number of calls a store has served, per verb
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CallLog {
    pub fetches: usize,
    pub inserts: usize,
    pub updates: usize,
    pub removes: usize,
    pub status_writes: usize,
}

impl CallLog {
    pub fn writes(&self) -> usize {
        self.inserts + self.updates + self.removes + self.status_writes
    }

    fn add(self, other: CallLog) -> CallLog {
        CallLog {
            fetches: self.fetches + other.fetches,
            inserts: self.inserts + other.inserts,
            updates: self.updates + other.updates,
            removes: self.removes + other.removes,
            status_writes: self.status_writes + other.status_writes,
        }
    }
}

struct Inner<K> {
    objects: BTreeMap<String, K>,
    version: u64,
    calls: CallLog,
    fail_writes: bool,
    fail_names: BTreeSet<String>,
}

pub struct MemoryStore<K> {
    kind: String,
    inner: Arc<Mutex<Inner<K>>>,
}

impl<K> Clone for MemoryStore<K> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind.clone(),
            inner: self.inner.clone(),
        }
    }
}

impl<K> MemoryStore<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            inner: Arc::new(Mutex::new(Inner {
                objects: BTreeMap::new(),
                version: 0,
                calls: CallLog::default(),
                fail_writes: false,
                fail_names: BTreeSet::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<K>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Place an object without counting it as a call
    pub fn seed(&self, mut obj: K) -> &Self {
        let mut inner = self.lock();
        inner.version += 1;
        obj.meta_mut().resource_version = Some(inner.version.to_string());
        let name = obj.meta().name.clone().unwrap_or_default();
        inner.objects.insert(name, obj);
        self
    }

    pub fn get(&self, name: &str) -> Option<K> {
        self.lock().objects.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.lock().objects.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn calls(&self) -> CallLog {
        self.lock().calls
    }

    /// Make every following write fail
    pub fn fail_writes(&self) {
        self.lock().fail_writes = true;
    }

    /// Make writes of the named object fail
    pub fn fail_writes_for(&self, name: &str) {
        self.lock().fail_names.insert(name.to_string());
    }

    fn check_write(&self, inner: &Inner<K>, name: &str) -> Result<()> {
        if inner.fail_writes || inner.fail_names.contains(name) {
            return Err(Error::OtherError(format!(
                "injected failure writing {} `{name}`",
                self.kind
            )));
        }
        Ok(())
    }
}

fn object_name<K: Resource>(obj: &K) -> Result<String> {
    obj.meta()
        .name
        .clone()
        .ok_or(Error::MissingObjectKey(".metadata.name"))
}

#[async_trait]
impl<K> ObjectStore<K> for MemoryStore<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn fetch(&self, name: &str) -> Result<Option<K>> {
        let mut inner = self.lock();
        inner.calls.fetches += 1;
        Ok(inner.objects.get(name).cloned())
    }

    async fn fetch_all(&self) -> Result<Vec<K>> {
        let mut inner = self.lock();
        inner.calls.fetches += 1;
        Ok(inner.objects.values().cloned().collect())
    }

    async fn insert(&self, obj: &K) -> Result<K> {
        let name = object_name(obj)?;
        let mut inner = self.lock();
        inner.calls.inserts += 1;
        self.check_write(&inner, &name)?;
        if inner.objects.contains_key(&name) {
            return Err(Error::OtherError(format!(
                "{} `{name}` already exists",
                self.kind
            )));
        }
        inner.version += 1;
        let mut stored = obj.clone();
        stored.meta_mut().resource_version = Some(inner.version.to_string());
        inner.objects.insert(name, stored.clone());
        Ok(stored)
    }

    async fn update(&self, obj: &K) -> Result<K> {
        let name = object_name(obj)?;
        let mut inner = self.lock();
        inner.calls.updates += 1;
        self.check_write(&inner, &name)?;
        let current_version = match inner.objects.get(&name) {
            Some(current) => current.meta().resource_version.clone(),
            None => {
                return Err(Error::OtherError(format!(
                    "{} `{name}` not found",
                    self.kind
                )));
            }
        };
        if obj.meta().resource_version.is_some() && obj.meta().resource_version != current_version
        {
            return Err(Error::ConflictError(format!("{} `{name}`", self.kind)));
        }
        inner.version += 1;
        let mut stored = obj.clone();
        stored.meta_mut().resource_version = Some(inner.version.to_string());
        inner.objects.insert(name, stored.clone());
        Ok(stored)
    }

    async fn remove(&self, name: &str) -> Result<bool> {
        let mut inner = self.lock();
        inner.calls.removes += 1;
        self.check_write(&inner, name)?;
        Ok(inner.objects.remove(name).is_some())
    }

    async fn write_status(&self, name: &str, resource_version: Option<&str>, status: &Value) -> Result<K> {
        let mut inner = self.lock();
        inner.calls.status_writes += 1;
        self.check_write(&inner, name)?;
        let Some(current) = inner.objects.get(name) else {
            return Err(Error::OtherError(format!("{} `{name}` not found", self.kind)));
        };
        if resource_version.is_some() && current.meta().resource_version.as_deref() != resource_version {
            return Err(Error::ConflictError(format!("status of {} `{name}`", self.kind)));
        }
        let mut doc = serde_json::to_value(current).map_err(Error::SerializationError)?;
        json_patch::merge(&mut doc, &json!({ "status": status }));
        let mut stored: K = serde_json::from_value(doc).map_err(Error::SerializationError)?;
        inner.version += 1;
        stored.meta_mut().resource_version = Some(inner.version.to_string());
        inner.objects.insert(name.to_string(), stored.clone());
        Ok(stored)
    }
}

/// Type-erased view of a typed store, for accounting across kinds
trait TrackedStore: Send + Sync {
    fn calls(&self) -> CallLog;
    fn fail_writes(&self);
    fn as_any(&self) -> &dyn Any;
}

impl<K> TrackedStore for MemoryStore<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    fn calls(&self) -> CallLog {
        MemoryStore::calls(self)
    }

    fn fail_writes(&self) {
        MemoryStore::fail_writes(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

type StoreKey = (String, Option<String>);
type TypedKey = (TypeId, Option<String>);

/// [`StoreProvider`] handing out shared in-memory stores
#[derive(Clone, Default)]
pub struct MemoryStores {
    stores: Arc<Mutex<BTreeMap<StoreKey, MemoryStore<DynamicObject>>>>,
    typed: Arc<Mutex<BTreeMap<TypedKey, Box<dyn TrackedStore>>>>,
    failing_namespaces: Arc<Mutex<BTreeSet<String>>>,
}

impl MemoryStores {
    pub fn new() -> Self {
        Self::default()
    }

    /// The store for a kind in a namespace (`None` for cluster scoped kinds)
    pub fn store(&self, resource: &ApiResource, namespace: Option<&str>) -> MemoryStore<DynamicObject> {
        let key = (resource.plural.clone(), namespace.map(str::to_string));
        let mut stores = self.stores.lock().unwrap_or_else(|e| e.into_inner());
        stores
            .entry(key)
            .or_insert_with(|| {
                let store = MemoryStore::new(resource.kind.clone());
                if self.is_failing(namespace) {
                    store.fail_writes();
                }
                store
            })
            .clone()
    }

    /// The store for a typed kind in a namespace (`None` for cluster scoped kinds)
    pub fn typed_store<K: Scoped>(&self, namespace: Option<&str>) -> MemoryStore<K> {
        let key = (TypeId::of::<K>(), namespace.map(str::to_string));
        let mut typed = self.typed.lock().unwrap_or_else(|e| e.into_inner());
        let entry = typed.entry(key).or_insert_with(|| {
            let store = MemoryStore::<K>::new(K::kind(&()).to_string());
            if self.is_failing(namespace) {
                store.fail_writes();
            }
            Box::new(store)
        });
        entry
            .as_any()
            .downcast_ref::<MemoryStore<K>>()
            .cloned()
            .expect("typed stores are keyed by their kind")
    }

    fn is_failing(&self, namespace: Option<&str>) -> bool {
        let failing = self
            .failing_namespaces
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        namespace.is_some_and(|ns| failing.contains(ns))
    }

    /// Make all writes into the namespace fail, for every kind
    pub fn fail_namespace(&self, namespace: &str) {
        self.failing_namespaces
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(namespace.to_string());
        let stores = self.stores.lock().unwrap_or_else(|e| e.into_inner());
        for ((_, ns), store) in stores.iter() {
            if ns.as_deref() == Some(namespace) {
                store.fail_writes();
            }
        }
        let typed = self.typed.lock().unwrap_or_else(|e| e.into_inner());
        for ((_, ns), store) in typed.iter() {
            if ns.as_deref() == Some(namespace) {
                store.fail_writes();
            }
        }
    }

    /// Calls summed over every store handed out so far
    pub fn total_calls(&self) -> CallLog {
        let stores = self.stores.lock().unwrap_or_else(|e| e.into_inner());
        let typed = self.typed.lock().unwrap_or_else(|e| e.into_inner());
        let dynamic = stores
            .values()
            .fold(CallLog::default(), |acc, s| acc.add(s.calls()));
        typed.values().fold(dynamic, |acc, s| acc.add(s.calls()))
    }
}

impl StoreProvider for MemoryStores {
    type Typed<K: Scoped> = MemoryStore<K>;
    type Dynamic = MemoryStore<DynamicObject>;

    fn typed<K: Scoped>(&self, namespace: Option<&str>) -> MemoryStore<K> {
        self.typed_store(namespace)
    }

    fn dynamic(&self, resource: &ApiResource, namespace: Option<&str>) -> MemoryStore<DynamicObject> {
        self.store(resource, namespace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;

    fn cm(name: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.into()),
                ..ObjectMeta::default()
            },
            ..ConfigMap::default()
        }
    }

    #[tokio::test]
    async fn stale_updates_are_rejected() {
        let store = MemoryStore::<ConfigMap>::new("ConfigMap");
        let created = store.insert(&cm("a")).await.unwrap();
        let mut first = created.clone();
        first.data = Some(BTreeMap::from([("k".into(), "1".into())]));
        store.update(&first).await.unwrap();
        // `created` still carries the old version
        assert!(store.update(&created).await.is_err());
        assert_eq!(store.calls().updates, 2);
    }

    #[tokio::test]
    async fn injected_failures_only_hit_writes() {
        let stores = MemoryStores::new();
        let ar = ApiResource::erase::<ConfigMap>(&());
        stores.fail_namespace("broken");
        let broken = stores.dynamic(&ar, Some("broken"));
        let obj = DynamicObject::new("x", &ar).within("broken");
        assert!(broken.insert(&obj).await.is_err());
        assert!(broken.fetch("x").await.unwrap().is_none());

        let fine = stores.dynamic(&ar, Some("fine"));
        assert!(fine.insert(&DynamicObject::new("x", &ar).within("fine")).await.is_ok());
        assert_eq!(stores.total_calls().inserts, 2);
    }
}
