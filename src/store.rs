//! Access to cluster objects.
//!
//! Reconcile logic talks to [`ObjectStore`] instead of `kube::Api` directly so
//! the same code runs against the API server and against in-memory stores in
//! tests. A store is bound to one kind and, for namespaced kinds, one
//! namespace.

use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{ConfigMap, PersistentVolumeClaim, Service, ServiceAccount},
    rbac::v1::{ClusterRole, ClusterRoleBinding},
};
use kube::{
    Api, Client, Resource,
    api::{ApiResource, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams},
};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Value, json};

use crate::crd::Search;
use crate::{Error, Result};

#[cfg(test)]
pub mod memory;

#[async_trait]
pub trait ObjectStore<K>: Send + Sync
where
    K: Send + Sync + 'static,
{
    /// Fetch an object by name; `Ok(None)` when it does not exist
    async fn fetch(&self, name: &str) -> Result<Option<K>>;

    async fn fetch_all(&self) -> Result<Vec<K>>;

    async fn insert(&self, obj: &K) -> Result<K>;

    /// Replace an existing object (the object carries its resourceVersion)
    async fn update(&self, obj: &K) -> Result<K>;

    /// Delete by name; `Ok(false)` when it was already gone
    async fn remove(&self, name: &str) -> Result<bool>;

    /// Merge `status` into the status of the named object. With a
    /// `resource_version` the write fails with [`Error::ConflictError`] when
    /// the object changed since that version was read.
    async fn write_status(&self, name: &str, resource_version: Option<&str>, status: &Value) -> Result<K>;
}

pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 404)
}

pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 409)
}

#[async_trait]
impl<K> ObjectStore<K> for Api<K>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug + Send + Sync + 'static,
{
    async fn fetch(&self, name: &str) -> Result<Option<K>> {
        self.get_opt(name).await.map_err(Error::KubeError)
    }

    async fn fetch_all(&self) -> Result<Vec<K>> {
        let list = self
            .list(&ListParams::default())
            .await
            .map_err(Error::KubeError)?;
        Ok(list.items)
    }

    async fn insert(&self, obj: &K) -> Result<K> {
        self.create(&PostParams::default(), obj)
            .await
            .map_err(Error::KubeError)
    }

    async fn update(&self, obj: &K) -> Result<K> {
        let name = obj
            .meta()
            .name
            .as_deref()
            .ok_or(Error::MissingObjectKey(".metadata.name"))?;
        self.replace(name, &PostParams::default(), obj)
            .await
            .map_err(Error::KubeError)
    }

    async fn remove(&self, name: &str) -> Result<bool> {
        match self.delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(Error::KubeError(e)),
        }
    }

    async fn write_status(&self, name: &str, resource_version: Option<&str>, status: &Value) -> Result<K> {
        let patch = json!({
            "metadata": { "resourceVersion": resource_version },
            "status": status,
        });
        match self
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(obj) => Ok(obj),
            Err(e) if is_conflict(&e) => Err(Error::ConflictError(format!("status of `{name}`"))),
            Err(e) => Err(Error::KubeError(e)),
        }
    }
}

/// Kinds with a compile-time schema, and how to address them
pub trait Scoped:
    Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Debug + Send + Sync + 'static
{
    /// `namespace` is ignored for cluster scoped kinds
    fn api(client: Client, namespace: Option<&str>) -> Api<Self>;
}

macro_rules! namespaced {
    ($($kind:ty),*) => {$(
        impl Scoped for $kind {
            fn api(client: Client, namespace: Option<&str>) -> Api<Self> {
                match namespace {
                    Some(ns) => Api::namespaced(client, ns),
                    None => Api::all(client),
                }
            }
        }
    )*};
}

macro_rules! cluster_scoped {
    ($($kind:ty),*) => {$(
        impl Scoped for $kind {
            fn api(client: Client, _namespace: Option<&str>) -> Api<Self> {
                Api::all(client)
            }
        }
    )*};
}

namespaced!(Search, ServiceAccount, ConfigMap, PersistentVolumeClaim, Service, Deployment);
cluster_scoped!(ClusterRole, ClusterRoleBinding);

/// Hands out stores, cluster scoped (`namespace = None`) or bound to a
/// namespace
pub trait StoreProvider: Send + Sync {
    type Typed<K: Scoped>: ObjectStore<K>;
    type Dynamic: ObjectStore<DynamicObject>;

    fn typed<K: Scoped>(&self, namespace: Option<&str>) -> Self::Typed<K>;

    /// Store for a schema-less kind
    fn dynamic(&self, resource: &ApiResource, namespace: Option<&str>) -> Self::Dynamic;
}

/// [`StoreProvider`] backed by the API server
#[derive(Clone)]
pub struct KubeStores {
    client: Client,
}

impl KubeStores {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl StoreProvider for KubeStores {
    type Typed<K: Scoped> = Api<K>;
    type Dynamic = Api<DynamicObject>;

    fn typed<K: Scoped>(&self, namespace: Option<&str>) -> Api<K> {
        K::api(self.client.clone(), namespace)
    }

    fn dynamic(&self, resource: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, resource),
            None => Api::all_with(self.client.clone(), resource),
        }
    }
}
