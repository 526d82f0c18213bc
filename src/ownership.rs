//! Ownership of managed objects.
//!
//! Objects living next to the Search carry a controller owner reference and
//! are garbage collected with it. Cluster scoped objects and objects in other
//! namespaces cannot point at a namespaced owner, so they only carry the
//! ownership labels and are removed by the finalizer instead.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};

use crate::crd::Search;
use crate::{Error, Result};

pub static OWNER_NAME_LABEL: &str = "search.open-cluster-management.io/owner-name";
pub static OWNER_NAMESPACE_LABEL: &str = "search.open-cluster-management.io/owner-namespace";
pub static MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

#[derive(Clone, Debug)]
pub struct Owner {
    name: String,
    namespace: String,
    reference: OwnerReference,
}

impl Owner {
    pub fn of(search: &Search) -> Result<Self> {
        let namespace = search
            .namespace()
            .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
        let reference = search
            .controller_owner_ref(&())
            .ok_or(Error::MissingObjectKey(".metadata.uid"))?;
        Ok(Self {
            name: search.name_any(),
            namespace,
            reference,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (OWNER_NAME_LABEL.to_string(), self.name.clone()),
            (OWNER_NAMESPACE_LABEL.to_string(), self.namespace.clone()),
            (MANAGED_BY_LABEL.to_string(), crate::crd::SEARCH_MANAGER_NAME.to_string()),
        ])
    }

    /// Add the ownership labels, without an owner reference
    pub fn label(&self, meta: &mut ObjectMeta) {
        meta.labels.get_or_insert_with(BTreeMap::new).extend(self.labels());
    }

    /// Label the object and, when it shares the owner's namespace, add the
    /// controller owner reference
    pub fn adopt(&self, meta: &mut ObjectMeta) {
        self.label(meta);
        if meta.namespace.as_deref() != Some(self.namespace.as_str()) {
            return;
        }
        let refs = meta.owner_references.get_or_insert_with(Vec::new);
        if !refs.iter().any(|r| r.uid == self.reference.uid) {
            refs.push(self.reference.clone());
        }
    }

    /// Whether the object was labelled by this owner
    pub fn owns(&self, meta: &ObjectMeta) -> bool {
        let labels = meta.labels.as_ref();
        let get = |key: &str| labels.and_then(|l| l.get(key)).map(String::as_str);
        get(OWNER_NAME_LABEL) == Some(self.name.as_str())
            && get(OWNER_NAMESPACE_LABEL) == Some(self.namespace.as_str())
    }
}
