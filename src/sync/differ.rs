//! Owned-field comparison per kind.
//!
//! Each kind only compares the fields this operator sets. Anything else on the
//! live object (autoscaler annotations, server defaults, secrets injected by
//! the platform) is neither compared nor touched by the returned mutation.

use std::collections::BTreeMap;

use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{
        Container, ConfigMap, PersistentVolumeClaim, PodSpec, Service, ServiceAccount, Volume,
    },
    rbac::v1::{ClusterRole, ClusterRoleBinding},
};
use kube::{Resource, api::DynamicObject};
use serde::Serialize;
use serde_json::Value;

/// Applies the differing owned fields onto the live object
pub type Mutation<K> = Box<dyn FnOnce(&mut K) + Send>;

pub trait Differ: Resource + Sized {
    fn kind_name(&self) -> String;

    /// `None` when the live object already matches on every owned field
    fn diff(existing: &Self, desired: &Self) -> Option<Mutation<Self>>;
}

macro_rules! static_kind {
    () => {
        fn kind_name(&self) -> String {
            <Self as Resource>::kind(&()).to_string()
        }
    };
}

/// Sort a collection by its JSON rendering so that ordering alone never
/// counts as a change. Absent and empty collections are equal.
pub fn normalized<T: Serialize + Clone>(items: Option<&[T]>) -> Vec<T> {
    let mut items = items.unwrap_or_default().to_vec();
    items.sort_by_cached_key(|i| serde_json::to_string(i).unwrap_or_default());
    items
}

fn same_set<T: Serialize + Clone + PartialEq>(a: Option<&[T]>, b: Option<&[T]>) -> bool {
    normalized(a) == normalized(b)
}

fn non_empty<V>(map: Option<&BTreeMap<String, V>>) -> Option<&BTreeMap<String, V>> {
    map.filter(|m| !m.is_empty())
}

impl Differ for ConfigMap {
    static_kind!();

    fn diff(existing: &Self, desired: &Self) -> Option<Mutation<Self>> {
        let have = existing.data.as_ref();
        let changed: BTreeMap<String, String> = desired
            .data
            .iter()
            .flatten()
            .filter(|(k, v)| have.and_then(|h| h.get(*k)) != Some(*v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if changed.is_empty() {
            return None;
        }
        Some(Box::new(move |cm: &mut ConfigMap| {
            cm.data.get_or_insert_with(BTreeMap::new).extend(changed);
        }))
    }
}

impl Differ for ServiceAccount {
    static_kind!();

    // Pull secrets may be appended by the platform, so only missing desired ones count
    fn diff(existing: &Self, desired: &Self) -> Option<Mutation<Self>> {
        let automount = desired
            .automount_service_account_token
            .filter(|want| existing.automount_service_account_token != Some(*want));
        let have_secrets = existing.image_pull_secrets.as_deref().unwrap_or_default();
        let missing: Vec<_> = desired
            .image_pull_secrets
            .iter()
            .flatten()
            .filter(|s| !have_secrets.contains(s))
            .cloned()
            .collect();
        if automount.is_none() && missing.is_empty() {
            return None;
        }
        Some(Box::new(move |sa: &mut ServiceAccount| {
            if automount.is_some() {
                sa.automount_service_account_token = automount;
            }
            if !missing.is_empty() {
                sa.image_pull_secrets
                    .get_or_insert_with(Vec::new)
                    .extend(missing);
            }
        }))
    }
}

impl Differ for ClusterRole {
    static_kind!();

    fn diff(existing: &Self, desired: &Self) -> Option<Mutation<Self>> {
        if same_set(existing.rules.as_deref(), desired.rules.as_deref()) {
            return None;
        }
        let rules = desired.rules.clone();
        Some(Box::new(move |role: &mut ClusterRole| role.rules = rules))
    }
}

impl Differ for ClusterRoleBinding {
    static_kind!();

    fn diff(existing: &Self, desired: &Self) -> Option<Mutation<Self>> {
        if existing.role_ref == desired.role_ref
            && same_set(existing.subjects.as_deref(), desired.subjects.as_deref())
        {
            return None;
        }
        let role_ref = desired.role_ref.clone();
        let subjects = desired.subjects.clone();
        Some(Box::new(move |binding: &mut ClusterRoleBinding| {
            binding.role_ref = role_ref;
            binding.subjects = subjects;
        }))
    }
}

impl Differ for Service {
    static_kind!();

    fn diff(existing: &Self, desired: &Self) -> Option<Mutation<Self>> {
        let want = desired.spec.as_ref()?;
        let have = existing.spec.as_ref();
        let selector_same =
            non_empty(have.and_then(|s| s.selector.as_ref())) == non_empty(want.selector.as_ref());
        let ports_same = same_set(
            have.and_then(|s| s.ports.as_deref()),
            want.ports.as_deref(),
        );
        if selector_same && ports_same {
            return None;
        }
        let selector = want.selector.clone();
        let ports = want.ports.clone();
        Some(Box::new(move |svc: &mut Service| {
            let spec = svc.spec.get_or_insert_with(Default::default);
            spec.selector = selector;
            spec.ports = ports;
        }))
    }
}

fn container_differs(have: Option<&Container>, want: &Container) -> bool {
    let Some(have) = have else {
        return true;
    };
    have.image != want.image
        || want
            .image_pull_policy
            .as_ref()
            .is_some_and(|p| have.image_pull_policy.as_ref() != Some(p))
        || have.command.as_deref().unwrap_or_default() != want.command.as_deref().unwrap_or_default()
        || have.args.as_deref().unwrap_or_default() != want.args.as_deref().unwrap_or_default()
        || have.env.as_deref().unwrap_or_default() != want.env.as_deref().unwrap_or_default()
        || have.resources != want.resources
        || !same_set(have.volume_mounts.as_deref(), want.volume_mounts.as_deref())
}

// Volumes are matched by name; live volumes the desired spec does not name are kept
fn volumes_differ(have: Option<&[Volume]>, want: Option<&[Volume]>) -> bool {
    let have = have.unwrap_or_default();
    want.unwrap_or_default()
        .iter()
        .any(|w| have.iter().find(|h| h.name == w.name) != Some(w))
}

fn pod_differs(have: Option<&PodSpec>, want: &PodSpec) -> bool {
    let Some(have) = have else {
        return true;
    };
    want.containers.iter().any(|w| {
        container_differs(have.containers.iter().find(|h| h.name == w.name), w)
    }) || (want.service_account_name.is_some()
        && have.service_account_name != want.service_account_name)
        || non_empty(have.node_selector.as_ref()) != non_empty(want.node_selector.as_ref())
        || !same_set(have.tolerations.as_deref(), want.tolerations.as_deref())
        || !same_set(
            have.image_pull_secrets.as_deref(),
            want.image_pull_secrets.as_deref(),
        )
        || volumes_differ(have.volumes.as_deref(), want.volumes.as_deref())
}

fn apply_pod(have: &mut PodSpec, want: PodSpec) {
    for w in want.containers {
        match have.containers.iter().position(|h| h.name == w.name) {
            Some(pos) => {
                let h = &mut have.containers[pos];
                h.image = w.image;
                if w.image_pull_policy.is_some() {
                    h.image_pull_policy = w.image_pull_policy;
                }
                h.command = w.command;
                h.args = w.args;
                h.env = w.env;
                h.resources = w.resources;
                h.volume_mounts = w.volume_mounts;
            }
            None => have.containers.push(w),
        }
    }
    if want.service_account_name.is_some() {
        have.service_account_name = want.service_account_name;
    }
    have.node_selector = want.node_selector;
    have.tolerations = want.tolerations;
    have.image_pull_secrets = want.image_pull_secrets;
    for w in want.volumes.into_iter().flatten() {
        let volumes = have.volumes.get_or_insert_with(Vec::new);
        match volumes.iter().position(|h| h.name == w.name) {
            Some(pos) => volumes[pos] = w,
            None => volumes.push(w),
        }
    }
}

impl Differ for Deployment {
    static_kind!();

    // Replicas are owned only when the desired object sets them
    fn diff(existing: &Self, desired: &Self) -> Option<Mutation<Self>> {
        let want = desired.spec.as_ref()?;
        let have = existing.spec.as_ref();
        let replicas = want
            .replicas
            .filter(|r| have.and_then(|s| s.replicas) != Some(*r));
        let want_pod = want.template.spec.as_ref();
        let have_pod = have.and_then(|s| s.template.spec.as_ref());
        let pod = want_pod.filter(|w| pod_differs(have_pod, w)).cloned();
        if replicas.is_none() && pod.is_none() {
            return None;
        }
        Some(Box::new(move |dep: &mut Deployment| {
            let spec = dep.spec.get_or_insert_with(Default::default);
            if replicas.is_some() {
                spec.replicas = replicas;
            }
            if let Some(pod) = pod {
                apply_pod(spec.template.spec.get_or_insert_with(Default::default), pod);
            }
        }))
    }
}

impl Differ for PersistentVolumeClaim {
    static_kind!();

    // Claims are immutable once bound; only creation is managed
    fn diff(_existing: &Self, _desired: &Self) -> Option<Mutation<Self>> {
        None
    }
}

/// Recursively sort arrays so that two documents differing only in element
/// order compare equal
pub fn normalize_value(value: &Value) -> Value {
    match value {
        Value::Array(items) => {
            let mut items: Vec<Value> = items.iter().map(normalize_value).collect();
            items.sort_by_cached_key(|v| v.to_string());
            Value::Array(items)
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), normalize_value(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

impl Differ for DynamicObject {
    fn kind_name(&self) -> String {
        self.types
            .as_ref()
            .map(|t| t.kind.clone())
            .unwrap_or_else(|| "Object".to_string())
    }

    // Every top-level field of the desired object except `status` is owned
    fn diff(existing: &Self, desired: &Self) -> Option<Mutation<Self>> {
        let want = desired.data.as_object()?;
        let have = existing.data.as_object();
        let changed: Vec<(String, Value)> = want
            .iter()
            .filter(|(k, _)| k.as_str() != "status")
            .filter(|(k, v)| {
                have.and_then(|h| h.get(k.as_str())).map(normalize_value)
                    != Some(normalize_value(v))
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if changed.is_empty() {
            return None;
        }
        Some(Box::new(move |obj: &mut DynamicObject| {
            if !obj.data.is_object() {
                obj.data = Value::Object(serde_json::Map::new());
            }
            if let Some(map) = obj.data.as_object_mut() {
                map.extend(changed);
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::DeploymentSpec;
    use k8s_openapi::api::core::v1::{LocalObjectReference, PodTemplateSpec};
    use k8s_openapi::api::rbac::v1::{RoleRef, Subject};
    use kube::api::{ApiResource, GroupVersionKind, ObjectMeta};
    use serde_json::json;

    fn subject(name: &str) -> Subject {
        Subject {
            kind: "ServiceAccount".into(),
            name: name.into(),
            namespace: Some("ocm".into()),
            ..Subject::default()
        }
    }

    fn binding(subjects: Vec<Subject>) -> ClusterRoleBinding {
        ClusterRoleBinding {
            metadata: ObjectMeta {
                name: Some("search".into()),
                ..ObjectMeta::default()
            },
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".into(),
                kind: "ClusterRole".into(),
                name: "search".into(),
            },
            subjects: Some(subjects),
        }
    }

    #[test]
    fn reordered_subjects_are_not_a_change() {
        let existing = binding(vec![subject("a"), subject("b")]);
        let desired = binding(vec![subject("b"), subject("a")]);
        assert!(ClusterRoleBinding::diff(&existing, &desired).is_none());
    }

    #[test]
    fn changed_subjects_are_replaced() {
        let mut existing = binding(vec![subject("a")]);
        existing.metadata.labels = Some(BTreeMap::from([("team".into(), "x".into())]));
        let desired = binding(vec![subject("a"), subject("c")]);
        let mutate = ClusterRoleBinding::diff(&existing, &desired).expect("needs update");
        mutate(&mut existing);
        assert_eq!(existing.subjects.as_ref().unwrap().len(), 2);
        assert!(existing.metadata.labels.is_some(), "metadata untouched");
    }

    #[test]
    fn config_map_only_compares_desired_keys() {
        let mut existing = ConfigMap {
            data: Some(BTreeMap::from([
                ("postgresql.conf".into(), "ssl = 'on'".into()),
                ("added-by-someone".into(), "x".into()),
            ])),
            ..ConfigMap::default()
        };
        let mut desired = ConfigMap {
            data: Some(BTreeMap::from([("postgresql.conf".into(), "ssl = 'on'".into())])),
            ..ConfigMap::default()
        };
        assert!(ConfigMap::diff(&existing, &desired).is_none());

        desired
            .data
            .as_mut()
            .unwrap()
            .insert("postgresql.conf".into(), "ssl = 'off'".into());
        let mutate = ConfigMap::diff(&existing, &desired).unwrap();
        mutate(&mut existing);
        let data = existing.data.unwrap();
        assert_eq!(data["postgresql.conf"], "ssl = 'off'");
        assert_eq!(data["added-by-someone"], "x");
    }

    #[test]
    fn platform_pull_secrets_are_kept() {
        let pull = |n: &str| LocalObjectReference { name: n.into() };
        let mut existing = ServiceAccount {
            image_pull_secrets: Some(vec![pull("search-pull-secret"), pull("search-dockercfg-x")]),
            ..ServiceAccount::default()
        };
        let desired = ServiceAccount {
            image_pull_secrets: Some(vec![pull("search-pull-secret")]),
            ..ServiceAccount::default()
        };
        assert!(ServiceAccount::diff(&existing, &desired).is_none());

        let desired = ServiceAccount {
            automount_service_account_token: Some(true),
            image_pull_secrets: Some(vec![pull("other")]),
            ..ServiceAccount::default()
        };
        ServiceAccount::diff(&existing, &desired).unwrap()(&mut existing);
        assert_eq!(existing.image_pull_secrets.unwrap().len(), 3);
        assert_eq!(existing.automount_service_account_token, Some(true));
    }

    fn deployment(replicas: i32, image: &str) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some("search-api".into()),
                ..ObjectMeta::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(replicas),
                template: PodTemplateSpec {
                    metadata: None,
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "search-api".into(),
                            image: Some(image.into()),
                            ..Container::default()
                        }],
                        ..PodSpec::default()
                    }),
                },
                ..DeploymentSpec::default()
            }),
            ..Deployment::default()
        }
    }

    #[test]
    fn deployment_ignores_foreign_fields() {
        let mut existing = deployment(2, "api:1");
        existing.metadata.annotations = Some(BTreeMap::from([(
            "autoscaling.alpha.kubernetes.io/current-metrics".into(),
            "[]".into(),
        )]));
        if let Some(pod) = existing.spec.as_mut().unwrap().template.spec.as_mut() {
            pod.containers[0].image_pull_policy = Some("IfNotPresent".into());
            pod.containers.push(Container {
                name: "injected-sidecar".into(),
                ..Container::default()
            });
        }
        assert!(Deployment::diff(&existing, &deployment(2, "api:1")).is_none());
    }

    #[test]
    fn deployment_update_keeps_foreign_fields() {
        let mut existing = deployment(2, "api:1");
        existing.metadata.annotations = Some(BTreeMap::from([("a".into(), "b".into())]));
        let mutate = Deployment::diff(&existing, &deployment(3, "api:2")).unwrap();
        mutate(&mut existing);
        let spec = existing.spec.unwrap();
        assert_eq!(spec.replicas, Some(3));
        assert_eq!(
            spec.template.spec.unwrap().containers[0].image.as_deref(),
            Some("api:2")
        );
        assert!(existing.metadata.annotations.is_some());
    }

    #[test]
    fn volumes_are_matched_by_name() {
        let volume = |name: &str, empty_dir: bool| Volume {
            name: name.into(),
            empty_dir: empty_dir.then(Default::default),
            ..Volume::default()
        };
        let with_volumes = |volumes: Vec<Volume>| {
            let mut d = deployment(1, "db:1");
            if let Some(pod) = d.spec.as_mut().unwrap().template.spec.as_mut() {
                pod.volumes = Some(volumes);
                pod.service_account_name = Some("search-serviceaccount".into());
            }
            d
        };
        let mut existing = with_volumes(vec![volume("injected", true), volume("data", true)]);
        assert!(Deployment::diff(&existing, &with_volumes(vec![volume("data", true)])).is_none());

        let desired = with_volumes(vec![volume("data", false)]);
        Deployment::diff(&existing, &desired).unwrap()(&mut existing);
        let pod = existing.spec.unwrap().template.spec.unwrap();
        let volumes = pod.volumes.unwrap();
        assert_eq!(volumes.len(), 2);
        assert!(volumes.iter().find(|v| v.name == "data").unwrap().empty_dir.is_none());
        assert!(volumes.iter().any(|v| v.name == "injected"));
    }

    #[test]
    fn dynamic_objects_compare_normalized_top_level_fields() {
        let ar = ApiResource::from_gvk(&GroupVersionKind::gvk(
            "rbac.open-cluster-management.io",
            "v1alpha1",
            "ClusterPermission",
        ));
        let mut existing = DynamicObject::new("search-global", &ar).data(json!({
            "spec": {"clusterRole": {"rules": [{"verbs": ["list", "get"]}, {"verbs": ["watch"]}]}},
            "status": {"conditions": []}
        }));
        let desired = DynamicObject::new("search-global", &ar).data(json!({
            "spec": {"clusterRole": {"rules": [{"verbs": ["watch"]}, {"verbs": ["get", "list"]}]}}
        }));
        assert!(DynamicObject::diff(&existing, &desired).is_none());
        assert_eq!(desired.kind_name(), "ClusterPermission");

        let desired = DynamicObject::new("search-global", &ar).data(json!({
            "spec": {"clusterRole": {"rules": [{"verbs": ["get"]}]}}
        }));
        DynamicObject::diff(&existing, &desired).unwrap()(&mut existing);
        assert_eq!(existing.data["spec"], desired.data["spec"]);
        assert!(existing.data.get("status").is_some());
    }
}
