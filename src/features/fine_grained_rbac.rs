use k8s_openapi::api::rbac::v1::ClusterRole;
use kube::api::{ApiResource, DynamicObject};
use serde_json::json;

use super::FeatureResource;
use crate::ownership::Owner;

pub static CLUSTER_ROLE_NAME: &str = "search-fine-grained-rbac";

/// Hub role letting the search API resolve per-namespace permissions of
/// virtual machine users
pub fn resources(owner: &Owner) -> Vec<FeatureResource> {
    let resource = ApiResource::erase::<ClusterRole>(&());
    let mut object = DynamicObject::new(CLUSTER_ROLE_NAME, &resource).data(json!({
        "rules": [
            {
                "apiGroups": ["clusterview.open-cluster-management.io"],
                "resources": ["kubevirtprojects", "userpermissions"],
                "verbs": ["list", "get"],
            },
            {
                "apiGroups": ["rbac.open-cluster-management.io"],
                "resources": ["clusterpermissions"],
                "verbs": ["get", "list", "watch"],
            },
        ],
    }));
    owner.adopt(&mut object.metadata);
    vec![FeatureResource { resource, object }]
}
