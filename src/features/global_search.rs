//! Global search: the search API reads every managed cluster through a
//! managed service account bound to a cluster-wide read role.

use kube::api::DynamicObject;
use serde_json::json;

use super::{FeatureResource, Target, cluster_permission_resource, managed_service_account_resource};
use crate::ownership::Owner;

pub static SERVICE_ACCOUNT_NAME: &str = "search-global";
pub static PERMISSION_NAME: &str = "search-global";
/// Namespace of the add-on agents on a managed cluster
pub static AGENT_NAMESPACE: &str = "open-cluster-management-agent-addon";

pub fn resources(target: &Target, owner: &Owner) -> Vec<FeatureResource> {
    let Target::ManagedCluster(cluster) = target else {
        return Vec::new();
    };
    vec![
        managed_service_account(SERVICE_ACCOUNT_NAME, cluster, owner),
        cluster_permission(
            PERMISSION_NAME,
            cluster,
            owner,
            json!([{
                "apiGroups": ["*"],
                "resources": ["*"],
                "verbs": ["get", "list", "watch"],
            }]),
            SERVICE_ACCOUNT_NAME,
        ),
    ]
}

/// Token rotated by the add-on and projected into the hub
pub(super) fn managed_service_account(name: &str, cluster: &str, owner: &Owner) -> FeatureResource {
    let resource = managed_service_account_resource();
    let mut object = DynamicObject::new(name, &resource)
        .within(cluster)
        .data(json!({
            "spec": {
                "rotation": {
                    "enabled": true,
                    "validity": "8640h0m0s",
                },
            },
        }));
    owner.adopt(&mut object.metadata);
    FeatureResource { resource, object }
}

/// Cluster role and binding created on the managed cluster for `subject`
pub(super) fn cluster_permission(
    name: &str,
    cluster: &str,
    owner: &Owner,
    rules: serde_json::Value,
    subject: &str,
) -> FeatureResource {
    let resource = cluster_permission_resource();
    let mut object = DynamicObject::new(name, &resource)
        .within(cluster)
        .data(json!({
            "spec": {
                "clusterRole": {
                    "rules": rules,
                },
                "clusterRoleBinding": {
                    "subject": {
                        "kind": "ServiceAccount",
                        "name": subject,
                        "namespace": AGENT_NAMESPACE,
                    },
                },
            },
        }));
    owner.adopt(&mut object.metadata);
    FeatureResource { resource, object }
}
