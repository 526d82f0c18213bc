//! Virtual machine actions: start, stop, restart, pause and unpause virtual
//! machines on managed clusters from the search UI.

use serde_json::json;

use super::global_search::{cluster_permission, managed_service_account};
use super::{FeatureResource, Target};
use crate::ownership::Owner;

pub static SERVICE_ACCOUNT_NAME: &str = "vm-actor";
pub static PERMISSION_NAME: &str = "vm-actions";

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
                "apiGroups": ["subresources.kubevirt.io"],
                "resources": [
                    "virtualmachines/start",
                    "virtualmachines/stop",
                    "virtualmachines/restart",
                    "virtualmachineinstances/pause",
                    "virtualmachineinstances/unpause",
                ],
                "verbs": ["update"],
            }]),
            SERVICE_ACCOUNT_NAME,
        ),
    ]
}
