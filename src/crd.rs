use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{EnvVar, ResourceRequirements, Toleration};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition as K8sCondition;
use kube::CustomResource;
use operator_derive::Conditions;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use crate::config::Component;

pub static SEARCH_FINALIZER: &str = "search.open-cluster-management.io/cleanup";
pub static SEARCH_MANAGER_NAME: &str = "search-operator";

#[skip_serializing_none]
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
#[kube(
    group = "search.open-cluster-management.io",
    version = "v1alpha1",
    kind = "Search",
    derive = "Default",
    namespaced,
    shortname = "srch",
    doc = "Search deploys and configures the search application on the hub",
    printcolumn = r#"{"name":"Database","jsonPath":".status.db","type":"string"}"#,
    printcolumn = r#"{"name":"Storage","jsonPath":".status.storage","type":"string"}"#,
    status = "SearchStatus"
)]
pub struct SearchSpec {
    /// Storage of the database. Without it the database uses an emptyDir volume
    pub db_storage: Option<StorageSpec>,
    /// Image pull secret used by every search workload
    pub image_pull_secret: Option<String>,
    pub image_pull_policy: Option<String>,
    pub node_selector: Option<BTreeMap<String, String>>,
    pub tolerations: Option<Vec<Toleration>>,
    #[serde(default)]
    pub deployments: SearchDeployments,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    pub storage_class_name: Option<String>,
    /// Requested size, e.g. "10Gi"
    pub size: Option<String>,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SearchDeployments {
    pub collector: Option<DeploymentConfig>,
    pub indexer: Option<DeploymentConfig>,
    pub database: Option<DeploymentConfig>,
    #[serde(rename = "queryapi")]
    pub query_api: Option<DeploymentConfig>,
}

impl SearchDeployments {
    pub fn get(&self, component: Component) -> Option<&DeploymentConfig> {
        match component {
            Component::Collector => self.collector.as_ref(),
            Component::Indexer => self.indexer.as_ref(),
            Component::Database => self.database.as_ref(),
            Component::Api => self.query_api.as_ref(),
        }
    }
}

/// Per-workload overrides
#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentConfig {
    pub replica_count: Option<i32>,
    pub resources: Option<ResourceRequirements>,
    pub image_override: Option<String>,
    pub arguments: Option<Vec<String>>,
    pub env: Option<Vec<EnvVar>>,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema, Conditions)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct SearchStatus {
    /// Name of the database deployment
    pub db: Option<String>,
    /// Storage used by the database: a PVC name or "EmptyDir"
    pub storage: Option<String>,
    /// Outcome of the optional features, one condition per feature
    /// - GlobalSearchReady
    /// - VirtualMachineActionsReady
    /// - FineGrainedRbacReady
    pub conditions: Option<Vec<K8sCondition>>,
}

impl Search {
    /// Annotation value as a flag; anything but "true" is off
    pub fn annotation_enabled(&self, key: &str) -> bool {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }
}
