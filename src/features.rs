//! Optional features toggled by annotations on the Search.
//!
//! Each feature owns a set of resources, either in every managed cluster
//! namespace or on the hub, and reports its outcome through one condition.
//! The condition is only written once every target reached the desired state.

use std::collections::BTreeSet;

use k8s_openapi::api::core::v1::EnvVar;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition as K8sCondition;
use kube::{
    ResourceExt,
    api::{ApiResource, DynamicObject, GroupVersionKind},
};
use tracing::*;

use crate::aggregate::ErrorAggregate;
use crate::conditions::{ConditionStatus, Conditions, new_condition};
use crate::crd::Search;
use crate::document::{Document, FieldError};
use crate::ownership::Owner;
use crate::store::{ObjectStore, StoreProvider};
use crate::sync::{self, SyncOutcome};
use crate::{Error, Result};

pub mod fine_grained_rbac;
pub mod global_search;
pub mod virtual_machine;


pub const REASON_ENABLED: &str = "FeatureEnabled";
pub const REASON_DISABLED: &str = "FeatureDisabled";
pub const MANAGED_SERVICE_ACCOUNT_ADDON: &str = "managed-serviceaccount";
/// Name used in error labels for features that live on the hub
pub const HUB_TARGET: &str = "hub";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FeatureKind {
    GlobalSearch,
    VirtualMachineActions,
    FineGrainedRbac,
}

/// Where the resources of a feature live
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scope {
    ManagedClusters,
    Hub,
}

impl FeatureKind {
    pub const ALL: [FeatureKind; 3] = [
        FeatureKind::GlobalSearch,
        FeatureKind::VirtualMachineActions,
        FeatureKind::FineGrainedRbac,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            FeatureKind::GlobalSearch => "GlobalSearch",
            FeatureKind::VirtualMachineActions => "VirtualMachineActions",
            FeatureKind::FineGrainedRbac => "FineGrainedRbac",
        }
    }

    pub fn annotation(&self) -> &'static str {
        match self {
            FeatureKind::GlobalSearch => "global-search-preview",
            FeatureKind::VirtualMachineActions => "virtual-machine-preview",
            FeatureKind::FineGrainedRbac => "fine-grained-rbac-preview",
        }
    }

    pub fn condition_type(&self) -> &'static str {
        match self {
            FeatureKind::GlobalSearch => "GlobalSearchReady",
            FeatureKind::VirtualMachineActions => "VirtualMachineActionsReady",
            FeatureKind::FineGrainedRbac => "FineGrainedRbacReady",
        }
    }

    /// Environment flag handed to the search API when the feature is on
    pub fn env_flag(&self) -> &'static str {
        match self {
            FeatureKind::GlobalSearch => "FEATURE_GLOBAL_SEARCH",
            FeatureKind::VirtualMachineActions => "FEATURE_VIRTUAL_MACHINE",
            FeatureKind::FineGrainedRbac => "FEATURE_FINE_GRAINED_RBAC",
        }
    }

    pub fn required_addons(&self) -> &'static [&'static str] {
        match self {
            FeatureKind::GlobalSearch | FeatureKind::VirtualMachineActions => {
                &[MANAGED_SERVICE_ACCOUNT_ADDON]
            }
            FeatureKind::FineGrainedRbac => &[],
        }
    }

    /// MultiClusterEngine components that must be enabled
    pub fn required_components(&self) -> &'static [&'static str] {
        match self {
            FeatureKind::GlobalSearch => &["managedserviceaccount", "cluster-proxy-addon"],
            FeatureKind::VirtualMachineActions => &["managedserviceaccount", "cluster-permission"],
            FeatureKind::FineGrainedRbac => &["cluster-permission"],
        }
    }

    pub fn scope(&self) -> Scope {
        match self {
            FeatureKind::GlobalSearch | FeatureKind::VirtualMachineActions => {
                Scope::ManagedClusters
            }
            FeatureKind::FineGrainedRbac => Scope::Hub,
        }
    }

    /// Resources the feature needs in one target
    pub fn resources(&self, target: &Target, owner: &Owner) -> Vec<FeatureResource> {
        match self {
            FeatureKind::GlobalSearch => global_search::resources(target, owner),
            FeatureKind::VirtualMachineActions => virtual_machine::resources(target, owner),
            FeatureKind::FineGrainedRbac => fine_grained_rbac::resources(owner),
        }
    }
}

/// Feature switches sampled from the Search annotations at the start of a pass
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FeatureToggles {
    enabled: BTreeSet<FeatureKind>,
}

impl FeatureToggles {
    pub fn from_search(search: &Search) -> Self {
        Self {
            enabled: FeatureKind::ALL
                .into_iter()
                .filter(|f| search.annotation_enabled(f.annotation()))
                .collect(),
        }
    }

    pub fn with(mut self, kind: FeatureKind) -> Self {
        self.enabled.insert(kind);
        self
    }

    pub fn is_enabled(&self, kind: FeatureKind) -> bool {
        self.enabled.contains(&kind)
    }

    /// `FEATURE_*=true` for every enabled feature
    pub fn env_flags(&self) -> Vec<EnvVar> {
        self.enabled
            .iter()
            .map(|f| EnvVar {
                name: f.env_flag().to_string(),
                value: Some("true".to_string()),
                ..EnvVar::default()
            })
            .collect()
    }
}

/// Lifecycle state, derived from the persisted condition
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FeatureState {
    /// No condition was ever written
    Unset,
    Enabled,
    /// Explicitly turned off after having been enabled
    Disabled,
    /// Has a condition but never became active
    Inactive,
}

impl FeatureState {
    pub fn from_condition(condition: Option<&K8sCondition>) -> Self {
        match condition {
            None => FeatureState::Unset,
            Some(c) if c.status == ConditionStatus::True.as_str() => FeatureState::Enabled,
            Some(c)
                if c.status == ConditionStatus::False.as_str() && c.reason == REASON_DISABLED =>
            {
                FeatureState::Disabled
            }
            Some(_) => FeatureState::Inactive,
        }
    }
}

/// Change a pass made to a feature condition
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    Enabled,
    Disabled,
    Cleared,
}

/// Namespace a feature applies its resources to
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Target {
    Hub,
    ManagedCluster(String),
}

impl Target {
    pub fn name(&self) -> &str {
        match self {
            Target::Hub => HUB_TARGET,
            Target::ManagedCluster(name) => name,
        }
    }
}

/// A schema-less object together with the API it is served by
#[derive(Clone, Debug)]
pub struct FeatureResource {
    pub resource: ApiResource,
    pub object: DynamicObject,
}

impl FeatureResource {
    pub fn name(&self) -> String {
        self.object.name_any()
    }

    pub fn namespace(&self) -> Option<&str> {
        self.object.metadata.namespace.as_deref()
    }
}

pub fn managed_cluster_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(
        "cluster.open-cluster-management.io",
        "v1",
        "ManagedCluster",
    ))
}

pub fn multicluster_engine_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(
        "multicluster.openshift.io",
        "v1",
        "MultiClusterEngine",
    ))
}

pub fn addon_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(
        "addon.open-cluster-management.io",
        "v1alpha1",
        "ClusterManagementAddOn",
    ))
}

pub fn managed_service_account_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(
        "authentication.open-cluster-management.io",
        "v1beta1",
        "ManagedServiceAccount",
    ))
}

pub fn cluster_permission_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(
        "rbac.open-cluster-management.io",
        "v1alpha1",
        "ClusterPermission",
    ))
}

/// Drives features towards their toggles for one Search
pub struct FeatureController<'a, P: StoreProvider> {
    stores: &'a P,
    owner: &'a Owner,
    generation: i64,
}

impl<'a, P: StoreProvider> FeatureController<'a, P> {
    pub fn new(stores: &'a P, owner: &'a Owner, generation: i64) -> Self {
        Self {
            stores,
            owner,
            generation,
        }
    }

    /// Move one feature towards `enabled`, recording the outcome in `status`.
    ///
    /// The condition is left untouched whenever an error is returned.
    pub async fn reconcile_feature<C: Conditions>(
        &self,
        kind: FeatureKind,
        enabled: bool,
        status: &mut C,
    ) -> Result<Option<Transition>> {
        let state = FeatureState::from_condition(status.find_condition(kind.condition_type()));
        if enabled {
            let targets = self.enable(kind).await?;
            let message = match kind.scope() {
                Scope::Hub => format!("{} is enabled", kind.name()),
                Scope::ManagedClusters => format!(
                    "{} is enabled on {} managed cluster(s)",
                    kind.name(),
                    targets
                ),
            };
            let condition = new_condition(
                kind.condition_type(),
                ConditionStatus::True,
                REASON_ENABLED,
                &message,
                self.generation,
            );
            let changed = status.upsert_condition(condition);
            return Ok((changed && state != FeatureState::Enabled).then_some(Transition::Enabled));
        }

        match state {
            FeatureState::Unset | FeatureState::Disabled => Ok(None),
            FeatureState::Enabled => {
                self.disable(kind).await?;
                let condition = new_condition(
                    kind.condition_type(),
                    ConditionStatus::False,
                    REASON_DISABLED,
                    &format!("{} is disabled", kind.name()),
                    self.generation,
                );
                status.upsert_condition(condition);
                Ok(Some(Transition::Disabled))
            }
            // never active, so there is nothing to delete
            FeatureState::Inactive => {
                status.remove_condition(kind.condition_type());
                Ok(Some(Transition::Cleared))
            }
        }
    }

    /// Check that everything the feature depends on is installed
    pub async fn validate(&self, kind: FeatureKind) -> Result<()> {
        let addons = self.stores.dynamic(&addon_resource(), None);
        for addon in kind.required_addons() {
            if addons.fetch(addon).await?.is_none() {
                return Err(Error::ValidationError(format!(
                    "{} requires the `{}` add-on",
                    kind.name(),
                    addon
                )));
            }
        }

        let required = kind.required_components();
        if required.is_empty() {
            return Ok(());
        }
        let engines = self
            .stores
            .dynamic(&multicluster_engine_resource(), None)
            .fetch_all()
            .await?;
        let Some(engine) = engines.first() else {
            return Err(Error::ValidationError(format!(
                "{} requires a MultiClusterEngine",
                kind.name()
            )));
        };
        let enabled = enabled_components(engine).map_err(Error::DocumentError)?;
        for component in required {
            if !enabled.contains(*component) {
                return Err(Error::ValidationError(format!(
                    "{} requires the MultiClusterEngine component `{}` to be enabled",
                    kind.name(),
                    component
                )));
            }
        }
        Ok(())
    }

    /// Targets of a feature in a stable order
    pub async fn targets(&self, kind: FeatureKind) -> Result<Vec<Target>> {
        if kind.scope() == Scope::Hub {
            return Ok(vec![Target::Hub]);
        }
        let clusters = self
            .stores
            .dynamic(&managed_cluster_resource(), None)
            .fetch_all()
            .await?;
        let mut targets: Vec<Target> = clusters
            .iter()
            .filter(|c| c.metadata.deletion_timestamp.is_none())
            .map(|c| Target::ManagedCluster(c.name_any()))
            .collect();
        targets.sort();
        Ok(targets)
    }

    /// Validate, then apply the feature resources to every target.
    ///
    /// A failing target does not stop the others. Returns the number of
    /// configured targets.
    pub async fn enable(&self, kind: FeatureKind) -> Result<usize> {
        self.validate(kind).await?;
        let targets = self.targets(kind).await?;
        let mut errors = ErrorAggregate::new();
        for target in &targets {
            if let Err(e) = self.apply_target(kind, target).await {
                warn!("Failed to enable {} in {}: {}", kind.name(), target.name(), e);
                errors.push(e, [kind.name(), target.name()]);
            }
        }
        errors.into_result()?;
        info!("{} configured in {} target(s)", kind.name(), targets.len());
        Ok(targets.len())
    }

    async fn apply_target(&self, kind: FeatureKind, target: &Target) -> Result<()> {
        for res in kind.resources(target, self.owner) {
            let store = self.stores.dynamic(&res.resource, res.namespace());
            let outcome = sync::sync(&store, res.object.clone()).await?;
            if outcome != SyncOutcome::Unchanged {
                debug!(
                    "{} {} `{}` in {}",
                    outcome.as_str(),
                    res.resource.kind,
                    res.name(),
                    target.name()
                );
            }
        }
        Ok(())
    }

    /// Remove the feature resources from every target, without looking at
    /// prerequisites
    pub async fn disable(&self, kind: FeatureKind) -> Result<()> {
        let targets = self.targets(kind).await?;
        let mut errors = ErrorAggregate::new();
        for target in &targets {
            if let Err(e) = self.delete_target(kind, target).await {
                warn!("Failed to disable {} in {}: {}", kind.name(), target.name(), e);
                errors.push(e, [kind.name(), target.name()]);
            }
        }
        errors.into_result()
    }

    async fn delete_target(&self, kind: FeatureKind, target: &Target) -> Result<()> {
        for res in kind.resources(target, self.owner) {
            let store = self.stores.dynamic(&res.resource, res.namespace());
            sync::ensure_deleted::<DynamicObject, _>(&store, &res.resource.kind, &res.name())
                .await?;
        }
        Ok(())
    }

    /// Remove the resources of every feature, whatever the conditions say
    pub async fn force_cleanup(&self) -> Result<()> {
        let mut errors = ErrorAggregate::new();
        for kind in FeatureKind::ALL {
            let targets = match self.targets(kind).await {
                Ok(targets) => targets,
                Err(e) => {
                    errors.push(e, [kind.name()]);
                    continue;
                }
            };
            for target in &targets {
                errors.collect(self.delete_target(kind, target).await, [kind.name(), target.name()]);
            }
        }
        errors.into_result()
    }
}

/// Names of the components switched on in a MultiClusterEngine
fn enabled_components(engine: &DynamicObject) -> Result<BTreeSet<String>, FieldError> {
    let doc = Document::of(engine);
    let Some(components) = Document::optional(doc.array(&["spec", "overrides", "components"]))?
    else {
        return Ok(BTreeSet::new());
    };
    let mut enabled = BTreeSet::new();
    for entry in components {
        let entry = Document::new(entry);
        let name = entry.str(&["name"])?;
        if Document::optional(entry.bool(&["enabled"]))?.unwrap_or(false) {
            enabled.insert(name.to_string());
        }
    }
    Ok(enabled)
}
