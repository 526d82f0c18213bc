use std::sync::Arc;

use k8s_openapi::api::{
    core::v1::ConfigMap,
    rbac::v1::{ClusterRole, ClusterRoleBinding},
};
use kube::{Resource, api::ResourceExt, runtime::controller::Action};
use serde_json::json;
use tracing::*;

use super::Context;
use crate::aggregate::ErrorAggregate;
use crate::config::{Component, OperatorConfig};
use crate::config_merge::merge_postgres_config;
use crate::crd::{Search, SearchStatus};
use crate::events_helper::{emit_info, emit_warning};
use crate::features::{FeatureController, FeatureKind, FeatureToggles, Transition};
use crate::manifests::{
    CLUSTER_ROLE_NAME, DesiredState, POSTGRES_CONFIG_NAME, PRIOR_POSTGRES_CONF_TEMPLATES,
};
use crate::ownership::Owner;
use crate::store::{KubeStores, ObjectStore, Scoped, StoreProvider};
use crate::sync::{self, Differ, SyncOutcome};
use crate::{Error, Result};

/// An event about the Search, published once the pass is over
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notice {
    pub warning: bool,
    pub reason: String,
    pub action: String,
    pub note: String,
}

impl Notice {
    fn info(reason: &str, action: &str, note: String) -> Self {
        Self {
            warning: false,
            reason: reason.to_string(),
            action: action.to_string(),
            note,
        }
    }

    fn warning(reason: &str, action: &str, note: String) -> Self {
        Self {
            warning: true,
            ..Self::info(reason, action, note)
        }
    }
}

impl Search {
    pub async fn reconcile(&self, ctx: Arc<Context>) -> Result<Action> {
        let stores = KubeStores::new(ctx.client.clone());
        let (notices, result) = SearchPass::new(self, &stores, &ctx.config)?.apply().await;
        self.publish(&ctx, notices).await;
        result?;
        Ok(Action::requeue(ctx.config.requeue_interval))
    }

    /// Remove everything garbage collection cannot reach: feature resources
    /// in managed cluster namespaces and cluster scoped objects
    pub async fn cleanup(&self, ctx: Arc<Context>) -> Result<Action> {
        emit_info(
            &ctx.recorder,
            self,
            "DeleteRequested",
            "Deleting",
            Some(format!("Delete `{}`", self.name_any())),
        )
        .await;
        let stores = KubeStores::new(ctx.client.clone());
        let (notices, result) = SearchPass::new(self, &stores, &ctx.config)?.cleanup().await;
        self.publish(&ctx, notices).await;
        result?;
        info!("Cleaned up after Search \"{}\"", self.name_any());
        Ok(Action::await_change())
    }

    async fn publish(&self, ctx: &Context, notices: Vec<Notice>) {
        for n in notices {
            if n.warning {
                emit_warning(&ctx.recorder, self, &n.reason, &n.action, Some(n.note)).await;
            } else {
                emit_info(&ctx.recorder, self, &n.reason, &n.action, Some(n.note)).await;
            }
        }
    }
}

/// One reconcile or cleanup of a Search against a set of stores.
///
/// A pass applies the desired workloads, then the features, then writes the
/// status at most once. Failures are collected and reported together at the
/// end so one broken object does not hold back the others.
pub struct SearchPass<'a, P: StoreProvider> {
    search: &'a Search,
    stores: &'a P,
    config: &'a OperatorConfig,
    owner: Owner,
    namespace: String,
    notices: Vec<Notice>,
    errors: ErrorAggregate,
}

impl<'a, P: StoreProvider> SearchPass<'a, P> {
    pub fn new(search: &'a Search, stores: &'a P, config: &'a OperatorConfig) -> Result<Self> {
        let namespace = search
            .namespace()
            .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
        Ok(Self {
            search,
            stores,
            config,
            owner: Owner::of(search)?,
            namespace,
            notices: Vec::new(),
            errors: ErrorAggregate::new(),
        })
    }

    fn generation(&self) -> i64 {
        self.search.meta().generation.unwrap_or_default()
    }

    pub async fn apply(mut self) -> (Vec<Notice>, Result<()>) {
        let result = self.apply_all().await;
        (self.notices, result)
    }

    async fn apply_all(&mut self) -> Result<()> {
        let ns = self.namespace.clone();
        let toggles = FeatureToggles::from_search(self.search);
        let mut desired = DesiredState::build(self.search, &self.owner, self.config, &toggles);

        // Keep the user's database settings across regenerations
        let configs = self.stores.typed::<ConfigMap>(Some(&ns));
        if let Some(existing) = configs.fetch(POSTGRES_CONFIG_NAME).await? {
            merge_postgres_config(
                &existing,
                &mut desired.postgres_config,
                PRIOR_POSTGRES_CONF_TEMPLATES,
            );
        }

        self.sync_one(Some(&ns), desired.service_account.clone()).await;
        self.sync_one(None, desired.cluster_role.clone()).await;
        self.sync_one(None, desired.cluster_role_binding.clone()).await;
        self.sync_one(Some(&ns), desired.postgres_config.clone()).await;
        if let Some(pvc) = desired.storage.clone() {
            self.sync_one(Some(&ns), pvc).await;
        }
        for svc in desired.services.clone() {
            self.sync_one(Some(&ns), svc).await;
        }
        for deploy in desired.deployments.clone() {
            self.sync_one(Some(&ns), deploy).await;
        }

        // Features write their outcome into a copy of the status
        let mut status = self.search.status.clone().unwrap_or_default();
        let owner = self.owner.clone();
        let features = FeatureController::new(self.stores, &owner, self.generation());
        for kind in FeatureKind::ALL {
            let enabled = toggles.is_enabled(kind);
            match features.reconcile_feature(kind, enabled, &mut status).await {
                Ok(Some(transition)) => self.feature_notice(kind, transition),
                Ok(None) => {}
                Err(e) => {
                    warn!("Feature {} of Search \"{}\": {}", kind.name(), self.search.name_any(), e);
                    self.notices.push(Notice::warning(
                        "FeatureFailed",
                        "Reconciling",
                        format!("{}: {}", kind.name(), e),
                    ));
                    self.errors.push(e, [kind.name()]);
                }
            }
        }

        status.db = Some(Component::Database.name().to_string());
        status.storage = Some(desired.storage_name());
        if self.search.status.as_ref() != Some(&status) {
            let written = self.persist_status(&status).await;
            self.errors.collect(written, ["status"]);
        }

        std::mem::take(&mut self.errors).into_result()
    }

    /// Sync one object, noting when it changed and collecting the error
    /// when it failed
    async fn sync_one<K>(&mut self, namespace: Option<&str>, desired: K)
    where
        K: Scoped + Differ,
    {
        let store = self.stores.typed::<K>(namespace);
        let (kind, name) = sync::describe(&desired);
        match sync::sync(&store, desired).await {
            Ok(SyncOutcome::Unchanged) => {}
            Ok(outcome) => {
                info!("{} {} `{}` for Search \"{}\"", outcome.as_str(), kind, name, self.search.name_any());
                self.notices.push(Notice::info(
                    outcome.as_str(),
                    outcome.as_str(),
                    format!("{} {} `{}`", outcome.as_str(), kind, name),
                ));
            }
            Err(e) => {
                warn!("{}", e);
                self.errors.push(e, [kind, name]);
            }
        }
    }

    fn feature_notice(&mut self, kind: FeatureKind, transition: Transition) {
        let (reason, note) = match transition {
            Transition::Enabled => ("FeatureEnabled", format!("{} is enabled", kind.name())),
            Transition::Disabled => ("FeatureDisabled", format!("{} is disabled", kind.name())),
            Transition::Cleared => ("FeatureCleared", format!("{} was never active, condition cleared", kind.name())),
        };
        info!("{} for Search \"{}\"", note, self.search.name_any());
        self.notices.push(Notice::info(reason, "Reconciling", note));
    }

    /// Merge patch of the status guarded by the resourceVersion the pass
    /// started from. A conflict is left to the next pass.
    async fn persist_status(&self, status: &SearchStatus) -> Result<()> {
        let searches = self.stores.typed::<Search>(Some(&self.namespace));
        let patch = json!({
            "db": status.db,
            "storage": status.storage,
            // an empty list, never null, so removed conditions disappear
            "conditions": status.conditions.as_deref().unwrap_or_default(),
        });
        let name = self.search.name_any();
        match searches
            .write_status(&name, self.search.resource_version().as_deref(), &patch)
            .await
        {
            Ok(_) => Ok(()),
            Err(Error::ConflictError(_)) => {
                warn!("Search \"{name}\" changed during reconcile, status is written on the next pass");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn cleanup(mut self) -> (Vec<Notice>, Result<()>) {
        let features = FeatureController::new(self.stores, &self.owner, self.generation());
        let cleaned = features.force_cleanup().await;
        self.errors.collect(cleaned, ["features"]);

        let bindings = self.stores.typed::<ClusterRoleBinding>(None);
        let roles = self.stores.typed::<ClusterRole>(None);
        let deleted = delete_owned::<ClusterRoleBinding, _>(&bindings, &self.owner, CLUSTER_ROLE_NAME).await;
        self.errors.collect(deleted, ["ClusterRoleBinding"]);
        let deleted = delete_owned::<ClusterRole, _>(&roles, &self.owner, CLUSTER_ROLE_NAME).await;
        self.errors.collect(deleted, ["ClusterRole"]);
        let result = std::mem::take(&mut self.errors).into_result();
        (self.notices, result)
    }
}

/// Delete a cluster scoped object, only when it carries our ownership labels
async fn delete_owned<K, S>(store: &S, owner: &Owner, name: &str) -> Result<bool>
where
    K: Differ + Send + Sync + 'static,
    S: ObjectStore<K>,
{
    match store.fetch(name).await? {
        Some(obj) if owner.owns(obj.meta()) => {
            let kind = obj.kind_name();
            sync::ensure_deleted::<K, S>(store, &kind, name).await
        }
        _ => Ok(false),
    }
}
