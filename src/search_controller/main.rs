use chrono::{DateTime, Utc};
use futures::StreamExt;
use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{ConfigMap, Service, ServiceAccount},
};
use kube::{
    api::{Api, ListParams, ResourceExt},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        events::{Recorder, Reporter},
        finalizer::{Event as Finalizer, finalizer},
        watcher,
    },
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::*;

use crate::config::OperatorConfig;
use crate::crd::{SEARCH_FINALIZER, SEARCH_MANAGER_NAME, Search};
use crate::{Error, Result};

// Context for our reconciler
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Event recorder
    pub recorder: Recorder,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Process configuration, fixed at start
    pub config: Arc<OperatorConfig>,
}

async fn reconcile_search(search: Arc<Search>, ctx: Arc<Context>) -> Result<Action> {
    let ns = search
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let api_search: Api<Search> = Api::namespaced(ctx.client.clone(), &ns);
    ctx.diagnostics.write().await.last_event = Utc::now();

    info!("Reconciling Search \"{}\" in {}", search.name_any(), ns);
    finalizer(&api_search, SEARCH_FINALIZER, search, async |event| match event {
        Finalizer::Apply(search) => search.reconcile(ctx.clone()).await,
        Finalizer::Cleanup(search) => search.cleanup(ctx.clone()).await,
    })
    .await
    .map_err(|e| Error::FinalizerError(Box::new(e)))
}

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}
impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            reporter: SEARCH_MANAGER_NAME.into(),
        }
    }
}
impl Diagnostics {
    fn recorder(&self, client: Client) -> Recorder {
        Recorder::new(client, self.reporter.clone())
    }
}

/// State shared between the controller and the web server
#[derive(Clone, Default)]
pub struct State {
    /// Diagnostics populated by the reconciler
    diagnostics: Arc<RwLock<Diagnostics>>,
}

impl State {
    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    // Create a Controller Context that can update State
    pub async fn to_context(&self, client: Client, config: Arc<OperatorConfig>) -> Arc<Context> {
        Arc::new(Context {
            client: client.clone(),
            recorder: self.diagnostics.read().await.recorder(client),
            diagnostics: self.diagnostics.clone(),
            config,
        })
    }
}

fn error_policy(search: Arc<Search>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!("reconcile of Search \"{}\" failed: {}", search.name_any(), error);
    Action::requeue(ctx.config.error_requeue_interval)
}

/// Run the Search controller until a shutdown signal arrives
pub async fn run(state: State, config: Arc<OperatorConfig>) -> Result<()> {
    let client = Client::try_default().await.map_err(Error::KubeError)?;
    let searches = Api::<Search>::all(client.clone());
    if let Err(e) = searches.list(&ListParams::default().limit(1)).await {
        error!("Search CRD is not queryable; {e:?}. Is the CRD installed?");
        info!("Installation: cargo run --bin gencrd | kubectl apply -f -");
        return Err(Error::KubeError(e));
    }
    let watch = watcher::Config::default().any_semantic();
    Controller::new(searches, watch.clone())
        .owns(Api::<Deployment>::all(client.clone()), watch.clone())
        .owns(Api::<Service>::all(client.clone()), watch.clone())
        .owns(Api::<ConfigMap>::all(client.clone()), watch.clone())
        .owns(Api::<ServiceAccount>::all(client.clone()), watch)
        .shutdown_on_signal()
        .run(reconcile_search, error_policy, state.to_context(client, config).await)
        .filter_map(async |x| std::result::Result::ok(x))
        .for_each(|_| futures::future::ready(()))
        .await;
    Ok(())
}
