//! Main reconciler for ObjectStore resources
//!
//! Implements the controller pattern using kube-rs runtime. A pass converges
//! PVC, Service and Deployment in that order, waits for the gateway pod, then
//! runs the multisite step of the object's role. Each step is idempotent, so
//! a pass replayed after a partial failure ends in the same state.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Service};
use kube::{
    api::{Api, ListParams},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        watcher::Config,
    },
    ResourceExt,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use super::events::{emit_event, reasons, EventType};
use super::exec::{ExecTransport, KubeExecTransport, RemoteCommandExecutor};
use super::finalizers::{add_finalizer, is_being_deleted, remove_finalizer};
use super::multisite::{BootstrapOutcome, JoinOutcome, MultisiteProtocol};
use super::readiness::wait_for_pods_running;
use super::resources::{
    delete_zone_job, ensure_deployment, ensure_pvc, ensure_service, label_selector, namespace,
};
use super::store::{KubeStore, ResourceStore, StoreResource};
use crate::config::OperatorConfig;
use crate::crd::{ObjectStore, SiteRole};
use crate::error::{Error, Result};

pub const PHASE_CONVERGING: &str = "Converging";
pub const PHASE_READY: &str = "Ready";
pub const PHASE_FAILED: &str = "Failed";

/// Shared state for the controller
pub struct Context<S, T> {
    pub store: Arc<S>,
    pub executor: RemoteCommandExecutor<S, T>,
    pub config: Arc<OperatorConfig>,
    /// Cancelled on shutdown; pollers and remote commands stop at the next step
    pub shutdown: CancellationToken,
}

impl<S: ResourceStore, T: ExecTransport> Context<S, T> {
    pub fn new(store: Arc<S>, transport: T, config: Arc<OperatorConfig>) -> Self {
        let executor = RemoteCommandExecutor::new(Arc::clone(&store), transport);
        Self {
            store,
            executor,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    fn multisite(&self) -> MultisiteProtocol<'_, S, T> {
        MultisiteProtocol::new(
            self.store.as_ref(),
            &self.executor,
            self.config.as_ref(),
            &self.shutdown,
        )
    }
}

fn scoped_api<K: StoreResource>(client: &Client, namespace: Option<&str>) -> Api<K> {
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Main entry point to start the controller
///
/// Watches ObjectStores in `watch_namespace`, or cluster-wide when `None`.
pub async fn run_controller(
    client: Client,
    config: Arc<OperatorConfig>,
    watch_namespace: Option<String>,
) -> Result<()> {
    let watch_namespace = watch_namespace.as_deref();
    let object_stores: Api<ObjectStore> = scoped_api(&client, watch_namespace);

    info!("Starting ObjectStore controller");

    // Verify CRD exists
    match object_stores.list(&ListParams::default().limit(1)).await {
        Ok(_) => info!("ObjectStore CRD is available"),
        Err(e) => {
            error!(
                "ObjectStore CRD not found. Please install the CRD first: {:?}",
                e
            );
            return Err(Error::ConfigError(
                "ObjectStore CRD not installed".to_string(),
            ));
        }
    }

    let store = Arc::new(KubeStore::new(client.clone(), config.field_manager.clone()));
    let transport = KubeExecTransport::new(client.clone());
    let ctx = Arc::new(Context::new(store, transport, config));

    // long polls in flight must not hold up shutdown
    let shutdown = ctx.shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown.cancel();
    });

    Controller::new(object_stores, Config::default())
        // Watch owned resources for changes
        .owns::<Deployment>(scoped_api(&client, watch_namespace), Config::default())
        .owns::<Service>(scoped_api(&client, watch_namespace), Config::default())
        .owns::<PersistentVolumeClaim>(scoped_api(&client, watch_namespace), Config::default())
        .owns::<Job>(scoped_api(&client, watch_namespace), Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok(obj) => info!("Reconciled: {:?}", obj),
                Err(e) => error!("Reconcile error: {:?}", e),
            }
        })
        .await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C, cancelling in-flight reconciles"),
        () = terminate => info!("Received SIGTERM, cancelling in-flight reconciles"),
    }
}

/// The main reconciliation function
///
/// This function is called whenever:
/// - An ObjectStore is created, updated, or deleted
/// - An owned resource (Deployment, Service, PVC, Job) changes
/// - The requeue timer expires
#[instrument(skip(obj, ctx), fields(name = %obj.name_any(), namespace = obj.namespace()))]
pub async fn reconcile<S: ResourceStore, T: ExecTransport>(
    obj: Arc<ObjectStore>,
    ctx: Arc<Context<S, T>>,
) -> Result<Action> {
    info!(
        "Reconciling ObjectStore {}/{}",
        namespace(&obj),
        obj.name_any()
    );

    if is_being_deleted(&obj) {
        return cleanup(&obj, &ctx).await;
    }
    apply(&obj, &ctx).await
}

/// Converge the ObjectStore's children and run its multisite step
async fn apply<S: ResourceStore, T: ExecTransport>(
    obj: &ObjectStore,
    ctx: &Context<S, T>,
) -> Result<Action> {
    let store = ctx.store.as_ref();
    let ns = namespace(obj);
    let name = obj.name_any();

    info!("Applying ObjectStore: {}/{}", ns, name);

    let obj = add_finalizer(store, obj).await?;

    // Validate the spec
    if let Err(e) = obj.spec.validate() {
        warn!("Validation failed for {}/{}: {}", ns, name, e);
        if update_status(store, &obj, PHASE_FAILED, Some(&e)).await? {
            emit_event(store, &obj, EventType::Warning, reasons::VALIDATION_FAILED, &e).await;
        }
        return Err(Error::ValidationError(e));
    }

    let role = obj.spec.site_role();
    let new_generation = !generation_observed(&obj);

    if obj.spec.has_ambiguous_role() {
        warn!(
            "ObjectStore {}/{} sets both isMainSite and realmTokenSecretName, treating it as a joining site",
            ns, name
        );
        if new_generation {
            emit_event(
                store,
                &obj,
                EventType::Warning,
                reasons::AMBIGUOUS_MULTISITE_ROLE,
                "both isMainSite and realmTokenSecretName are set; the site joins the referenced realm and does not bootstrap one",
            )
            .await;
        }
    }

    if new_generation || current_phase(&obj) != Some(PHASE_READY) {
        update_status(store, &obj, PHASE_CONVERGING, None).await?;
    }

    match converge(&obj, &role, ctx).await {
        Ok(()) => {
            update_status(store, &obj, PHASE_READY, None).await?;
            info!("ObjectStore {}/{} is ready (role: {})", ns, name, role.as_str());
            Ok(Action::requeue(ctx.config.resync_interval))
        }
        Err(e) if !e.is_retriable() => {
            let message = e.to_string();
            match update_status(store, &obj, PHASE_FAILED, Some(&message)).await {
                Ok(true) => {
                    emit_event(store, &obj, EventType::Warning, reasons::RECONCILE_FAILED, &message)
                        .await
                }
                Ok(false) => {}
                Err(status_err) => warn!("Failed to record failure status: {}", status_err),
            }
            Err(e)
        }
        Err(e) => Err(e),
    }
}

/// PVC → Service → Deployment → readiness → multisite step
async fn converge<S: ResourceStore, T: ExecTransport>(
    obj: &ObjectStore,
    role: &SiteRole,
    ctx: &Context<S, T>,
) -> Result<()> {
    let store = ctx.store.as_ref();
    let config = ctx.config.as_ref();
    let multisite = ctx.multisite();

    if ctx.shutdown.is_cancelled() {
        return Err(Error::Cancelled);
    }

    ensure_pvc(store, obj, config).await?;
    // the endpoint is advertised by both handshake directions
    let endpoint = ensure_service(store, obj, config).await?;

    let realm_token_secret = match role {
        SiteRole::Joiner { realm_token_secret } => {
            // a joiner without a usable token must fail before anything runs
            multisite.read_realm_token(obj, realm_token_secret).await?;
            Some(realm_token_secret.as_str())
        }
        SiteRole::Standalone | SiteRole::Origin => None,
    };

    ensure_deployment(store, obj, config, realm_token_secret, &endpoint).await?;

    wait_for_pods_running(
        store,
        &namespace(obj),
        &label_selector(obj),
        &config.pod_ready_policy,
        &ctx.shutdown,
    )
    .await?;

    match role {
        SiteRole::Standalone => {}
        SiteRole::Origin => {
            if let BootstrapOutcome::Bootstrapped { secret } =
                multisite.bootstrap_realm(obj, &endpoint).await?
            {
                let message = format!("Bootstrapped realm, token published in secret {secret}");
                emit_event(store, obj, EventType::Normal, reasons::REALM_BOOTSTRAPPED, &message)
                    .await;
            }
        }
        SiteRole::Joiner { realm_token_secret } => {
            if multisite
                .join_zone(obj, realm_token_secret, &endpoint)
                .await?
                == JoinOutcome::Joined
            {
                let message = format!("Joined realm with token from secret {realm_token_secret}");
                emit_event(store, obj, EventType::Normal, reasons::ZONE_JOINED, &message).await;
            }
        }
    }

    Ok(())
}

/// Clean up after an ObjectStore marked for deletion
///
/// Only the zone join Job needs explicit deletion, every other child goes
/// with the owner reference. Cleanup problems are logged and never keep the
/// finalizer in place.
#[instrument(skip(obj, ctx), fields(name = %obj.name_any(), namespace = obj.namespace()))]
async fn cleanup<S: ResourceStore, T: ExecTransport>(
    obj: &ObjectStore,
    ctx: &Context<S, T>,
) -> Result<Action> {
    let store = ctx.store.as_ref();
    let ns = namespace(obj);
    let name = obj.name_any();

    info!("Cleaning up ObjectStore: {}/{}", ns, name);

    if let Err(e) = delete_zone_job(store, obj).await {
        warn!("Failed to delete zone job: {:?}", e);
    }

    remove_finalizer(store, obj).await?;

    info!("Cleanup complete for ObjectStore: {}/{}", ns, name);

    Ok(Action::await_change())
}

fn current_phase(obj: &ObjectStore) -> Option<&str> {
    obj.status.as_ref().map(|s| s.phase.as_str())
}

fn generation_observed(obj: &ObjectStore) -> bool {
    obj.status
        .as_ref()
        .and_then(|s| s.observed_generation)
        .is_some_and(|observed| Some(observed) == obj.metadata.generation)
}

/// Update the status subresource of an ObjectStore
///
/// Returns whether anything was written; an unchanged status is not patched.
async fn update_status<S: ResourceStore>(
    store: &S,
    obj: &ObjectStore,
    phase: &str,
    message: Option<&str>,
) -> Result<bool> {
    let unchanged = obj.status.as_ref().is_some_and(|s| {
        s.phase == phase
            && s.message.as_deref() == message
            && s.observed_generation == obj.metadata.generation
    });
    if unchanged {
        return Ok(false);
    }

    // a null message removes a stale one
    let patch = json!({
        "status": {
            "phase": phase,
            "message": message,
            "observedGeneration": obj.metadata.generation,
        }
    });
    store
        .patch_status::<ObjectStore>(&namespace(obj), &obj.name_any(), &patch)
        .await?;
    Ok(true)
}

/// Error policy determines how to handle reconciliation errors
pub fn error_policy<S, T>(obj: Arc<ObjectStore>, error: &Error, _ctx: Arc<Context<S, T>>) -> Action {
    error!("Reconciliation error for {}: {:?}", obj.name_any(), error);
    Action::requeue(retry_delay(error))
}

/// Use shorter retry for retriable errors
pub fn retry_delay(error: &Error) -> Duration {
    if error.is_retriable() {
        Duration::from_secs(15)
    } else {
        Duration::from_secs(60)
    }
}
