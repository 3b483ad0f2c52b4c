//! Kubernetes resource builders for ObjectStore
//!
//! Every ObjectStore owns one PVC, one Service and one single-replica
//! Deployment, all named `rgw-<name>-<namespace>` and labelled
//! `object_store=<name>`. Joining sites may additionally own a one-shot zone
//! join Job, origin sites own the realm token Secret.
//!
//! Convergence goes through [`create_or_update`]: missing children are
//! created, existing children get their mutable fields rewritten and are
//! replaced with the resourceVersion they were read at.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, ObjectFieldSelector, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, PodSecurityContext, PodSpec,
    PodTemplateSpec, Secret, SecretKeySelector, SecurityContext, Service, ServicePort,
    ServiceSpec, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use super::store::{ResourceStore, StoreResource};
use crate::config::OperatorConfig;
use crate::crd::ObjectStore;
use crate::error::{is_already_exists, is_not_found, Error, Result};
use crate::rgw::{env_var_reference, CephCli};

/// Label tying gateway pods and children to their ObjectStore
pub const OWNER_LABEL: &str = "object_store";
/// Owner label of zone join Job pods, deliberately distinct from [`OWNER_LABEL`]
pub const ZONE_JOB_OWNER_LABEL: &str = "object.rgw-standalone.io/zone-job-owner";
pub const ZONE_JOB_APP: &str = "object-store-multisite-zone-job";
pub const ZONE_CONTAINER: &str = "object-store-multisite-create-zone";
pub const CHOWN_CONTAINER: &str = "chown-container-data-dir";
pub const DATA_VOLUME: &str = "ceph-daemon-data";
pub const REALM_TOKEN_KEY: &str = "token";
pub const REALM_TOKEN_ENV: &str = "REALM_TOKEN";
const POD_NAME_ENV: &str = "POD_NAME";
const ZONE_JOB_BACKOFF_LIMIT: i32 = 600;

/// Name shared by the PVC, Service and Deployment
pub fn instance_name(store: &ObjectStore) -> String {
    format!("rgw-{}-{}", store.name_any(), namespace(store))
}

/// Zone name a joining site registers in the realm
pub fn zone_name(store: &ObjectStore) -> String {
    format!("{}-{}", store.name_any(), namespace(store))
}

pub fn zone_job_name(store: &ObjectStore) -> String {
    format!("{}-zone-join", instance_name(store))
}

/// Secret the origin site publishes its realm token in
pub fn realm_token_secret_name(store: &ObjectStore) -> String {
    format!("{}-realm-token", store.name_any())
}

pub fn namespace(store: &ObjectStore) -> String {
    store.namespace().unwrap_or_else(|| "default".to_string())
}

/// Get the standard labels for an ObjectStore's resources
pub fn standard_labels(store: &ObjectStore) -> BTreeMap<String, String> {
    BTreeMap::from([(OWNER_LABEL.to_string(), store.name_any())])
}

/// Selector matching the gateway pods of an ObjectStore
pub fn label_selector(store: &ObjectStore) -> String {
    format!("{OWNER_LABEL}={}", store.name_any())
}

fn zone_job_labels(store: &ObjectStore) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), ZONE_JOB_APP.to_string()),
        (ZONE_JOB_OWNER_LABEL.to_string(), store.name_any()),
    ])
}

/// Create an OwnerReference for garbage collection
pub fn owner_reference(store: &ObjectStore) -> OwnerReference {
    OwnerReference {
        api_version: ObjectStore::api_version(&()).to_string(),
        kind: ObjectStore::kind(&()).to_string(),
        name: store.name_any(),
        uid: store.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

fn child_meta(store: &ObjectStore, name: String, labels: BTreeMap<String, String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: store.namespace(),
        labels: Some(labels),
        owner_references: Some(vec![owner_reference(store)]),
        ..Default::default()
    }
}

// ============================================================================
// Create or update
// ============================================================================

/// What [`create_or_update`] did to the cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Created,
    Updated,
    Unchanged,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Created => write!(f, "created"),
            Operation::Updated => write!(f, "updated"),
            Operation::Unchanged => write!(f, "unchanged"),
        }
    }
}

/// Create `desired` or bring the live object in line with it
///
/// `mutate` receives the live object and the desired one and rewrites the
/// live object's mutable fields. The result is only written back when it
/// differs from what was read. The write is a full replace carrying the read
/// resourceVersion, so a concurrent writer makes it fail with 409 Conflict
/// instead of being silently overwritten. Losing a create race to another
/// writer counts as success.
pub async fn create_or_update<S, K, F>(
    store: &S,
    namespace: &str,
    desired: K,
    mutate: F,
) -> Result<(K, Operation)>
where
    S: ResourceStore,
    K: StoreResource,
    F: FnOnce(&mut K, &K),
{
    let kind = K::kind(&());
    let name = desired
        .meta()
        .name
        .clone()
        .ok_or_else(|| Error::ValidationError(format!("{kind} has no name")))?;

    let Some(existing) = store.get::<K>(namespace, &name).await? else {
        return match store.create(namespace, &desired).await {
            Ok(created) => {
                info!("Created {} {}/{}", kind, namespace, name);
                Ok((created, Operation::Created))
            }
            Err(e) if is_already_exists(&e) => {
                debug!("{} {}/{} created concurrently", kind, namespace, name);
                match store.get::<K>(namespace, &name).await? {
                    Some(existing) => Ok((existing, Operation::Unchanged)),
                    None => Err(Error::KubeError(e)),
                }
            }
            Err(e) => Err(Error::KubeError(e)),
        };
    };

    let mut updated = existing.clone();
    mutate(&mut updated, &desired);
    if serde_json::to_value(&updated)? == serde_json::to_value(&existing)? {
        return Ok((existing, Operation::Unchanged));
    }

    let replaced = store.replace(namespace, &name, &updated).await?;
    info!("Updated {} {}/{}", kind, namespace, name);
    Ok((replaced, Operation::Updated))
}

/// Make sure the live metadata carries our labels and owner reference
///
/// Labels and owner references added by others are left alone.
fn converge_metadata(live: &mut ObjectMeta, desired: &ObjectMeta) {
    if let Some(labels) = &desired.labels {
        live.labels
            .get_or_insert_with(BTreeMap::new)
            .extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    if let Some(refs) = &desired.owner_references {
        let live_refs = live.owner_references.get_or_insert_with(Vec::new);
        for owner in refs {
            if !live_refs.iter().any(|r| r.uid == owner.uid) {
                live_refs.push(owner.clone());
            }
        }
    }
}

// ============================================================================
// PersistentVolumeClaim
// ============================================================================

/// Ensure the PersistentVolumeClaim holding the gateway database exists
///
/// Claim specs are immutable once bound, so only metadata is converged.
#[instrument(skip(store, obj, config), fields(name = %obj.name_any(), namespace = obj.namespace()))]
pub async fn ensure_pvc<S: ResourceStore>(
    store: &S,
    obj: &ObjectStore,
    config: &OperatorConfig,
) -> Result<Operation> {
    let pvc = build_pvc(obj, config);
    let (_, op) = create_or_update(store, &namespace(obj), pvc, |live, desired| {
        converge_metadata(&mut live.metadata, &desired.metadata);
    })
    .await?;
    Ok(op)
}

pub fn build_pvc(obj: &ObjectStore, config: &OperatorConfig) -> PersistentVolumeClaim {
    let template_spec = obj
        .spec
        .volume_claim_template
        .as_ref()
        .and_then(|t| t.spec.clone());

    let mut spec = template_spec.unwrap_or_else(|| PersistentVolumeClaimSpec {
        resources: Some(VolumeResourceRequirements {
            requests: Some(BTreeMap::from([(
                "storage".to_string(),
                Quantity(config.default_volume_size.clone()),
            )])),
            ..Default::default()
        }),
        ..Default::default()
    });
    // the gateway is a single writer on a local sqlite file
    spec.access_modes = Some(vec!["ReadWriteOnce".to_string()]);
    spec.volume_mode = Some("Filesystem".to_string());

    PersistentVolumeClaim {
        metadata: child_meta(obj, instance_name(obj), standard_labels(obj)),
        spec: Some(spec),
        status: None,
    }
}

// ============================================================================
// Service
// ============================================================================

/// Ensure the gateway Service exists and return the gateway endpoint URL
///
/// Only the selector and ports are converged, so the allocated cluster IP and
/// any fields set by other controllers survive updates.
#[instrument(skip(store, obj, config), fields(name = %obj.name_any(), namespace = obj.namespace()))]
pub async fn ensure_service<S: ResourceStore>(
    store: &S,
    obj: &ObjectStore,
    config: &OperatorConfig,
) -> Result<String> {
    let port = config.gateway_port(obj.spec.gateway.port);
    let service = build_service(obj, config);

    let (live, op) = create_or_update(store, &namespace(obj), service, |live, desired| {
        converge_metadata(&mut live.metadata, &desired.metadata);
        let desired_spec = desired.spec.clone().unwrap_or_default();
        let spec = live.spec.get_or_insert_with(ServiceSpec::default);
        spec.selector = desired_spec.selector;
        spec.ports = desired_spec.ports;
    })
    .await?;

    let endpoint = service_endpoint(&live, port);
    info!(operation = %op, endpoint = %endpoint, "Object store gateway service");
    Ok(endpoint)
}

pub fn build_service(obj: &ObjectStore, config: &OperatorConfig) -> Service {
    let port = config.gateway_port(obj.spec.gateway.port);

    Service {
        metadata: child_meta(obj, instance_name(obj), standard_labels(obj)),
        spec: Some(ServiceSpec {
            selector: Some(standard_labels(obj)),
            ports: Some(vec![ServicePort {
                name: Some("http".to_string()),
                port,
                target_port: Some(IntOrString::Int(config.internal_gateway_port)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: None,
    }
}

/// `http://<address>:<port>` for a Service
///
/// Uses the cluster IP once allocated, the in-cluster DNS name otherwise.
pub fn service_endpoint(service: &Service, port: i32) -> String {
    let cluster_ip = service
        .spec
        .as_ref()
        .and_then(|s| s.cluster_ip.as_deref())
        .filter(|ip| !ip.is_empty() && *ip != "None");

    match cluster_ip {
        Some(ip) => format!("http://{ip}:{port}"),
        None => format!(
            "http://{}.{}.svc:{port}",
            service.name_any(),
            service.namespace().unwrap_or_else(|| "default".to_string())
        ),
    }
}

// ============================================================================
// Deployment
// ============================================================================

/// Ensure the gateway Deployment matches the desired pod template
#[instrument(skip(store, obj, config, realm_token_secret), fields(name = %obj.name_any(), namespace = obj.namespace()))]
pub async fn ensure_deployment<S: ResourceStore>(
    store: &S,
    obj: &ObjectStore,
    config: &OperatorConfig,
    realm_token_secret: Option<&str>,
    endpoint: &str,
) -> Result<Operation> {
    let deployment = build_deployment(obj, config, realm_token_secret, endpoint);
    let (_, op) = create_or_update(store, &namespace(obj), deployment, |live, desired| {
        converge_metadata(&mut live.metadata, &desired.metadata);
        live.spec = desired.spec.clone();
    })
    .await?;
    info!(operation = %op, "Object store gateway deployment");
    Ok(op)
}

/// Build the gateway Deployment
///
/// `realm_token_secret` is set for joining sites, which get an extra init
/// container that creates their zone before the gateway starts.
pub fn build_deployment(
    obj: &ObjectStore,
    config: &OperatorConfig,
    realm_token_secret: Option<&str>,
    endpoint: &str,
) -> Deployment {
    let labels = standard_labels(obj);

    Deployment {
        metadata: child_meta(obj, instance_name(obj), labels.clone()),
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels),
                ..Default::default()
            },
            // the RWO claim cannot be mounted by two gateway pods at once
            strategy: Some(DeploymentStrategy {
                type_: Some("Recreate".to_string()),
                ..Default::default()
            }),
            template: build_pod_template(obj, config, realm_token_secret, endpoint),
            ..Default::default()
        }),
        status: None,
    }
}

// ============================================================================
// Pod Template
// ============================================================================

fn build_pod_template(
    obj: &ObjectStore,
    config: &OperatorConfig,
    realm_token_secret: Option<&str>,
    endpoint: &str,
) -> PodTemplateSpec {
    let mut init_containers = vec![build_chown_container(obj, config)];
    if let Some(secret) = realm_token_secret {
        init_containers.push(build_zone_container(
            obj,
            config,
            ZONE_CONTAINER,
            secret,
            endpoint,
        ));
    }

    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(standard_labels(obj)),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            init_containers: Some(init_containers),
            containers: vec![build_gateway_container(obj, config)],
            restart_policy: Some("Always".to_string()),
            security_context: Some(PodSecurityContext {
                run_as_user: Some(config.ceph_uid),
                run_as_group: Some(config.ceph_gid),
                fs_group: Some(config.ceph_uid),
                ..Default::default()
            }),
            volumes: Some(vec![data_volume(obj)]),
            ..Default::default()
        }),
    }
}

fn data_volume(obj: &ObjectStore) -> Volume {
    Volume {
        name: DATA_VOLUME.to_string(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name: instance_name(obj),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn data_volume_mount(config: &OperatorConfig) -> VolumeMount {
    VolumeMount {
        name: DATA_VOLUME.to_string(),
        mount_path: config.data_directory.clone(),
        ..Default::default()
    }
}

fn field_ref_env(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn value_env(name: &str, value: String) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value),
        ..Default::default()
    }
}

/// Environment shared by the gateway and the multisite helper
pub fn daemon_env(obj: &ObjectStore, config: &OperatorConfig) -> Vec<EnvVar> {
    vec![
        value_env("CONTAINER_IMAGE", obj.spec.image.clone()),
        field_ref_env(POD_NAME_ENV, "metadata.name"),
        field_ref_env("POD_NAMESPACE", "metadata.namespace"),
        field_ref_env("NODE_NAME", "spec.nodeName"),
        value_env("CEPH_LIB", config.ceph_lib.clone()),
        value_env("CEPH_ARGS", CephCli::new(config).ceph_args_env()),
    ]
}

/// Init container fixing data directory ownership
///
/// Some CSI drivers ignore fsGroup, and a chown in a postStart hook races the
/// daemon start, so this runs as root before the gateway.
fn build_chown_container(obj: &ObjectStore, config: &OperatorConfig) -> Container {
    Container {
        name: CHOWN_CONTAINER.to_string(),
        image: Some(obj.spec.image.clone()),
        command: Some(vec!["chown".to_string()]),
        args: Some(vec![
            "--verbose".to_string(),
            "--recursive".to_string(),
            "ceph:ceph".to_string(),
            config.data_directory.clone(),
        ]),
        volume_mounts: Some(vec![data_volume_mount(config)]),
        security_context: Some(SecurityContext {
            privileged: Some(true),
            run_as_user: Some(0),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn build_gateway_container(obj: &ObjectStore, config: &OperatorConfig) -> Container {
    let cli = CephCli::new(config);

    Container {
        name: config.gateway_container.clone(),
        image: Some(obj.spec.image.clone()),
        command: Some(vec![config.daemon_binary.clone()]),
        args: Some(cli.daemon_args(&instance_name(obj), &env_var_reference(POD_NAME_ENV))),
        ports: Some(vec![ContainerPort {
            name: Some("http".to_string()),
            container_port: config.internal_gateway_port,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        volume_mounts: Some(vec![data_volume_mount(config)]),
        env: Some(daemon_env(obj, config)),
        ..Default::default()
    }
}

/// Container running `zone create` with the token taken from the Secret
///
/// The token only ever reaches the command line through `$(REALM_TOKEN)`.
fn build_zone_container(
    obj: &ObjectStore,
    config: &OperatorConfig,
    container_name: &str,
    realm_token_secret: &str,
    endpoint: &str,
) -> Container {
    let mut env = daemon_env(obj, config);
    env.push(EnvVar {
        name: REALM_TOKEN_ENV.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: Some(realm_token_secret.to_string()),
                key: REALM_TOKEN_KEY.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    });

    Container {
        name: container_name.to_string(),
        image: Some(obj.spec.image.clone()),
        command: Some(vec![config.multisite_binary.clone()]),
        args: Some(CephCli::new(config).zone_create_args(
            &zone_name(obj),
            &env_var_reference(REALM_TOKEN_ENV),
            endpoint,
        )),
        volume_mounts: Some(vec![data_volume_mount(config)]),
        env: Some(env),
        ..Default::default()
    }
}

// ============================================================================
// Zone join Job
// ============================================================================

/// One-shot Job creating the zone of a joining site
pub fn build_zone_job(
    obj: &ObjectStore,
    config: &OperatorConfig,
    realm_token_secret: &str,
    endpoint: &str,
) -> Job {
    let labels = zone_job_labels(obj);

    Job {
        metadata: child_meta(obj, zone_job_name(obj), labels.clone()),
        spec: Some(JobSpec {
            backoff_limit: Some(ZONE_JOB_BACKOFF_LIMIT),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![build_zone_container(
                        obj,
                        config,
                        ZONE_JOB_APP,
                        realm_token_secret,
                        endpoint,
                    )],
                    volumes: Some(vec![data_volume(obj)]),
                    restart_policy: Some("OnFailure".to_string()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

/// Delete the zone join Job, tolerating its absence
#[instrument(skip(store, obj), fields(name = %obj.name_any(), namespace = obj.namespace()))]
pub async fn delete_zone_job<S: ResourceStore>(store: &S, obj: &ObjectStore) -> Result<()> {
    let name = zone_job_name(obj);
    match store.delete::<Job>(&namespace(obj), &name).await {
        Ok(()) => info!("Deleted zone job {}", name),
        Err(e) if is_not_found(&e) => {
            debug!("Zone job {} not found, already deleted", name);
        }
        Err(e) => return Err(Error::KubeError(e)),
    }
    Ok(())
}

// ============================================================================
// Realm token Secret
// ============================================================================

pub fn build_realm_token_secret(obj: &ObjectStore, token: &str) -> Secret {
    Secret {
        metadata: child_meta(obj, realm_token_secret_name(obj), standard_labels(obj)),
        data: Some(BTreeMap::from([(
            REALM_TOKEN_KEY.to_string(),
            ByteString(token.as_bytes().to_vec()),
        )])),
        type_: Some("Opaque".to_string()),
        ..Default::default()
    }
}

/// Publish the realm token; an existing Secret is left as it is
#[instrument(skip(store, obj, token), fields(name = %obj.name_any(), namespace = obj.namespace()))]
pub async fn create_realm_token_secret<S: ResourceStore>(
    store: &S,
    obj: &ObjectStore,
    token: &str,
) -> Result<()> {
    let secret = build_realm_token_secret(obj, token);
    match store.create(&namespace(obj), &secret).await {
        Ok(_) => info!("Created realm token secret {}", secret.name_any()),
        Err(e) if is_already_exists(&e) => {
            warn!("Realm token secret {} already exists", secret.name_any());
        }
        Err(e) => return Err(Error::KubeError(e)),
    }
    Ok(())
}
