//! Multisite realm bootstrap and zone join
//!
//! The origin site bootstraps a realm inside its running gateway and
//! publishes the realm token in a Secret. The user copies that Secret next to
//! the joining site, which creates its own zone in the realm with the token,
//! either by exec'ing `zone create` in its gateway or through a one-shot Job.
//!
//! Both directions advertise the gateway endpoint URL, so callers resolve the
//! Service first. Every step is safe to replay: an existing realm makes
//! bootstrap a no-op, an existing realm on the joiner or a completed Job makes
//! the join a no-op.

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use super::exec::{ExecOptions, ExecOutput, ExecTarget, ExecTransport, RemoteCommandExecutor};
use super::readiness::{job_state, wait_for_job_completion, wait_for_pods_running, JobState};
use super::resources::{
    build_zone_job, create_realm_token_secret, label_selector, namespace, realm_token_secret_name,
    zone_job_name, zone_name, REALM_TOKEN_KEY,
};
use super::store::ResourceStore;
use crate::config::{OperatorConfig, ZoneJoinStrategy};
use crate::crd::ObjectStore;
use crate::error::{is_already_exists, is_not_found, Error, Result};
use crate::rgw::{
    parse_realm_list, parse_realm_token, redact_command, validate_realm_token, CephCli,
    ProtocolError,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// A realm already existed, nothing was run
    AlreadyBootstrapped { realm: String },
    /// A new realm was bootstrapped and its token published
    Bootstrapped { secret: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinOutcome {
    AlreadyJoined,
    Joined,
}

/// Drives the multisite commands for one reconcile pass
pub struct MultisiteProtocol<'a, S, T> {
    store: &'a S,
    executor: &'a RemoteCommandExecutor<S, T>,
    config: &'a OperatorConfig,
    cancel: &'a CancellationToken,
}

impl<'a, S: ResourceStore, T: ExecTransport> MultisiteProtocol<'a, S, T> {
    pub fn new(
        store: &'a S,
        executor: &'a RemoteCommandExecutor<S, T>,
        config: &'a OperatorConfig,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            store,
            executor,
            config,
            cancel,
        }
    }

    fn target(&self, obj: &ObjectStore) -> ExecTarget {
        ExecTarget {
            namespace: namespace(obj),
            selector: label_selector(obj),
            container: self.config.gateway_container.clone(),
        }
    }

    /// Run a command in the gateway container, failing on a non-zero exit
    async fn run(&self, obj: &ObjectStore, command: Vec<String>) -> Result<ExecOutput> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let options = ExecOptions::with_timeout(self.config.exec_timeout);
        let output = self
            .executor
            .exec(&self.target(obj), &command, options)
            .await?;
        output.into_result(&redact_command(&command))
    }

    /// Realms known to the gateway's store
    pub async fn list_realms(&self, obj: &ObjectStore) -> Result<Vec<String>> {
        let output = self.run(obj, CephCli::new(self.config).realm_list()).await?;
        Ok(parse_realm_list(&output.stdout)?)
    }

    // ========================================================================
    // Origin site
    // ========================================================================

    /// Bootstrap a realm on the origin site and publish its token
    ///
    /// With `restart_after_bootstrap` the gateway pod is deleted afterwards
    /// so the daemon comes back with the realm configuration, and the pass
    /// waits for the replacement pod.
    #[instrument(skip(self, obj), fields(name = %obj.name_any(), namespace = obj.namespace()))]
    pub async fn bootstrap_realm(
        &self,
        obj: &ObjectStore,
        endpoint: &str,
    ) -> Result<BootstrapOutcome> {
        let realms = self.list_realms(obj).await?;
        if let Some(realm) = realms.into_iter().next() {
            info!(realm = %realm, "Realm already exists");
            self.warn_if_token_unpublished(obj).await;
            return Ok(BootstrapOutcome::AlreadyBootstrapped { realm });
        }

        let command = CephCli::new(self.config).realm_bootstrap(endpoint);
        let output = self.run(obj, command).await?;
        let token = parse_realm_token(&output.stdout)?;

        create_realm_token_secret(self.store, obj, &token).await?;
        let secret = realm_token_secret_name(obj);
        info!(secret = %secret, "Bootstrapped realm");

        if self.config.restart_after_bootstrap {
            self.restart_gateway(obj).await?;
        }

        Ok(BootstrapOutcome::Bootstrapped { secret })
    }

    /// The token can only be captured from bootstrap output, so a realm
    /// without its Secret needs manual attention
    async fn warn_if_token_unpublished(&self, obj: &ObjectStore) {
        let secret = realm_token_secret_name(obj);
        match self.store.get::<Secret>(&namespace(obj), &secret).await {
            Ok(Some(_)) => {}
            Ok(None) => warn!(
                secret = %secret,
                "Realm exists but its token secret is missing, it has to be recreated by hand"
            ),
            Err(e) => warn!(secret = %secret, error = %e, "Failed to look up realm token secret"),
        }
    }

    /// Delete the running gateway pod(s) and wait for the replacement
    async fn restart_gateway(&self, obj: &ObjectStore) -> Result<Pod> {
        let ns = namespace(obj);
        let selector = label_selector(obj);
        let pods: Vec<Pod> = self.store.list(&ns, &selector).await?;

        for pod in pods
            .iter()
            .filter(|pod| pod.metadata.deletion_timestamp.is_none())
        {
            let name = pod.name_any();
            match self.store.delete::<Pod>(&ns, &name).await {
                Ok(()) => info!(pod = %name, "Restarting gateway to load the realm configuration"),
                Err(e) if is_not_found(&e) => {}
                Err(e) => return Err(Error::KubeError(e)),
            }
        }

        wait_for_pods_running(
            self.store,
            &ns,
            &selector,
            &self.config.pod_ready_policy,
            self.cancel,
        )
        .await
    }

    // ========================================================================
    // Joining site
    // ========================================================================

    /// Read and check the realm token from the Secret the user provided
    pub async fn read_realm_token(&self, obj: &ObjectStore, secret_name: &str) -> Result<String> {
        let secret = self
            .store
            .get::<Secret>(&namespace(obj), secret_name)
            .await?
            .ok_or_else(|| Error::RealmTokenSecretNotFound(secret_name.to_string()))?;

        let bytes = secret
            .data
            .as_ref()
            .and_then(|data| data.get(REALM_TOKEN_KEY))
            .ok_or_else(|| ProtocolError::MissingTokenKey {
                secret: secret_name.to_string(),
                key: REALM_TOKEN_KEY.to_string(),
            })?;

        let token = String::from_utf8_lossy(&bytes.0).trim().to_string();
        if token.is_empty() {
            return Err(ProtocolError::EmptyToken {
                secret: secret_name.to_string(),
                key: REALM_TOKEN_KEY.to_string(),
            }
            .into());
        }
        validate_realm_token(&token)?;
        Ok(token)
    }

    /// Create this site's zone in the realm the token belongs to
    #[instrument(skip(self, obj), fields(name = %obj.name_any(), namespace = obj.namespace()))]
    pub async fn join_zone(
        &self,
        obj: &ObjectStore,
        secret_name: &str,
        endpoint: &str,
    ) -> Result<JoinOutcome> {
        let token = self.read_realm_token(obj, secret_name).await?;

        match self.config.zone_join_strategy {
            ZoneJoinStrategy::Exec => self.join_zone_exec(obj, &token, endpoint).await,
            ZoneJoinStrategy::Job => self.join_zone_job(obj, secret_name, endpoint).await,
        }
    }

    async fn join_zone_exec(
        &self,
        obj: &ObjectStore,
        token: &str,
        endpoint: &str,
    ) -> Result<JoinOutcome> {
        let realms = self.list_realms(obj).await?;
        if !realms.is_empty() {
            info!(realms = ?realms, "Zone already belongs to a realm");
            return Ok(JoinOutcome::AlreadyJoined);
        }

        let command = CephCli::new(self.config).zone_create(&zone_name(obj), token, endpoint);
        let output = self.run(obj, command).await?;
        info!(output = %output.stdout, "Created zone");
        Ok(JoinOutcome::Joined)
    }

    async fn join_zone_job(
        &self,
        obj: &ObjectStore,
        secret_name: &str,
        endpoint: &str,
    ) -> Result<JoinOutcome> {
        let ns = namespace(obj);
        let name = zone_job_name(obj);

        match self.store.get::<Job>(&ns, &name).await? {
            Some(job) => match job_state(&job) {
                JobState::Succeeded => {
                    info!(job = %name, "Zone job already completed");
                    return Ok(JoinOutcome::AlreadyJoined);
                }
                JobState::Failed => {
                    warn!(job = %name, "Zone job failed, deleting it so the next pass retries");
                    match self.store.delete::<Job>(&ns, &name).await {
                        Ok(()) => {}
                        Err(e) if is_not_found(&e) => {}
                        Err(e) => return Err(Error::KubeError(e)),
                    }
                    return Err(Error::JobFailed(name));
                }
                _ => info!(job = %name, "Zone job in progress"),
            },
            None => {
                let job = build_zone_job(obj, self.config, secret_name, endpoint);
                match self.store.create(&ns, &job).await {
                    Ok(_) => info!(job = %name, "Created zone job"),
                    Err(e) if is_already_exists(&e) => {
                        info!(job = %name, "Zone job already exists")
                    }
                    Err(e) => return Err(Error::KubeError(e)),
                }
            }
        }

        wait_for_job_completion(
            self.store,
            &ns,
            &name,
            &self.config.job_poll_policy,
            self.cancel,
        )
        .await?;
        Ok(JoinOutcome::Joined)
    }
}
