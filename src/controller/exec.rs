//! Remote command execution in gateway pods
//!
//! The admin tools only work against the gateway's local sqlite store, so the
//! operator runs them inside the gateway container over the pod `exec`
//! subresource. [`RemoteCommandExecutor`] resolves the target pod from a label
//! selector, wraps the command with `timeout` so a hung tool dies on the
//! remote side, and returns the captured output together with a best-effort
//! exit code.
//!
//! The exit code is the only reliable failure signal: the multisite helper
//! logs harmless diagnostics to stderr, so stderr content is never inspected.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::{Api, AttachParams};
use kube::Client;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, instrument, warn};

use super::store::ResourceStore;
use crate::error::{Error, Result};
use crate::rgw::flags::redact_command;

/// Extra time granted to the transport beyond the remote `timeout` before the
/// operator gives up on the stream itself
const TRANSPORT_GRACE: Duration = Duration::from_secs(5);

/// Captured result of one remote command
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    /// Process exit code, when the transport reported one
    pub exit_code: Option<i32>,
    /// Failure reported by the remote side, if any
    pub error: Option<String>,
}

impl ExecOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            exit_code: Some(0),
            ..Default::default()
        }
    }

    pub fn failure(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stderr: stderr.into(),
            exit_code: Some(exit_code),
            error: Some(format!("command terminated with non-zero exit code {exit_code}")),
            ..Default::default()
        }
    }

    /// Whether the command should be treated as failed
    ///
    /// A known exit code decides. Without one, only an explicit error counts.
    pub fn failed(&self) -> bool {
        match self.exit_code {
            Some(code) => code != 0,
            None => self.error.is_some(),
        }
    }

    /// Turn a failed command into [`Error::CommandFailed`] carrying stderr
    pub fn into_result(self, command: &str) -> Result<ExecOutput> {
        if self.failed() {
            return Err(Error::CommandFailed {
                command: command.to_string(),
                exit_code: self.exit_code,
                stderr: self.stderr,
            });
        }
        Ok(self)
    }

    fn trimmed(self) -> Self {
        Self {
            stdout: self.stdout.trim().to_string(),
            stderr: self.stderr.trim().to_string(),
            ..self
        }
    }
}

/// Which container to run in, found through a label selector
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecTarget {
    pub namespace: String,
    pub selector: String,
    pub container: String,
}

#[derive(Clone, Copy, Debug)]
pub struct ExecOptions {
    /// Hard wall-clock limit, enforced remotely with `timeout`
    pub timeout: Duration,
    /// Keep leading/trailing whitespace in stdout/stderr
    pub preserve_whitespace: bool,
}

impl ExecOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            preserve_whitespace: false,
        }
    }
}

/// Streams a command into a named container of a specific pod
#[async_trait]
pub trait ExecTransport: Send + Sync + 'static {
    /// Run `command` without stdin and collect its output
    ///
    /// Returns `Err` only when the stream itself failed. A command that ran
    /// and exited non-zero is an `Ok` with `exit_code`/`error` set.
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: Vec<String>,
    ) -> Result<ExecOutput>;
}

/// [`ExecTransport`] over the Kubernetes exec websocket
#[derive(Clone)]
pub struct KubeExecTransport {
    client: Client,
}

impl KubeExecTransport {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ExecTransport for KubeExecTransport {
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: Vec<String>,
    ) -> Result<ExecOutput> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = AttachParams::default()
            .container(container)
            .stdin(false)
            .stdout(true)
            .stderr(true);

        let mut attached = pods
            .exec(pod, command, &params)
            .await
            .map_err(|e| Error::TransportError(format!("failed to exec in pod {pod}: {e}")))?;

        let stdout = attached
            .stdout()
            .ok_or_else(|| Error::TransportError("stdout not available".to_string()))?;
        let stderr = attached
            .stderr()
            .ok_or_else(|| Error::TransportError("stderr not available".to_string()))?;
        let status = attached.take_status();

        let (stdout, stderr) = tokio::try_join!(read_stream(stdout), read_stream(stderr))?;
        let status = match status {
            Some(status) => status.await,
            None => None,
        };

        attached
            .join()
            .await
            .map_err(|e| Error::TransportError(e.to_string()))?;

        let (exit_code, error) = exit_status(status.as_ref());
        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code,
            error,
        })
    }
}

async fn read_stream(mut reader: impl AsyncRead + Unpin) -> Result<String> {
    let mut buf = Vec::new();
    reader
        .read_to_end(&mut buf)
        .await
        .map_err(|e| Error::TransportError(e.to_string()))?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Extract exit code and error message from the exec status channel
///
/// A `Success` status means exit code 0. A failure carries the code as an
/// `ExitCode` cause when the process ran; otherwise only the message is known.
pub fn exit_status(status: Option<&Status>) -> (Option<i32>, Option<String>) {
    let Some(status) = status else {
        return (None, None);
    };
    if status.status.as_deref() == Some("Success") {
        return (Some(0), None);
    }

    let code = status
        .details
        .as_ref()
        .and_then(|details| details.causes.as_ref())
        .and_then(|causes| {
            causes
                .iter()
                .find(|cause| cause.reason.as_deref() == Some("ExitCode"))
        })
        .and_then(|cause| cause.message.as_deref())
        .and_then(|message| message.trim().parse().ok());
    let message = status
        .message
        .clone()
        .unwrap_or_else(|| "command failed".to_string());

    (code, Some(message))
}

/// Prefix `command` with coreutils `timeout`
pub fn with_remote_timeout(command: &[String], timeout: Duration) -> Vec<String> {
    let secs = timeout.as_secs().max(1);
    let mut wrapped = vec!["timeout".to_string(), secs.to_string()];
    wrapped.extend(command.iter().cloned());
    wrapped
}

fn is_running(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_none()
        && pod.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Running")
}

/// Runs commands in the first running pod that matches a selector
pub struct RemoteCommandExecutor<S, T> {
    store: Arc<S>,
    transport: T,
}

impl<S: ResourceStore, T: ExecTransport> RemoteCommandExecutor<S, T> {
    pub fn new(store: Arc<S>, transport: T) -> Self {
        Self { store, transport }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Execute `command` in the target container
    ///
    /// Fails with [`Error::TargetNotFound`] before any remote call when no
    /// running pod matches. A non-zero exit is returned as `Ok`; use
    /// [`ExecOutput::into_result`] to branch on it.
    #[instrument(skip(self, command, options), fields(namespace = %target.namespace, selector = %target.selector))]
    pub async fn exec(
        &self,
        target: &ExecTarget,
        command: &[String],
        options: ExecOptions,
    ) -> Result<ExecOutput> {
        let pods: Vec<Pod> = self
            .store
            .list(&target.namespace, &target.selector)
            .await?;
        let pod_name = pods
            .iter()
            .find(|pod| is_running(pod))
            .and_then(|pod| pod.metadata.name.clone())
            .ok_or_else(|| Error::TargetNotFound {
                selector: target.selector.clone(),
                namespace: target.namespace.clone(),
            })?;

        let wrapped = with_remote_timeout(command, options.timeout);
        debug!(pod = %pod_name, container = %target.container, command = %redact_command(&wrapped), "Executing remote command");

        let output = tokio::time::timeout(
            options.timeout + TRANSPORT_GRACE,
            self.transport
                .exec(&target.namespace, &pod_name, &target.container, wrapped),
        )
        .await
        .map_err(|_| Error::ExecTimeout(options.timeout))??;

        if output.failed() {
            warn!(
                pod = %pod_name,
                exit_code = ?output.exit_code,
                "Remote command failed"
            );
        }

        Ok(if options.preserve_whitespace {
            output
        } else {
            output.trimmed()
        })
    }
}
