//! Bounded polling for pod readiness and Job completion
//!
//! Both waits block the reconcile pass that issued them. They are driven by a
//! [`RetryPolicy`] so the cadence can change without touching call sites, and
//! they stop as soon as the pass is cancelled.

use std::future::Future;
use std::time::Duration;

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::store::ResourceStore;
use crate::error::{Error, Result};

/// Delay growth between attempts
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backoff {
    Fixed,
    /// Doubles the interval every attempt, capped at `max`
    Exponential { max: Duration },
}

/// Outcome of a single probe
#[derive(Debug)]
pub enum Probe<T> {
    Ready(T),
    /// Not there yet; the string says why
    Pending(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Give up after this many probes
    pub max_attempts: Option<u32>,
    pub interval: Duration,
    /// Give up once this much time has passed since the first probe
    pub timeout: Option<Duration>,
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Fixed number of probes at a fixed interval
    pub fn attempts(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            interval,
            timeout: None,
            backoff: Backoff::Fixed,
        }
    }

    /// Probe at a fixed interval until `timeout` expires
    pub fn deadline(interval: Duration, timeout: Duration) -> Self {
        Self {
            max_attempts: None,
            interval,
            timeout: Some(timeout),
            backoff: Backoff::Fixed,
        }
    }

    pub fn with_backoff(self, backoff: Backoff) -> Self {
        Self { backoff, ..self }
    }

    /// Delay to wait after the given (1-based) attempt
    pub fn delay(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.interval,
            Backoff::Exponential { max } => {
                let factor = 2_u32.saturating_pow(attempt.saturating_sub(1).min(16));
                self.interval.saturating_mul(factor).min(max)
            }
        }
    }

    /// Run `probe` until it is ready, fails, or the budget runs out
    ///
    /// A probe error ends the loop immediately. Cancellation is checked
    /// before every probe and while sleeping.
    pub async fn run<T, F, Fut>(
        &self,
        what: &str,
        cancel: &CancellationToken,
        mut probe: F,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<Probe<T>>>,
    {
        let started = Instant::now();
        let mut attempt = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            attempt += 1;

            match probe(attempt).await? {
                Probe::Ready(value) => return Ok(value),
                Probe::Pending(reason) => {
                    debug!(attempt, what, reason = %reason, "Still waiting");
                }
            }

            if self.max_attempts.is_some_and(|max| attempt >= max) {
                return Err(Error::RetriesExhausted {
                    what: what.to_string(),
                    attempts: attempt,
                });
            }

            let mut delay = self.delay(attempt);
            if let Some(timeout) = self.timeout {
                let elapsed = started.elapsed();
                if elapsed >= timeout {
                    return Err(Error::Timeout {
                        what: what.to_string(),
                        timeout,
                    });
                }
                delay = delay.min(timeout - elapsed);
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

fn pod_phase(pod: &Pod) -> &str {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("Unknown")
}

/// Wait until every pod matching `selector` is Running
///
/// Pods that are already terminating are ignored. Returns the first running
/// pod. List failures are logged and count as a pending attempt.
#[instrument(skip(store, policy, cancel))]
pub async fn wait_for_pods_running<S: ResourceStore>(
    store: &S,
    namespace: &str,
    selector: &str,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<Pod> {
    let what = format!("pod(s) with label {selector} to be running");
    policy
        .run(&what, cancel, |attempt| async move {
            let pods = match store.list::<Pod>(namespace, selector).await {
                Ok(pods) => pods,
                Err(e) => {
                    warn!(attempt, error = %e, "Failed to list pods");
                    return Ok(Probe::Pending(format!("list failed: {e}")));
                }
            };

            let live: Vec<Pod> = pods
                .into_iter()
                .filter(|pod| pod.metadata.deletion_timestamp.is_none())
                .collect();
            let running = live
                .iter()
                .filter(|pod| pod_phase(pod) == "Running")
                .count();

            if !live.is_empty() && running == live.len() {
                info!(pods = live.len(), selector, "All pod(s) running");
                return Ok(Probe::Ready(live[0].clone()));
            }

            let last_phase = live.last().map(pod_phase).unwrap_or("None").to_string();
            info!(
                attempt,
                running,
                pods = live.len(),
                last_phase = %last_phase,
                "Waiting for pod(s) to be running"
            );
            Ok(Probe::Pending(format!(
                "{running}/{} running, last phase {last_phase}",
                live.len()
            )))
        })
        .await
}

/// Observed state of a one-shot Job
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobState {
    Succeeded,
    /// A pod is running, possibly a retry after earlier failures
    Active,
    /// Failed with no pod left running
    Failed,
    /// Status not populated yet
    Initializing,
}

pub fn job_state(job: &Job) -> JobState {
    let status = job.status.as_ref();
    let count = |f: fn(&k8s_openapi::api::batch::v1::JobStatus) -> Option<i32>| {
        status.and_then(f).unwrap_or(0)
    };

    if count(|s| s.succeeded) > 0 {
        JobState::Succeeded
    } else if count(|s| s.active) > 0 {
        JobState::Active
    } else if count(|s| s.failed) > 0 {
        JobState::Failed
    } else {
        JobState::Initializing
    }
}

/// Wait for a Job to report a successful completion
///
/// A failed completion or a Job that vanished ends the wait with an error.
#[instrument(skip(store, policy, cancel))]
pub async fn wait_for_job_completion<S: ResourceStore>(
    store: &S,
    namespace: &str,
    name: &str,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<()> {
    info!(job = name, "Waiting for job to complete");
    let what = format!("job {name} to complete");
    policy
        .run(&what, cancel, |_| async move {
            let job = store
                .get::<Job>(namespace, name)
                .await?
                .ok_or_else(|| Error::JobFailed(format!("{name} (deleted while waiting)")))?;

            match job_state(&job) {
                JobState::Succeeded => Ok(Probe::Ready(())),
                JobState::Failed => Err(Error::JobFailed(name.to_string())),
                JobState::Active => Ok(Probe::Pending("job is still running".to_string())),
                JobState::Initializing => {
                    Ok(Probe::Pending("job is still initializing".to_string()))
                }
            }
        })
        .await
}
