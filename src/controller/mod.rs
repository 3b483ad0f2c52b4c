//! Controller module for ObjectStore reconciliation
//! This module contains the main controller loop, reconciliation logic,
//! and resource management for standalone gateways.

pub mod events;
pub mod exec;
mod finalizers;
pub mod multisite;
pub mod readiness;
mod reconciler;
pub mod resources;
#[cfg(test)]
mod resources_test;
pub mod store;
#[cfg(test)]
pub(crate) mod testing;

pub use exec::{
    ExecOptions, ExecOutput, ExecTarget, ExecTransport, KubeExecTransport, RemoteCommandExecutor,
};
pub use finalizers::finalizer_name;
pub use multisite::{BootstrapOutcome, JoinOutcome, MultisiteProtocol};
pub use readiness::{wait_for_job_completion, wait_for_pods_running, Backoff, Probe, RetryPolicy};
pub use reconciler::{
    error_policy, reconcile, run_controller, Context, PHASE_CONVERGING, PHASE_FAILED, PHASE_READY,
};
pub use store::{KubeStore, ResourceStore, StoreResource};
