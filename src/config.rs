//! Operator configuration
//!
//! Every fixed constant the gateway pods depend on (ceph uid/gid, ports, tool
//! names, data directory, polling budgets) lives in [`OperatorConfig`]. The
//! config is built once at startup and shared read-only by every component, so
//! tests can swap in their own values.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::controller::RetryPolicy;

/// How a joining site runs `zone create` after its gateway is up
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ZoneJoinStrategy {
    /// Exec the command inside the running gateway container
    #[default]
    Exec,
    /// Run the command in a dedicated one-shot Job and wait for it
    Job,
}

impl FromStr for ZoneJoinStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "exec" => Ok(ZoneJoinStrategy::Exec),
            "job" => Ok(ZoneJoinStrategy::Job),
            other => Err(format!(
                "unknown zone join strategy {other:?}, expected \"exec\" or \"job\""
            )),
        }
    }
}

impl fmt::Display for ZoneJoinStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ZoneJoinStrategy::Exec => write!(f, "exec"),
            ZoneJoinStrategy::Job => write!(f, "job"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// uid of the `ceph` user inside the gateway image
    pub ceph_uid: i64,
    /// gid of the `ceph` group inside the gateway image
    pub ceph_gid: i64,
    /// Service port used when `spec.gateway.port` is unset or zero
    pub default_gateway_port: i32,
    /// Port the gateway process listens on inside the container
    pub internal_gateway_port: i32,
    pub data_directory: String,
    /// Name of the gateway container, also the exec target container
    pub gateway_container: String,
    pub daemon_binary: String,
    pub admin_binary: String,
    /// Multisite bootstrap/join tool
    pub multisite_binary: String,
    /// Dummy ceph.conf path handed to every ceph tool
    pub ceph_conf: String,
    pub ceph_lib: String,
    /// Flags appended to the daemon command line after the identity pair
    pub extra_daemon_flags: Vec<(String, String)>,
    /// Hard wall-clock limit for a single remote command
    pub exec_timeout: Duration,
    pub pod_ready_policy: RetryPolicy,
    pub job_poll_policy: RetryPolicy,
    pub zone_join_strategy: ZoneJoinStrategy,
    /// Delete the origin gateway pod after bootstrapping a realm so the daemon
    /// restarts with the realm configuration
    pub restart_after_bootstrap: bool,
    /// PVC request used when the ObjectStore has no volumeClaimTemplate
    pub default_volume_size: String,
    /// Requeue interval once an ObjectStore is Ready
    pub resync_interval: Duration,
    /// Field manager used for patches
    pub field_manager: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            ceph_uid: 167,
            ceph_gid: 167,
            default_gateway_port: 8080,
            internal_gateway_port: 7480,
            data_directory: "/var/lib/ceph/radosgw/data".to_string(),
            gateway_container: "rgw".to_string(),
            daemon_binary: "radosgw-sqlite".to_string(),
            admin_binary: "radosgw-admin-sqlite".to_string(),
            multisite_binary: "rgwam-sqlite".to_string(),
            ceph_conf: "/etc/ceph/rbdmap".to_string(),
            ceph_lib: "/usr/lib64/rados-classes".to_string(),
            extra_daemon_flags: vec![
                // keeps the DB initialization progress visible in the pod logs
                ("debug rgw".to_string(), "15".to_string()),
                ("rgw cache enabled".to_string(), "false".to_string()),
            ],
            exec_timeout: Duration::from_secs(15),
            pod_ready_policy: RetryPolicy::attempts(5, Duration::from_secs(30)),
            job_poll_policy: RetryPolicy::deadline(Duration::from_secs(5), Duration::from_secs(600)),
            zone_join_strategy: ZoneJoinStrategy::Exec,
            restart_after_bootstrap: true,
            default_volume_size: "10Gi".to_string(),
            resync_interval: Duration::from_secs(60),
            field_manager: "rgw-standalone-operator".to_string(),
        }
    }
}

impl OperatorConfig {
    /// Resolve the Service port for a spec value, falling back to the default
    pub fn gateway_port(&self, spec_port: Option<i32>) -> i32 {
        match spec_port {
            Some(port) if port != 0 => port,
            _ => self.default_gateway_port,
        }
    }

    /// Sanity-check values that came from the command line
    pub fn validate(&self) -> crate::Result<()> {
        if self.exec_timeout.is_zero() {
            return Err(crate::Error::ConfigError(
                "exec timeout must be greater than zero".to_string(),
            ));
        }
        if self.pod_ready_policy.max_attempts == Some(0) {
            return Err(crate::Error::ConfigError(
                "pod readiness retries must be at least 1".to_string(),
            ));
        }
        if !(1..=65535).contains(&self.default_gateway_port) {
            return Err(crate::Error::ConfigError(format!(
                "default gateway port {} is out of range",
                self.default_gateway_port
            )));
        }
        Ok(())
    }
}
