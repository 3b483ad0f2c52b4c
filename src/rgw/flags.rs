//! Command-line construction for the ceph tools

use sha2::{Digest, Sha256};

use crate::config::OperatorConfig;

/// Convert a ceph config key to its underscore form
///
/// Ceph accepts spaces, underscores and hyphens interchangeably in config
/// keys. Normalizing lets "debug rgw", "debug_rgw" and "debug-rgw" compare equal.
pub fn normalize_key(key: &str) -> String {
    key.replace([' ', '-'], "_")
}

/// Build a `--key=value` flag, e.g. `("debug rgw", "15")` becomes `--debug-rgw=15`
pub fn new_flag(key: &str, value: &str) -> String {
    let flag = normalize_key(key).replace('_', "-");
    format!("--{flag}={value}")
}

/// Reference to a container env var usable in command or args fields
pub fn env_var_reference(name: &str) -> String {
    format!("$({name})")
}

/// Stable pseudorandom string derived from `seed`
///
/// Do NOT change the output of this function: gateway identities are derived
/// from it and must survive operator upgrades.
pub fn stable_hash(seed: &str) -> String {
    let digest = Sha256::digest(seed.as_bytes());
    hex::encode(&digest[..16])
}

/// Argument builders for the daemon, admin and multisite tools
#[derive(Clone, Copy, Debug)]
pub struct CephCli<'a> {
    config: &'a OperatorConfig,
}

impl<'a> CephCli<'a> {
    pub fn new(config: &'a OperatorConfig) -> Self {
        Self { config }
    }

    /// Flags shared by the daemon and the admin CLI
    ///
    /// There is no monitor to talk to and no cephx, and ceph refuses to start
    /// without a conf file even though it never reads anything useful from it.
    pub fn default_flags(&self) -> Vec<String> {
        vec![
            "--no-mon-config".to_string(),
            new_flag("librados sqlite data dir", &self.config.data_directory),
            new_flag("auth-client-required", "none"),
            new_flag("auth-service-required", "none"),
            new_flag("auth-cluster-required", "none"),
            new_flag("conf", &self.config.ceph_conf),
        ]
    }

    /// Foreground daemon flags, logging to stdout
    pub fn daemon_flags(&self) -> Vec<String> {
        let mut flags = vec!["-d".to_string(), "--nolockdep".to_string()];
        flags.extend(self.default_flags());
        flags
    }

    /// Full argument list for the gateway daemon
    ///
    /// `--id` is hashed from the instance name, which keeps it short enough
    /// for the admin socket path and identical across pod restarts.
    pub fn daemon_args(&self, instance_name: &str, host: &str) -> Vec<String> {
        let mut args = self.daemon_flags();
        args.push(new_flag("id", &stable_hash(instance_name)));
        args.push(new_flag("host", host));
        args.extend(
            self.config
                .extra_daemon_flags
                .iter()
                .map(|(key, value)| new_flag(key, value)),
        );
        args
    }

    /// `radosgw-admin-sqlite <default flags> <args...>`
    pub fn admin_command(&self, args: &[&str]) -> Vec<String> {
        let mut cmd = vec![self.config.admin_binary.clone()];
        cmd.extend(self.default_flags());
        cmd.extend(args.iter().map(|a| a.to_string()));
        cmd
    }

    pub fn realm_list(&self) -> Vec<String> {
        self.admin_command(&["realm", "list"])
    }

    pub fn realm_bootstrap(&self, endpoint: &str) -> Vec<String> {
        vec![
            self.config.multisite_binary.clone(),
            "realm".to_string(),
            "bootstrap".to_string(),
            format!("--endpoints={endpoint}"),
        ]
    }

    /// Arguments (without the binary) for `zone create`
    pub fn zone_create_args(&self, zone: &str, token: &str, endpoint: &str) -> Vec<String> {
        vec![
            "zone".to_string(),
            "create".to_string(),
            format!("--zone={zone}"),
            format!("--realm-token={token}"),
            format!("--endpoints={endpoint}"),
        ]
    }

    pub fn zone_create(&self, zone: &str, token: &str, endpoint: &str) -> Vec<String> {
        let mut cmd = vec![self.config.multisite_binary.clone()];
        cmd.extend(self.zone_create_args(zone, token, endpoint));
        cmd
    }

    /// Value for `CEPH_ARGS`
    ///
    /// The multisite helper rejects some admin flags on its command line but
    /// honours them from the environment.
    pub fn ceph_args_env(&self) -> String {
        [
            new_flag("librados sqlite data dir", &self.config.data_directory),
            "--no-mon-config".to_string(),
            new_flag("conf", &self.config.ceph_conf),
        ]
        .join(" ")
    }
}

/// Replace realm token values so commands can be logged
pub fn redact_command(cmd: &[String]) -> String {
    cmd.iter()
        .map(|arg| match arg.split_once('=') {
            Some((flag, _)) if flag == "--realm-token" => format!("{flag}=<redacted>"),
            _ => arg.clone(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}
