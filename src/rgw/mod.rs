//! The ceph tooling wrapped by the operator
//!
//! The gateway image ships three binaries the operator drives: the gateway
//! daemon, the sqlite admin CLI and the multisite helper. This module owns
//! their command-line grammar and the parsing of what they print.

pub mod flags;
pub mod output;

pub use flags::{env_var_reference, new_flag, normalize_key, redact_command, stable_hash, CephCli};
pub use output::{
    parse_realm_list, parse_realm_token, validate_realm_token, ProtocolError,
};
