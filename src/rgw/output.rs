//! Parsing of the multisite tool output
//!
//! # Output grammar (version 1)
//!
//! - `rgwam-sqlite realm bootstrap` prints exactly one line of the form
//!   `Realm Token: <token>` where `<token>` is a single whitespace-free,
//!   standard-alphabet, padded base64 string. Other lines are ignored.
//! - `radosgw-admin-sqlite realm list` prints one JSON document with a
//!   `realms` array of realm names; other keys are ignored.
//!
//! Anything else is a [`ProtocolError`], never a generic failure.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Deserialize;
use thiserror::Error;

const REALM_TOKEN_PREFIX: &str = "Realm Token: ";

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("realm bootstrap output has no 'Realm Token: <token>' line: {output:?}")]
    MissingRealmToken { output: String },

    #[error("realm bootstrap output has {count} 'Realm Token:' lines, expected exactly one")]
    AmbiguousRealmToken { count: usize },

    /// The token is not valid base64; the value is deliberately not included
    #[error("realm token is not valid base64: {0}")]
    InvalidRealmToken(#[from] base64::DecodeError),

    #[error("failed to decode realm list: {source}")]
    MalformedRealmList {
        #[source]
        source: serde_json::Error,
    },

    #[error("secret {secret:?} has no {key:?} key")]
    MissingTokenKey { secret: String, key: String },

    #[error("secret {secret:?} key {key:?} is empty")]
    EmptyToken { secret: String, key: String },
}

#[derive(Debug, Deserialize)]
struct RealmList {
    #[serde(default)]
    realms: Vec<String>,
}

/// Extract and validate the token from `realm bootstrap` output
pub fn parse_realm_token(output: &str) -> Result<String, ProtocolError> {
    let tokens: Vec<&str> = output
        .lines()
        .filter_map(|line| line.trim_end().strip_prefix(REALM_TOKEN_PREFIX))
        .collect();

    let token = match tokens.as_slice() {
        [] => {
            return Err(ProtocolError::MissingRealmToken {
                output: output.to_string(),
            })
        }
        [token] => *token,
        many => return Err(ProtocolError::AmbiguousRealmToken { count: many.len() }),
    };

    if token.is_empty() || token.chars().any(char::is_whitespace) {
        return Err(ProtocolError::MissingRealmToken {
            output: output.to_string(),
        });
    }

    validate_realm_token(token)?;
    Ok(token.to_string())
}

/// A realm token must be standard-alphabet, padded base64
pub fn validate_realm_token(token: &str) -> Result<(), ProtocolError> {
    STANDARD.decode(token)?;
    Ok(())
}

/// Decode the realm names from `realm list` output
pub fn parse_realm_list(output: &str) -> Result<Vec<String>, ProtocolError> {
    let list: RealmList = serde_json::from_str(output.trim())
        .map_err(|source| ProtocolError::MalformedRealmList { source })?;
    Ok(list.realms)
}
