//! ObjectStore Custom Resource Definition
//!
//! An ObjectStore is a single standalone Ceph Object Gateway backed by a
//! sqlite store on a PVC. It can optionally take part in a multisite realm,
//! either as the origin site that bootstraps the realm or as a joining site
//! that adds its own zone.

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::CustomResource;
use schemars::gen::SchemaGenerator;
use schemars::schema::{InstanceType, Schema, SchemaObject};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "object.rgw-standalone.io",
    version = "v1alpha1",
    kind = "ObjectStore",
    namespaced,
    status = "ObjectStoreStatus",
    shortname = "objs",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Port","type":"integer","jsonPath":".spec.gateway.port"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ObjectStoreSpec {
    /// Container image for the gateway and its helper containers
    pub image: String,

    #[serde(default)]
    pub gateway: GatewaySpec,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multisite: Option<MultisiteSpec>,

    /// Template for the PVC holding the gateway database
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub volume_claim_template: Option<PersistentVolumeClaim>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GatewaySpec {
    /// Port the gateway Service listens on (http)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MultisiteSpec {
    /// True if this gateway bootstraps the realm
    #[serde(default)]
    pub is_main_site: bool,

    /// Secret holding the realm token of the origin site, used to join its realm
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realm_token_secret_name: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectStoreStatus {
    #[serde(default)]
    pub phase: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// The part an ObjectStore plays in a multisite federation
///
/// Computed once per reconcile pass and handed down, so the protocol code
/// never re-derives it from the raw spec fields.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SiteRole {
    Standalone,
    /// Bootstraps a realm and publishes its token
    Origin,
    /// Joins the realm whose token is stored in the named Secret
    Joiner { realm_token_secret: String },
}

impl SiteRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            SiteRole::Standalone => "standalone",
            SiteRole::Origin => "origin",
            SiteRole::Joiner { .. } => "joiner",
        }
    }
}

impl ObjectStoreSpec {
    /// A realm token Secret is referenced, so this site joins a realm
    pub fn is_multisite(&self) -> bool {
        self.multisite
            .as_ref()
            .and_then(|m| m.realm_token_secret_name.as_deref())
            .is_some_and(|name| !name.is_empty())
    }

    pub fn is_main_site(&self) -> bool {
        self.multisite.as_ref().is_some_and(|m| m.is_main_site)
    }

    /// Both `isMainSite` and `realmTokenSecretName` are set
    pub fn has_ambiguous_role(&self) -> bool {
        self.is_multisite() && self.is_main_site()
    }

    /// Resolve the site role
    ///
    /// When both predicates hold the joiner role wins: a joined zone already
    /// belongs to a realm, so bootstrapping another one on top of it is never
    /// what the user wants. Callers surface the ambiguity separately.
    pub fn site_role(&self) -> SiteRole {
        if self.is_multisite() {
            let secret = self
                .multisite
                .as_ref()
                .and_then(|m| m.realm_token_secret_name.clone())
                .unwrap_or_default();
            SiteRole::Joiner {
                realm_token_secret: secret,
            }
        } else if self.is_main_site() {
            SiteRole::Origin
        } else {
            SiteRole::Standalone
        }
    }

    /// Validate the spec before any child resource is touched
    pub fn validate(&self) -> Result<(), String> {
        if self.image.trim().is_empty() {
            return Err("spec.image must not be empty".to_string());
        }
        if let Some(port) = self.gateway.port {
            if !(0..=65535).contains(&port) {
                return Err(format!(
                    "spec.gateway.port {port} is out of range (0-65535)"
                ));
            }
        }
        Ok(())
    }
}

fn preserve_unknown_fields(_: &mut SchemaGenerator) -> Schema {
    let mut schema = SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        ..Default::default()
    };
    schema.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        serde_json::Value::Bool(true),
    );
    Schema::Object(schema)
}
