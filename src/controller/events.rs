//! Kubernetes Events for ObjectStore milestones
//!
//! Events are best effort: a failure to record one is logged and never fails
//! the reconcile pass.

use k8s_openapi::api::core::v1::Event;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};
use tracing::warn;

use super::store::ResourceStore;
use crate::crd::ObjectStore;

pub const REPORTING_COMPONENT: &str = "rgw-standalone-operator";

pub mod reasons {
    /// The origin site bootstrapped a realm and published its token
    pub const REALM_BOOTSTRAPPED: &str = "RealmBootstrapped";
    /// A joining site created its zone in the realm
    pub const ZONE_JOINED: &str = "ZoneJoined";
    /// Both `isMainSite` and `realmTokenSecretName` are set
    pub const AMBIGUOUS_MULTISITE_ROLE: &str = "AmbiguousMultisiteRole";
    pub const VALIDATION_FAILED: &str = "ValidationFailed";
    pub const RECONCILE_FAILED: &str = "ReconcileFailed";
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Normal => "Normal",
            EventType::Warning => "Warning",
        }
    }
}

pub fn build_event(obj: &ObjectStore, event_type: EventType, reason: &str, message: &str) -> Event {
    let time = chrono::Utc::now();
    Event {
        metadata: ObjectMeta {
            generate_name: Some(format!("{}-event-", obj.name_any())),
            namespace: obj.namespace(),
            ..Default::default()
        },
        type_: Some(event_type.as_str().to_string()),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
        involved_object: obj.object_ref(&()),
        first_timestamp: Some(Time(time)),
        last_timestamp: Some(Time(time)),
        count: Some(1),
        reporting_component: Some(REPORTING_COMPONENT.to_string()),
        ..Default::default()
    }
}

/// Record an Event on the ObjectStore
pub async fn emit_event<S: ResourceStore>(
    store: &S,
    obj: &ObjectStore,
    event_type: EventType,
    reason: &str,
    message: &str,
) {
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let event = build_event(obj, event_type, reason, message);
    if let Err(e) = store.create(&namespace, &event).await {
        warn!(reason, error = %e, "Failed to publish Kubernetes event");
    }
}
