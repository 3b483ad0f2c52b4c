//! Finalizer handling for ObjectStore cleanup
//!
//! The finalizer keeps a deleted ObjectStore around until the operator has
//! removed what owner references do not cover (the zone join Job). Removal
//! is unconditional once cleanup ran, so a broken cleanup never wedges the
//! deletion.

use kube::{Resource, ResourceExt};
use serde_json::json;
use tracing::info;

use super::store::ResourceStore;
use crate::crd::ObjectStore;
use crate::error::Result;

/// Finalizer name derived from the kind and API group/version
///
/// `objectstore.object.rgw-standalone.io/v1alpha1`
pub fn finalizer_name() -> String {
    format!(
        "{}.{}",
        ObjectStore::kind(&()).to_lowercase(),
        ObjectStore::api_version(&())
    )
}

/// Check if the object store is being deleted
pub fn is_being_deleted(obj: &ObjectStore) -> bool {
    obj.metadata.deletion_timestamp.is_some()
}

/// Check if the object store has our finalizer
pub fn has_finalizer(obj: &ObjectStore) -> bool {
    let name = finalizer_name();
    obj.finalizers().iter().any(|f| *f == name)
}

/// Patch the finalizer list, guarded by the resourceVersion it was read at
async fn patch_finalizers<S: ResourceStore>(
    store: &S,
    obj: &ObjectStore,
    finalizers: Vec<String>,
) -> Result<ObjectStore> {
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let patch = json!({
        "metadata": {
            "finalizers": finalizers,
            "resourceVersion": obj.resource_version(),
        }
    });
    Ok(store
        .patch_merge::<ObjectStore>(&namespace, &obj.name_any(), &patch)
        .await?)
}

/// Add finalizer to an ObjectStore if not present
pub async fn add_finalizer<S: ResourceStore>(store: &S, obj: &ObjectStore) -> Result<ObjectStore> {
    if has_finalizer(obj) {
        return Ok(obj.clone());
    }

    let mut finalizers = obj.finalizers().to_vec();
    finalizers.push(finalizer_name());
    let updated = patch_finalizers(store, obj, finalizers).await?;
    info!("Added finalizer to ObjectStore: {}", obj.name_any());
    Ok(updated)
}

/// Remove finalizer after cleanup is complete
///
/// Once the finalizer is gone Kubernetes completes the deletion.
pub async fn remove_finalizer<S: ResourceStore>(store: &S, obj: &ObjectStore) -> Result<()> {
    if !has_finalizer(obj) {
        return Ok(());
    }

    let name = finalizer_name();
    let finalizers: Vec<String> = obj
        .finalizers()
        .iter()
        .filter(|f| **f != name)
        .cloned()
        .collect();
    patch_finalizers(store, obj, finalizers).await?;

    info!("Removed finalizer from ObjectStore: {}", obj.name_any());
    Ok(())
}
