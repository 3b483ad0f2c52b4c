//! Resource store abstraction
//!
//! Everything the reconciler reads or writes in the cluster goes through
//! [`ResourceStore`]. Production code uses [`KubeStore`]; tests use the
//! in-memory store from `controller::testing`.
//!
//! Errors are plain [`kube::Error`] so callers can branch on API status codes
//! (404, 409 `AlreadyExists`, 409 `Conflict`) exactly as they would with `Api`.

use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Namespaced, statically-typed resource the store can handle
pub trait StoreResource:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<K> StoreResource for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

#[async_trait]
pub trait ResourceStore: Send + Sync + 'static {
    /// Fetch an object, `None` if it does not exist
    async fn get<K: StoreResource>(&self, namespace: &str, name: &str) -> kube::Result<Option<K>>;

    /// List objects matching an equality-based label selector (`k=v,k2=v2`)
    async fn list<K: StoreResource>(&self, namespace: &str, selector: &str)
        -> kube::Result<Vec<K>>;

    async fn create<K: StoreResource>(&self, namespace: &str, obj: &K) -> kube::Result<K>;

    /// Full update; the object's `resourceVersion` guards against lost updates
    async fn replace<K: StoreResource>(
        &self,
        namespace: &str,
        name: &str,
        obj: &K,
    ) -> kube::Result<K>;

    /// Delete with background propagation
    async fn delete<K: StoreResource>(&self, namespace: &str, name: &str) -> kube::Result<()>;

    /// JSON merge patch on the main resource
    async fn patch_merge<K: StoreResource>(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> kube::Result<K>;

    /// JSON merge patch on the status subresource
    async fn patch_status<K: StoreResource>(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> kube::Result<K>;
}

/// [`ResourceStore`] backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    field_manager: String,
}

impl KubeStore {
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }

    fn api<K: StoreResource>(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn patch_params(&self) -> PatchParams {
        PatchParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn get<K: StoreResource>(&self, namespace: &str, name: &str) -> kube::Result<Option<K>> {
        self.api::<K>(namespace).get_opt(name).await
    }

    async fn list<K: StoreResource>(
        &self,
        namespace: &str,
        selector: &str,
    ) -> kube::Result<Vec<K>> {
        let params = ListParams::default().labels(selector);
        Ok(self.api::<K>(namespace).list(&params).await?.items)
    }

    async fn create<K: StoreResource>(&self, namespace: &str, obj: &K) -> kube::Result<K> {
        self.api::<K>(namespace)
            .create(&PostParams::default(), obj)
            .await
    }

    async fn replace<K: StoreResource>(
        &self,
        namespace: &str,
        name: &str,
        obj: &K,
    ) -> kube::Result<K> {
        self.api::<K>(namespace)
            .replace(name, &PostParams::default(), obj)
            .await
    }

    async fn delete<K: StoreResource>(&self, namespace: &str, name: &str) -> kube::Result<()> {
        self.api::<K>(namespace)
            .delete(name, &DeleteParams::background())
            .await
            .map(|_| ())
    }

    async fn patch_merge<K: StoreResource>(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> kube::Result<K> {
        self.api::<K>(namespace)
            .patch(name, &self.patch_params(), &Patch::Merge(patch))
            .await
    }

    async fn patch_status<K: StoreResource>(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> kube::Result<K> {
        self.api::<K>(namespace)
            .patch_status(name, &self.patch_params(), &Patch::Merge(patch))
            .await
    }
}
