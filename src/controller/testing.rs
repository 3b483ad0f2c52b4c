//! In-memory doubles for controller tests
//!
//! [`FakeStore`] behaves like a tiny API server: it stamps resource versions,
//! rejects stale updates with 409 Conflict, rejects duplicate creates with 409
//! AlreadyExists, and applies JSON merge patches. Every call is recorded so
//! tests can assert on what a reconcile pass did.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{Job, JobStatus};
use k8s_openapi::api::core::v1::{Pod, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::ErrorResponse;
use serde_json::{Map, Value};

use super::exec::{ExecOutput, ExecTransport};
use super::store::{ResourceStore, StoreResource};
use crate::crd::{GatewaySpec, MultisiteSpec, ObjectStore, ObjectStoreSpec};
use crate::error::Result;

type Key = (String, String, String);

#[derive(Clone)]
struct Failure {
    code: u16,
    reason: String,
    once: bool,
}

#[derive(Default)]
struct StoreState {
    objects: BTreeMap<Key, Value>,
    calls: Vec<String>,
    next_version: u64,
    /// Status stamped onto newly created objects of a kind
    initial_status: HashMap<String, Value>,
    /// Injected failures, keyed by call prefix such as `"replace Deployment"`
    failures: HashMap<String, Failure>,
}

#[derive(Clone, Default)]
pub struct FakeStore {
    state: Arc<Mutex<StoreState>>,
}

fn api_error(code: u16, reason: &str, message: String) -> kube::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    })
}

fn kind_of<K: StoreResource>() -> String {
    K::kind(&()).to_string()
}

/// RFC 7386 JSON merge patch
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target) = target {
        for (key, value) in patch {
            if value.is_null() {
                target.remove(key);
            } else {
                merge_patch(target.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

fn matches_selector(obj: &Value, selector: &str) -> bool {
    let labels = obj.pointer("/metadata/labels");
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, value)) => labels
                .and_then(|l| l.get(key))
                .and_then(Value::as_str)
                .is_some_and(|v| v == value),
            None => false,
        })
}

fn resource_version(obj: &Value) -> Option<&str> {
    obj.pointer("/metadata/resourceVersion").and_then(Value::as_str)
}

impl StoreState {
    fn record(&mut self, call: String) -> kube::Result<()> {
        let failure = self
            .failures
            .iter()
            .find(|(prefix, _)| call.starts_with(prefix.as_str()))
            .map(|(prefix, failure)| (prefix.clone(), failure.clone()));
        self.calls.push(call.clone());
        match failure {
            Some((prefix, failure)) => {
                if failure.once {
                    self.failures.remove(&prefix);
                }
                Err(api_error(
                    failure.code,
                    &failure.reason,
                    format!("injected: {call}"),
                ))
            }
            None => Ok(()),
        }
    }

    fn stamp(&mut self, obj: &mut Value) {
        self.next_version += 1;
        let version = Value::String(self.next_version.to_string());
        if let Some(meta) = obj.get_mut("metadata").and_then(Value::as_object_mut) {
            meta.insert("resourceVersion".to_string(), version);
            meta.entry("uid")
                .or_insert_with(|| Value::String(format!("uid-{}", self.next_version)));
        }
    }
}

impl FakeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object without recording a call
    pub fn insert<K: StoreResource>(&self, obj: K) {
        let mut value = serde_json::to_value(&obj).expect("serializable object");
        let namespace = obj.meta().namespace.clone().unwrap_or_default();
        let name = obj.meta().name.clone().expect("seeded object needs a name");
        let mut state = self.state.lock().unwrap();
        state.stamp(&mut value);
        state.objects.insert((kind_of::<K>(), namespace, name), value);
    }

    pub fn object<K: StoreResource>(&self, namespace: &str, name: &str) -> Option<K> {
        let state = self.state.lock().unwrap();
        state
            .objects
            .get(&(kind_of::<K>(), namespace.to_string(), name.to_string()))
            .map(|v| serde_json::from_value(v.clone()).expect("stored object decodes"))
    }

    pub fn objects<K: StoreResource>(&self) -> Vec<K> {
        let kind = kind_of::<K>();
        let state = self.state.lock().unwrap();
        state
            .objects
            .iter()
            .filter(|((k, _, _), _)| *k == kind)
            .map(|(_, v)| serde_json::from_value(v.clone()).expect("stored object decodes"))
            .collect()
    }

    /// Give every object of `kind` created from now on this status
    pub fn set_initial_status(&self, kind: &str, status: Value) {
        let mut state = self.state.lock().unwrap();
        state.initial_status.insert(kind.to_string(), status);
    }

    /// Make every call starting with `prefix` fail with the given API error
    pub fn fail_on(&self, prefix: &str, code: u16, reason: &str) {
        self.inject(prefix, code, reason, false);
    }

    /// Like [`FakeStore::fail_on`], for the next matching call only
    pub fn fail_once(&self, prefix: &str, code: u16, reason: &str) {
        self.inject(prefix, code, reason, true);
    }

    fn inject(&self, prefix: &str, code: u16, reason: &str, once: bool) {
        let mut state = self.state.lock().unwrap();
        state.failures.insert(
            prefix.to_string(),
            Failure {
                code,
                reason: reason.to_string(),
                once,
            },
        );
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    /// Calls that would have changed cluster state
    pub fn mutations(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|call| !call.starts_with("get ") && !call.starts_with("list "))
            .collect()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }
}

#[async_trait]
impl ResourceStore for FakeStore {
    async fn get<K: StoreResource>(&self, namespace: &str, name: &str) -> kube::Result<Option<K>> {
        let kind = kind_of::<K>();
        let mut state = self.state.lock().unwrap();
        // mirrors `Api::get_opt`, which turns 404 into `None`
        match state.record(format!("get {kind} {name}")) {
            Err(e) if crate::error::is_not_found(&e) => return Ok(None),
            other => other?,
        }
        state
            .objects
            .get(&(kind, namespace.to_string(), name.to_string()))
            .map(|v| serde_json::from_value(v.clone()).map_err(kube::Error::SerdeError))
            .transpose()
    }

    async fn list<K: StoreResource>(
        &self,
        namespace: &str,
        selector: &str,
    ) -> kube::Result<Vec<K>> {
        let kind = kind_of::<K>();
        let mut state = self.state.lock().unwrap();
        state.record(format!("list {kind} {selector}"))?;
        state
            .objects
            .iter()
            .filter(|((k, ns, _), v)| *k == kind && ns == namespace && matches_selector(v, selector))
            .map(|(_, v)| serde_json::from_value(v.clone()).map_err(kube::Error::SerdeError))
            .collect()
    }

    async fn create<K: StoreResource>(&self, namespace: &str, obj: &K) -> kube::Result<K> {
        let kind = kind_of::<K>();
        let mut value = serde_json::to_value(obj).map_err(kube::Error::SerdeError)?;
        let mut state = self.state.lock().unwrap();

        let name = match (&obj.meta().name, &obj.meta().generate_name) {
            (Some(name), _) => name.clone(),
            (None, Some(prefix)) => format!("{prefix}{}", state.next_version + 1),
            (None, None) => return Err(api_error(422, "Invalid", "name is required".to_string())),
        };
        state.record(format!("create {kind} {name}"))?;

        let key = (kind.clone(), namespace.to_string(), name.clone());
        if state.objects.contains_key(&key) {
            return Err(api_error(
                409,
                "AlreadyExists",
                format!("{kind} {name:?} already exists"),
            ));
        }

        merge_patch(
            &mut value,
            &serde_json::json!({ "metadata": { "name": name, "namespace": namespace } }),
        );
        if let Some(status) = state.initial_status.get(&kind).cloned() {
            merge_patch(&mut value, &serde_json::json!({ "status": status }));
        }
        state.stamp(&mut value);
        state.objects.insert(key, value.clone());
        serde_json::from_value(value).map_err(kube::Error::SerdeError)
    }

    async fn replace<K: StoreResource>(
        &self,
        namespace: &str,
        name: &str,
        obj: &K,
    ) -> kube::Result<K> {
        let kind = kind_of::<K>();
        let mut value = serde_json::to_value(obj).map_err(kube::Error::SerdeError)?;
        let mut state = self.state.lock().unwrap();
        state.record(format!("replace {kind} {name}"))?;

        let key = (kind.clone(), namespace.to_string(), name.to_string());
        let Some(current) = state.objects.get(&key) else {
            return Err(api_error(404, "NotFound", format!("{kind} {name:?} not found")));
        };
        if resource_version(&value).is_some_and(|v| Some(v) != resource_version(current)) {
            return Err(api_error(
                409,
                "Conflict",
                "the object has been modified; please apply your changes to the latest version"
                    .to_string(),
            ));
        }

        // status is owned by the status subresource
        if let Some(status) = current.get("status").cloned() {
            merge_patch(&mut value, &serde_json::json!({ "status": status }));
        }
        state.stamp(&mut value);
        state.objects.insert(key, value.clone());
        serde_json::from_value(value).map_err(kube::Error::SerdeError)
    }

    async fn delete<K: StoreResource>(&self, namespace: &str, name: &str) -> kube::Result<()> {
        let kind = kind_of::<K>();
        let mut state = self.state.lock().unwrap();
        state.record(format!("delete {kind} {name}"))?;
        state
            .objects
            .remove(&(kind.clone(), namespace.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| api_error(404, "NotFound", format!("{kind} {name:?} not found")))
    }

    async fn patch_merge<K: StoreResource>(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> kube::Result<K> {
        let kind = kind_of::<K>();
        let mut state = self.state.lock().unwrap();
        state.record(format!("patch {kind} {name}"))?;

        let key = (kind.clone(), namespace.to_string(), name.to_string());
        let Some(mut current) = state.objects.get(&key).cloned() else {
            return Err(api_error(404, "NotFound", format!("{kind} {name:?} not found")));
        };
        if resource_version(patch).is_some_and(|v| Some(v) != resource_version(&current)) {
            return Err(api_error(409, "Conflict", "the object has been modified".to_string()));
        }

        let mut patch = patch.clone();
        if let Some(patch) = patch.as_object_mut() {
            patch.remove("status");
        }
        merge_patch(&mut current, &patch);
        state.stamp(&mut current);
        state.objects.insert(key, current.clone());
        serde_json::from_value(current).map_err(kube::Error::SerdeError)
    }

    async fn patch_status<K: StoreResource>(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> kube::Result<K> {
        let kind = kind_of::<K>();
        let mut state = self.state.lock().unwrap();
        state.record(format!("patch_status {kind} {name}"))?;

        let key = (kind.clone(), namespace.to_string(), name.to_string());
        let Some(mut current) = state.objects.get(&key).cloned() else {
            return Err(api_error(404, "NotFound", format!("{kind} {name:?} not found")));
        };
        if let Some(status) = patch.get("status") {
            merge_patch(&mut current, &serde_json::json!({ "status": status }));
        }
        state.stamp(&mut current);
        state.objects.insert(key, current.clone());
        serde_json::from_value(current).map_err(kube::Error::SerdeError)
    }
}

/// One recorded remote command
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecCall {
    pub namespace: String,
    pub pod: String,
    pub container: String,
    pub command: Vec<String>,
}

#[derive(Default)]
struct TransportState {
    responses: Vec<(String, ExecOutput)>,
    calls: Vec<ExecCall>,
}

/// Scripted [`ExecTransport`]
///
/// The first response whose pattern occurs in the joined command wins.
/// Unmatched commands succeed with empty output.
#[derive(Clone, Default)]
pub struct FakeTransport {
    state: Arc<Mutex<TransportState>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, pattern: &str, output: ExecOutput) {
        self.state
            .lock()
            .unwrap()
            .responses
            .push((pattern.to_string(), output));
    }

    pub fn calls(&self) -> Vec<ExecCall> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Recorded commands, each joined with spaces
    pub fn commands(&self) -> Vec<String> {
        self.calls()
            .iter()
            .map(|call| call.command.join(" "))
            .collect()
    }
}

#[async_trait]
impl ExecTransport for FakeTransport {
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: Vec<String>,
    ) -> Result<ExecOutput> {
        let mut state = self.state.lock().unwrap();
        let joined = command.join(" ");
        let output = state
            .responses
            .iter()
            .find(|(pattern, _)| joined.contains(pattern.as_str()))
            .map(|(_, output)| output.clone())
            .unwrap_or_else(|| ExecOutput::success(""));
        state.calls.push(ExecCall {
            namespace: namespace.to_string(),
            pod: pod.to_string(),
            container: container.to_string(),
            command,
        });
        Ok(output)
    }
}

pub fn pod_in_phase(namespace: &str, name: &str, store_name: &str, phase: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(
                "object_store".to_string(),
                store_name.to_string(),
            )])),
            ..Default::default()
        },
        status: Some(PodStatus {
            phase: Some(phase.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn running_pod(namespace: &str, name: &str, store_name: &str) -> Pod {
    pod_in_phase(namespace, name, store_name, "Running")
}

pub fn job_with_status(
    namespace: &str,
    name: &str,
    active: i32,
    succeeded: i32,
    failed: i32,
) -> Job {
    let count = |n: i32| (n > 0).then_some(n);
    Job {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        status: Some(JobStatus {
            active: count(active),
            succeeded: count(succeeded),
            failed: count(failed),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn object_store(namespace: &str, name: &str) -> ObjectStore {
    let mut store = ObjectStore::new(
        name,
        ObjectStoreSpec {
            image: "quay.io/ceph/ceph:rgw-sqlite".to_string(),
            gateway: GatewaySpec { port: Some(8080) },
            multisite: None,
            volume_claim_template: None,
        },
    );
    store.metadata.namespace = Some(namespace.to_string());
    store.metadata.uid = Some(format!("{name}-uid"));
    store.metadata.generation = Some(1);
    store
}

pub fn origin_store(namespace: &str, name: &str) -> ObjectStore {
    let mut store = object_store(namespace, name);
    store.spec.multisite = Some(MultisiteSpec {
        is_main_site: true,
        realm_token_secret_name: None,
    });
    store
}

pub fn joiner_store(namespace: &str, name: &str, secret: &str) -> ObjectStore {
    let mut store = object_store(namespace, name);
    store.spec.multisite = Some(MultisiteSpec {
        is_main_site: false,
        realm_token_secret_name: Some(secret.to_string()),
    });
    store
}

#[test]
fn test_merge_patch_removes_nulls_and_merges_nested() {
    let mut target = serde_json::json!({"a": {"b": 1, "c": 2}, "d": [1]});
    merge_patch(&mut target, &serde_json::json!({"a": {"b": null, "e": 3}, "d": [2]}));
    assert_eq!(target, serde_json::json!({"a": {"c": 2, "e": 3}, "d": [2]}));
}

#[test]
fn test_selector_matching() {
    let obj = serde_json::json!({"metadata": {"labels": {"app": "x", "object_store": "s"}}});
    assert!(matches_selector(&obj, "object_store=s"));
    assert!(matches_selector(&obj, "app=x,object_store=s"));
    assert!(!matches_selector(&obj, "object_store=t"));
}
