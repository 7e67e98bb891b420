//! In-memory clusters for move scenarios
//!
//! A [`FakeCluster`] stores objects as JSON, assigns UIDs on create, applies
//! merge patches, and records every call in a journal shared between the
//! source and target so tests can assert on cross-cluster ordering.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use keel_move::{AccessorError, MovableKind, ObjectIdentity, ResourceAccessor};

pub const CAPI: &str = "cluster.x-k8s.io/v1beta1";
pub const KUBEADM_CP: &str = "controlplane.cluster.x-k8s.io/v1beta1";
pub const INFRA: &str = "infrastructure.cluster.x-k8s.io/v1beta1";
pub const CLUSTER_NAME_LABEL: &str = "cluster.x-k8s.io/cluster-name";

/// Accessor operation recorded in the journal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    List,
    Get,
    Create,
    Delete,
    Patch,
    EnsureNamespace,
}

/// One accessor call
#[derive(Debug, Clone)]
pub struct Call {
    /// Name of the cluster that received the call
    pub cluster: String,
    pub op: Op,
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub body: Option<Value>,
}

/// Calls from every cluster, in the order they happened
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<Call>>>);

impl Journal {
    pub fn calls(&self) -> Vec<Call> {
        self.0.lock().unwrap().clone()
    }

    pub fn on(&self, cluster: &str) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| c.cluster == cluster)
            .collect()
    }

    /// Names of the objects `op` was applied to on `cluster`, in order
    pub fn names(&self, cluster: &str, op: Op) -> Vec<String> {
        self.on(cluster)
            .into_iter()
            .filter(|c| c.op == op)
            .map(|c| c.name)
            .collect()
    }

    /// Position of the first matching call in the shared journal
    pub fn position(&self, cluster: &str, op: Op, name: &str) -> Option<usize> {
        self.calls()
            .iter()
            .position(|c| c.cluster == cluster && c.op == op && c.name == name)
    }

    fn push(&self, call: Call) {
        self.0.lock().unwrap().push(call);
    }
}

type Key = (String, String, String, String);
type Hook = Box<dyn Fn(&ObjectIdentity) + Send + Sync>;

#[derive(Default)]
struct State {
    objects: BTreeMap<Key, Value>,
    namespaces: BTreeSet<String>,
    next_uid: u64,
    /// Remaining injected create failures per object name
    create_failures: HashMap<String, (u32, AccessorError)>,
    /// Remaining injected patch failures per object name
    patch_failures: HashMap<String, (u32, AccessorError)>,
}

/// A cluster held in memory
pub struct FakeCluster {
    name: String,
    journal: Journal,
    state: Mutex<State>,
    on_create: Mutex<Option<Hook>>,
    patch_delay: Mutex<Option<Duration>>,
    patches_in_flight: AtomicUsize,
    peak_patches: AtomicUsize,
}

/// Source and target sharing one journal
pub fn cluster_pair() -> (Arc<FakeCluster>, Arc<FakeCluster>, Journal) {
    let journal = Journal::default();
    (
        Arc::new(FakeCluster::new("source", journal.clone())),
        Arc::new(FakeCluster::new("target", journal.clone())),
        journal,
    )
}

fn group_of(api_version: &str) -> &str {
    api_version
        .rsplit_once('/')
        .map(|(group, _)| group)
        .unwrap_or("")
}

fn key_of(identity: &ObjectIdentity) -> Key {
    (
        group_of(&identity.api_version).to_string(),
        identity.kind.clone(),
        identity.namespace.clone(),
        identity.name.clone(),
    )
}

/// RFC 7386 JSON merge patch
fn merge(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(fields) => {
            if !target.is_object() {
                *target = Value::Object(Map::new());
            }
            let Some(object) = target.as_object_mut() else {
                return;
            };
            for (key, value) in fields {
                if value.is_null() {
                    object.remove(key);
                } else {
                    merge(object.entry(key.clone()).or_insert(Value::Null), value);
                }
            }
        }
        other => *target = other.clone(),
    }
}

/// `key` and `key=value` terms, comma separated
fn matches_selector(object: &Value, selector: &str) -> bool {
    let labels = object.pointer("/metadata/labels").and_then(Value::as_object);
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| {
            let (key, expected) = match term.split_once('=') {
                Some((k, v)) => (k, Some(v)),
                None => (term, None),
            };
            match labels.and_then(|l| l.get(key)) {
                None => false,
                Some(actual) => expected.map_or(true, |v| actual.as_str() == Some(v)),
            }
        })
}

impl FakeCluster {
    pub fn new(name: &str, journal: Journal) -> Self {
        Self {
            name: name.to_string(),
            journal,
            state: Mutex::new(State::default()),
            on_create: Mutex::new(None),
            patch_delay: Mutex::new(None),
            patches_in_flight: AtomicUsize::new(0),
            peak_patches: AtomicUsize::new(0),
        }
    }

    /// Store an object, assigning a UID unless it has one, and return it as stored
    pub fn seed(&self, mut object: Value) -> Value {
        let mut state = self.state.lock().unwrap();
        if object.pointer("/metadata/uid").is_none() {
            state.next_uid += 1;
            let uid = format!("{}-uid-{}", self.name, state.next_uid);
            object["metadata"]["uid"] = json!(uid);
        }
        let identity = ObjectIdentity::from_object(&object).expect("seeded object needs a name");
        state.objects.insert(key_of(&identity), object.clone());
        object
    }

    /// Stored object by apiVersion, kind, namespace and name
    pub fn object(&self, api_version: &str, kind: &str, namespace: &str, name: &str) -> Option<Value> {
        let key = (
            group_of(api_version).to_string(),
            kind.to_string(),
            namespace.to_string(),
            name.to_string(),
        );
        self.state.lock().unwrap().objects.get(&key).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().objects.len()
    }

    /// Every stored object, ordered by group, kind, namespace and name
    pub fn objects(&self) -> Vec<Value> {
        self.state.lock().unwrap().objects.values().cloned().collect()
    }

    /// Fail the next `times` creates of `name` with `error`
    pub fn fail_creates(&self, name: &str, times: u32, error: AccessorError) {
        self.state
            .lock()
            .unwrap()
            .create_failures
            .insert(name.to_string(), (times, error));
    }

    /// Fail the next `times` patches of `name` with `error`
    pub fn fail_patches(&self, name: &str, times: u32, error: AccessorError) {
        self.state
            .lock()
            .unwrap()
            .patch_failures
            .insert(name.to_string(), (times, error));
    }

    /// Hold every patch for `delay` so overlapping calls can be counted
    pub fn slow_patches(&self, delay: Duration) {
        *self.patch_delay.lock().unwrap() = Some(delay);
    }

    /// Most patches seen in flight at once while patches were slowed
    pub fn peak_patches(&self) -> usize {
        self.peak_patches.load(Ordering::SeqCst)
    }

    /// Run `hook` after every successful create
    pub fn on_create(&self, hook: impl Fn(&ObjectIdentity) + Send + Sync + 'static) {
        *self.on_create.lock().unwrap() = Some(Box::new(hook));
    }

    fn record(&self, op: Op, kind: &str, namespace: &str, name: &str, body: Option<&Value>) {
        self.journal.push(Call {
            cluster: self.name.clone(),
            op,
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
            body: body.cloned(),
        });
    }
}

#[async_trait]
impl ResourceAccessor for FakeCluster {
    async fn list(
        &self,
        kind: &MovableKind,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<Value>, AccessorError> {
        self.record(Op::List, &kind.kind, namespace, "", None);
        let state = self.state.lock().unwrap();
        Ok(state
            .objects
            .iter()
            .filter(|((group, k, ns, _), _)| {
                group == kind.group() && *k == kind.kind && (namespace.is_empty() || ns == namespace)
            })
            .map(|(_, object)| object)
            .filter(|object| matches_selector(object, selector))
            .cloned()
            .collect())
    }

    async fn get(&self, identity: &ObjectIdentity) -> Result<Value, AccessorError> {
        self.record(Op::Get, &identity.kind, &identity.namespace, &identity.name, None);
        self.state
            .lock()
            .unwrap()
            .objects
            .get(&key_of(identity))
            .cloned()
            .ok_or_else(|| AccessorError::NotFound(identity.display()))
    }

    async fn create(&self, object: &Value) -> Result<Value, AccessorError> {
        let identity = ObjectIdentity::from_object(object)
            .ok_or_else(|| AccessorError::Invalid("missing identity".to_string()))?;
        self.record(
            Op::Create,
            &identity.kind,
            &identity.namespace,
            &identity.name,
            Some(object),
        );

        let stored = {
            let mut state = self.state.lock().unwrap();
            if let Some((remaining, error)) = state.create_failures.get_mut(&identity.name) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(error.clone());
                }
            }
            let key = key_of(&identity);
            if state.objects.contains_key(&key) {
                return Err(AccessorError::AlreadyExists(identity.display()));
            }
            state.next_uid += 1;
            let mut stored = object.clone();
            stored["metadata"]["uid"] = json!(format!("{}-uid-{}", self.name, state.next_uid));
            stored["metadata"]["resourceVersion"] = json!("1");
            state.objects.insert(key, stored.clone());
            stored
        };

        if let Some(hook) = self.on_create.lock().unwrap().as_ref() {
            hook(&identity);
        }
        Ok(stored)
    }

    async fn delete(&self, identity: &ObjectIdentity) -> Result<(), AccessorError> {
        self.record(Op::Delete, &identity.kind, &identity.namespace, &identity.name, None);
        self.state
            .lock()
            .unwrap()
            .objects
            .remove(&key_of(identity))
            .map(|_| ())
            .ok_or_else(|| AccessorError::NotFound(identity.display()))
    }

    async fn patch(&self, identity: &ObjectIdentity, patch: &Value) -> Result<(), AccessorError> {
        self.record(
            Op::Patch,
            &identity.kind,
            &identity.namespace,
            &identity.name,
            Some(patch),
        );

        let delay = *self.patch_delay.lock().unwrap();
        if let Some(delay) = delay {
            let now = self.patches_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_patches.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
            self.patches_in_flight.fetch_sub(1, Ordering::SeqCst);
        }

        let mut state = self.state.lock().unwrap();
        if let Some((remaining, error)) = state.patch_failures.get_mut(&identity.name) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(error.clone());
            }
        }
        let object = state
            .objects
            .get_mut(&key_of(identity))
            .ok_or_else(|| AccessorError::NotFound(identity.display()))?;
        merge(object, patch);
        Ok(())
    }

    async fn ensure_namespace(&self, namespace: &str) -> Result<(), AccessorError> {
        self.record(Op::EnsureNamespace, "Namespace", "", namespace, None);
        self.state
            .lock()
            .unwrap()
            .namespaces
            .insert(namespace.to_string());
        Ok(())
    }
}

// =============================================================================
// Fixtures
// =============================================================================

/// A namespaced object, labelled as a member of `cluster` when given
pub fn object(api_version: &str, kind: &str, name: &str, cluster: Option<&str>) -> Value {
    let mut labels = Map::new();
    if let Some(cluster) = cluster {
        labels.insert(CLUSTER_NAME_LABEL.to_string(), json!(cluster));
    }
    json!({
        "apiVersion": api_version,
        "kind": kind,
        "metadata": {
            "name": name,
            "namespace": "default",
            "labels": labels,
        },
        "spec": {},
    })
}

/// A cluster-scoped object
pub fn cluster_scoped(api_version: &str, kind: &str, name: &str) -> Value {
    json!({
        "apiVersion": api_version,
        "kind": kind,
        "metadata": { "name": name },
        "spec": {},
    })
}

/// A Cluster whose infrastructureRef points at `infra_kind/infra_name`
pub fn cluster_with_infra(name: &str, infra_kind: &str, infra_name: &str) -> Value {
    let mut cluster = object(CAPI, "Cluster", name, None);
    cluster["spec"]["infrastructureRef"] = json!({
        "apiVersion": INFRA,
        "kind": infra_kind,
        "name": infra_name,
    });
    cluster
}

/// Add an owner reference to an already-seeded owner
pub fn owned_by(mut object: Value, owner: &Value) -> Value {
    let reference = json!({
        "apiVersion": owner["apiVersion"],
        "kind": owner["kind"],
        "name": owner["metadata"]["name"],
        "uid": owner["metadata"]["uid"],
    });
    match object["metadata"]["ownerReferences"].as_array_mut() {
        Some(refs) => refs.push(reference),
        None => object["metadata"]["ownerReferences"] = json!([reference]),
    }
    object
}

/// UID of the first owner reference
pub fn owner_uid(object: &Value) -> Option<&str> {
    object
        .pointer("/metadata/ownerReferences/0/uid")
        .and_then(Value::as_str)
}

pub fn uid(object: &Value) -> &str {
    object["metadata"]["uid"].as_str().unwrap_or_default()
}
