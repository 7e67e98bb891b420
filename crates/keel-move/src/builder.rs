//! Discovery of movable objects into an [`ObjectGraph`]
//!
//! Listing runs concurrently, one call per (kind, namespace). Credential
//! Secrets are fetched by name for every discovered Cluster. Edge wiring then
//! happens in a single pass over the discovered set, so virtual nodes are
//! created exactly once.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use keel_common::kube_utils::api_group;

use crate::accessor::{AccessorError, ResourceAccessor};
use crate::bounded::run_bounded;
use crate::error::MoveError;
use crate::graph::{is_cluster_kind, GraphNode, ObjectGraph, ObjectIdentity, SoftEdge};
use crate::registry::{MovableKind, MovableKindRegistry, SoftReference};
use crate::CLUSTER_SECRET_SUFFIXES;

const OWNER_REFERENCES_FIELD: &str = "metadata.ownerReferences";

/// Namespaces to discover objects in
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamespaceScope {
    /// Every namespace
    All,
    /// Only these namespaces
    Only(Vec<String>),
}

impl NamespaceScope {
    /// An empty namespace means all namespaces
    pub fn from_namespace(namespace: &str) -> Self {
        if namespace.is_empty() {
            Self::All
        } else {
            Self::Only(vec![namespace.to_string()])
        }
    }

    /// Namespaces to pass to list calls ("" lists across all of them)
    fn list_namespaces(&self) -> Vec<&str> {
        match self {
            Self::All => vec![""],
            Self::Only(namespaces) => namespaces.iter().map(String::as_str).collect(),
        }
    }
}

/// (group, kind, namespace, name)
type ObjectKey = (String, String, String, String);

/// Builds object graphs from a source cluster
pub struct GraphBuilder {
    accessor: Arc<dyn ResourceAccessor>,
    registry: MovableKindRegistry,
    concurrency: usize,
}

impl GraphBuilder {
    /// Builder listing the registry's kinds through `accessor`
    pub fn new(accessor: Arc<dyn ResourceAccessor>, registry: MovableKindRegistry) -> Self {
        Self {
            accessor,
            registry,
            concurrency: 4,
        }
    }

    /// Limit concurrent list calls
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Discover every movable object in scope and wire the graph.
    ///
    /// Any listing failure fails the whole build.
    #[instrument(skip_all, fields(scope = ?scope))]
    pub async fn build(&self, scope: &NamespaceScope) -> Result<ObjectGraph, MoveError> {
        let mut discovered = self.list_all(scope).await?;
        let secrets = self.fetch_cluster_secrets(&discovered).await?;
        let secret_count = secrets.len();

        let mut credential_owner: HashMap<String, String> = HashMap::new();
        for (cluster_uid, secret) in secrets {
            if let Some(uid) = secret.pointer("/metadata/uid").and_then(|u| u.as_str()) {
                credential_owner.insert(uid.to_string(), cluster_uid);
            }
            discovered.push((None, secret));
        }

        let mut graph = ObjectGraph::new();
        for (kind, object) in discovered {
            let Some(identity) = ObjectIdentity::from_object(&object) else {
                warn!("Skipping listed object without apiVersion, kind or name");
                continue;
            };
            if identity.uid.is_empty() {
                warn!(object = %identity.display(), "Skipping object without a UID");
                continue;
            }
            let global = kind.map(|k| k.global).unwrap_or(false);
            let name = identity.display();
            if !graph.insert(GraphNode::discovered(identity, object, global)) {
                debug!(object = %name, "Object discovered twice, keeping the first copy");
            }
        }

        self.wire_owner_edges(&mut graph, &credential_owner);
        self.wire_soft_edges(&mut graph);

        info!(
            objects = graph.len(),
            secrets = secret_count,
            virtual_nodes = graph.nodes().values().filter(|n| n.is_virtual).count(),
            "Built object graph"
        );
        Ok(graph)
    }

    async fn list_all(
        &self,
        scope: &NamespaceScope,
    ) -> Result<Vec<(Option<&MovableKind>, Value)>, MoveError> {
        let namespaces = scope.list_namespaces();
        let mut jobs: Vec<(&MovableKind, &str)> = Vec::new();
        for kind in self.registry.kinds() {
            if kind.global {
                jobs.push((kind, ""));
            } else {
                jobs.extend(namespaces.iter().map(|ns| (kind, *ns)));
            }
        }

        let results = run_bounded(
            self.concurrency,
            jobs.iter().map(|(kind, namespace)| async move {
                let selector = kind.selector().unwrap_or_default();
                self.accessor.list(kind, namespace, selector).await
            }),
        )
        .await;

        let mut discovered = Vec::new();
        for ((kind, namespace), result) in jobs.iter().zip(results) {
            let objects = result.map_err(|e| {
                MoveError::Discovery(format!(
                    "failed to list {} in {}: {}",
                    kind.kind,
                    if namespace.is_empty() { "all namespaces" } else { *namespace },
                    e
                ))
            })?;
            debug!(kind = %kind.kind, namespace = %namespace, count = objects.len(), "Listed objects");
            discovered.extend(objects.into_iter().map(|o| (Some(*kind), o)));
        }
        Ok(discovered)
    }

    /// Fetch `<cluster><suffix>` Secrets for every discovered Cluster.
    /// Returns (cluster UID, secret) pairs.
    async fn fetch_cluster_secrets(
        &self,
        discovered: &[(Option<&MovableKind>, Value)],
    ) -> Result<Vec<(String, Value)>, MoveError> {
        let clusters: Vec<ObjectIdentity> = discovered
            .iter()
            .filter_map(|(_, o)| ObjectIdentity::from_object(o))
            .filter(is_cluster_kind)
            .collect();

        let lookups: Vec<(&ObjectIdentity, ObjectIdentity)> = clusters
            .iter()
            .flat_map(|cluster| {
                CLUSTER_SECRET_SUFFIXES.iter().map(move |suffix| {
                    let name = format!("{}{}", cluster.name, suffix);
                    (
                        cluster,
                        ObjectIdentity::new("v1", "Secret", &cluster.namespace, &name, ""),
                    )
                })
            })
            .collect();

        let results = run_bounded(
            self.concurrency,
            lookups
                .iter()
                .map(|(_, secret)| self.accessor.get(secret)),
        )
        .await;

        let mut secrets = Vec::new();
        for ((cluster, secret), result) in lookups.iter().zip(results) {
            match result {
                Ok(mut object) => {
                    // Core objects come back without apiVersion/kind from some clients
                    if object.get("kind").is_none() {
                        object["apiVersion"] = Value::String("v1".to_string());
                        object["kind"] = Value::String("Secret".to_string());
                    }
                    secrets.push((cluster.uid.clone(), object));
                }
                Err(AccessorError::NotFound(_)) => {}
                Err(e) => {
                    return Err(MoveError::Discovery(format!(
                        "failed to get {}: {}",
                        secret.display(),
                        e
                    )))
                }
            }
        }
        Ok(secrets)
    }

    fn wire_owner_edges(&self, graph: &mut ObjectGraph, credential_owner: &HashMap<String, String>) {
        let mut edges: Vec<(String, String)> = Vec::new();
        let mut virtual_owners: Vec<(String, ObjectIdentity, bool)> = Vec::new();

        for (key, node) in graph.nodes() {
            let mut has_owner = false;
            for owner in owner_references(&node.object) {
                if graph.contains(&owner.uid) {
                    edges.push((key.clone(), owner.uid));
                    has_owner = true;
                    continue;
                }
                match self.registry.find_for(&owner.api_version, &owner.kind) {
                    Some(kind) => {
                        let namespace = if kind.global {
                            String::new()
                        } else {
                            node.identity.namespace.clone()
                        };
                        let identity = ObjectIdentity::new(
                            &owner.api_version,
                            &owner.kind,
                            &namespace,
                            &owner.name,
                            &owner.uid,
                        );
                        virtual_owners.push((key.clone(), identity, kind.global));
                        has_owner = true;
                    }
                    None => debug!(
                        object = %node.identity.display(),
                        owner_kind = %owner.kind,
                        owner = %owner.name,
                        "Ignoring owner outside the movable kinds"
                    ),
                }
            }

            // Credential Secrets without an owner in the graph hang off their Cluster
            if !has_owner {
                if let Some(cluster_uid) = credential_owner.get(key) {
                    edges.push((key.clone(), cluster_uid.clone()));
                }
            }
        }

        for (referrer, identity, global) in virtual_owners {
            let target = add_virtual(graph, identity, global, &referrer, OWNER_REFERENCES_FIELD);
            edges.push((referrer, target));
        }
        for (dependent, owner) in edges {
            if let Some(node) = graph.get_mut(&dependent) {
                node.owners.insert(owner);
            }
        }
    }

    fn wire_soft_edges(&self, graph: &mut ObjectGraph) {
        let mut index: HashMap<ObjectKey, String> = HashMap::new();
        for (key, node) in graph.nodes().iter().filter(|(_, n)| !n.is_virtual) {
            index.insert(object_key(&node.identity), key.clone());
        }

        let mut references: Vec<(String, SoftReference)> = Vec::new();
        for (key, node) in graph.nodes().iter().filter(|(_, n)| !n.is_virtual) {
            if let Some(kind) = self
                .registry
                .find_for(&node.identity.api_version, &node.identity.kind)
            {
                references.extend(
                    kind.extract_soft_refs(&node.object, &node.identity.namespace)
                        .into_iter()
                        .map(|r| (key.clone(), r)),
                );
            }
        }

        for (referrer, reference) in references {
            let target_kind = self.resolve_kind(&reference);
            let global = target_kind.map(|k| k.global).unwrap_or(false);
            let namespace = if global { "" } else { reference.namespace.as_str() };

            let found = lookup(&index, &reference, namespace);
            let target = match found {
                Some(target) => {
                    let owned_by_referrer = graph
                        .get(&target)
                        .is_some_and(|t| t.owners.contains(&referrer));
                    if target == referrer || owned_by_referrer {
                        continue;
                    }
                    target
                }
                None => {
                    let api_version = if reference.api_version.is_empty() {
                        target_kind
                            .map(|k| k.api_version.clone())
                            .unwrap_or_default()
                    } else {
                        reference.api_version.clone()
                    };
                    let identity = ObjectIdentity::new(
                        &api_version,
                        &reference.kind,
                        namespace,
                        &reference.name,
                        "",
                    );
                    add_virtual(graph, identity, global, &referrer, &reference.field)
                }
            };

            if let Some(node) = graph.get_mut(&referrer) {
                let edge = SoftEdge {
                    target,
                    field: reference.field.clone(),
                };
                if !node.soft_refs.contains(&edge) {
                    node.soft_refs.push(edge);
                }
            }
        }
    }

    fn resolve_kind(&self, reference: &SoftReference) -> Option<&MovableKind> {
        if reference.api_version.is_empty() {
            self.registry
                .kinds()
                .iter()
                .find(|k| k.kind == reference.kind)
        } else {
            self.registry
                .find_for(&reference.api_version, &reference.kind)
        }
    }
}

struct OwnerReference {
    api_version: String,
    kind: String,
    name: String,
    uid: String,
}

fn owner_references(object: &Value) -> Vec<OwnerReference> {
    object
        .pointer("/metadata/ownerReferences")
        .and_then(|r| r.as_array())
        .map(|refs| {
            refs.iter()
                .filter_map(|r| {
                    Some(OwnerReference {
                        api_version: r.get("apiVersion")?.as_str()?.to_string(),
                        kind: r.get("kind")?.as_str()?.to_string(),
                        name: r.get("name")?.as_str()?.to_string(),
                        uid: r.get("uid")?.as_str()?.to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn object_key(identity: &ObjectIdentity) -> ObjectKey {
    (
        identity.group().to_string(),
        identity.kind.clone(),
        identity.namespace.clone(),
        identity.name.clone(),
    )
}

fn lookup(index: &HashMap<ObjectKey, String>, reference: &SoftReference, namespace: &str) -> Option<String> {
    if reference.api_version.is_empty() {
        return index
            .iter()
            .find(|((_, kind, ns, name), _)| {
                *kind == reference.kind && ns == namespace && *name == reference.name
            })
            .map(|(_, key)| key.clone());
    }
    index
        .get(&(
            api_group(&reference.api_version).to_string(),
            reference.kind.clone(),
            namespace.to_string(),
            reference.name.clone(),
        ))
        .cloned()
}

/// Insert (or reuse) the virtual node for an undiscovered object and record
/// who points at it. Returns its graph key.
fn add_virtual(
    graph: &mut ObjectGraph,
    identity: ObjectIdentity,
    global: bool,
    referrer: &str,
    field: &str,
) -> String {
    let key = format!(
        "virtual:{}/{}/{}/{}",
        identity.group(),
        identity.kind,
        identity.namespace,
        identity.name
    );
    if !graph.contains(&key) {
        debug!(object = %identity.display(), referrer = %referrer, field = %field, "Referenced object was not discovered");
        graph.insert_with_key(key.clone(), GraphNode::virtual_node(identity, global));
    }
    if let Some(node) = graph.get_mut(&key) {
        node.referenced_by
            .push((referrer.to_string(), field.to_string()));
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accessor::MockResourceAccessor;
    use serde_json::json;

    const CAPI: &str = "cluster.x-k8s.io/v1beta1";
    const DOCKER: &str = "infrastructure.cluster.x-k8s.io/v1beta1";

    fn obj(api_version: &str, kind: &str, name: &str, uid: &str) -> Value {
        json!({
            "apiVersion": api_version,
            "kind": kind,
            "metadata": {"name": name, "namespace": "default", "uid": uid}
        })
    }

    fn owned_by(mut object: Value, api_version: &str, kind: &str, name: &str, uid: &str) -> Value {
        object["metadata"]["ownerReferences"] = json!([{
            "apiVersion": api_version, "kind": kind, "name": name, "uid": uid
        }]);
        object
    }

    fn registry() -> MovableKindRegistry {
        MovableKindRegistry::cluster_api_defaults()
            .with_kind(MovableKind::member(DOCKER, "DockerCluster"))
            .with_kind(MovableKind::member(DOCKER, "DockerMachine"))
    }

    /// Mock serving `objects` for list calls of their kind and 404 for every get
    fn source(objects: Vec<Value>) -> MockResourceAccessor {
        let mut accessor = MockResourceAccessor::new();
        accessor.expect_list().returning(move |kind, _, _| {
            Ok(objects
                .iter()
                .filter(|o| o["kind"] == kind.kind.as_str())
                .cloned()
                .collect())
        });
        accessor
            .expect_get()
            .returning(|id| Err(AccessorError::NotFound(id.display())));
        accessor
    }

    #[tokio::test]
    async fn test_owner_and_soft_edges() {
        let mut cluster = obj(CAPI, "Cluster", "prod", "c");
        cluster["spec"] = json!({
            "infrastructureRef": {"apiVersion": DOCKER, "kind": "DockerCluster", "name": "prod"}
        });
        let infra = owned_by(obj(DOCKER, "DockerCluster", "prod", "i"), CAPI, "Cluster", "prod", "c");
        let md = owned_by(obj(CAPI, "MachineDeployment", "md", "m"), CAPI, "Cluster", "prod", "c");

        let builder = GraphBuilder::new(Arc::new(source(vec![cluster, infra, md])), registry());
        let graph = builder.build(&NamespaceScope::All).await.unwrap();

        assert_eq!(graph.len(), 3);
        assert!(graph.get("m").unwrap().owners.contains("c"));
        // DockerCluster is owned by the Cluster, so the Cluster's soft reference adds no edge
        assert!(graph.get("c").unwrap().soft_refs.is_empty());
        assert!(graph.get("i").unwrap().owners.contains("c"));
    }

    #[tokio::test]
    async fn test_soft_reference_to_unowned_object() {
        let mut machine = obj(CAPI, "Machine", "m-0", "m");
        machine["spec"] = json!({
            "infrastructureRef": {"apiVersion": DOCKER, "kind": "DockerMachine", "name": "dm-0"}
        });
        let docker_machine = obj(DOCKER, "DockerMachine", "dm-0", "d");

        let builder = GraphBuilder::new(Arc::new(source(vec![machine, docker_machine])), registry());
        let graph = builder.build(&NamespaceScope::All).await.unwrap();

        let refs = &graph.get("m").unwrap().soft_refs;
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].target, "d");
        assert_eq!(refs[0].field, "spec.infrastructureRef");
    }

    #[tokio::test]
    async fn test_missing_soft_reference_becomes_virtual() {
        let mut cluster = obj(CAPI, "Cluster", "prod", "c");
        cluster["spec"] = json!({
            "infrastructureRef": {"apiVersion": DOCKER, "kind": "DockerCluster", "name": "prod"}
        });

        let builder = GraphBuilder::new(Arc::new(source(vec![cluster])), registry());
        let graph = builder.build(&NamespaceScope::All).await.unwrap();

        let key = "virtual:infrastructure.cluster.x-k8s.io/DockerCluster/default/prod";
        let node = graph.get(key).unwrap();
        assert!(node.is_virtual);
        assert_eq!(
            node.referenced_by,
            vec![("c".to_string(), "spec.infrastructureRef".to_string())]
        );
        assert_eq!(graph.get("c").unwrap().soft_refs[0].target, key);
    }

    #[tokio::test]
    async fn test_external_owner_is_dropped() {
        let md = owned_by(obj(CAPI, "MachineDeployment", "md", "m"), "v1", "ConfigMap", "cm", "x");
        let builder = GraphBuilder::new(Arc::new(source(vec![md])), registry());
        let graph = builder.build(&NamespaceScope::All).await.unwrap();

        assert_eq!(graph.len(), 1);
        assert!(graph.get("m").unwrap().owners.is_empty());
    }

    #[tokio::test]
    async fn test_missing_registry_owner_becomes_virtual() {
        let machine = owned_by(obj(CAPI, "Machine", "m-0", "m"), CAPI, "MachineSet", "ms", "gone");
        let builder = GraphBuilder::new(Arc::new(source(vec![machine])), registry());
        let graph = builder.build(&NamespaceScope::All).await.unwrap();

        let owner_key = graph.get("m").unwrap().owners.iter().next().unwrap().clone();
        let owner = graph.get(&owner_key).unwrap();
        assert!(owner.is_virtual);
        assert_eq!(owner.identity.uid, "gone");
        assert_eq!(owner.referenced_by[0].1, "metadata.ownerReferences");
    }

    #[tokio::test]
    async fn test_credential_secrets_fetched_by_name() {
        let cluster = obj(CAPI, "Cluster", "prod", "c");
        let mut accessor = MockResourceAccessor::new();
        let listed = cluster.clone();
        accessor.expect_list().returning(move |kind, _, _| {
            Ok(if kind.kind == "Cluster" {
                vec![listed.clone()]
            } else {
                vec![]
            })
        });
        accessor.expect_get().returning(|id| {
            if id.name == "prod-kubeconfig" {
                Ok(obj("v1", "Secret", "prod-kubeconfig", "s"))
            } else {
                Err(AccessorError::NotFound(id.display()))
            }
        });

        let graph = GraphBuilder::new(Arc::new(accessor), registry())
            .build(&NamespaceScope::from_namespace("default"))
            .await
            .unwrap();

        assert_eq!(graph.len(), 2);
        let secret = graph.get("s").unwrap();
        assert_eq!(secret.identity.kind, "Secret");
        assert!(secret.owners.contains("c"));
    }

    #[tokio::test]
    async fn test_list_failure_aborts_build() {
        let mut accessor = MockResourceAccessor::new();
        accessor.expect_list().returning(|kind, _, _| {
            if kind.kind == "Machine" {
                Err(AccessorError::Transport("connection refused".to_string()))
            } else {
                Ok(vec![])
            }
        });
        accessor
            .expect_get()
            .returning(|id| Err(AccessorError::NotFound(id.display())));

        let err = GraphBuilder::new(Arc::new(accessor), registry())
            .build(&NamespaceScope::All)
            .await
            .unwrap_err();
        assert!(matches!(err, MoveError::Discovery(msg) if msg.contains("Machine")));
    }

    #[tokio::test]
    async fn test_selectors_and_namespaces() {
        let mut accessor = MockResourceAccessor::new();
        accessor
            .expect_list()
            .withf(|kind, namespace, selector| {
                namespace == "capi"
                    && match kind.kind.as_str() {
                        "Cluster" | "ClusterClass" => selector.is_empty(),
                        "Machine" => selector == keel_common::CLUSTER_NAME_LABEL,
                        _ => true,
                    }
            })
            .returning(|_, _, _| Ok(vec![]));

        let graph = GraphBuilder::new(Arc::new(accessor), registry())
            .build(&NamespaceScope::from_namespace("capi"))
            .await
            .unwrap();
        assert!(graph.is_empty());
    }
}
