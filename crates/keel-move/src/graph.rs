//! Object graph of Cluster API resources
//!
//! Nodes are keyed by source UID. Edges come in two flavours: owner edges
//! (from `metadata.ownerReferences`, plus the credential Secrets attached to
//! their Cluster) and soft edges (fields such as `spec.infrastructureRef`).
//! Both mean "must exist on the target before this object is created".

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Identity of a Kubernetes object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectIdentity {
    /// API version (e.g., "cluster.x-k8s.io/v1beta1")
    pub api_version: String,
    /// Kind (e.g., "Cluster")
    pub kind: String,
    /// Namespace (empty for cluster-scoped)
    pub namespace: String,
    /// Name
    pub name: String,
    /// UID on the source cluster (empty when not known yet)
    pub uid: String,
}

impl ObjectIdentity {
    /// Create a new ObjectIdentity
    pub fn new(api_version: &str, kind: &str, namespace: &str, name: &str, uid: &str) -> Self {
        Self {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
            uid: uid.to_string(),
        }
    }

    /// Read the identity out of an object's `apiVersion`, `kind` and `metadata`
    pub fn from_object(object: &serde_json::Value) -> Option<Self> {
        let metadata = object.get("metadata")?;
        Some(Self {
            api_version: object.get("apiVersion")?.as_str()?.to_string(),
            kind: object.get("kind")?.as_str()?.to_string(),
            namespace: metadata
                .get("namespace")
                .and_then(|n| n.as_str())
                .unwrap_or_default()
                .to_string(),
            name: metadata.get("name")?.as_str()?.to_string(),
            uid: metadata
                .get("uid")
                .and_then(|u| u.as_str())
                .unwrap_or_default()
                .to_string(),
        })
    }

    /// API group (empty for the core group)
    pub fn group(&self) -> &str {
        keel_common::kube_utils::api_group(&self.api_version)
    }

    /// Get a display string for logging
    pub fn display(&self) -> String {
        if self.namespace.is_empty() {
            format!("{}/{}", self.kind, self.name)
        } else {
            format!("{}/{}/{}", self.kind, self.namespace, self.name)
        }
    }
}

/// A soft (field) reference from one node to another
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct SoftEdge {
    /// Graph key of the referenced node
    pub target: String,
    /// Dotted path of the field holding the reference
    pub field: String,
}

/// A node in the object graph representing a single resource
#[derive(Debug, Clone)]
pub struct GraphNode {
    /// Identity of this object
    pub identity: ObjectIdentity,
    /// The object as discovered (JSON, with apiVersion and kind)
    pub object: serde_json::Value,
    /// Keys of owners, from ownerReferences or naming conventions
    pub owners: BTreeSet<String>,
    /// Field references that must exist on the target first
    pub soft_refs: Vec<SoftEdge>,
    /// Inferred from a reference but never discovered
    pub is_virtual: bool,
    /// Cluster-scoped shared object: copied to the target, never deleted
    pub is_global: bool,
    /// Also needed by a Cluster left out of a filtered move: copied to the
    /// target, left untouched on the source
    pub shared_with_unmoved: bool,
    /// Who points at a virtual node: (referrer key, field)
    pub referenced_by: Vec<(String, String)>,
}

impl GraphNode {
    /// Create a node for a discovered object
    pub fn discovered(identity: ObjectIdentity, object: serde_json::Value, is_global: bool) -> Self {
        Self {
            identity,
            object,
            owners: BTreeSet::new(),
            soft_refs: Vec::new(),
            is_virtual: false,
            is_global,
            shared_with_unmoved: false,
            referenced_by: Vec::new(),
        }
    }

    /// Create a placeholder for something only known through a reference
    pub fn virtual_node(identity: ObjectIdentity, is_global: bool) -> Self {
        Self {
            identity,
            object: serde_json::Value::Null,
            owners: BTreeSet::new(),
            soft_refs: Vec::new(),
            is_virtual: true,
            is_global,
            shared_with_unmoved: false,
            referenced_by: Vec::new(),
        }
    }

    /// Get the source UID
    pub fn uid(&self) -> &str {
        &self.identity.uid
    }

    /// Whether the move pauses and finally deletes the source copy
    pub fn leaves_source(&self) -> bool {
        !self.is_virtual && !self.is_global && !self.shared_with_unmoved
    }

    /// Every node that must be created before this one
    pub fn dependencies(&self) -> BTreeSet<&str> {
        self.owners
            .iter()
            .map(String::as_str)
            .chain(self.soft_refs.iter().map(|s| s.target.as_str()))
            .collect()
    }
}

/// The object graph containing all discovered resources and their relationships
#[derive(Debug, Default)]
pub struct ObjectGraph {
    /// All nodes indexed by key (the source UID for discovered objects)
    nodes: BTreeMap<String, GraphNode>,
}

impl ObjectGraph {
    /// Create a new empty ObjectGraph
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all nodes
    pub fn nodes(&self) -> &BTreeMap<String, GraphNode> {
        &self.nodes
    }

    /// Get a node by key
    pub fn get(&self, key: &str) -> Option<&GraphNode> {
        self.nodes.get(key)
    }

    pub(crate) fn get_mut(&mut self, key: &str) -> Option<&mut GraphNode> {
        self.nodes.get_mut(key)
    }

    /// Whether a node exists for this key
    pub fn contains(&self, key: &str) -> bool {
        self.nodes.contains_key(key)
    }

    /// Get all keys, sorted
    pub fn uids(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    /// Get the number of nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check if the graph is empty
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Insert a node under its UID. Returns false if the key was taken.
    pub fn insert(&mut self, node: GraphNode) -> bool {
        let key = node.uid().to_string();
        self.insert_with_key(key, node)
    }

    /// Insert a node under an explicit key (virtual nodes without a UID)
    pub fn insert_with_key(&mut self, key: String, node: GraphNode) -> bool {
        if self.nodes.contains_key(&key) {
            return false;
        }
        self.nodes.insert(key, node);
        true
    }

    /// Reverse edges: for each key, the nodes listing it as an owner or soft
    /// reference
    pub fn dependents(&self) -> HashMap<&str, Vec<&str>> {
        let mut index: HashMap<&str, Vec<&str>> = HashMap::new();
        for (key, node) in &self.nodes {
            for dep in node.dependencies() {
                index.entry(dep).or_default().push(key.as_str());
            }
        }
        index
    }

    /// Cluster API `Cluster` objects with no owners of their own
    pub fn cluster_roots(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|(_, n)| is_cluster_kind(&n.identity) && n.owners.is_empty() && !n.is_virtual)
            .map(|(k, _)| k.as_str())
            .collect()
    }

    /// Restrict the graph to one Cluster, everything hanging off it, and
    /// everything those objects depend on.
    ///
    /// Kept nodes that another Cluster root also reaches are flagged
    /// `shared_with_unmoved` so they are copied but stay on the source.
    pub fn filter_by_cluster(&mut self, namespace: Option<&str>, cluster_name: &str) -> bool {
        let cluster_key = self
            .nodes
            .iter()
            .find(|(_, n)| {
                is_cluster_kind(&n.identity)
                    && n.identity.name == cluster_name
                    && namespace.is_none_or(|ns| n.identity.namespace == ns)
            })
            .map(|(k, _)| k.clone());

        let Some(cluster_key) = cluster_key else {
            warn!(cluster = %cluster_name, "Cluster not found in graph");
            return false;
        };

        let dependents = self.dependents();
        let keep = self.cluster_members(&cluster_key, &dependents);
        let shared: HashSet<String> = self
            .cluster_roots()
            .into_iter()
            .filter(|root| *root != cluster_key.as_str())
            .flat_map(|root| self.cluster_members(root, &dependents))
            .filter(|key| keep.contains(key))
            .collect();

        let before = self.nodes.len();
        self.nodes.retain(|key, _| keep.contains(key));
        for key in &shared {
            if let Some(node) = self.nodes.get_mut(key) {
                node.shared_with_unmoved = true;
                warn!(
                    object = %node.identity.display(),
                    "Object is also used by a Cluster outside the move, it will be copied but kept on the source"
                );
            }
        }

        info!(
            cluster = %cluster_name,
            before = before,
            after = self.nodes.len(),
            shared = shared.len(),
            "Filtered graph by cluster"
        );
        true
    }

    /// A root, everything that transitively depends on it, and everything
    /// those objects depend on in turn. `dependents` comes from
    /// [`ObjectGraph::dependents`].
    pub(crate) fn cluster_members(
        &self,
        root: &str,
        dependents: &HashMap<&str, Vec<&str>>,
    ) -> HashSet<String> {
        let mut members = collect_descendants(root, dependents);

        let mut queue: VecDeque<String> = members.iter().cloned().collect();
        while let Some(key) = queue.pop_front() {
            if let Some(node) = self.nodes.get(&key) {
                for dep in node.dependencies() {
                    if self.nodes.contains_key(dep) && members.insert(dep.to_string()) {
                        queue.push_back(dep.to_string());
                    }
                }
            }
        }
        members
    }
}

/// Collect a node and all its descendants
fn collect_descendants(root: &str, dependents: &HashMap<&str, Vec<&str>>) -> HashSet<String> {
    let mut collected = HashSet::new();
    let mut stack = vec![root.to_string()];

    while let Some(key) = stack.pop() {
        if !collected.insert(key.clone()) {
            continue;
        }
        for dependent in dependents.get(key.as_str()).into_iter().flatten() {
            if !collected.contains(*dependent) {
                stack.push(dependent.to_string());
            }
        }
    }

    collected
}

/// Whether this identity is a Cluster API `Cluster`
pub(crate) fn is_cluster_kind(identity: &ObjectIdentity) -> bool {
    identity.kind == "Cluster" && identity.group() == crate::registry::CLUSTER_API_GROUP
}


#[cfg(test)]
mod tests {
    use super::test_support::{graph, node};
    use super::*;

    #[test]
    fn test_object_identity_display() {
        let id = ObjectIdentity::new("v1", "Secret", "default", "my-secret", "uid-1");
        assert_eq!(id.display(), "Secret/default/my-secret");

        let global = ObjectIdentity::new(
            "infrastructure.cluster.x-k8s.io/v1beta2",
            "AWSClusterStaticIdentity",
            "",
            "default",
            "uid-2",
        );
        assert_eq!(global.display(), "AWSClusterStaticIdentity/default");
    }

    #[test]
    fn test_identity_from_object() {
        let obj = serde_json::json!({
            "apiVersion": "cluster.x-k8s.io/v1beta1",
            "kind": "Machine",
            "metadata": {"name": "m-1", "namespace": "capi", "uid": "u-1"}
        });
        let id = ObjectIdentity::from_object(&obj).unwrap();
        assert_eq!(id.kind, "Machine");
        assert_eq!(id.namespace, "capi");
        assert_eq!(id.uid, "u-1");
        assert_eq!(id.group(), "cluster.x-k8s.io");

        assert!(ObjectIdentity::from_object(&serde_json::json!({"kind": "Machine"})).is_none());
    }

    #[test]
    fn test_dependencies_union_owners_and_soft_refs() {
        let mut n = node("c", "Cluster", "prod", &["owner-1"]);
        n.soft_refs.push(SoftEdge {
            target: "infra".to_string(),
            field: "spec.infrastructureRef".to_string(),
        });
        let deps = n.dependencies();
        assert!(deps.contains("owner-1"));
        assert!(deps.contains("infra"));
        assert_eq!(deps.len(), 2);
    }

    #[test]
    fn test_insert_rejects_duplicate_keys() {
        let mut g = ObjectGraph::new();
        assert!(g.insert(node("uid-1", "Cluster", "a", &[])));
        assert!(!g.insert(node("uid-1", "Cluster", "a-again", &[])));
        assert_eq!(g.len(), 1);
        assert_eq!(g.get("uid-1").unwrap().identity.name, "a");
    }

    #[test]
    fn test_cluster_roots() {
        let g = graph(vec![
            node("c1", "Cluster", "one", &[]),
            node("c2", "Cluster", "two", &["something"]),
            node("m1", "Machine", "m", &["c1"]),
        ]);
        assert_eq!(g.cluster_roots(), vec!["c1"]);
    }

    #[test]
    fn test_filter_by_cluster() {
        let mut infra = node("infra-1", "DockerCluster", "cluster-1", &[]);
        infra.is_global = false;
        let mut cluster1 = node("cluster-1-uid", "Cluster", "cluster-1", &[]);
        cluster1.soft_refs.push(SoftEdge {
            target: "infra-1".to_string(),
            field: "spec.infrastructureRef".to_string(),
        });

        let mut g = graph(vec![
            infra,
            cluster1,
            node("machine-1-uid", "Machine", "machine-1", &["cluster-1-uid"]),
            node("cluster-2-uid", "Cluster", "cluster-2", &[]),
            node("machine-2-uid", "Machine", "machine-2", &["cluster-2-uid"]),
        ]);

        assert!(g.filter_by_cluster(Some("default"), "cluster-1"));

        assert_eq!(g.len(), 3);
        assert!(g.contains("cluster-1-uid"));
        assert!(g.contains("machine-1-uid"));
        assert!(g.contains("infra-1"));
        assert!(!g.contains("cluster-2-uid"));
        assert!(!g.contains("machine-2-uid"));
    }

    #[test]
    fn test_filter_flags_objects_another_cluster_still_uses() {
        let infra_ref = |target: &str| SoftEdge {
            target: target.to_string(),
            field: "spec.infrastructureRef".to_string(),
        };
        let mut prod = node("prod-uid", "Cluster", "prod", &[]);
        prod.soft_refs.push(infra_ref("shared-uid"));
        let mut dev = node("dev-uid", "Cluster", "dev", &[]);
        dev.soft_refs.push(infra_ref("shared-uid"));

        let mut g = graph(vec![
            prod,
            dev,
            node("shared-uid", "DockerCluster", "shared", &[]),
            node("prod-m", "Machine", "prod-m", &["prod-uid"]),
        ]);
        assert!(g.filter_by_cluster(None, "prod"));

        let kept = g.uids();
        assert_eq!(kept, vec!["prod-m", "prod-uid", "shared-uid"]);
        assert!(g.get("shared-uid").unwrap().shared_with_unmoved);
        assert!(!g.get("shared-uid").unwrap().leaves_source());
        assert!(g.get("prod-uid").unwrap().leaves_source());
        assert!(g.get("prod-m").unwrap().leaves_source());
    }

    #[test]
    fn test_dependents_index() {
        let mut c = node("c", "Cluster", "prod", &[]);
        c.soft_refs.push(SoftEdge {
            target: "infra".to_string(),
            field: "spec.infrastructureRef".to_string(),
        });
        let g = graph(vec![
            c,
            node("infra", "DockerCluster", "prod", &[]),
            node("m1", "Machine", "m1", &["c"]),
            node("m2", "Machine", "m2", &["c"]),
        ]);

        let index = g.dependents();
        assert_eq!(index.get("c"), Some(&vec!["m1", "m2"]));
        assert_eq!(index.get("infra"), Some(&vec!["c"]));
        assert!(!index.contains_key("m1"));

        let members = g.cluster_members("c", &index);
        assert_eq!(members.len(), 4);
    }

    #[test]
    fn test_filter_by_unknown_cluster_keeps_graph() {
        let mut g = graph(vec![node("c1", "Cluster", "one", &[])]);
        assert!(!g.filter_by_cluster(None, "missing"));
        assert_eq!(g.len(), 1);
    }
}
