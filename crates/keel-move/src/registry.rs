//! Registry of kinds that take part in a move
//!
//! Each entry says how objects of a kind are discovered (every object in the
//! namespace, or only those labelled with a cluster name), whether the kind is
//! global (cluster-scoped, copied but never deleted), and which fields hold
//! soft references to other objects.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, ListParams};
use kube::discovery::ApiResource;
use kube::Client;
use serde_json::Value;
use tracing::{debug, info};

use keel_common::kube_utils::{api_group, build_api_resource};
use keel_common::{CLUSTERCTL_LABEL, CLUSTER_NAME_LABEL, PROVIDER_LABEL};

use crate::error::MoveError;

/// API group of the core Cluster API types
pub const CLUSTER_API_GROUP: &str = "cluster.x-k8s.io";

const CAPI_V1BETA1: &str = "cluster.x-k8s.io/v1beta1";
const KUBEADM_CP_V1BETA1: &str = "controlplane.cluster.x-k8s.io/v1beta1";
const KUBEADM_BOOTSTRAP_V1BETA1: &str = "bootstrap.cluster.x-k8s.io/v1beta1";

/// How objects of a kind are found on the source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindDiscovery {
    /// Every object in the namespace (Clusters, ClusterClasses, templates)
    All,
    /// Only objects carrying the cluster-name label
    ClusterMembers,
}

/// A field holding a reference to another object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoftRefRule {
    /// Dotted path to an object reference (`{apiVersion, kind, name[, namespace]}`)
    pub field: String,
}

impl SoftRefRule {
    /// Rule for the reference at a dotted path
    pub fn new(field: &str) -> Self {
        Self {
            field: field.to_string(),
        }
    }

    /// Pull the reference out of an object, if the field is set
    pub fn extract(&self, object: &Value, default_namespace: &str) -> Option<SoftReference> {
        let reference = self
            .field
            .split('.')
            .try_fold(object, |value, segment| value.get(segment))?;

        let kind = reference.get("kind")?.as_str()?;
        let name = reference.get("name")?.as_str()?;
        let api_version = reference
            .get("apiVersion")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let namespace = reference
            .get("namespace")
            .and_then(|v| v.as_str())
            .unwrap_or(default_namespace);

        Some(SoftReference {
            field: self.field.clone(),
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        })
    }
}

/// A reference found in an object's fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoftReference {
    /// Field the reference was read from
    pub field: String,
    /// Referenced apiVersion (may be empty)
    pub api_version: String,
    /// Referenced kind
    pub kind: String,
    /// Referenced namespace (the referrer's when omitted)
    pub namespace: String,
    /// Referenced name
    pub name: String,
}

/// A kind considered part of the object graph
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MovableKind {
    /// API version to list with (e.g., "cluster.x-k8s.io/v1beta1")
    pub api_version: String,
    /// Kind
    pub kind: String,
    /// Plural resource name
    pub plural: String,
    /// Cluster-scoped shared kind
    pub global: bool,
    /// How instances are found
    pub discovery: KindDiscovery,
    /// Fields holding soft references
    pub soft_refs: Vec<SoftRefRule>,
}

impl MovableKind {
    /// Namespaced kind listed by the cluster-name label
    pub fn member(api_version: &str, kind: &str) -> Self {
        let ar = build_api_resource(api_version, kind);
        Self {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            plural: ar.plural,
            global: false,
            discovery: KindDiscovery::ClusterMembers,
            soft_refs: Vec::new(),
        }
    }

    /// Namespaced kind whose every instance is listed
    pub fn unlabelled(api_version: &str, kind: &str) -> Self {
        Self {
            discovery: KindDiscovery::All,
            ..Self::member(api_version, kind)
        }
    }

    /// Cluster-scoped kind shared between clusters
    pub fn global(api_version: &str, kind: &str) -> Self {
        Self {
            global: true,
            discovery: KindDiscovery::All,
            ..Self::member(api_version, kind)
        }
    }

    /// Add soft-reference fields
    pub fn with_soft_refs(mut self, fields: &[&str]) -> Self {
        self.soft_refs
            .extend(fields.iter().map(|f| SoftRefRule::new(f)));
        self
    }

    /// API group (empty for core)
    pub fn group(&self) -> &str {
        api_group(&self.api_version)
    }

    /// Label selector used when listing, if any
    pub fn selector(&self) -> Option<&'static str> {
        match self.discovery {
            KindDiscovery::All => None,
            KindDiscovery::ClusterMembers => Some(CLUSTER_NAME_LABEL),
        }
    }

    /// kube ApiResource for dynamic API access
    pub fn api_resource(&self) -> ApiResource {
        let mut ar = build_api_resource(&self.api_version, &self.kind);
        ar.plural = self.plural.clone();
        ar
    }

    /// Every soft reference set on this object
    pub fn extract_soft_refs(&self, object: &Value, default_namespace: &str) -> Vec<SoftReference> {
        self.soft_refs
            .iter()
            .filter_map(|rule| rule.extract(object, default_namespace))
            .collect()
    }
}

/// Soft-reference fields for the kinds whose shape is known
fn known_soft_refs(group: &str, kind: &str) -> &'static [&'static str] {
    match (group, kind) {
        (CLUSTER_API_GROUP, "Cluster") => &["spec.infrastructureRef", "spec.controlPlaneRef"],
        (CLUSTER_API_GROUP, "Machine") => &["spec.infrastructureRef", "spec.bootstrap.configRef"],
        (CLUSTER_API_GROUP, "MachineSet")
        | (CLUSTER_API_GROUP, "MachineDeployment")
        | (CLUSTER_API_GROUP, "MachinePool") => &[
            "spec.template.spec.infrastructureRef",
            "spec.template.spec.bootstrap.configRef",
        ],
        (CLUSTER_API_GROUP, "ClusterClass") => &[
            "spec.infrastructure.ref",
            "spec.controlPlane.ref",
            "spec.controlPlane.machineInfrastructure.ref",
        ],
        ("controlplane.cluster.x-k8s.io", "KubeadmControlPlane") => {
            &["spec.machineTemplate.infrastructureRef"]
        }
        _ => &[],
    }
}

/// Ordered list of movable kinds
#[derive(Debug, Clone, Default)]
pub struct MovableKindRegistry {
    kinds: Vec<MovableKind>,
}

impl MovableKindRegistry {
    /// Registry with no kinds
    pub fn empty() -> Self {
        Self::default()
    }

    /// The core Cluster API and kubeadm kinds
    pub fn cluster_api_defaults() -> Self {
        let kinds = vec![
            MovableKind::unlabelled(CAPI_V1BETA1, "Cluster"),
            MovableKind::unlabelled(CAPI_V1BETA1, "ClusterClass"),
            MovableKind::member(CAPI_V1BETA1, "MachineDeployment"),
            MovableKind::member(CAPI_V1BETA1, "MachineSet"),
            MovableKind::member(CAPI_V1BETA1, "Machine"),
            MovableKind::member(CAPI_V1BETA1, "MachinePool"),
            MovableKind::member(CAPI_V1BETA1, "MachineHealthCheck"),
            MovableKind::member(KUBEADM_CP_V1BETA1, "KubeadmControlPlane"),
            MovableKind::unlabelled(KUBEADM_CP_V1BETA1, "KubeadmControlPlaneTemplate"),
            MovableKind::member(KUBEADM_BOOTSTRAP_V1BETA1, "KubeadmConfig"),
            MovableKind::unlabelled(KUBEADM_BOOTSTRAP_V1BETA1, "KubeadmConfigTemplate"),
        ];

        let mut registry = Self::empty();
        for kind in kinds {
            registry.register(kind);
        }
        registry
    }

    /// Add a kind, attaching the known soft-reference rules when it has none.
    /// A kind already registered (same group and kind) is replaced.
    pub fn register(&mut self, mut kind: MovableKind) {
        if kind.soft_refs.is_empty() {
            let known = known_soft_refs(kind.group(), &kind.kind);
            kind = kind.with_soft_refs(known);
        }
        let group = kind.group().to_string();
        match self
            .kinds
            .iter_mut()
            .find(|k| k.group() == group && k.kind == kind.kind)
        {
            Some(existing) => *existing = kind,
            None => self.kinds.push(kind),
        }
    }

    /// Builder-style [`register`](Self::register)
    pub fn with_kind(mut self, kind: MovableKind) -> Self {
        self.register(kind);
        self
    }

    /// All kinds, in registration order
    pub fn kinds(&self) -> &[MovableKind] {
        &self.kinds
    }

    /// Look up a kind by group and kind (versions may differ between references)
    pub fn find(&self, group: &str, kind: &str) -> Option<&MovableKind> {
        self.kinds
            .iter()
            .find(|k| k.group() == group && k.kind == kind)
    }

    /// Look up the kind of an apiVersion/kind pair
    pub fn find_for(&self, api_version: &str, kind: &str) -> Option<&MovableKind> {
        self.find(api_group(api_version), kind)
    }

    /// Number of registered kinds
    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    /// Whether no kind is registered
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}

/// Extend the Cluster API defaults with the provider CRDs installed on a cluster.
///
/// CRDs labelled `cluster.x-k8s.io/provider` or `clusterctl.cluster.x-k8s.io`
/// are movable. Cluster-scoped CRDs become global kinds; template kinds are
/// listed without the cluster-name selector because they are rarely labelled.
pub async fn discover_movable_kinds(client: &Client) -> Result<MovableKindRegistry, MoveError> {
    let crd_api: Api<CustomResourceDefinition> = Api::all(client.clone());
    let crds = crd_api
        .list(&ListParams::default())
        .await
        .map_err(|e| MoveError::Discovery(format!("failed to list CRDs: {}", e)))?;

    let mut registry = MovableKindRegistry::cluster_api_defaults();
    for crd in &crds.items {
        if let Some(kind) = movable_kind_from_crd(crd) {
            if registry.find(kind.group(), &kind.kind).is_none() {
                debug!(kind = %kind.kind, api_version = %kind.api_version, global = kind.global, "Discovered movable CRD");
                registry.register(kind);
            }
        }
    }

    info!(kinds = registry.len(), "Built movable kind registry");
    Ok(registry)
}

fn movable_kind_from_crd(crd: &CustomResourceDefinition) -> Option<MovableKind> {
    let labels = crd.metadata.labels.as_ref()?;
    if !labels.contains_key(PROVIDER_LABEL) && !labels.contains_key(CLUSTERCTL_LABEL) {
        return None;
    }

    let spec = &crd.spec;
    let version = spec
        .versions
        .iter()
        .find(|v| v.storage)
        .or_else(|| spec.versions.first())?;
    let api_version = if spec.group.is_empty() {
        version.name.clone()
    } else {
        format!("{}/{}", spec.group, version.name)
    };

    let mut kind = if spec.scope == "Cluster" {
        MovableKind::global(&api_version, &spec.names.kind)
    } else if spec.names.kind.ends_with("Template") {
        MovableKind::unlabelled(&api_version, &spec.names.kind)
    } else {
        MovableKind::member(&api_version, &spec.names.kind)
    };
    kind.plural = spec.names.plural.clone();
    Some(kind)
}
