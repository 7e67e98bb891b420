//! Common types for keel: errors, retry, and Kubernetes client helpers

#![deny(missing_docs)]

pub mod error;
pub mod kube_utils;
pub mod retry;
pub mod telemetry;

pub use error::Error;

/// Label carried by every Cluster API object that belongs to a workload cluster.
pub const CLUSTER_NAME_LABEL: &str = "cluster.x-k8s.io/cluster-name";

/// Label all upstream Cluster API provider CRDs carry (`cluster.x-k8s.io/provider: <name>`).
pub const PROVIDER_LABEL: &str = "cluster.x-k8s.io/provider";

/// Label clusterctl puts on CRDs whose objects take part in a move.
pub const CLUSTERCTL_LABEL: &str = "clusterctl.cluster.x-k8s.io";
