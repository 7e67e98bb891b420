//! Creating objects on the target and retiring them from the source
//!
//! Creation runs wave by wave. Each object is re-read from the source (so the
//! copy carries the pause marker), stripped of server-assigned fields, and has
//! its ownerReferences and soft-reference UIDs rewritten through the
//! [`TranslationTable`] before it is submitted. An object that already exists
//! on the target is adopted by reading back its UID, which makes re-runs
//! resume where a previous run stopped.
//!
//! Deletion walks the waves backwards and only starts once every object has a
//! confirmed copy.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use keel_common::retry::{retry_with_backoff_if, RetryConfig};

use crate::accessor::{AccessorError, ResourceAccessor};
use crate::bounded::run_bounded;
use crate::error::{MoveError, NodeFailure, RelocationOp};
use crate::graph::{GraphNode, ObjectGraph, ObjectIdentity};
use crate::sequence::{MovePlan, Wave};
use crate::translation::TranslationTable;
use crate::DELETE_FOR_MOVE_ANNOTATION;

const LAST_APPLIED_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";

/// Strip fields the API server owns so the object can be created elsewhere.
///
/// ownerReferences are kept; they are rewritten separately.
pub fn strip_transient_fields(obj: &mut Value) {
    if let Some(metadata) = obj.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        metadata.remove("uid");
        metadata.remove("resourceVersion");
        metadata.remove("creationTimestamp");
        metadata.remove("deletionTimestamp");
        metadata.remove("deletionGracePeriodSeconds");
        metadata.remove("generation");
        metadata.remove("selfLink");
        metadata.remove("managedFields");

        if let Some(annotations) = metadata
            .get_mut("annotations")
            .and_then(|a| a.as_object_mut())
        {
            annotations.remove(LAST_APPLIED_ANNOTATION);
        }
    }

    if let Some(obj_map) = obj.as_object_mut() {
        obj_map.remove("status");
    }
}

/// Point ownerReferences at the target copies of their owners.
///
/// References to objects outside the graph are dropped; an owner inside the
/// graph without a copy yet is an ordering bug and fails the object.
fn rewrite_owner_references(
    object: &mut Value,
    graph: &ObjectGraph,
    table: &TranslationTable,
) -> Result<(), String> {
    let Some(metadata) = object.get_mut("metadata").and_then(|m| m.as_object_mut()) else {
        return Ok(());
    };
    let Some(refs) = metadata.get("ownerReferences").and_then(|r| r.as_array()) else {
        return Ok(());
    };

    let mut rewritten = Vec::with_capacity(refs.len());
    for owner in refs {
        let Some(uid) = owner.get("uid").and_then(|u| u.as_str()) else {
            continue;
        };
        let owner_name = owner.get("name").and_then(|n| n.as_str()).unwrap_or(uid);
        if !graph.contains(uid) {
            debug!(owner = %owner_name, uid = %uid, "Dropping reference to owner outside the move");
            continue;
        }
        let target_uid = table
            .get(uid)
            .ok_or_else(|| format!("owner {} has no copy on the target yet", owner_name))?;
        let mut owner = owner.clone();
        owner["uid"] = Value::String(target_uid);
        rewritten.push(owner);
    }

    if rewritten.is_empty() {
        metadata.remove("ownerReferences");
    } else {
        metadata.insert("ownerReferences".to_string(), Value::Array(rewritten));
    }
    Ok(())
}

/// Soft references rarely carry a UID, but when they do it must name the
/// target copy.
fn rewrite_soft_reference_uids(object: &mut Value, node: &GraphNode, table: &TranslationTable) {
    for edge in &node.soft_refs {
        let Some(reference) = edge
            .field
            .split('.')
            .try_fold(&mut *object, |value, segment| value.get_mut(segment))
        else {
            continue;
        };
        if reference.get("uid").is_none() {
            continue;
        }
        if let Some(target_uid) = table.get(&edge.target) {
            reference["uid"] = Value::String(target_uid);
        }
    }
}

/// Creates graph objects on the target and deletes them from the source
pub struct Relocator {
    source: Arc<dyn ResourceAccessor>,
    target: Arc<dyn ResourceAccessor>,
    retry: RetryConfig,
    concurrency: usize,
}

impl Relocator {
    /// Create a relocator between two clusters
    pub fn new(
        source: Arc<dyn ResourceAccessor>,
        target: Arc<dyn ResourceAccessor>,
        retry: RetryConfig,
        concurrency: usize,
    ) -> Self {
        Self {
            source,
            target,
            retry,
            concurrency: concurrency.max(1),
        }
    }

    /// Make sure every namespace the graph writes into exists on the target
    pub async fn ensure_namespaces(&self, graph: &ObjectGraph) -> Result<(), MoveError> {
        let namespaces: BTreeSet<&str> = graph
            .nodes()
            .values()
            .filter(|n| !n.is_virtual && !n.identity.namespace.is_empty())
            .map(|n| n.identity.namespace.as_str())
            .collect();

        let mut failed = Vec::new();
        for namespace in namespaces {
            let result = retry_with_backoff_if(
                &self.retry,
                &format!("ensure namespace {}", namespace),
                AccessorError::is_retryable,
                || self.target.ensure_namespace(namespace),
            )
            .await;
            if let Err(e) = result {
                error!(namespace = %namespace, error = %e, "Failed to ensure namespace on target");
                failed.push(NodeFailure::new(
                    &ObjectIdentity::new("v1", "Namespace", "", namespace, ""),
                    e.to_string(),
                ));
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            let remaining = failed.iter().map(|f| f.identity.clone()).collect();
            Err(MoveError::Relocation {
                op: RelocationOp::Create,
                failed,
                remaining,
            })
        }
    }

    /// Create every object of a wave on the target, recording the new UIDs.
    ///
    /// Objects already in the table are skipped. Returns the identities
    /// created (or adopted) by this call.
    #[instrument(skip_all, fields(wave = wave.index, objects = wave.len()))]
    pub async fn create_wave(
        &self,
        graph: &ObjectGraph,
        wave: &Wave,
        table: &TranslationTable,
    ) -> Result<Vec<ObjectIdentity>, MoveError> {
        let nodes = wave.graph_nodes(graph);
        let results = run_bounded(
            self.concurrency,
            nodes.iter().map(|node| self.create_node(graph, node, table)),
        )
        .await;

        let mut created = Vec::new();
        let mut failed = Vec::new();
        for (node, result) in nodes.iter().zip(results) {
            match result {
                Ok(()) => created.push(node.identity.clone()),
                Err(message) => {
                    error!(object = %node.identity.display(), error = %message, "Failed to create object on target");
                    failed.push(NodeFailure::new(&node.identity, message));
                }
            }
        }

        if failed.is_empty() {
            info!(wave = wave.index, created = created.len(), "Wave created on target");
            Ok(created)
        } else {
            let remaining = failed.iter().map(|f| f.identity.clone()).collect();
            Err(MoveError::Relocation {
                op: RelocationOp::Create,
                failed,
                remaining,
            })
        }
    }

    async fn create_node(
        &self,
        graph: &ObjectGraph,
        node: &GraphNode,
        table: &TranslationTable,
    ) -> Result<(), String> {
        if node.is_virtual {
            return Err("object was never discovered on the source".to_string());
        }
        if table.contains(node.uid()) {
            return Ok(());
        }

        let identity = &node.identity;
        let name = identity.display();

        let mut object = retry_with_backoff_if(
            &self.retry,
            &format!("read {}", name),
            AccessorError::is_retryable,
            || self.source.get(identity),
        )
        .await
        .map_err(|e| format!("failed to re-read from source: {}", e))?;

        strip_transient_fields(&mut object);
        rewrite_owner_references(&mut object, graph, table)?;
        rewrite_soft_reference_uids(&mut object, node, table);

        let created = retry_with_backoff_if(
            &self.retry,
            &format!("create {}", name),
            AccessorError::is_retryable,
            || self.target.create(&object),
        )
        .await;

        let stored = match created {
            Ok(stored) => stored,
            Err(AccessorError::AlreadyExists(_)) => {
                debug!(object = %name, "Already exists on target, adopting it");
                retry_with_backoff_if(
                    &self.retry,
                    &format!("read back {}", name),
                    AccessorError::is_retryable,
                    || self.target.get(identity),
                )
                .await
                .map_err(|e| format!("exists on target but could not be read: {}", e))?
            }
            Err(e) => return Err(e.to_string()),
        };

        let target_uid = stored
            .pointer("/metadata/uid")
            .and_then(|u| u.as_str())
            .filter(|u| !u.is_empty())
            .ok_or_else(|| "target returned the object without a UID".to_string())?;

        debug!(object = %name, source_uid = %node.uid(), target_uid = %target_uid, "Created on target");
        table.record(node.uid(), target_uid);
        Ok(())
    }

    /// Fail unless every discovered object has a copy on the target
    pub fn ensure_fully_migrated(
        &self,
        graph: &ObjectGraph,
        table: &TranslationTable,
    ) -> Result<(), MoveError> {
        let discovered = graph
            .nodes()
            .iter()
            .filter(|(_, node)| !node.is_virtual)
            .map(|(key, _)| key.as_str());
        let missing: Vec<NodeFailure> = table
            .missing(discovered)
            .into_iter()
            .filter_map(|key| graph.get(key))
            .map(|node| NodeFailure::new(&node.identity, "no confirmed copy on the target"))
            .collect();

        if missing.is_empty() {
            return Ok(());
        }
        let remaining = deletable(graph).into_iter().map(|n| n.identity.clone()).collect();
        Err(MoveError::Relocation {
            op: RelocationOp::Delete,
            failed: missing,
            remaining,
        })
    }

    /// Delete the source objects, last wave first.
    ///
    /// Global objects and objects shared with an unmoved Cluster stay on
    /// the source. Each object is marked for move
    /// deletion and has its finalizers cleared before the delete. The
    /// cancellation token is checked between waves. Identities removed are
    /// appended to `deleted` even when the call fails part-way.
    #[instrument(skip_all, fields(waves = plan.num_waves()))]
    pub async fn delete_source(
        &self,
        graph: &ObjectGraph,
        plan: &MovePlan,
        table: &TranslationTable,
        cancel: &CancellationToken,
        deleted: &mut Vec<ObjectIdentity>,
    ) -> Result<(), MoveError> {
        self.ensure_fully_migrated(graph, table)?;

        for wave in plan.waves().iter().rev() {
            if cancel.is_cancelled() {
                return Err(MoveError::Cancelled);
            }

            let nodes: Vec<&GraphNode> = wave
                .graph_nodes(graph)
                .into_iter()
                .filter(|n| n.leaves_source())
                .collect();
            let results = run_bounded(
                self.concurrency,
                nodes.iter().map(|node| self.delete_node(&node.identity)),
            )
            .await;

            let mut failed = Vec::new();
            for (node, result) in nodes.iter().zip(results) {
                match result {
                    Ok(()) => deleted.push(node.identity.clone()),
                    Err(e) => {
                        error!(object = %node.identity.display(), error = %e, "Failed to delete object from source");
                        failed.push(NodeFailure::new(&node.identity, e.to_string()));
                    }
                }
            }

            if !failed.is_empty() {
                let remaining = deletable(graph)
                    .into_iter()
                    .map(|n| n.identity.clone())
                    .filter(|id| !deleted.contains(id))
                    .collect();
                return Err(MoveError::Relocation {
                    op: RelocationOp::Delete,
                    failed,
                    remaining,
                });
            }
            debug!(wave = wave.index, objects = nodes.len(), "Wave deleted from source");
        }

        info!(deleted = deleted.len(), "Source objects deleted");
        Ok(())
    }

    async fn delete_node(&self, identity: &ObjectIdentity) -> Result<(), AccessorError> {
        let name = identity.display();
        let mut annotations = serde_json::Map::new();
        annotations.insert(DELETE_FOR_MOVE_ANNOTATION.to_string(), Value::String(String::new()));
        let mark = json!({
            "metadata": {
                "annotations": annotations,
                "finalizers": null
            }
        });

        let marked = retry_with_backoff_if(
            &self.retry,
            &format!("mark {} for deletion", name),
            AccessorError::is_retryable,
            || self.source.patch(identity, &mark),
        )
        .await;
        match marked {
            Ok(()) => {}
            Err(AccessorError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        }

        let result = retry_with_backoff_if(
            &self.retry,
            &format!("delete {}", name),
            AccessorError::is_retryable,
            || self.source.delete(identity),
        )
        .await;
        match result {
            Ok(()) | Err(AccessorError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Nodes whose source copy is deleted
fn deletable(graph: &ObjectGraph) -> Vec<&GraphNode> {
    graph
        .nodes()
        .values()
        .filter(|n| n.leaves_source())
        .collect()
}
