//! Structural checks on the object graph before anything is mutated
//!
//! Pure analysis: reads the graph, never the clusters, so it is safe to run
//! repeatedly and as part of a dry run.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use tracing::{info, warn};

use crate::error::{GraphIssue, MoveError};
use crate::graph::{ObjectGraph, ObjectIdentity};

/// Diagnostics that do not block a move
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    /// Objects not connected to any Cluster root; moved as independent roots
    pub orphans: Vec<ObjectIdentity>,
    /// Objects belonging to more than one Cluster, including Clusters left
    /// out of a filtered move
    pub shared: Vec<ObjectIdentity>,
}

/// Check a graph for ownership cycles and unresolved references.
///
/// Every issue found is reported, cycles first. Orphaned and shared objects
/// are returned as diagnostics.
pub fn validate(graph: &ObjectGraph) -> Result<ValidationReport, MoveError> {
    let mut issues: Vec<GraphIssue> = owner_cycles(graph)
        .into_iter()
        .map(|keys| GraphIssue::Cycle {
            members: keys
                .into_iter()
                .filter_map(|k| graph.get(k))
                .map(|n| n.identity.clone())
                .collect(),
        })
        .collect();
    issues.extend(unresolved_references(graph));

    if !issues.is_empty() {
        for issue in &issues {
            warn!(%issue, "Graph validation failed");
        }
        return Err(MoveError::Graph(issues));
    }

    let report = membership_report(graph);
    for orphan in &report.orphans {
        warn!(object = %orphan.display(), "Object is not connected to any Cluster; moving it as an independent root");
    }
    info!(
        objects = graph.len(),
        orphans = report.orphans.len(),
        shared = report.shared.len(),
        "Object graph is valid"
    );
    Ok(report)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Visit {
    InProgress,
    Done,
}

/// Iterative DFS along owner edges; a back edge to an in-progress node closes
/// a cycle made of the stack from that node upward.
fn owner_cycles(graph: &ObjectGraph) -> Vec<Vec<&str>> {
    let mut state: HashMap<&str, Visit> = HashMap::new();
    let mut cycles = Vec::new();

    for start in graph.nodes().keys().map(String::as_str) {
        if state.contains_key(start) {
            continue;
        }
        state.insert(start, Visit::InProgress);
        let mut stack: Vec<(&str, Vec<&str>)> = vec![(start, owners_of(graph, start))];

        loop {
            let next = match stack.last_mut() {
                Some((_, pending)) => pending.pop(),
                None => break,
            };
            match next {
                Some(owner) => match state.get(owner) {
                    None => {
                        state.insert(owner, Visit::InProgress);
                        stack.push((owner, owners_of(graph, owner)));
                    }
                    Some(Visit::InProgress) => {
                        if let Some(pos) = stack.iter().position(|(k, _)| *k == owner) {
                            cycles.push(stack[pos..].iter().map(|(k, _)| *k).collect());
                        }
                    }
                    Some(Visit::Done) => {}
                },
                None => {
                    if let Some((done, _)) = stack.pop() {
                        state.insert(done, Visit::Done);
                    }
                }
            }
        }
    }

    cycles
}

/// Owners present in the graph, reversed so popping visits them in order
fn owners_of<'a>(graph: &'a ObjectGraph, key: &str) -> Vec<&'a str> {
    graph
        .get(key)
        .map(|n| {
            n.owners
                .iter()
                .map(String::as_str)
                .filter(|o| graph.contains(o))
                .rev()
                .collect()
        })
        .unwrap_or_default()
}

fn unresolved_references(graph: &ObjectGraph) -> Vec<GraphIssue> {
    let mut issues = Vec::new();
    for node in graph.nodes().values().filter(|n| n.is_virtual) {
        if node.referenced_by.is_empty() {
            issues.push(GraphIssue::UnresolvedReference {
                referrer: node.identity.clone(),
                field: "(unknown)".to_string(),
                target: node.identity.clone(),
            });
        }
        for (referrer_key, field) in &node.referenced_by {
            let referrer = graph
                .get(referrer_key)
                .map(|r| r.identity.clone())
                .unwrap_or_else(|| node.identity.clone());
            issues.push(GraphIssue::UnresolvedReference {
                referrer,
                field: field.clone(),
                target: node.identity.clone(),
            });
        }
    }
    issues
}

fn membership_report(graph: &ObjectGraph) -> ValidationReport {
    let dependents = graph.dependents();
    let mut roots_per_node: BTreeMap<&str, usize> = BTreeMap::new();
    for root in graph.cluster_roots() {
        for member in graph.cluster_members(root, &dependents) {
            if let Some((key, _)) = graph.nodes().get_key_value(&member) {
                *roots_per_node.entry(key.as_str()).or_default() += 1;
            }
        }
    }

    let mut report = ValidationReport::default();
    for (key, node) in graph.nodes() {
        let roots = roots_per_node.get(key.as_str()).copied().unwrap_or(0);
        if roots > 1 || node.shared_with_unmoved {
            report.shared.push(node.identity.clone());
        } else if roots == 0 {
            report.orphans.push(node.identity.clone());
        }
    }
    report.orphans.sort();
    report.shared.sort();
    report
}
