//! Wave ordering for the move
//!
//! Objects are grouped into waves: every owner and soft reference of an object
//! sits in an earlier wave, so a wave can be created in parallel once the
//! previous one is on the target. Deletion walks the waves backwards.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use serde::Serialize;
use tracing::{debug, info};

use crate::error::{GraphIssue, MoveError};
use crate::graph::{GraphNode, ObjectGraph, ObjectIdentity};

/// A group of objects that can be created in parallel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Wave {
    /// Position in the plan, starting at 0
    pub index: usize,
    /// Objects in this wave, sorted by identity
    pub nodes: Vec<ObjectIdentity>,
    #[serde(skip)]
    keys: Vec<String>,
}

impl Wave {
    /// Graph keys of the objects in this wave
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// Number of objects in the wave
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the wave is empty
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Resolve the wave's nodes in a graph
    pub(crate) fn graph_nodes<'a>(&self, graph: &'a ObjectGraph) -> Vec<&'a GraphNode> {
        self.keys.iter().filter_map(|key| graph.get(key)).collect()
    }
}

/// Ordered, immutable sequence of waves
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MovePlan {
    waves: Vec<Wave>,
}

impl MovePlan {
    /// Plan with nothing to move
    pub fn empty() -> Self {
        Self::default()
    }

    /// Compute waves from an object graph with Kahn's algorithm.
    ///
    /// Dependencies are owner and soft-reference edges between nodes of the
    /// graph. If some nodes can never become ready the graph has a cycle; the
    /// error names the nodes that sit on (or between) the cycles.
    pub fn from_graph(graph: &ObjectGraph) -> Result<Self, MoveError> {
        let mut deps: HashMap<&str, Vec<&str>> = HashMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        let mut unmet: BTreeMap<&str, usize> = BTreeMap::new();

        for (key, node) in graph.nodes() {
            let node_deps: Vec<&str> = node
                .dependencies()
                .into_iter()
                .filter(|dep| graph.contains(dep))
                .collect();
            for dep in &node_deps {
                dependents.entry(*dep).or_default().push(key.as_str());
            }
            unmet.insert(key.as_str(), node_deps.len());
            deps.insert(key.as_str(), node_deps);
        }

        let mut ready: Vec<&str> = unmet
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(key, _)| *key)
            .collect();
        let mut waves = Vec::new();

        while !ready.is_empty() {
            sort_by_identity(graph, &mut ready);

            let mut next = Vec::new();
            for key in &ready {
                for dependent in dependents.get(key).into_iter().flatten() {
                    if let Some(count) = unmet.get_mut(dependent) {
                        *count -= 1;
                        if *count == 0 {
                            next.push(*dependent);
                        }
                    }
                }
                unmet.remove(key);
            }

            debug!(wave = waves.len(), objects = ready.len(), "Computed move wave");
            waves.push(Wave {
                index: waves.len(),
                nodes: ready
                    .iter()
                    .filter_map(|key| graph.get(key))
                    .map(|n| n.identity.clone())
                    .collect(),
                keys: ready.iter().map(|key| key.to_string()).collect(),
            });
            ready = next;
        }

        if !unmet.is_empty() {
            let members = cycle_members(&unmet, &deps)
                .into_iter()
                .filter_map(|key| graph.get(key))
                .map(|n| n.identity.clone())
                .collect();
            return Err(MoveError::Graph(vec![GraphIssue::Cycle { members }]));
        }

        let plan = Self { waves };
        info!(
            waves = plan.num_waves(),
            objects = plan.total_objects(),
            "Computed move plan"
        );
        Ok(plan)
    }

    /// Waves in creation order
    pub fn waves(&self) -> &[Wave] {
        &self.waves
    }

    /// Iterate over waves in creation order
    pub fn iter(&self) -> impl Iterator<Item = &Wave> {
        self.waves.iter()
    }

    /// Total number of objects across waves
    pub fn total_objects(&self) -> usize {
        self.waves.iter().map(Wave::len).sum()
    }

    /// Number of waves
    pub fn num_waves(&self) -> usize {
        self.waves.len()
    }

    /// Whether the plan moves nothing
    pub fn is_empty(&self) -> bool {
        self.waves.is_empty()
    }

    /// Every graph key in creation order
    pub fn all_uids_in_order(&self) -> Vec<String> {
        self.waves
            .iter()
            .flat_map(|w| w.keys.iter().cloned())
            .collect()
    }
}

impl fmt::Display for MovePlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} object(s) in {} wave(s)",
            self.total_objects(),
            self.num_waves()
        )?;
        for wave in &self.waves {
            writeln!(f, "wave {}:", wave.index)?;
            for id in &wave.nodes {
                writeln!(f, "  {} ({})", id.display(), id.api_version)?;
            }
        }
        Ok(())
    }
}

fn sort_by_identity(graph: &ObjectGraph, keys: &mut [&str]) {
    keys.sort_by(|a, b| {
        let ia = graph.get(a).map(|n| &n.identity);
        let ib = graph.get(b).map(|n| &n.identity);
        ia.cmp(&ib).then_with(|| a.cmp(b))
    });
}

/// Drop stuck nodes that nothing else stuck depends on until only the
/// nodes on cycles (and between them) are left.
fn cycle_members<'a>(
    stuck: &BTreeMap<&'a str, usize>,
    deps: &HashMap<&'a str, Vec<&'a str>>,
) -> Vec<&'a str> {
    let mut remaining: BTreeSet<&str> = stuck.keys().copied().collect();
    loop {
        let leaves: Vec<&str> = remaining
            .iter()
            .copied()
            .filter(|key| {
                !remaining
                    .iter()
                    .any(|other| deps.get(other).is_some_and(|d| d.contains(key)))
            })
            .collect();
        if leaves.is_empty() {
            return remaining.into_iter().collect();
        }
        for leaf in leaves {
            remaining.remove(leaf);
        }
    }
}
