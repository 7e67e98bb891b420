//! Error types for move operations
//!
//! Structural errors (`Discovery`, `Graph`) happen before any mutation and are
//! safe to retry from scratch. Execution errors (`Pause`, `Relocation`) leave
//! an inspectable intermediate state and always name the identities involved.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::coordinator::MovePhase;
use crate::graph::ObjectIdentity;

/// A structural problem found in the object graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum GraphIssue {
    /// Owner edges form a cycle through these objects
    Cycle {
        /// Objects on the cycle, in traversal order
        members: Vec<ObjectIdentity>,
    },
    /// A reference points at an object that was never discovered
    UnresolvedReference {
        /// Object holding the reference
        referrer: ObjectIdentity,
        /// Field (or `metadata.ownerReferences`) holding it
        field: String,
        /// What the reference points at
        target: ObjectIdentity,
    },
}

impl fmt::Display for GraphIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphIssue::Cycle { members } => {
                let names: Vec<String> = members.iter().map(|m| m.display()).collect();
                write!(f, "ownership cycle: {}", names.join(" -> "))
            }
            GraphIssue::UnresolvedReference {
                referrer,
                field,
                target,
            } => write!(
                f,
                "{} references missing {} via {}",
                referrer.display(),
                target.display(),
                field
            ),
        }
    }
}

/// Per-object failure after retries were exhausted
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeFailure {
    /// The object that failed
    pub identity: ObjectIdentity,
    /// Last error observed
    pub message: String,
}

impl NodeFailure {
    pub(crate) fn new(identity: &ObjectIdentity, message: impl Into<String>) -> Self {
        Self {
            identity: identity.clone(),
            message: message.into(),
        }
    }
}

/// Which relocation step failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RelocationOp {
    /// Creating copies on the target
    Create,
    /// Deleting originals from the source
    Delete,
}

impl fmt::Display for RelocationOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelocationOp::Create => f.write_str("create"),
            RelocationOp::Delete => f.write_str("delete"),
        }
    }
}

/// Errors from move operations
#[derive(Debug, Error)]
pub enum MoveError {
    /// Listing or fetching objects on the source failed
    #[error("discovery failed: {0}")]
    Discovery(String),

    /// The object graph violates a structural invariant
    #[error("invalid object graph: {}", join_issues(.0))]
    Graph(Vec<GraphIssue>),

    /// Some objects could not be paused or unpaused
    #[error("pause operation failed for {} object(s): {}", .failed.len(), join_failures(.failed))]
    Pause {
        /// Objects whose patch failed
        failed: Vec<NodeFailure>,
    },

    /// Creating or deleting objects failed after retries
    #[error("{op} failed for {} object(s): {}", .failed.len(), join_failures(.failed))]
    Relocation {
        /// Create or delete
        op: RelocationOp,
        /// Objects whose operation failed
        failed: Vec<NodeFailure>,
        /// Objects not yet handled by this operation (includes `failed`)
        remaining: Vec<ObjectIdentity>,
    },

    /// Move was cancelled by the operator
    #[error("move was cancelled")]
    Cancelled,

    /// Invalid configuration or client setup
    #[error(transparent)]
    Config(#[from] keel_common::Error),

    /// A run stopped before completion
    #[error("move aborted during {stage} ({} object(s) migrated): {cause}", .migrated.len())]
    Aborted {
        /// Phase the run was in when it failed
        stage: MovePhase,
        /// Objects with a confirmed copy on the target
        migrated: Vec<ObjectIdentity>,
        /// Objects already deleted from the source
        deleted: Vec<ObjectIdentity>,
        /// What went wrong
        #[source]
        cause: Box<MoveError>,
    },
}

fn join_issues(issues: &[GraphIssue]) -> String {
    issues
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

fn join_failures(failed: &[NodeFailure]) -> String {
    failed
        .iter()
        .map(|f| format!("{}: {}", f.identity.display(), f.message))
        .collect::<Vec<_>>()
        .join("; ")
}

impl MoveError {
    /// The underlying cause, looking through `Aborted`
    pub fn cause(&self) -> &MoveError {
        match self {
            MoveError::Aborted { cause, .. } => cause.cause(),
            other => other,
        }
    }

    /// Phase the run stopped in, if this came out of the coordinator
    pub fn stage(&self) -> Option<MovePhase> {
        match self {
            MoveError::Aborted { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Objects that have a confirmed copy on the target
    pub fn migrated(&self) -> &[ObjectIdentity] {
        match self {
            MoveError::Aborted { migrated, .. } => migrated,
            _ => &[],
        }
    }

    /// True for failures detected before any mutation happened
    pub fn is_structural(&self) -> bool {
        matches!(self.cause(), MoveError::Discovery(_) | MoveError::Graph(_))
    }

    /// Process exit code for the CLI
    pub fn exit_code(&self) -> u8 {
        match self.cause() {
            MoveError::Discovery(_) | MoveError::Graph(_) => 2,
            MoveError::Pause { .. } | MoveError::Relocation { .. } => 3,
            MoveError::Cancelled => 130,
            MoveError::Config(_) | MoveError::Aborted { .. } => 1,
        }
    }
}
