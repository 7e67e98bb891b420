//! Reconciliation pause marker
//!
//! Objects are paused one by one with a merge patch. A failure on one object
//! never stops the others; the report lists every identity that failed.

use serde_json::{json, Value};
use tracing::{debug, error, info};

use keel_common::retry::{retry_with_backoff_if, RetryConfig};

use crate::accessor::{AccessorError, ResourceAccessor};
use crate::bounded::run_bounded;
use crate::error::{MoveError, NodeFailure};
use crate::graph::{is_cluster_kind, ObjectIdentity};
use crate::PAUSED_ANNOTATION;

/// Outcome of a pause or unpause pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PauseReport {
    /// Objects patched successfully
    pub succeeded: Vec<ObjectIdentity>,
    /// Objects whose patch failed after retries
    pub failed: Vec<NodeFailure>,
}

impl PauseReport {
    /// Whether every object was patched
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// Turn a partial report into [`MoveError::Pause`]
    pub fn into_result(self) -> Result<Vec<ObjectIdentity>, MoveError> {
        if self.failed.is_empty() {
            Ok(self.succeeded)
        } else {
            Err(MoveError::Pause {
                failed: self.failed,
            })
        }
    }
}

/// Merge patch setting or clearing the pause marker
fn pause_patch(identity: &ObjectIdentity, paused: bool) -> Value {
    let annotation = if paused {
        Value::String("true".to_string())
    } else {
        Value::Null
    };
    let mut annotations = serde_json::Map::new();
    annotations.insert(PAUSED_ANNOTATION.to_string(), annotation);
    let mut patch = json!({ "metadata": { "annotations": annotations } });
    if is_cluster_kind(identity) {
        patch["spec"] = json!({ "paused": paused });
    }
    patch
}

/// Set the pause marker on every object
pub async fn pause_nodes(
    accessor: &dyn ResourceAccessor,
    identities: &[ObjectIdentity],
    retry: &RetryConfig,
    concurrency: usize,
) -> PauseReport {
    set_paused(accessor, identities, retry, concurrency, true).await
}

/// Clear the pause marker on every object. Objects that no longer exist count
/// as unpaused.
pub async fn unpause_nodes(
    accessor: &dyn ResourceAccessor,
    identities: &[ObjectIdentity],
    retry: &RetryConfig,
    concurrency: usize,
) -> PauseReport {
    set_paused(accessor, identities, retry, concurrency, false).await
}

async fn set_paused(
    accessor: &dyn ResourceAccessor,
    identities: &[ObjectIdentity],
    retry: &RetryConfig,
    concurrency: usize,
    paused: bool,
) -> PauseReport {
    let action = if paused { "pause" } else { "unpause" };

    let results = run_bounded(
        concurrency,
        identities.iter().map(|identity| async move {
            let patch = pause_patch(identity, paused);
            let op_name = format!("{} {}", action, identity.display());
            let result = retry_with_backoff_if(
                retry,
                &op_name,
                AccessorError::is_retryable,
                || accessor.patch(identity, &patch),
            )
            .await;
            match result {
                Err(AccessorError::NotFound(_)) if !paused => Ok(()),
                other => other,
            }
        }),
    )
    .await;

    let mut report = PauseReport::default();
    for (identity, result) in identities.iter().zip(results) {
        match result {
            Ok(()) => {
                debug!(object = %identity.display(), action, "Patched pause marker");
                report.succeeded.push(identity.clone());
            }
            Err(e) => {
                error!(object = %identity.display(), action, error = %e, "Failed to patch pause marker");
                report.failed.push(NodeFailure::new(identity, e.to_string()));
            }
        }
    }

    info!(
        action,
        succeeded = report.succeeded.len(),
        failed = report.failed.len(),
        "Pause pass finished"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accessor::MockResourceAccessor;
    use std::time::Duration;

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            backoff_multiplier: 1.0,
        }
    }

    fn cluster(name: &str) -> ObjectIdentity {
        ObjectIdentity::new("cluster.x-k8s.io/v1beta1", "Cluster", "default", name, name)
    }

    fn machine(name: &str) -> ObjectIdentity {
        ObjectIdentity::new("cluster.x-k8s.io/v1beta1", "Machine", "default", name, name)
    }

    #[test]
    fn test_cluster_patch_sets_spec_paused() {
        let patch = pause_patch(&cluster("prod"), true);
        assert_eq!(patch["metadata"]["annotations"][PAUSED_ANNOTATION], "true");
        assert_eq!(patch["spec"]["paused"], true);

        let patch = pause_patch(&machine("m"), true);
        assert!(patch.get("spec").is_none());

        let patch = pause_patch(&cluster("prod"), false);
        assert!(patch["metadata"]["annotations"][PAUSED_ANNOTATION].is_null());
        assert_eq!(patch["spec"]["paused"], false);
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_other_nodes() {
        let mut accessor = MockResourceAccessor::new();
        accessor.expect_patch().returning(|id, _| {
            if id.name == "bad" {
                Err(AccessorError::Api {
                    code: 403,
                    message: "forbidden".to_string(),
                })
            } else {
                Ok(())
            }
        });

        let ids = vec![machine("a"), machine("bad"), machine("c")];
        let report = pause_nodes(&accessor, &ids, &fast_retry(), 2).await;

        assert_eq!(report.succeeded.len(), 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].identity.name, "bad");
        assert!(matches!(
            report.into_result(),
            Err(MoveError::Pause { failed }) if failed.len() == 1
        ));
    }

    #[tokio::test]
    async fn test_transient_patch_failure_is_retried() {
        let mut accessor = MockResourceAccessor::new();
        let mut seq = mockall::Sequence::new();
        accessor
            .expect_patch()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(AccessorError::Timeout(Duration::from_secs(1))));
        accessor
            .expect_patch()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));

        let report = pause_nodes(&accessor, &[cluster("prod")], &fast_retry(), 1).await;
        assert!(report.is_complete());
    }

    #[tokio::test]
    async fn test_unpause_tolerates_missing_objects() {
        let mut accessor = MockResourceAccessor::new();
        accessor
            .expect_patch()
            .returning(|id, _| Err(AccessorError::NotFound(id.display())));

        let report = unpause_nodes(&accessor, &[machine("gone")], &fast_retry(), 1).await;
        assert!(report.is_complete());
        assert_eq!(report.succeeded.len(), 1);
    }
}
