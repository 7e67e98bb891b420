//! Capability interface to a management cluster
//!
//! The move engine only talks to clusters through [`ResourceAccessor`], so
//! tests can drive it against mocks or an in-memory cluster while production
//! code uses [`KubeAccessor`](crate::KubeAccessor).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

use crate::graph::ObjectIdentity;
use crate::registry::MovableKind;

/// Errors from a single accessor call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccessorError {
    /// Create hit an existing object with the same name
    #[error("{0} already exists")]
    AlreadyExists(String),

    /// The object does not exist
    #[error("{0} not found")]
    NotFound(String),

    /// The call did not finish before its deadline
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The API server rejected the request
    #[error("api error {code}: {message}")]
    Api {
        /// HTTP status code
        code: u16,
        /// Server message
        message: String,
    },

    /// Connection-level failure
    #[error("transport error: {0}")]
    Transport(String),

    /// The object could not be (de)serialized
    #[error("invalid object: {0}")]
    Invalid(String),
}

impl AccessorError {
    /// Whether another attempt may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            AccessorError::Timeout(_) | AccessorError::Transport(_) => true,
            AccessorError::Api { code, .. } => *code >= 500 || *code == 429,
            AccessorError::AlreadyExists(_)
            | AccessorError::NotFound(_)
            | AccessorError::Invalid(_) => false,
        }
    }
}

/// Typed read/create/delete/patch operations against one cluster
///
/// Objects are JSON values carrying `apiVersion`, `kind` and `metadata`.
/// Identities with an empty namespace address cluster-scoped objects.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceAccessor: Send + Sync {
    /// List objects of a kind in a namespace matching a label selector.
    /// An empty namespace lists across all namespaces (or the cluster scope
    /// for global kinds); an empty selector matches everything.
    async fn list(
        &self,
        kind: &MovableKind,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<Value>, AccessorError>;

    /// Fetch one object by identity (the UID is ignored)
    async fn get(&self, identity: &ObjectIdentity) -> Result<Value, AccessorError>;

    /// Create an object, returning it as stored (with the server-assigned UID)
    async fn create(&self, object: &Value) -> Result<Value, AccessorError>;

    /// Delete an object
    async fn delete(&self, identity: &ObjectIdentity) -> Result<(), AccessorError>;

    /// Apply a JSON merge patch
    async fn patch(&self, identity: &ObjectIdentity, patch: &Value) -> Result<(), AccessorError>;

    /// Create the namespace if it does not exist
    async fn ensure_namespace(&self, namespace: &str) -> Result<(), AccessorError>;
}

/// Runs every call of the wrapped accessor under a deadline.
///
/// An expired deadline surfaces as [`AccessorError::Timeout`], which is
/// retryable, never as success.
pub struct DeadlineAccessor {
    inner: Arc<dyn ResourceAccessor>,
    deadline: Duration,
}

impl DeadlineAccessor {
    /// Wrap an accessor
    pub fn new(inner: Arc<dyn ResourceAccessor>, deadline: Duration) -> Self {
        Self { inner, deadline }
    }

    async fn bounded<T>(
        &self,
        call: impl std::future::Future<Output = Result<T, AccessorError>>,
    ) -> Result<T, AccessorError> {
        tokio::time::timeout(self.deadline, call)
            .await
            .unwrap_or(Err(AccessorError::Timeout(self.deadline)))
    }
}

#[async_trait]
impl ResourceAccessor for DeadlineAccessor {
    async fn list(
        &self,
        kind: &MovableKind,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<Value>, AccessorError> {
        self.bounded(self.inner.list(kind, namespace, selector)).await
    }

    async fn get(&self, identity: &ObjectIdentity) -> Result<Value, AccessorError> {
        self.bounded(self.inner.get(identity)).await
    }

    async fn create(&self, object: &Value) -> Result<Value, AccessorError> {
        self.bounded(self.inner.create(object)).await
    }

    async fn delete(&self, identity: &ObjectIdentity) -> Result<(), AccessorError> {
        self.bounded(self.inner.delete(identity)).await
    }

    async fn patch(&self, identity: &ObjectIdentity, patch: &Value) -> Result<(), AccessorError> {
        self.bounded(self.inner.patch(identity, patch)).await
    }

    async fn ensure_namespace(&self, namespace: &str) -> Result<(), AccessorError> {
        self.bounded(self.inner.ensure_namespace(namespace)).await
    }
}
