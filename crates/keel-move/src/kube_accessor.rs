//! [`ResourceAccessor`] backed by a kube client

use std::collections::HashMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::discovery::ApiResource;
use kube::Client;
use serde_json::Value;
use tracing::{debug, info};

use keel_common::kube_utils::{api_group, build_api_resource};

use crate::accessor::{AccessorError, ResourceAccessor};
use crate::graph::ObjectIdentity;
use crate::registry::{MovableKind, MovableKindRegistry};

/// Talks to one cluster through `Api<DynamicObject>`
#[derive(Clone)]
pub struct KubeAccessor {
    client: Client,
    /// Plural names known from CRDs, keyed by (group, kind)
    plurals: HashMap<(String, String), String>,
}

impl KubeAccessor {
    /// Wrap a client
    pub fn new(client: Client) -> Self {
        Self {
            client,
            plurals: HashMap::new(),
        }
    }

    /// Use the registry's plural names instead of guessing them from the kind
    pub fn with_registry(mut self, registry: &MovableKindRegistry) -> Self {
        self.plurals.extend(registry.kinds().iter().map(|k| {
            ((k.group().to_string(), k.kind.clone()), k.plural.clone())
        }));
        self
    }

    fn api_resource(&self, api_version: &str, kind: &str) -> ApiResource {
        let mut ar = build_api_resource(api_version, kind);
        if let Some(plural) = self
            .plurals
            .get(&(api_group(api_version).to_string(), kind.to_string()))
        {
            ar.plural = plural.clone();
        }
        ar
    }

    fn api(&self, ar: &ApiResource, namespace: &str) -> Api<DynamicObject> {
        if namespace.is_empty() {
            Api::all_with(self.client.clone(), ar)
        } else {
            Api::namespaced_with(self.client.clone(), namespace, ar)
        }
    }

    fn api_for(&self, identity: &ObjectIdentity) -> Api<DynamicObject> {
        let ar = self.api_resource(&identity.api_version, &identity.kind);
        self.api(&ar, &identity.namespace)
    }
}

/// Serialize a DynamicObject, filling in apiVersion/kind that list responses omit
fn to_value(object: &DynamicObject, ar: &ApiResource) -> Result<Value, AccessorError> {
    let mut value =
        serde_json::to_value(object).map_err(|e| AccessorError::Invalid(e.to_string()))?;
    if let Some(map) = value.as_object_mut() {
        map.entry("apiVersion")
            .or_insert_with(|| Value::String(ar.api_version.clone()));
        map.entry("kind")
            .or_insert_with(|| Value::String(ar.kind.clone()));
    }
    Ok(value)
}

fn map_kube_error(err: kube::Error, what: &str) -> AccessorError {
    match err {
        kube::Error::Api(e) if e.code == 404 => AccessorError::NotFound(what.to_string()),
        kube::Error::Api(e) => AccessorError::Api {
            code: e.code,
            message: e.message,
        },
        kube::Error::SerdeError(e) => AccessorError::Invalid(e.to_string()),
        other => AccessorError::Transport(other.to_string()),
    }
}

fn map_create_error(err: kube::Error, what: &str) -> AccessorError {
    match err {
        kube::Error::Api(e) if e.code == 409 => AccessorError::AlreadyExists(what.to_string()),
        other => map_kube_error(other, what),
    }
}

#[async_trait]
impl ResourceAccessor for KubeAccessor {
    async fn list(
        &self,
        kind: &MovableKind,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<Value>, AccessorError> {
        let ar = kind.api_resource();
        let api = self.api(&ar, namespace);
        let mut params = ListParams::default();
        if !selector.is_empty() {
            params = params.labels(selector);
        }

        let list = api
            .list(&params)
            .await
            .map_err(|e| map_kube_error(e, &kind.kind))?;
        list.items.iter().map(|o| to_value(o, &ar)).collect()
    }

    async fn get(&self, identity: &ObjectIdentity) -> Result<Value, AccessorError> {
        let ar = self.api_resource(&identity.api_version, &identity.kind);
        let object = self
            .api(&ar, &identity.namespace)
            .get(&identity.name)
            .await
            .map_err(|e| map_kube_error(e, &identity.display()))?;
        to_value(&object, &ar)
    }

    async fn create(&self, object: &Value) -> Result<Value, AccessorError> {
        let identity = ObjectIdentity::from_object(object).ok_or_else(|| {
            AccessorError::Invalid("object is missing apiVersion, kind or name".to_string())
        })?;
        let ar = self.api_resource(&identity.api_version, &identity.kind);
        let dyn_obj: DynamicObject = serde_json::from_value(object.clone())
            .map_err(|e| AccessorError::Invalid(format!("failed to convert to DynamicObject: {}", e)))?;

        let created = self
            .api(&ar, &identity.namespace)
            .create(&PostParams::default(), &dyn_obj)
            .await
            .map_err(|e| map_create_error(e, &identity.display()))?;
        to_value(&created, &ar)
    }

    async fn delete(&self, identity: &ObjectIdentity) -> Result<(), AccessorError> {
        self.api_for(identity)
            .delete(&identity.name, &DeleteParams::default())
            .await
            .map_err(|e| map_kube_error(e, &identity.display()))?;
        Ok(())
    }

    async fn patch(&self, identity: &ObjectIdentity, patch: &Value) -> Result<(), AccessorError> {
        self.api_for(identity)
            .patch(&identity.name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| map_kube_error(e, &identity.display()))?;
        Ok(())
    }

    async fn ensure_namespace(&self, namespace: &str) -> Result<(), AccessorError> {
        let ns_api: Api<Namespace> = Api::all(self.client.clone());
        let what = format!("Namespace/{}", namespace);

        match ns_api.get(namespace).await {
            Ok(_) => {
                debug!(namespace = %namespace, "Namespace already exists");
                return Ok(());
            }
            Err(kube::Error::Api(e)) if e.code == 404 => {}
            Err(e) => return Err(map_kube_error(e, &what)),
        }

        let ns = Namespace {
            metadata: kube::core::ObjectMeta {
                name: Some(namespace.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        match ns_api.create(&PostParams::default(), &ns).await {
            Ok(_) => {
                info!(namespace = %namespace, "Created namespace");
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(()),
            Err(e) => Err(map_kube_error(e, &what)),
        }
    }
}
