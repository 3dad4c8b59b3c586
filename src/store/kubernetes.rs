//! Kubernetes-backed object store
//!
//! Adapts `kube::Api<K>` to the [`ObjectStore`] port. Writes carry the
//! observed resourceVersion so the API server enforces optimistic
//! concurrency; a 409 surfaces as `Error::Conflict`.

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams, Preconditions};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::domain::ports::{ObjectKey, ObjectStore, WatchEvent};
use crate::error::{Error, Result};

const WATCH_CHANNEL_CAPACITY: usize = 1024;

/// Object store over the Kubernetes API server
pub struct KubeStore<K> {
    client: Client,
    /// Restrict list/watch to one namespace
    namespace: Option<String>,
    kind: String,
    events: broadcast::Sender<WatchEvent<K>>,
}

impl<K> KubeStore<K>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + DeserializeOwned
        + Serialize
        + Send
        + Sync
        + 'static,
{
    /// Create the store and start forwarding watch events
    pub fn new(client: Client, namespace: Option<String>) -> Arc<Self> {
        let (events, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        let store = Arc::new(Self {
            client,
            namespace,
            kind: K::kind(&()).to_string(),
            events,
        });
        store.spawn_watcher();
        store
    }

    fn api(&self, namespace: Option<&str>) -> Api<K> {
        match namespace.or(self.namespace.as_deref()) {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    fn spawn_watcher(&self) {
        let api = self.api(None);
        let events = self.events.clone();
        let kind = self.kind.clone();

        tokio::spawn(async move {
            info!(kind = %kind, "Starting watch");
            let mut stream = watcher(api, watcher::Config::default())
                .default_backoff()
                .boxed();

            while let Some(item) = stream.next().await {
                let event = match item {
                    Ok(watcher::Event::Applied(obj)) => WatchEvent::Applied(obj),
                    Ok(watcher::Event::Deleted(obj)) => WatchEvent::Deleted(obj),
                    Ok(watcher::Event::Restarted(_)) => WatchEvent::Resync,
                    Err(e) => {
                        warn!(kind = %kind, error = %e, "Watch error");
                        continue;
                    }
                };
                // No subscribers is fine
                let _ = events.send(event);
            }
            warn!(kind = %kind, "Watch stream ended");
        });
    }

    fn map_err(&self, name: &str, err: kube::Error) -> Error {
        map_kube_error(&self.kind, name, err)
    }
}

/// Translate API server responses into store errors
fn map_kube_error(kind: &str, name: &str, err: kube::Error) -> Error {
    match err {
        kube::Error::Api(resp) if resp.code == 404 => Error::not_found(kind, name),
        kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
            Error::ResourceExists {
                kind: kind.to_string(),
                name: name.to_string(),
            }
        }
        kube::Error::Api(resp) if resp.code == 409 => Error::conflict(kind, name),
        kube::Error::Api(resp) if resp.code >= 500 => {
            Error::StoreUnavailable(format!("{} ({}): {}", resp.reason, resp.code, resp.message))
        }
        kube::Error::HyperError(e) => Error::StoreUnavailable(e.to_string()),
        kube::Error::Service(e) => Error::StoreUnavailable(e.to_string()),
        other => Error::Kube(other),
    }
}

/// A deleting object whose last finalizer is gone no longer exists on the server
fn deletion_completed(meta: &ObjectMeta) -> bool {
    meta.deletion_timestamp.is_some() && meta.finalizers.as_ref().map_or(true, |f| f.is_empty())
}

#[async_trait]
impl<K> ObjectStore<K> for KubeStore<K>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + DeserializeOwned
        + Serialize
        + Send
        + Sync
        + 'static,
{
    async fn get(&self, key: &ObjectKey) -> Result<K> {
        self.api(key.namespace.as_deref())
            .get(&key.name)
            .await
            .map_err(|e| self.map_err(&key.name, e))
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Vec<K>> {
        let list = self
            .api(namespace)
            .list(&ListParams::default())
            .await
            .map_err(|e| self.map_err("", e))?;
        Ok(list.items)
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let name = obj.name_any();
        self.api(obj.meta().namespace.as_deref())
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| self.map_err(&name, e))
    }

    async fn update(&self, obj: &K) -> Result<K> {
        let name = obj.name_any();
        if obj.meta().resource_version.is_none() {
            return Err(Error::conflict(&self.kind, name));
        }
        let api = self.api(obj.meta().namespace.as_deref());

        let replaced = api
            .replace(&name, &PostParams::default(), obj)
            .await
            .map_err(|e| self.map_err(&name, e))?;
        if deletion_completed(replaced.meta()) {
            debug!(kind = %self.kind, name = %name, "Last finalizer removed, skipping status");
            return Ok(replaced);
        }

        // Status lives behind its own subresource
        let value = serde_json::to_value(obj)?;
        let Some(status) = value.get("status").filter(|s| !s.is_null()) else {
            return Ok(replaced);
        };
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": replaced.meta().resource_version },
            "status": status,
        });
        debug!(kind = %self.kind, name = %name, "Patching status");
        api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| self.map_err(&name, e))
    }

    async fn delete(&self, obj: &K) -> Result<()> {
        let name = obj.name_any();
        let params = DeleteParams {
            preconditions: obj.meta().resource_version.as_ref().map(|rv| Preconditions {
                resource_version: Some(rv.clone()),
                uid: None,
            }),
            ..DeleteParams::default()
        };
        self.api(obj.meta().namespace.as_deref())
            .delete(&name, &params)
            .await
            .map_err(|e| self.map_err(&name, e))?;
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent<K>> {
        self.events.subscribe()
    }

    fn kind(&self) -> &str {
        &self.kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::error::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: format!("{} test", reason),
            reason: reason.into(),
            code,
        })
    }

    #[test]
    fn test_map_api_errors() {
        assert_matches!(
            map_kube_error("BlockDevice", "bd-1", api_error(404, "NotFound")),
            Error::ResourceNotFound { .. }
        );
        assert_matches!(
            map_kube_error("BlockDevice", "bd-1", api_error(409, "AlreadyExists")),
            Error::ResourceExists { .. }
        );
        assert_matches!(
            map_kube_error("BlockDevice", "bd-1", api_error(409, "Conflict")),
            Error::Conflict { .. }
        );
        assert_matches!(
            map_kube_error("BlockDevice", "bd-1", api_error(503, "ServiceUnavailable")),
            Error::StoreUnavailable(_)
        );
        assert_matches!(
            map_kube_error("BlockDevice", "bd-1", api_error(422, "Invalid")),
            Error::Kube(_)
        );
    }

    #[test]
    fn test_transport_failure_is_unavailable() {
        let err = map_kube_error(
            "BlockDeviceClaim",
            "bdc-1",
            kube::Error::Service("connection refused".into()),
        );
        assert_matches!(err, Error::StoreUnavailable(ref msg) if msg.contains("connection refused"));
        assert!(err.is_transient());
    }

    #[test]
    fn test_deletion_completed() {
        let mut meta = ObjectMeta::default();
        assert!(!deletion_completed(&meta));

        meta.deletion_timestamp = Some(Time(chrono::Utc::now()));
        meta.finalizers = Some(vec![crate::crd::CLAIM_FINALIZER.to_string()]);
        assert!(!deletion_completed(&meta));

        meta.finalizers = Some(Vec::new());
        assert!(deletion_completed(&meta));
        meta.finalizers = None;
        assert!(deletion_completed(&meta));
    }
}
