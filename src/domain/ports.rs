//! Domain Ports - Core trait definitions for the claim operator
//!
//! The reconciler never talks to Kubernetes directly. It reads and writes
//! through [`ObjectStore`], which any versioned declarative store can
//! implement (the in-memory store for standalone mode, `kube::Api` in a
//! cluster).

use crate::crd::{BlockDevice, BlockDeviceClaim};
use crate::error::Result;
use async_trait::async_trait;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

// =============================================================================
// Object Keys
// =============================================================================

/// Namespaced name of a stored object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<String>, name: impl Into<String>) -> Self {
        Self {
            namespace,
            name: name.into(),
        }
    }

    /// Key in the given namespace
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Key of an existing object
    pub fn of<K: kube::Resource>(obj: &K) -> Self {
        Self::new(obj.namespace(), obj.name_any())
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

// =============================================================================
// Watch Events
// =============================================================================

/// Change notification delivered by a store
#[derive(Debug, Clone)]
pub enum WatchEvent<K> {
    /// Object created or modified
    Applied(K),
    /// Object removed from the store
    Deleted(K),
    /// Watch restarted; consumers should re-list
    Resync,
}

// =============================================================================
// Object Store Port
// =============================================================================

/// Port for a versioned declarative object store.
///
/// Every mutating call is conditioned on `metadata.resourceVersion` of the
/// object passed in; a stale version fails with `Error::Conflict` and never
/// blocks.
#[async_trait]
pub trait ObjectStore<K>: Send + Sync
where
    K: Send + Sync + 'static,
{
    /// Fetch one object, `Error::ResourceNotFound` if absent
    async fn get(&self, key: &ObjectKey) -> Result<K>;

    /// List objects, optionally restricted to one namespace, in store order
    async fn list(&self, namespace: Option<&str>) -> Result<Vec<K>>;

    /// Create a new object, `Error::ResourceExists` if the name is taken
    async fn create(&self, obj: &K) -> Result<K>;

    /// Replace an object, conditioned on its resourceVersion
    async fn update(&self, obj: &K) -> Result<K>;

    /// Delete an object. With finalizers present the object is only
    /// marked for deletion.
    async fn delete(&self, obj: &K) -> Result<()>;

    /// Subscribe to change notifications
    fn watch(&self) -> broadcast::Receiver<WatchEvent<K>>;

    /// Kind name used in errors and logs
    fn kind(&self) -> &str;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type ClaimStoreRef = Arc<dyn ObjectStore<BlockDeviceClaim>>;
pub type DeviceStoreRef = Arc<dyn ObjectStore<BlockDevice>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_key_display() {
        assert_eq!(ObjectKey::namespaced("default", "bdc-1").to_string(), "default/bdc-1");
        assert_eq!(ObjectKey::new(None, "bd-1").to_string(), "bd-1");
    }

    #[test]
    fn test_object_key_of_resource() {
        let mut claim = BlockDeviceClaim::new("bdc-1", Default::default());
        claim.metadata.namespace = Some("storage".into());
        assert_eq!(ObjectKey::of(&claim), ObjectKey::namespaced("storage", "bdc-1"));
    }
}
