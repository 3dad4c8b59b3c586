//! In-memory object store
//!
//! A versioned, insertion-ordered store with Kubernetes write semantics:
//! monotonically increasing resourceVersions, conditional updates, and
//! finalizer-aware deletion. Used for standalone mode and tests.

use async_trait::async_trait;
use chrono::Utc;
use indexmap::IndexMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{Resource, ResourceExt};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use crate::domain::ports::{ObjectKey, ObjectStore, WatchEvent};
use crate::error::{Error, Result};

/// Capacity of the watch channel before slow subscribers lag
const WATCH_CHANNEL_CAPACITY: usize = 1024;

/// In-memory store for one object kind
pub struct MemoryStore<K> {
    kind: String,
    /// Objects in creation order
    objects: RwLock<IndexMap<ObjectKey, K>>,
    /// Last issued resourceVersion
    version: AtomicU64,
    /// Counter for generated UIDs
    uid_counter: AtomicU64,
    /// Successful mutating operations
    writes: AtomicU64,
    events: broadcast::Sender<WatchEvent<K>>,
}

impl<K> MemoryStore<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    /// Create an empty store
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Arc::new(Self {
            kind: K::kind(&()).to_string(),
            objects: RwLock::new(IndexMap::new()),
            version: AtomicU64::new(0),
            uid_counter: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            events,
        })
    }

    /// Number of successful create/update/delete calls so far
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn generate_uid(&self) -> String {
        let n = self.uid_counter.fetch_add(1, Ordering::SeqCst);
        format!("{}-{:012x}", self.kind.to_lowercase(), n)
    }

    fn record_write(&self, event: WatchEvent<K>) {
        self.writes.fetch_add(1, Ordering::SeqCst);
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Reject writes whose resourceVersion does not match the stored one
    fn check_version(&self, key: &ObjectKey, stored: &K, expected: Option<&String>) -> Result<()> {
        match expected {
            Some(v) if Some(v) == stored.meta().resource_version.as_ref() => Ok(()),
            _ => {
                debug!(
                    kind = %self.kind,
                    key = %key,
                    expected = ?expected,
                    current = ?stored.meta().resource_version,
                    "Rejecting stale write"
                );
                Err(Error::conflict(&self.kind, key.to_string()))
            }
        }
    }
}

#[async_trait]
impl<K> ObjectStore<K> for MemoryStore<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &ObjectKey) -> Result<K> {
        self.objects
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::not_found(&self.kind, key.to_string()))
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Vec<K>> {
        let objects = self.objects.read();
        Ok(objects
            .iter()
            .filter(|(key, _)| namespace.is_none() || key.namespace.as_deref() == namespace)
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let key = ObjectKey::of(obj);
        if key.name.is_empty() {
            return Err(Error::Validation(format!("{} has no name", self.kind)));
        }

        let mut objects = self.objects.write();
        if objects.contains_key(&key) {
            return Err(Error::ResourceExists {
                kind: self.kind.clone(),
                name: key.to_string(),
            });
        }

        let mut created = obj.clone();
        let meta = created.meta_mut();
        // Identity is always assigned here, never taken from the caller
        meta.uid = Some(self.generate_uid());
        meta.resource_version = Some(self.next_version());
        meta.creation_timestamp = Some(Time(Utc::now()));
        meta.deletion_timestamp = None;

        objects.insert(key, created.clone());
        self.record_write(WatchEvent::Applied(created.clone()));
        Ok(created)
    }

    async fn update(&self, obj: &K) -> Result<K> {
        let key = ObjectKey::of(obj);
        let mut objects = self.objects.write();
        let stored = objects
            .get(&key)
            .ok_or_else(|| Error::not_found(&self.kind, key.to_string()))?;
        self.check_version(&key, stored, obj.meta().resource_version.as_ref())?;

        let mut updated = obj.clone();
        let stored_meta = stored.meta().clone();
        let meta = updated.meta_mut();
        // Identity and deletion marks are owned by the store
        meta.uid = stored_meta.uid;
        meta.creation_timestamp = stored_meta.creation_timestamp;
        meta.deletion_timestamp = stored_meta.deletion_timestamp;
        meta.resource_version = Some(self.next_version());

        if updated.meta().deletion_timestamp.is_some() && updated.finalizers().is_empty() {
            objects.shift_remove(&key);
            debug!(kind = %self.kind, key = %key, "Last finalizer removed, object deleted");
            self.record_write(WatchEvent::Deleted(updated.clone()));
        } else {
            objects.insert(key, updated.clone());
            self.record_write(WatchEvent::Applied(updated.clone()));
        }
        Ok(updated)
    }

    async fn delete(&self, obj: &K) -> Result<()> {
        let key = ObjectKey::of(obj);
        let mut objects = self.objects.write();
        let stored = objects
            .get_mut(&key)
            .ok_or_else(|| Error::not_found(&self.kind, key.to_string()))?;

        // Deletes without a version are unconditional, as in Kubernetes
        if obj.meta().resource_version.is_some() {
            self.check_version(&key, stored, obj.meta().resource_version.as_ref())?;
        }

        if stored.finalizers().is_empty() {
            if let Some(removed) = objects.shift_remove(&key) {
                self.record_write(WatchEvent::Deleted(removed));
            }
            return Ok(());
        }

        if stored.meta().deletion_timestamp.is_none() {
            let version = self.next_version();
            let meta = stored.meta_mut();
            meta.deletion_timestamp = Some(Time(Utc::now()));
            meta.resource_version = Some(version);
            let marked = stored.clone();
            debug!(kind = %self.kind, key = %key, "Object has finalizers, marked for deletion");
            self.record_write(WatchEvent::Applied(marked));
        }
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent<K>> {
        self.events.subscribe()
    }

    fn kind(&self) -> &str {
        &self.kind
    }
}
