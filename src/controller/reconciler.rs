//! Claim reconciler
//!
//! Level-triggered reconciliation of a single BlockDeviceClaim. Every call
//! re-reads the claim and the device pool and drives one step towards the
//! desired state:
//!
//! | Observation                  | Action                               | Requeue    |
//! |------------------------------|--------------------------------------|------------|
//! | claim missing                | none                                 | no         |
//! | reconcile disabled           | none                                 | no         |
//! | deletion requested           | release devices, drop finalizer      | no         |
//! | requirements invalid         | delete the claim                     | no         |
//! | not bound, device available  | bind                                 | immediate  |
//! | not bound, nothing available | Empty -> Pending                     | after wait |
//! | Done and consistent          | none (zero writes)                   | no         |
//! | Done but inconsistent        | reset to Pending, select again       | immediate  |
//!
//! Conflicts and vanished objects are absorbed into an immediate requeue.

use kube::ResourceExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::binding::BindingExecutor;
use super::metrics::{outcome, ControllerMetrics};
use super::release::{devices_bound_to, ReleaseHandler};
use super::selection::{select_device, SelectionCriteria};
use super::validation::validate;
use crate::crd::{BlockDeviceClaim, ClaimPhase, ClaimState};
use crate::domain::ports::{ClaimStoreRef, DeviceStoreRef, ObjectKey};
use crate::error::{Error, Result};

// =============================================================================
// Configuration & Outcome
// =============================================================================

/// Reconciler configuration
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Wait before re-checking a claim no device could satisfy
    pub retry_interval: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(10),
        }
    }
}

/// Requeue directive returned for a reconciled claim
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Reconcile again right away
    pub requeue: bool,
    /// Reconcile again after this delay
    pub requeue_after: Option<Duration>,
}

impl ReconcileOutcome {
    /// Nothing left to do until the claim changes
    pub fn done() -> Self {
        Self::default()
    }

    pub fn requeue_now() -> Self {
        Self {
            requeue: true,
            requeue_after: None,
        }
    }

    pub fn requeue_after(delay: Duration) -> Self {
        Self {
            requeue: false,
            requeue_after: Some(delay),
        }
    }

    /// Whether the dispatcher may forget the key
    pub fn is_settled(&self) -> bool {
        !self.requeue && self.requeue_after.is_none()
    }
}

// =============================================================================
// Reconciler
// =============================================================================

/// Drives BlockDeviceClaims towards a consistent binding
pub struct Reconciler {
    claims: ClaimStoreRef,
    devices: DeviceStoreRef,
    binder: BindingExecutor,
    releaser: ReleaseHandler,
    config: ReconcilerConfig,
    metrics: Arc<ControllerMetrics>,
}

impl Reconciler {
    pub fn new(
        claims: ClaimStoreRef,
        devices: DeviceStoreRef,
        config: ReconcilerConfig,
        metrics: Arc<ControllerMetrics>,
    ) -> Self {
        Self {
            binder: BindingExecutor::new(claims.clone(), devices.clone()),
            releaser: ReleaseHandler::new(devices.clone()),
            claims,
            devices,
            config,
            metrics,
        }
    }

    pub fn claims(&self) -> &ClaimStoreRef {
        &self.claims
    }

    pub fn devices(&self) -> &DeviceStoreRef {
        &self.devices
    }

    /// Reconcile the claim stored under `key`.
    ///
    /// Conflicts and not-found errors become an immediate requeue; every
    /// other error is returned for the dispatcher to handle.
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileOutcome> {
        let started = Instant::now();

        let result = match self.reconcile_claim(key).await {
            Err(e) if e.is_absorbed() => {
                if matches!(e, Error::Conflict { .. }) {
                    self.metrics.record_conflict();
                }
                debug!(claim = %key, reason = %e, "Requeueing after stale read");
                Ok(ReconcileOutcome::requeue_now())
            }
            other => other,
        };

        let label = match &result {
            Ok(o) if o.is_settled() => outcome::SETTLED,
            Ok(_) => outcome::REQUEUE,
            Err(_) => outcome::ERROR,
        };
        self.metrics
            .record_reconcile(label, started.elapsed().as_secs_f64());

        result
    }

    async fn reconcile_claim(&self, key: &ObjectKey) -> Result<ReconcileOutcome> {
        let mut claim = match self.claims.get(key).await {
            Ok(claim) => claim,
            Err(Error::ResourceNotFound { .. }) => {
                debug!(claim = %key, "Claim no longer exists");
                return Ok(ReconcileOutcome::done());
            }
            Err(e) => return Err(e),
        };

        if claim.is_reconcile_disabled() {
            debug!(claim = %key, "Reconciliation disabled by annotation");
            return Ok(ReconcileOutcome::done());
        }

        if claim.is_deleting() {
            return self.finalize(&claim).await;
        }

        let requirements = match validate(&claim) {
            Ok(_) if claim.phase() == ClaimPhase::Invalid => {
                return self.delete_invalid(&claim, "claim is marked Invalid").await;
            }
            Ok(r) => r,
            Err(Error::InvalidRequirement { reason, .. }) => {
                return self.delete_invalid(&claim, &reason).await;
            }
            Err(e) => return Err(e),
        };

        // The finalizer must be in place before any device can point here
        if !claim.has_finalizer() {
            claim.add_finalizer();
            claim = self.claims.update(&claim).await?;
        }

        let claim_uid = claim.uid().unwrap_or_default();
        let devices = self.devices.list(claim.namespace().as_deref()).await?;
        let bound = devices_bound_to(&devices, &claim_uid);

        let recorded = claim
            .bound_device_name()
            .and_then(|name| bound.iter().find(|d| d.name_any() == name))
            .filter(|d| d.claim_state() == ClaimState::Claimed);

        if bound.len() > 1 {
            let names: Vec<String> = bound.iter().map(|d| d.name_any()).collect();
            error!(
                claim = %key,
                devices = ?names,
                "Claim is referenced by more than one BlockDevice"
            );
            self.metrics.record_invariant_violation();
            if claim.phase() == ClaimPhase::Done && recorded.is_some() {
                return Ok(ReconcileOutcome::done());
            }
            return Err(Error::InvariantViolation(format!(
                "claim {} referenced by devices {:?}",
                key, names
            )));
        }

        if claim.phase() == ClaimPhase::Done {
            if recorded.is_some() {
                return Ok(ReconcileOutcome::done());
            }
            warn!(
                claim = %key,
                device = ?claim.bound_device_name(),
                "Bound device missing or no longer claimed, selecting again"
            );
            claim.set_phase(ClaimPhase::Pending);
            if let Some(status) = claim.status.as_mut() {
                status.block_device_name = None;
            }
            claim = self.claims.update(&claim).await?;
        }

        // A device written by an earlier, interrupted bind
        if let Some(device) = bound.first() {
            info!(claim = %key, device = %device.name_any(), "Adopting device already referencing claim");
            self.binder.bind(device, &claim).await?;
            self.metrics.record_bind();
            return Ok(ReconcileOutcome::requeue_now());
        }

        let criteria = SelectionCriteria::for_claim(&claim, &requirements);
        match select_device(&devices, &criteria) {
            Some(device) => {
                debug!(claim = %key, device = %device.name_any(), "Selected device");
                self.binder.bind(device, &claim).await?;
                self.metrics.record_bind();
                Ok(ReconcileOutcome::requeue_now())
            }
            None => {
                if claim.phase() == ClaimPhase::Empty {
                    claim.set_phase(ClaimPhase::Pending);
                    self.claims.update(&claim).await?;
                }
                info!(
                    "No BlockDevice available for claim {} ({} bytes), retrying in {:?}",
                    key, requirements.capacity_bytes, self.config.retry_interval
                );
                Ok(ReconcileOutcome::requeue_after(self.config.retry_interval))
            }
        }
    }

    /// Release the claim's devices, then let its deletion finish
    async fn finalize(&self, claim: &BlockDeviceClaim) -> Result<ReconcileOutcome> {
        if !claim.has_finalizer() {
            return Ok(ReconcileOutcome::done());
        }

        let released = self.releaser.release(claim).await?;
        self.metrics.record_releases(released);

        let mut finalized = claim.clone();
        finalized.remove_finalizer();
        self.claims.update(&finalized).await?;

        info!(
            "Finalized BlockDeviceClaim {} ({} device(s) released)",
            claim.key(),
            released
        );
        Ok(ReconcileOutcome::done())
    }

    async fn delete_invalid(
        &self,
        claim: &BlockDeviceClaim,
        reason: &str,
    ) -> Result<ReconcileOutcome> {
        warn!(claim = %claim.key(), reason = %reason, "Deleting unsatisfiable claim");
        self.claims.delete(claim).await?;
        self.metrics.record_invalid_claim();
        Ok(ReconcileOutcome::done())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::fixtures::{fake_claim, fake_device};
    use crate::crd::{BlockDevice, RECONCILE_ANNOTATION};
    use crate::domain::ports::{ObjectStore, WatchEvent};
    use crate::store::MemoryStore;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::broadcast;

    struct Harness {
        claims: Arc<MemoryStore<BlockDeviceClaim>>,
        devices: Arc<MemoryStore<BlockDevice>>,
        reconciler: Reconciler,
        metrics: Arc<ControllerMetrics>,
    }

    fn harness() -> Harness {
        let claims = MemoryStore::<BlockDeviceClaim>::new();
        let devices = MemoryStore::<BlockDevice>::new();
        let metrics = Arc::new(ControllerMetrics::unregistered());
        let reconciler = Reconciler::new(
            claims.clone(),
            devices.clone(),
            ReconcilerConfig::default(),
            metrics.clone(),
        );
        Harness {
            claims,
            devices,
            reconciler,
            metrics,
        }
    }

    fn key(name: &str) -> ObjectKey {
        ObjectKey::namespaced("default", name)
    }

    /// Reconcile until settled or waiting on the pool
    async fn converge(reconciler: &Reconciler, key: &ObjectKey) -> ReconcileOutcome {
        for _ in 0..10 {
            let outcome = reconciler.reconcile(key).await.unwrap();
            if !outcome.requeue {
                return outcome;
            }
        }
        panic!("claim {} did not converge", key);
    }

    #[tokio::test]
    async fn test_binds_first_fitting_device() {
        let h = harness();
        h.devices.create(&fake_device("blockdevice-example", 102400)).await.unwrap();
        h.devices.create(&fake_device("blockdevice-example2", 1024000)).await.unwrap();
        let created = h
            .claims
            .create(&fake_claim("blockdeviceclaim-example", "102400", "uid-1"))
            .await
            .unwrap();

        let first = h.reconciler.reconcile(&key("blockdeviceclaim-example")).await.unwrap();
        assert_eq!(first, ReconcileOutcome::requeue_now());

        let claim = h.claims.get(&key("blockdeviceclaim-example")).await.unwrap();
        assert_eq!(claim.phase(), ClaimPhase::Done);
        assert_eq!(claim.bound_device_name(), Some("blockdevice-example"));

        let r = h.devices.get(&key("blockdevice-example")).await.unwrap();
        assert!(r.is_referenced_by(&created.uid().unwrap()));
        assert_eq!(r.claim_state(), ClaimState::Claimed);

        let r2 = h.devices.get(&key("blockdevice-example2")).await.unwrap();
        assert!(r2.is_available());
        assert_eq!(h.metrics.binds(), 1);
    }

    #[tokio::test]
    async fn test_done_claim_is_idempotent() {
        let h = harness();
        h.devices.create(&fake_device("bd-1", 102400)).await.unwrap();
        h.claims.create(&fake_claim("bdc-1", "102400", "uid-1")).await.unwrap();
        converge(&h.reconciler, &key("bdc-1")).await;

        let claim_writes = h.claims.write_count();
        let device_writes = h.devices.write_count();
        for _ in 0..5 {
            let outcome = h.reconciler.reconcile(&key("bdc-1")).await.unwrap();
            assert!(outcome.is_settled());
        }
        assert_eq!(h.claims.write_count(), claim_writes);
        assert_eq!(h.devices.write_count(), device_writes);
    }

    #[tokio::test]
    async fn test_unsatisfiable_claim_waits_pending() {
        let h = harness();
        h.devices.create(&fake_device("bd-1", 102400)).await.unwrap();
        h.devices.create(&fake_device("bd-2", 1024000)).await.unwrap();
        h.claims.create(&fake_claim("bdc-1", "2048000", "uid-1")).await.unwrap();

        let outcome = h.reconciler.reconcile(&key("bdc-1")).await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::requeue_after(ReconcilerConfig::default().retry_interval)
        );
        let claim = h.claims.get(&key("bdc-1")).await.unwrap();
        assert_eq!(claim.phase(), ClaimPhase::Pending);

        // Still nothing fits; no further writes
        let claim_writes = h.claims.write_count();
        h.reconciler.reconcile(&key("bdc-1")).await.unwrap();
        assert_eq!(h.claims.write_count(), claim_writes);
        assert_eq!(h.metrics.binds(), 0);
    }

    #[tokio::test]
    async fn test_huge_claim_waits_pending() {
        let h = harness();
        h.devices.create(&fake_device("bd-1", u64::MAX)).await.unwrap();
        h.claims.create(&fake_claim("bdc-1", "1e400", "uid-1")).await.unwrap();

        let outcome = h.reconciler.reconcile(&key("bdc-1")).await.unwrap();
        assert!(outcome.requeue_after.is_some());
        let claim = h.claims.get(&key("bdc-1")).await.unwrap();
        assert_eq!(claim.phase(), ClaimPhase::Pending);
        assert_eq!(h.metrics.invalid_claims(), 0);
    }

    #[tokio::test]
    async fn test_invalid_claim_is_deleted() {
        let h = harness();
        h.devices.create(&fake_device("bd-1", 102400)).await.unwrap();
        h.claims.create(&fake_claim("bdc-1", "0", "uid-1")).await.unwrap();
        let device_writes = h.devices.write_count();

        let outcome = h.reconciler.reconcile(&key("bdc-1")).await.unwrap();
        assert!(outcome.is_settled());
        assert_matches!(
            h.claims.get(&key("bdc-1")).await,
            Err(Error::ResourceNotFound { .. })
        );
        assert_eq!(h.devices.write_count(), device_writes);
        assert_eq!(h.metrics.invalid_claims(), 1);
    }

    #[tokio::test]
    async fn test_claim_marked_invalid_is_deleted() {
        let h = harness();
        let mut claim = fake_claim("bdc-1", "1024", "uid-1");
        claim.set_phase(ClaimPhase::Invalid);
        h.claims.create(&claim).await.unwrap();

        h.reconciler.reconcile(&key("bdc-1")).await.unwrap();
        assert!(h.claims.is_empty());
    }

    #[tokio::test]
    async fn test_deleted_claim_releases_device() {
        let h = harness();
        h.devices.create(&fake_device("bd-1", 102400)).await.unwrap();
        h.claims.create(&fake_claim("bdc-1", "102400", "uid-1")).await.unwrap();
        converge(&h.reconciler, &key("bdc-1")).await;

        let claim = h.claims.get(&key("bdc-1")).await.unwrap();
        h.claims.delete(&claim).await.unwrap();
        // Finalizer holds the claim until the device is released
        assert!(h.claims.get(&key("bdc-1")).await.unwrap().is_deleting());

        let outcome = h.reconciler.reconcile(&key("bdc-1")).await.unwrap();
        assert!(outcome.is_settled());

        let device = h.devices.get(&key("bd-1")).await.unwrap();
        assert_eq!(device.claim_state(), ClaimState::Unclaimed);
        assert!(device.spec.claim_ref.is_none());
        assert!(h.claims.is_empty());
        assert_eq!(h.metrics.releases(), 1);

        // Further reconciles see a missing claim
        assert!(h.reconciler.reconcile(&key("bdc-1")).await.unwrap().is_settled());
    }

    #[tokio::test]
    async fn test_disabled_claim_is_skipped() {
        let h = harness();
        h.devices.create(&fake_device("bd-1", 102400)).await.unwrap();
        let mut claim = fake_claim("bdc-1", "1024", "uid-1");
        claim
            .annotations_mut()
            .insert(RECONCILE_ANNOTATION.to_string(), "false".to_string());
        h.claims.create(&claim).await.unwrap();
        let writes = h.claims.write_count() + h.devices.write_count();

        let outcome = h.reconciler.reconcile(&key("bdc-1")).await.unwrap();
        assert!(outcome.is_settled());
        assert_eq!(h.claims.write_count() + h.devices.write_count(), writes);
    }

    #[tokio::test]
    async fn test_half_bound_device_is_adopted() {
        let h = harness();
        let claim = h.claims.create(&fake_claim("bdc-1", "1024", "uid-1")).await.unwrap();
        h.devices.create(&fake_device("bd-free", 102400)).await.unwrap();
        let mut held = fake_device("bd-held", 102400);
        held.set_claimed_by(&claim);
        h.devices.create(&held).await.unwrap();
        let device_writes = h.devices.write_count();

        converge(&h.reconciler, &key("bdc-1")).await;

        let claim = h.claims.get(&key("bdc-1")).await.unwrap();
        assert_eq!(claim.phase(), ClaimPhase::Done);
        assert_eq!(claim.bound_device_name(), Some("bd-held"));
        assert_eq!(h.devices.write_count(), device_writes);
        assert!(h.devices.get(&key("bd-free")).await.unwrap().is_available());
    }

    #[tokio::test]
    async fn test_inconsistent_done_claim_is_rebound() {
        let h = harness();
        h.devices.create(&fake_device("bd-1", 102400)).await.unwrap();
        let mut claim = fake_claim("bdc-1", "1024", "uid-1");
        claim.add_finalizer();
        claim.set_phase(ClaimPhase::Done);
        claim.status.as_mut().unwrap().block_device_name = Some("bd-gone".into());
        let created = h.claims.create(&claim).await.unwrap();

        let outcome = h.reconciler.reconcile(&key("bdc-1")).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::requeue_now());

        let claim = h.claims.get(&key("bdc-1")).await.unwrap();
        assert_eq!(claim.phase(), ClaimPhase::Done);
        assert_eq!(claim.bound_device_name(), Some("bd-1"));
        assert!(h
            .devices
            .get(&key("bd-1"))
            .await
            .unwrap()
            .is_referenced_by(&created.uid().unwrap()));
    }

    #[tokio::test]
    async fn test_double_reference_is_never_extended() {
        let h = harness();
        let claim = h.claims.create(&fake_claim("bdc-1", "1024", "uid-1")).await.unwrap();
        for name in ["bd-1", "bd-2"] {
            let mut device = fake_device(name, 102400);
            device.set_claimed_by(&claim);
            h.devices.create(&device).await.unwrap();
        }
        h.devices.create(&fake_device("bd-3", 102400)).await.unwrap();

        let result = h.reconciler.reconcile(&key("bdc-1")).await;
        assert_matches!(result, Err(Error::InvariantViolation(_)));
        assert_eq!(h.metrics.invariant_violations(), 1);
        assert!(h.devices.get(&key("bd-3")).await.unwrap().is_available());
    }

    #[tokio::test]
    async fn test_claims_never_share_a_device() {
        let h = harness();
        h.devices.create(&fake_device("bd-1", 102400)).await.unwrap();
        h.devices.create(&fake_device("bd-2", 102400)).await.unwrap();
        for i in 0..5 {
            h.claims
                .create(&fake_claim(&format!("bdc-{}", i), "1024", &format!("uid-{}", i)))
                .await
                .unwrap();
        }

        for _ in 0..3 {
            for i in 0..5 {
                h.reconciler.reconcile(&key(&format!("bdc-{}", i))).await.unwrap();
            }
        }

        let claims = h.claims.list(Some("default")).await.unwrap();
        let done: Vec<_> = claims
            .iter()
            .filter(|c| c.phase() == ClaimPhase::Done)
            .collect();
        assert_eq!(done.len(), 2);
        let pending = claims
            .iter()
            .filter(|c| c.phase() == ClaimPhase::Pending)
            .count();
        assert_eq!(pending, 3);

        let devices = h.devices.list(Some("default")).await.unwrap();
        for claim in done {
            let uid = claim.uid().unwrap();
            assert_eq!(devices_bound_to(&devices, &uid).len(), 1);
        }
    }

    #[tokio::test]
    async fn test_claims_with_same_requested_uid_bind_separately() {
        let h = harness();
        h.devices.create(&fake_device("bd-1", 1 << 30)).await.unwrap();
        h.devices.create(&fake_device("bd-2", 1 << 30)).await.unwrap();
        h.claims.create(&fake_claim("a", "1Gi", "same")).await.unwrap();
        h.claims.create(&fake_claim("b", "1Gi", "same")).await.unwrap();

        for _ in 0..4 {
            h.reconciler.reconcile(&key("a")).await.unwrap();
            h.reconciler.reconcile(&key("b")).await.unwrap();
        }

        let a = h.claims.get(&key("a")).await.unwrap();
        let b = h.claims.get(&key("b")).await.unwrap();
        assert_eq!(a.phase(), ClaimPhase::Done);
        assert_eq!(b.phase(), ClaimPhase::Done);
        assert_ne!(a.uid(), b.uid());
        assert_ne!(a.bound_device_name(), b.bound_device_name());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reconciles_never_share_a_device() {
        let h = harness();
        for i in 0..3 {
            h.devices.create(&fake_device(&format!("bd-{}", i), 102400)).await.unwrap();
        }
        for i in 0..20 {
            h.claims
                .create(&fake_claim(&format!("bdc-{}", i), "1024", &format!("uid-{}", i)))
                .await
                .unwrap();
        }

        let reconciler = Arc::new(h.reconciler);
        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..20 {
            let reconciler = reconciler.clone();
            tasks.spawn(async move {
                let key = key(&format!("bdc-{}", i));
                for _ in 0..50 {
                    let outcome = reconciler.reconcile(&key).await.unwrap();
                    if !outcome.requeue {
                        return;
                    }
                }
                panic!("claim {} kept racing", key);
            });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap();
        }

        let claims = h.claims.list(Some("default")).await.unwrap();
        let done: Vec<_> = claims
            .iter()
            .filter(|c| c.phase() == ClaimPhase::Done)
            .collect();
        assert_eq!(done.len(), 3);

        let devices = h.devices.list(Some("default")).await.unwrap();
        for claim in &done {
            let bound = devices_bound_to(&devices, &claim.uid().unwrap());
            assert_eq!(bound.len(), 1);
            assert_eq!(Some(bound[0].name_any().as_str()), claim.bound_device_name());
        }
        let mut names: Vec<_> = done.iter().filter_map(|c| c.bound_device_name()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 3);
    }

    /// Device store that lets a competing writer claim the device right
    /// before the first update goes through
    struct RacingDevices {
        inner: Arc<MemoryStore<BlockDevice>>,
        raced: AtomicBool,
    }

    #[async_trait]
    impl ObjectStore<BlockDevice> for RacingDevices {
        async fn get(&self, key: &ObjectKey) -> Result<BlockDevice> {
            self.inner.get(key).await
        }

        async fn list(&self, namespace: Option<&str>) -> Result<Vec<BlockDevice>> {
            self.inner.list(namespace).await
        }

        async fn create(&self, obj: &BlockDevice) -> Result<BlockDevice> {
            self.inner.create(obj).await
        }

        async fn update(&self, obj: &BlockDevice) -> Result<BlockDevice> {
            if !self.raced.swap(true, Ordering::SeqCst) {
                let rival = fake_claim("rival", "1024", "uid-rival");
                let mut stolen = self.inner.get(&ObjectKey::of(obj)).await?;
                stolen.set_claimed_by(&rival);
                self.inner.update(&stolen).await?;
            }
            self.inner.update(obj).await
        }

        async fn delete(&self, obj: &BlockDevice) -> Result<()> {
            self.inner.delete(obj).await
        }

        fn watch(&self) -> broadcast::Receiver<WatchEvent<BlockDevice>> {
            self.inner.watch()
        }

        fn kind(&self) -> &str {
            self.inner.kind()
        }
    }

    #[tokio::test]
    async fn test_lost_race_requeues_without_binding() {
        let claims = MemoryStore::<BlockDeviceClaim>::new();
        let inner = MemoryStore::<BlockDevice>::new();
        inner.create(&fake_device("bd-1", 102400)).await.unwrap();
        claims.create(&fake_claim("bdc-1", "1024", "uid-1")).await.unwrap();

        let devices = Arc::new(RacingDevices {
            inner: inner.clone(),
            raced: AtomicBool::new(false),
        });
        let metrics = Arc::new(ControllerMetrics::unregistered());
        let reconciler = Reconciler::new(
            claims.clone(),
            devices,
            ReconcilerConfig::default(),
            metrics.clone(),
        );

        let outcome = reconciler.reconcile(&key("bdc-1")).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::requeue_now());
        assert_eq!(metrics.conflicts(), 1);
        let claim = claims.get(&key("bdc-1")).await.unwrap();
        assert_ne!(claim.phase(), ClaimPhase::Done);

        // The fresh read sees the device taken and the claim waits
        let outcome = reconciler.reconcile(&key("bdc-1")).await.unwrap();
        assert!(outcome.requeue_after.is_some());
        let claim = claims.get(&key("bdc-1")).await.unwrap();
        assert_eq!(claim.phase(), ClaimPhase::Pending);
        let device = inner.get(&key("bd-1")).await.unwrap();
        assert!(device.is_referenced_by("uid-rival"));
    }
}
