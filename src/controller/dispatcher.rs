//! Reconcile dispatcher
//!
//! Turns store watch events into claim keys on a deduplicating work queue
//! and runs a fixed pool of workers over it. A key is never handed to two
//! workers at once: keys that change while being processed are marked
//! dirty and queued again once the running reconcile finishes. Shutdown
//! stops workers from taking new keys but never cancels a reconcile in
//! flight.

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use dashmap::DashMap;
use kube::ResourceExt;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::reconciler::{ReconcileOutcome, Reconciler};
use crate::crd::{BlockDevice, BlockDeviceClaim, ClaimPhase};
use crate::domain::ports::{ObjectKey, WatchEvent};
use crate::error::{Error, ErrorAction, Result};

// =============================================================================
// Configuration
// =============================================================================

/// Dispatcher configuration
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Number of concurrent reconcile workers
    pub workers: usize,
    /// Interval at which every claim is re-enqueued
    pub resync_interval: Duration,
    /// First delay after a transient failure
    pub backoff_initial: Duration,
    /// Upper bound for failure delays
    pub backoff_max: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            resync_interval: Duration::from_secs(300),
            backoff_initial: Duration::from_millis(500),
            backoff_max: Duration::from_secs(60),
        }
    }
}

impl DispatcherConfig {
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::Configuration("workers must be at least 1".into()));
        }
        if self.resync_interval.is_zero() {
            return Err(Error::Configuration("resync interval must be positive".into()));
        }
        if self.backoff_initial.is_zero() || self.backoff_initial > self.backoff_max {
            return Err(Error::Configuration(format!(
                "backoff must satisfy 0 < initial ({:?}) <= max ({:?})",
                self.backoff_initial, self.backoff_max
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Work Queue
// =============================================================================

#[derive(Default)]
struct QueueState {
    /// Waiting in the channel
    queued: HashSet<ObjectKey>,
    /// Held by a worker
    processing: HashSet<ObjectKey>,
    /// Changed while held; queue again on completion
    dirty: HashSet<ObjectKey>,
}

/// Deduplicating FIFO of claim keys
pub struct WorkQueue {
    tx: mpsc::UnboundedSender<ObjectKey>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ObjectKey>>,
    state: Mutex<QueueState>,
}

impl WorkQueue {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            state: Mutex::new(QueueState::default()),
        })
    }

    /// Enqueue `key` unless it is already waiting
    pub fn add(&self, key: ObjectKey) {
        let mut state = self.state.lock();
        if state.processing.contains(&key) {
            state.dirty.insert(key);
            return;
        }
        if state.queued.insert(key.clone()) {
            // The receiver lives as long as the queue
            let _ = self.tx.send(key);
        }
    }

    /// Enqueue `key` after `delay` unless `shutdown` fires first
    pub fn add_after(self: &Arc<Self>, key: ObjectKey, delay: Duration, shutdown: &CancellationToken) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = self.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => queue.add(key),
            }
        });
    }

    /// Take the next key and mark it as being processed
    pub async fn next(&self) -> Option<ObjectKey> {
        let key = self.rx.lock().await.recv().await?;
        let mut state = self.state.lock();
        state.queued.remove(&key);
        state.processing.insert(key.clone());
        Some(key)
    }

    /// Release `key`, queueing it again if it changed meanwhile
    pub fn done(&self, key: &ObjectKey) {
        let mut state = self.state.lock();
        state.processing.remove(key);
        if state.dirty.remove(key) && state.queued.insert(key.clone()) {
            let _ = self.tx.send(key.clone());
        }
    }

    /// Keys waiting to be processed
    pub fn len(&self) -> usize {
        self.state.lock().queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Runs the reconciler for every claim that needs attention
pub struct Dispatcher {
    reconciler: Arc<Reconciler>,
    config: DispatcherConfig,
    queue: Arc<WorkQueue>,
    /// Failure backoff per claim, dropped once the claim settles
    backoffs: DashMap<ObjectKey, ExponentialBackoff>,
}

impl Dispatcher {
    pub fn new(reconciler: Arc<Reconciler>, config: DispatcherConfig) -> Arc<Self> {
        Arc::new(Self {
            reconciler,
            config,
            queue: WorkQueue::new(),
            backoffs: DashMap::new(),
        })
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    /// Run until `shutdown` is cancelled and in-flight reconciles finish
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        self.config.validate()?;

        // Subscribe before listing so no change falls between the two
        let claim_events = self.reconciler.claims().watch();
        let device_events = self.reconciler.devices().watch();

        self.resync().await?;

        let mut background = JoinSet::new();
        background.spawn(self.clone().watch_claims(claim_events, shutdown.clone()));
        background.spawn(self.clone().watch_devices(device_events, shutdown.clone()));
        background.spawn(self.clone().periodic_resync(shutdown.clone()));

        let mut workers = JoinSet::new();
        for id in 0..self.config.workers {
            workers.spawn(self.clone().worker(id, shutdown.clone()));
        }
        info!(
            "Dispatcher started with {} workers (resync every {:?})",
            self.config.workers,
            self.config.resync_interval
        );

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!("Reconcile worker panicked: {}", e);
            }
        }
        background.shutdown().await;

        info!("Dispatcher stopped");
        Ok(())
    }

    /// Enqueue every claim
    pub async fn resync(&self) -> Result<()> {
        let claims = self.reconciler.claims().list(None).await?;
        debug!("Resync enqueueing {} claims", claims.len());
        for claim in &claims {
            self.queue.add(claim.key());
        }
        Ok(())
    }

    async fn worker(self: Arc<Self>, id: usize, shutdown: CancellationToken) {
        loop {
            let key = tokio::select! {
                _ = shutdown.cancelled() => break,
                key = self.queue.next() => match key {
                    Some(key) => key,
                    None => break,
                },
            };

            // Runs to completion even if shutdown is requested meanwhile
            self.process(&key, &shutdown).await;
            self.queue.done(&key);
        }
        debug!(worker = id, "Worker stopped");
    }

    async fn process(&self, key: &ObjectKey, shutdown: &CancellationToken) {
        match self.reconciler.reconcile(key).await {
            Ok(outcome) => {
                self.backoffs.remove(key);
                self.apply_outcome(key, outcome, shutdown);
            }
            Err(e) => match e.action() {
                ErrorAction::RequeueWithBackoff => {
                    let delay = self.next_backoff(key);
                    warn!(claim = %key, error = %e, "Reconcile failed, retrying in {:?}", delay);
                    self.queue.add_after(key.clone(), delay, shutdown);
                }
                ErrorAction::RequeueAfter(delay) => {
                    debug!(claim = %key, error = %e, "Reconcile failed, retrying in {:?}", delay);
                    self.queue.add_after(key.clone(), delay, shutdown);
                }
                ErrorAction::NoRequeue => {
                    self.backoffs.remove(key);
                    error!(claim = %key, error = %e, "Reconcile failed, waiting for the claim to change");
                }
            },
        }
    }

    fn apply_outcome(&self, key: &ObjectKey, outcome: ReconcileOutcome, shutdown: &CancellationToken) {
        if outcome.requeue {
            self.queue.add(key.clone());
        } else if let Some(delay) = outcome.requeue_after {
            self.queue.add_after(key.clone(), delay, shutdown);
        }
    }

    fn next_backoff(&self, key: &ObjectKey) -> Duration {
        let mut backoff = self.backoffs.entry(key.clone()).or_insert_with(|| {
            ExponentialBackoffBuilder::new()
                .with_initial_interval(self.config.backoff_initial)
                .with_max_interval(self.config.backoff_max)
                .with_max_elapsed_time(None)
                .build()
        });
        backoff.next_backoff().unwrap_or(self.config.backoff_max)
    }

    // =========================================================================
    // Event mapping
    // =========================================================================

    async fn watch_claims(
        self: Arc<Self>,
        mut events: broadcast::Receiver<WatchEvent<BlockDeviceClaim>>,
        shutdown: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(WatchEvent::Applied(claim)) => self.queue.add(claim.key()),
                Ok(WatchEvent::Deleted(claim)) => {
                    self.backoffs.remove(&claim.key());
                }
                Ok(WatchEvent::Resync) => self.resync_logged().await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Claim watch lagged by {} events, resyncing", skipped);
                    self.resync_logged().await;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    async fn watch_devices(
        self: Arc<Self>,
        mut events: broadcast::Receiver<WatchEvent<BlockDevice>>,
        shutdown: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(WatchEvent::Applied(device)) => {
                    self.enqueue_owner(&device);
                    if device.is_available() {
                        self.enqueue_waiting(device.namespace().as_deref()).await;
                    }
                }
                Ok(WatchEvent::Deleted(device)) => self.enqueue_owner(&device),
                Ok(WatchEvent::Resync) => self.resync_logged().await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Device watch lagged by {} events, resyncing", skipped);
                    self.resync_logged().await;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// Enqueue the claim a device points at
    fn enqueue_owner(&self, device: &BlockDevice) {
        if let Some(claim_ref) = &device.spec.claim_ref {
            let namespace = claim_ref.namespace.clone().or_else(|| device.namespace());
            self.queue.add(ObjectKey::new(namespace, claim_ref.name.clone()));
        }
    }

    /// Enqueue every claim in `namespace` that is still waiting for a device
    async fn enqueue_waiting(&self, namespace: Option<&str>) {
        match self.reconciler.claims().list(namespace).await {
            Ok(claims) => claims
                .iter()
                .filter(|c| c.phase() != ClaimPhase::Done)
                .for_each(|c| self.queue.add(c.key())),
            Err(e) => warn!("Failed to list waiting claims: {}", e),
        }
    }

    async fn resync_logged(&self) {
        if let Err(e) = self.resync().await {
            warn!("Resync failed: {}", e);
        }
    }

    async fn periodic_resync(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.resync_interval);
        // The first tick completes immediately and run() already listed
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.resync_logged().await,
            }
        }
    }
}
