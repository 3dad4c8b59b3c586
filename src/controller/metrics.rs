//! Controller metrics
//!
//! Prometheus collectors for the claim reconciler, registered on a caller
//! supplied registry so tests can use a private one.

use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};

use crate::error::Result;

/// Reconcile outcome label values
pub mod outcome {
    pub const SETTLED: &str = "settled";
    pub const REQUEUE: &str = "requeue";
    pub const ERROR: &str = "error";
}

/// Metrics recorded by the reconciler
#[derive(Clone)]
pub struct ControllerMetrics {
    reconciles: IntCounterVec,
    binds: IntCounter,
    releases: IntCounter,
    conflicts: IntCounter,
    invalid_claims: IntCounter,
    invariant_violations: IntCounter,
    reconcile_duration: Histogram,
}

impl ControllerMetrics {
    /// Create the collectors and register them on `registry`
    pub fn new(registry: &Registry) -> Result<Self> {
        let reconciles = IntCounterVec::new(
            Opts::new(
                "blockdeviceclaim_reconciles_total",
                "Claim reconciliations by outcome",
            ),
            &["outcome"],
        )?;
        let binds = IntCounter::new(
            "blockdeviceclaim_binds_total",
            "Devices bound to claims",
        )?;
        let releases = IntCounter::new(
            "blockdeviceclaim_releases_total",
            "Devices released from deleted claims",
        )?;
        let conflicts = IntCounter::new(
            "blockdeviceclaim_conflicts_total",
            "Writes rejected because the object changed concurrently",
        )?;
        let invalid_claims = IntCounter::new(
            "blockdeviceclaim_invalid_deleted_total",
            "Claims deleted for unsatisfiable requirements",
        )?;
        let invariant_violations = IntCounter::new(
            "blockdeviceclaim_invariant_violations_total",
            "Claims referenced by more than one device",
        )?;
        let reconcile_duration = Histogram::with_opts(HistogramOpts::new(
            "blockdeviceclaim_reconcile_duration_seconds",
            "Duration of claim reconciliations",
        ))?;

        registry.register(Box::new(reconciles.clone()))?;
        registry.register(Box::new(binds.clone()))?;
        registry.register(Box::new(releases.clone()))?;
        registry.register(Box::new(conflicts.clone()))?;
        registry.register(Box::new(invalid_claims.clone()))?;
        registry.register(Box::new(invariant_violations.clone()))?;
        registry.register(Box::new(reconcile_duration.clone()))?;

        Ok(Self {
            reconciles,
            binds,
            releases,
            conflicts,
            invalid_claims,
            invariant_violations,
            reconcile_duration,
        })
    }

    /// Metrics on a throwaway registry
    #[cfg(test)]
    pub(crate) fn unregistered() -> Self {
        Self::new(&Registry::new()).unwrap()
    }

    #[inline]
    pub fn record_reconcile(&self, outcome: &str, seconds: f64) {
        self.reconciles.with_label_values(&[outcome]).inc();
        self.reconcile_duration.observe(seconds);
    }

    #[inline]
    pub fn record_bind(&self) {
        self.binds.inc();
    }

    #[inline]
    pub fn record_releases(&self, count: usize) {
        self.releases.inc_by(count as u64);
    }

    #[inline]
    pub fn record_conflict(&self) {
        self.conflicts.inc();
    }

    #[inline]
    pub fn record_invalid_claim(&self) {
        self.invalid_claims.inc();
    }

    #[inline]
    pub fn record_invariant_violation(&self) {
        self.invariant_violations.inc();
    }

    pub fn reconciles(&self, outcome: &str) -> u64 {
        self.reconciles.with_label_values(&[outcome]).get()
    }

    pub fn binds(&self) -> u64 {
        self.binds.get()
    }

    pub fn releases(&self) -> u64 {
        self.releases.get()
    }

    pub fn conflicts(&self) -> u64 {
        self.conflicts.get()
    }

    pub fn invalid_claims(&self) -> u64 {
        self.invalid_claims.get()
    }

    pub fn invariant_violations(&self) -> u64 {
        self.invariant_violations.get()
    }
}
