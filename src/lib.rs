//! BlockDevice Claim Operator
//!
//! A Kubernetes operator that binds BlockDeviceClaims to discovered
//! BlockDevices. Each claim is reconciled independently and repeatedly;
//! exclusivity between concurrently reconciled claims rests solely on the
//! object store rejecting writes made against a stale resourceVersion.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────┐
//! │                          Dispatcher                                    │
//! │   claim/device watches ──► work queue ──► N reconcile workers          │
//! ├───────────────────────────────────────────────────────────────────────┤
//! │                          Reconciler                                    │
//! │  ┌────────────┐  ┌────────────┐  ┌────────────┐  ┌────────────────┐   │
//! │  │ Validation │  │ Selection  │  │  Binding   │  │    Release     │   │
//! │  │            │  │ (first-fit)│  │ (dev→claim)│  │ (on deletion)  │   │
//! │  └────────────┘  └────────────┘  └────────────┘  └────────────────┘   │
//! ├───────────────────────────────────────────────────────────────────────┤
//! │                   ObjectStore port (versioned)                         │
//! │  ┌─────────────────────────────┐  ┌─────────────────────────────────┐ │
//! │  │   MemoryStore (standalone)  │  │   KubeStore (kube::Api)         │ │
//! │  └─────────────────────────────┘  └─────────────────────────────────┘ │
//! └───────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controller`]: Reconciler, dispatcher and their building blocks
//! - [`store`]: Object store adapters
//! - [`api`]: REST API
//! - [`crd`]: Custom Resource Definitions
//! - [`domain`]: Store port and keys
//! - [`error`]: Error types and handling

pub mod api;
pub mod controller;
pub mod crd;
pub mod domain;
pub mod error;
pub mod store;

// Re-export commonly used types
pub use api::{ApiServer, ApiServerConfig};

pub use controller::{
    ControllerMetrics, Dispatcher, DispatcherConfig, ReconcileOutcome, Reconciler,
    ReconcilerConfig,
};

pub use crd::{
    BlockDevice, BlockDeviceClaim, BlockDeviceClaimSpec, BlockDeviceClaimStatus, BlockDeviceSpec,
    BlockDeviceStatus, ClaimPhase, ClaimState, DeviceState, Quantity,
};

pub use domain::ports::{ClaimStoreRef, DeviceStoreRef, ObjectKey, ObjectStore, WatchEvent};

pub use error::{Error, ErrorAction, Result};

pub use store::{KubeStore, MemoryStore, SeedManifest};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
