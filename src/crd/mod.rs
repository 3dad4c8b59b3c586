//! Custom Resource Definitions for the claim operator
//!
//! This module contains all CRD types:
//! - BlockDevice: a discovered, allocatable block device
//! - BlockDeviceClaim: a request for exclusive use of one device
//! - Quantity: Kubernetes-style resource quantities used in claim requests

pub mod block_device;
pub mod device_claim;
pub mod quantity;

pub use block_device::*;
pub use device_claim::*;
pub use quantity::*;

/// Requirement name for device capacity in bytes
pub const RESOURCE_CAPACITY: &str = "capacity";

/// Node label carried by every discovered device
pub const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

/// Finalizer holding a claim until its device is released
pub const CLAIM_FINALIZER: &str = "storage.billyronks.io/claim-protection";

/// Annotation that switches reconciliation off for a claim when "false"
pub const RECONCILE_ANNOTATION: &str = "storage.billyronks.io/reconcile";
