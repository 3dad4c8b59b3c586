//! BlockDeviceClaim CRD
//!
//! A request for exclusive use of one BlockDevice that satisfies a set of
//! resource requirements and optional placement constraints.

use chrono::{DateTime, Utc};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::quantity::Quantity;
use super::{CLAIM_FINALIZER, RECONCILE_ANNOTATION};
use crate::domain::ports::ObjectKey;

// =============================================================================
// BlockDeviceClaim CRD
// =============================================================================

/// BlockDeviceClaim asks the operator to bind one matching BlockDevice
/// exclusively to the requester.
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "storage.billyronks.io",
    version = "v1alpha1",
    kind = "BlockDeviceClaim",
    plural = "blockdeviceclaims",
    shortname = "bdc",
    status = "BlockDeviceClaimStatus",
    printcolumn = r#"{"name": "BlockDevice", "type": "string", "jsonPath": ".status.blockDeviceName"}"#,
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct BlockDeviceClaimSpec {
    /// Resource requirements the device must satisfy
    #[serde(default)]
    pub requirements: ClaimRequirements,

    /// Only consider devices attached to this node
    #[serde(default)]
    pub host_name: Option<String>,

    /// Only consider devices of this type
    #[serde(default)]
    pub device_type: Option<String>,

    /// Only consider the device with this name
    #[serde(default)]
    pub block_device_name: Option<String>,
}

// =============================================================================
// Sub-Types
// =============================================================================

/// Resource requests of a claim
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClaimRequirements {
    /// Requirement name -> minimum quantity (e.g. "capacity": "10Gi")
    #[serde(default)]
    pub requests: BTreeMap<String, Quantity>,
}

impl ClaimRequirements {
    /// Requirements asking for `capacity` bytes
    pub fn with_capacity(capacity: impl Into<Quantity>) -> Self {
        let mut requests = BTreeMap::new();
        requests.insert(super::RESOURCE_CAPACITY.to_string(), capacity.into());
        Self { requests }
    }
}

// =============================================================================
// Status
// =============================================================================

/// Status of the BlockDeviceClaim
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BlockDeviceClaimStatus {
    /// Current phase
    #[serde(default)]
    pub phase: ClaimPhase,

    /// Device bound to this claim
    #[serde(default)]
    pub block_device_name: Option<String>,

    /// When the phase last changed
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

/// Claim lifecycle phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ClaimPhase {
    #[default]
    Empty,
    Pending,
    Done,
    Invalid,
}

impl std::fmt::Display for ClaimPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClaimPhase::Empty => write!(f, "Empty"),
            ClaimPhase::Pending => write!(f, "Pending"),
            ClaimPhase::Done => write!(f, "Done"),
            ClaimPhase::Invalid => write!(f, "Invalid"),
        }
    }
}

// =============================================================================
// Implementations
// =============================================================================

impl BlockDeviceClaim {
    /// Store key of this claim
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace(), self.name_any())
    }

    pub fn phase(&self) -> ClaimPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// Name of the device recorded as bound
    pub fn bound_device_name(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.block_device_name.as_deref())
    }

    /// Deletion has been requested
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self) -> bool {
        self.finalizers().iter().any(|f| f == CLAIM_FINALIZER)
    }

    /// Reconciliation switched off through the annotation
    pub fn is_reconcile_disabled(&self) -> bool {
        self.annotations()
            .get(RECONCILE_ANNOTATION)
            .map(|v| v.eq_ignore_ascii_case("false"))
            .unwrap_or(false)
    }

    /// Move to `phase`, stamping the transition time when it changes
    pub fn set_phase(&mut self, phase: ClaimPhase) {
        let status = self.status.get_or_insert_with(Default::default);
        if status.phase != phase {
            status.phase = phase;
            status.last_transition_time = Some(Utc::now());
        }
    }

    pub fn add_finalizer(&mut self) {
        if !self.has_finalizer() {
            self.finalizers_mut().push(CLAIM_FINALIZER.to_string());
        }
    }

    pub fn remove_finalizer(&mut self) {
        self.finalizers_mut().retain(|f| f != CLAIM_FINALIZER);
    }
}
