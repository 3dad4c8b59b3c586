//! BlockDevice CRD
//!
//! Represents a single discovered block device on a node. Devices are
//! created by the discovery agents; the claim controller only ever touches
//! the claim bookkeeping (`spec.claimRef` and `status.claimState`).

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::device_claim::BlockDeviceClaim;
use super::{HOSTNAME_LABEL, RESOURCE_CAPACITY};

// =============================================================================
// BlockDevice CRD
// =============================================================================

/// BlockDevice is an allocatable disk (or partition) that can be bound
/// exclusively to one BlockDeviceClaim.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "storage.billyronks.io",
    version = "v1alpha1",
    kind = "BlockDevice",
    plural = "blockdevices",
    shortname = "bd",
    status = "BlockDeviceStatus",
    printcolumn = r#"{"name": "Node", "type": "string", "jsonPath": ".metadata.labels.kubernetes\\.io/hostname"}"#,
    printcolumn = r#"{"name": "Size", "type": "integer", "jsonPath": ".spec.capacity.storage"}"#,
    printcolumn = r#"{"name": "ClaimState", "type": "string", "jsonPath": ".status.claimState"}"#,
    printcolumn = r#"{"name": "State", "type": "string", "jsonPath": ".status.state"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct BlockDeviceSpec {
    /// Device path on the host (e.g. /dev/sdb)
    #[serde(default)]
    pub path: String,

    /// Device capacity
    pub capacity: DeviceCapacity,

    /// Static device details
    #[serde(default)]
    pub details: DeviceDetails,

    /// Claim currently bound to this device
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_ref: Option<ClaimReference>,
}

// =============================================================================
// Sub-Types
// =============================================================================

/// Device capacity
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCapacity {
    /// Total size in bytes
    pub storage: u64,

    /// Logical sector size in bytes
    #[serde(default)]
    pub logical_sector_size: Option<u32>,
}

/// Static details reported by discovery
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDetails {
    /// Device type (disk, partition, sparse, ...)
    #[serde(default)]
    pub device_type: Option<String>,

    #[serde(default)]
    pub model: Option<String>,

    #[serde(default)]
    pub serial: Option<String>,

    #[serde(default)]
    pub vendor: Option<String>,
}

/// Back-reference from a device to the claim holding it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClaimReference {
    /// UID of the claim
    pub uid: String,

    /// Name of the claim
    pub name: String,

    /// Namespace of the claim
    #[serde(default)]
    pub namespace: Option<String>,
}

impl ClaimReference {
    /// Build a reference pointing at the given claim
    pub fn to_claim(claim: &BlockDeviceClaim) -> Self {
        Self {
            uid: claim.uid().unwrap_or_default(),
            name: claim.name_any(),
            namespace: claim.namespace(),
        }
    }
}

// =============================================================================
// Status
// =============================================================================

/// Status of the BlockDevice
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BlockDeviceStatus {
    /// Whether the device is currently present and usable
    #[serde(default)]
    pub state: DeviceState,

    /// Claim bookkeeping state
    #[serde(default)]
    pub claim_state: ClaimState,
}

/// Device presence state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum DeviceState {
    Active,
    #[default]
    Inactive,
}

impl std::fmt::Display for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceState::Active => write!(f, "Active"),
            DeviceState::Inactive => write!(f, "Inactive"),
        }
    }
}

/// Claim state of a device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ClaimState {
    #[default]
    Unclaimed,
    Claimed,
    Released,
}

impl std::fmt::Display for ClaimState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClaimState::Unclaimed => write!(f, "Unclaimed"),
            ClaimState::Claimed => write!(f, "Claimed"),
            ClaimState::Released => write!(f, "Released"),
        }
    }
}

// =============================================================================
// Implementations
// =============================================================================

impl BlockDevice {
    /// Node the device is attached to
    pub fn host_name(&self) -> Option<&str> {
        self.labels().get(HOSTNAME_LABEL).map(String::as_str)
    }

    /// Device type reported by discovery
    pub fn device_type(&self) -> Option<&str> {
        self.spec.details.device_type.as_deref()
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.spec.capacity.storage
    }

    pub fn state(&self) -> DeviceState {
        self.status.as_ref().map(|s| s.state).unwrap_or_default()
    }

    pub fn claim_state(&self) -> ClaimState {
        self.status.as_ref().map(|s| s.claim_state).unwrap_or_default()
    }

    pub fn is_active(&self) -> bool {
        self.state() == DeviceState::Active
    }

    /// Active, unclaimed and carrying no back-reference
    pub fn is_available(&self) -> bool {
        self.is_active()
            && self.claim_state() == ClaimState::Unclaimed
            && self.spec.claim_ref.is_none()
    }

    /// Whether the back-reference names the claim with this uid
    pub fn is_referenced_by(&self, claim_uid: &str) -> bool {
        self.spec
            .claim_ref
            .as_ref()
            .map(|r| r.uid == claim_uid)
            .unwrap_or(false)
    }

    /// Attribute compared against a claim requirement of the same name
    pub fn attribute(&self, requirement: &str) -> Option<i128> {
        match requirement {
            RESOURCE_CAPACITY => Some(i128::from(self.spec.capacity.storage)),
            _ => None,
        }
    }

    /// Mark the device as claimed by `claim`
    pub fn set_claimed_by(&mut self, claim: &BlockDeviceClaim) {
        self.spec.claim_ref = Some(ClaimReference::to_claim(claim));
        self.status.get_or_insert_with(Default::default).claim_state = ClaimState::Claimed;
    }

    /// Drop the claim bookkeeping, returning the device to the pool
    pub fn set_unclaimed(&mut self) {
        self.spec.claim_ref = None;
        self.status.get_or_insert_with(Default::default).claim_state = ClaimState::Unclaimed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{BlockDeviceClaimSpec, ClaimRequirements};
    use kube::CustomResourceExt;

    fn active_device(capacity: u64) -> BlockDevice {
        let mut device = BlockDevice::new(
            "blockdevice-example",
            BlockDeviceSpec {
                path: "/dev/disk-fake-path".into(),
                capacity: DeviceCapacity {
                    storage: capacity,
                    logical_sector_size: None,
                },
                details: DeviceDetails::default(),
                claim_ref: None,
            },
        );
        device.status = Some(BlockDeviceStatus {
            state: DeviceState::Active,
            claim_state: ClaimState::Unclaimed,
        });
        device
    }

    #[test]
    fn test_state_display() {
        assert_eq!(format!("{}", DeviceState::Active), "Active");
        assert_eq!(format!("{}", ClaimState::Released), "Released");
    }

    #[test]
    fn test_availability() {
        let mut device = active_device(1024000);
        assert!(device.is_available());

        device.status = None;
        assert!(!device.is_active());
        assert!(!device.is_available());
    }

    #[test]
    fn test_claim_bookkeeping() {
        let mut claim = BlockDeviceClaim::new(
            "bdc-1",
            BlockDeviceClaimSpec {
                requirements: ClaimRequirements::default(),
                host_name: None,
                device_type: None,
                block_device_name: None,
            },
        );
        claim.metadata.uid = Some("uid-1".into());
        claim.metadata.namespace = Some("default".into());

        let mut device = active_device(1024000);
        device.set_claimed_by(&claim);
        assert!(device.is_referenced_by("uid-1"));
        assert!(!device.is_referenced_by("uid-2"));
        assert_eq!(device.claim_state(), ClaimState::Claimed);
        assert!(!device.is_available());

        device.set_unclaimed();
        assert!(device.spec.claim_ref.is_none());
        assert!(device.is_available());
    }

    #[test]
    fn test_attribute_lookup() {
        let device = active_device(102400);
        assert_eq!(device.attribute(RESOURCE_CAPACITY), Some(102400));
        assert_eq!(device.attribute("iops"), None);
    }

    #[test]
    fn test_crd_is_namespaced() {
        let crd = BlockDevice::crd();
        assert_eq!(crd.spec.scope, "Namespaced");
        assert_eq!(crd.spec.names.kind, "BlockDevice");
    }
}
