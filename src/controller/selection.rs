//! Device selection
//!
//! First-fit over the device list in store order: the first device that is
//! available and satisfies every request and placement constraint wins.
//! Selection does not sort by capacity.

use std::collections::BTreeMap;

use super::validation::ValidatedRequirements;
use crate::crd::{BlockDevice, BlockDeviceClaim};

// =============================================================================
// Selection Criteria
// =============================================================================

/// What a device must satisfy to be bound to a claim
#[derive(Debug, Clone, Default)]
pub struct SelectionCriteria {
    /// Minimum attribute values by requirement name
    pub requests: BTreeMap<String, i128>,
    /// Required node
    pub host_name: Option<String>,
    /// Required device type
    pub device_type: Option<String>,
    /// Required device name
    pub device_name: Option<String>,
}

impl SelectionCriteria {
    /// Criteria for a validated claim. An empty constraint counts as unset.
    pub fn for_claim(claim: &BlockDeviceClaim, requirements: &ValidatedRequirements) -> Self {
        Self {
            requests: requirements.requests.clone(),
            host_name: non_empty(&claim.spec.host_name),
            device_type: non_empty(&claim.spec.device_type),
            device_name: non_empty(&claim.spec.block_device_name),
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.clone().filter(|s| !s.is_empty())
}

// =============================================================================
// Matching
// =============================================================================

/// Whether the device offers at least the requested amount of every
/// requirement. A requirement the device has no attribute for never matches.
pub fn matches_requirements(device: &BlockDevice, requests: &BTreeMap<String, i128>) -> bool {
    requests.iter().all(|(name, wanted)| {
        device
            .attribute(name)
            .map(|offered| offered >= *wanted)
            .unwrap_or(false)
    })
}

/// Whether `device` may be bound under `criteria`
pub fn qualifies(device: &BlockDevice, criteria: &SelectionCriteria) -> bool {
    if !device.is_available() {
        return false;
    }
    if let Some(host) = &criteria.host_name {
        if device.host_name() != Some(host.as_str()) {
            return false;
        }
    }
    if let Some(device_type) = &criteria.device_type {
        if device.device_type() != Some(device_type.as_str()) {
            return false;
        }
    }
    if let Some(name) = &criteria.device_name {
        if device.metadata.name.as_deref() != Some(name.as_str()) {
            return false;
        }
    }
    matches_requirements(device, &criteria.requests)
}

/// Pick the first qualifying device in list order
pub fn select_device<'a>(
    devices: &'a [BlockDevice],
    criteria: &SelectionCriteria,
) -> Option<&'a BlockDevice> {
    devices.iter().find(|device| qualifies(device, criteria))
}
