//! Claim requirement validation
//!
//! A claim is satisfiable in principle only if it requests a strictly
//! positive capacity and every other request parses to a positive quantity.

use kube::ResourceExt;
use std::collections::BTreeMap;

use crate::crd::{BlockDeviceClaim, RESOURCE_CAPACITY};
use crate::error::{Error, Result};

/// Requirements of a claim, parsed to bytes/units
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedRequirements {
    /// Requested capacity in bytes
    pub capacity_bytes: i128,
    /// Every request by name, including capacity
    pub requests: BTreeMap<String, i128>,
}

/// Check the requirement set of `claim`
pub fn validate(claim: &BlockDeviceClaim) -> Result<ValidatedRequirements> {
    let invalid = |reason: String| Error::InvalidRequirement {
        claim: claim.name_any(),
        reason,
    };

    let mut requests = BTreeMap::new();
    for (name, quantity) in &claim.spec.requirements.requests {
        let value = quantity
            .value()
            .map_err(|e| invalid(format!("{}: {}", name, e)))?;
        if value <= 0 {
            return Err(invalid(format!(
                "{} must be positive, got {}",
                name, quantity
            )));
        }
        requests.insert(name.clone(), value);
    }

    let capacity_bytes = *requests
        .get(RESOURCE_CAPACITY)
        .ok_or_else(|| invalid(format!("missing {} request", RESOURCE_CAPACITY)))?;

    Ok(ValidatedRequirements {
        capacity_bytes,
        requests,
    })
}
