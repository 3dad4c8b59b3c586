//! Binding executor
//!
//! Binds one device to one claim as two ordered writes: the device first,
//! conditioned on its observed resourceVersion, then the claim. Losing the
//! race on the device write leaves the claim untouched.

use kube::ResourceExt;
use tracing::{debug, info};

use crate::crd::{BlockDevice, BlockDeviceClaim, ClaimPhase, ClaimState};
use crate::domain::ports::{ClaimStoreRef, DeviceStoreRef};
use crate::error::Result;

/// Objects as persisted by a successful bind
#[derive(Debug, Clone)]
pub struct Binding {
    pub device: BlockDevice,
    pub claim: BlockDeviceClaim,
}

/// Performs the coupled device/claim transition
pub struct BindingExecutor {
    claims: ClaimStoreRef,
    devices: DeviceStoreRef,
}

impl BindingExecutor {
    pub fn new(claims: ClaimStoreRef, devices: DeviceStoreRef) -> Self {
        Self { claims, devices }
    }

    /// Bind `device` to `claim`.
    ///
    /// Both objects must carry the resourceVersion they were read at. A
    /// device that already references this claim and is Claimed is not
    /// written again, which lets a half-finished bind be completed.
    pub async fn bind(&self, device: &BlockDevice, claim: &BlockDeviceClaim) -> Result<Binding> {
        let claim_uid = claim.uid().unwrap_or_default();
        let device_name = device.name_any();

        let device = if device.is_referenced_by(&claim_uid)
            && device.claim_state() == ClaimState::Claimed
        {
            debug!(device = %device_name, claim = %claim.name_any(), "Device already claimed, completing bind");
            device.clone()
        } else {
            let mut claimed = device.clone();
            claimed.set_claimed_by(claim);
            // A conflict here means another claim got the device first
            self.devices.update(&claimed).await?
        };

        let mut bound = claim.clone();
        bound.add_finalizer();
        bound.set_phase(ClaimPhase::Done);
        bound
            .status
            .get_or_insert_with(Default::default)
            .block_device_name = Some(device_name.clone());
        let claim = self.claims.update(&bound).await?;

        info!(
            "Bound BlockDevice {} to BlockDeviceClaim {}",
            device_name,
            claim.key()
        );
        Ok(Binding { device, claim })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::fixtures::{fake_claim, fake_device};
    use crate::domain::ports::{ObjectKey, ObjectStore};
    use crate::error::Error;
    use crate::store::MemoryStore;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_bind_updates_device_then_claim() {
        let claims = MemoryStore::<BlockDeviceClaim>::new();
        let devices = MemoryStore::<BlockDevice>::new();
        let claim = claims.create(&fake_claim("bdc-1", "102400", "uid-1")).await.unwrap();
        let device = devices.create(&fake_device("bd-1", 102400)).await.unwrap();

        let executor = BindingExecutor::new(claims.clone(), devices.clone());
        let binding = executor.bind(&device, &claim).await.unwrap();

        assert!(binding.device.is_referenced_by(&claim.uid().unwrap()));
        assert_eq!(binding.device.claim_state(), ClaimState::Claimed);
        assert_eq!(binding.claim.phase(), ClaimPhase::Done);
        assert_eq!(binding.claim.bound_device_name(), Some("bd-1"));
        assert!(binding.claim.has_finalizer());
    }

    #[tokio::test]
    async fn test_lost_race_leaves_claim_untouched() {
        let claims = MemoryStore::<BlockDeviceClaim>::new();
        let devices = MemoryStore::<BlockDevice>::new();
        let winner = claims.create(&fake_claim("bdc-1", "1024", "uid-1")).await.unwrap();
        let loser = claims.create(&fake_claim("bdc-2", "1024", "uid-2")).await.unwrap();
        let device = devices.create(&fake_device("bd-1", 102400)).await.unwrap();

        let executor = BindingExecutor::new(claims.clone(), devices.clone());
        executor.bind(&device, &winner).await.unwrap();

        let writes_before = claims.write_count();
        let result = executor.bind(&device, &loser).await;
        assert_matches!(result, Err(Error::Conflict { .. }));
        assert_eq!(claims.write_count(), writes_before);

        let stored = devices.get(&ObjectKey::of(&device)).await.unwrap();
        assert!(stored.is_referenced_by(&winner.uid().unwrap()));
        let loser = claims.get(&loser.key()).await.unwrap();
        assert_eq!(loser.phase(), ClaimPhase::Empty);
    }
}
