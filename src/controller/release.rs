//! Release of devices held by a deleted claim

use kube::ResourceExt;
use tracing::{debug, info};

use crate::crd::{BlockDevice, BlockDeviceClaim};
use crate::domain::ports::DeviceStoreRef;
use crate::error::{Error, Result};

/// Devices whose back-reference names the claim with `claim_uid`
pub fn devices_bound_to<'a>(devices: &'a [BlockDevice], claim_uid: &str) -> Vec<&'a BlockDevice> {
    devices
        .iter()
        .filter(|device| device.is_referenced_by(claim_uid))
        .collect()
}

/// Returns devices to the pool when their claim goes away
pub struct ReleaseHandler {
    devices: DeviceStoreRef,
}

impl ReleaseHandler {
    pub fn new(devices: DeviceStoreRef) -> Self {
        Self { devices }
    }

    /// Unclaim every device referencing `claim`. Returns how many were
    /// released; zero when the claim was never bound or already released.
    pub async fn release(&self, claim: &BlockDeviceClaim) -> Result<usize> {
        let Some(claim_uid) = claim.uid() else {
            return Ok(0);
        };
        let devices = self.devices.list(claim.namespace().as_deref()).await?;

        let mut released = 0;
        for device in devices_bound_to(&devices, &claim_uid) {
            let mut unclaimed = device.clone();
            unclaimed.set_unclaimed();
            match self.devices.update(&unclaimed).await {
                Ok(_) => {
                    info!(
                        "Released BlockDevice {} from BlockDeviceClaim {}",
                        device.name_any(),
                        claim.key()
                    );
                    released += 1;
                }
                Err(Error::ResourceNotFound { .. }) => {
                    debug!(device = %device.name_any(), "Device vanished before release");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(released)
    }
}
