//! Seed manifests for standalone mode
//!
//! A YAML document listing devices and claims that is loaded into the
//! in-memory stores at startup:
//!
//! ```yaml
//! devices:
//!   - apiVersion: storage.billyronks.io/v1alpha1
//!     kind: BlockDevice
//!     metadata: { name: bd-1, namespace: default }
//!     spec: { path: /dev/sdb, capacity: { storage: 1073741824 } }
//!     status: { state: Active, claimState: Unclaimed }
//! claims: []
//! ```

use serde::Deserialize;
use std::path::Path;
use tracing::info;

use crate::crd::{BlockDevice, BlockDeviceClaim};
use crate::domain::ports::ObjectStore;
use crate::error::Result;

/// Devices and claims to preload
#[derive(Debug, Default, Deserialize)]
pub struct SeedManifest {
    #[serde(default)]
    pub devices: Vec<BlockDevice>,
    #[serde(default)]
    pub claims: Vec<BlockDeviceClaim>,
}

impl SeedManifest {
    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Create every object, devices first. Objects without a namespace land
    /// in `default`.
    pub async fn apply(
        self,
        claims: &dyn ObjectStore<BlockDeviceClaim>,
        devices: &dyn ObjectStore<BlockDevice>,
    ) -> Result<()> {
        let (device_count, claim_count) = (self.devices.len(), self.claims.len());

        for mut device in self.devices {
            device.metadata.namespace.get_or_insert_with(|| "default".to_string());
            devices.create(&device).await?;
        }
        for mut claim in self.claims {
            claim.metadata.namespace.get_or_insert_with(|| "default".to_string());
            claims.create(&claim).await?;
        }

        info!(devices = device_count, claims = claim_count, "Applied seed manifest");
        Ok(())
    }
}
