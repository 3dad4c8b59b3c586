//! Object store adapters
//!
//! - MemoryStore: versioned in-memory store for standalone mode and tests
//! - KubeStore: `kube::Api` adapter for running in a cluster
//! - SeedManifest: YAML preload for the in-memory store

pub mod kubernetes;
pub mod memory;
pub mod seed;

pub use kubernetes::KubeStore;
pub use memory::MemoryStore;
pub use seed::SeedManifest;
