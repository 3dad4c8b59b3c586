//! API Server
//!
//! Serves the REST API until the shutdown token is cancelled.

use crate::domain::ports::{ClaimStoreRef, DeviceStoreRef};
use crate::error::{Error, Result};
use std::net::{Ipv4Addr, SocketAddr};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use super::rest::RestRouter;

// =============================================================================
// Server Configuration
// =============================================================================

/// Configuration for the API server
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// REST API bind address
    pub rest_addr: SocketAddr,
    /// Allow cross-origin requests from any origin
    pub permissive_cors: bool,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            rest_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8090)),
            permissive_cors: true,
        }
    }
}

// =============================================================================
// API Server
// =============================================================================

/// REST API server over the claim and device stores
pub struct ApiServer {
    config: ApiServerConfig,
    claims: ClaimStoreRef,
    devices: DeviceStoreRef,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, claims: ClaimStoreRef, devices: DeviceStoreRef) -> Self {
        Self {
            config,
            claims,
            devices,
        }
    }

    /// Run the API server until `shutdown` is cancelled
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let mut app = RestRouter::new(self.claims.clone(), self.devices.clone())
            .build()
            .layer(TraceLayer::new_for_http());
        if self.config.permissive_cors {
            app = app.layer(CorsLayer::permissive());
        }

        let listener = tokio::net::TcpListener::bind(self.config.rest_addr)
            .await
            .map_err(|e| Error::Internal(format!("Failed to bind REST server: {}", e)))?;
        info!("REST API listening on {}", self.config.rest_addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                info!("REST server shutting down");
            })
            .await
            .map_err(|e| Error::Internal(format!("REST server error: {}", e)))?;

        Ok(())
    }
}
