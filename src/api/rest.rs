//! REST API Handlers
//!
//! Requester and discovery facing endpoints over the object stores:
//! claims can be listed, inspected, created and deleted; devices can be
//! listed, inspected and registered.

use crate::crd::{
    parse_quantity, BlockDevice, BlockDeviceClaim, BlockDeviceClaimSpec, BlockDeviceSpec,
    BlockDeviceStatus, ClaimRequirements, ClaimState, DeviceCapacity, DeviceDetails, DeviceState,
    Quantity, HOSTNAME_LABEL, RESOURCE_CAPACITY,
};
use crate::domain::ports::{ClaimStoreRef, DeviceStoreRef, ObjectKey};
use crate::error::Error;
use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{error, info};

// =============================================================================
// Request/Response Types
// =============================================================================

/// Claim creation request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateClaimRequest {
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
    /// Requested capacity (e.g., "10Gi", "102400")
    pub capacity: String,
    #[serde(default)]
    pub host_name: Option<String>,
    #[serde(default)]
    pub device_type: Option<String>,
    #[serde(default)]
    pub block_device_name: Option<String>,
}

/// Device registration request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterDeviceRequest {
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
    pub path: String,
    /// Capacity (e.g., "100Gi")
    pub capacity: String,
    pub host_name: String,
    #[serde(default)]
    pub device_type: Option<String>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

/// Claim info response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimResponse {
    pub name: String,
    pub namespace: Option<String>,
    pub uid: Option<String>,
    pub requests: BTreeMap<String, String>,
    pub phase: String,
    pub block_device_name: Option<String>,
    pub deleting: bool,
}

impl From<&BlockDeviceClaim> for ClaimResponse {
    fn from(claim: &BlockDeviceClaim) -> Self {
        Self {
            name: claim.name_any(),
            namespace: claim.namespace(),
            uid: claim.uid(),
            requests: claim
                .spec
                .requirements
                .requests
                .iter()
                .map(|(k, v)| (k.clone(), v.to_string()))
                .collect(),
            phase: claim.phase().to_string(),
            block_device_name: claim.bound_device_name().map(str::to_string),
            deleting: claim.is_deleting(),
        }
    }
}

/// Device info response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceResponse {
    pub name: String,
    pub namespace: Option<String>,
    pub host_name: Option<String>,
    pub path: String,
    pub capacity_bytes: u64,
    pub device_type: Option<String>,
    pub state: String,
    pub claim_state: String,
    pub claimed_by: Option<String>,
}

impl From<&BlockDevice> for DeviceResponse {
    fn from(device: &BlockDevice) -> Self {
        Self {
            name: device.name_any(),
            namespace: device.namespace(),
            host_name: device.host_name().map(str::to_string),
            path: device.spec.path.clone(),
            capacity_bytes: device.capacity_bytes(),
            device_type: device.device_type().map(str::to_string),
            state: device.state().to_string(),
            claim_state: device.claim_state().to_string(),
            claimed_by: device.spec.claim_ref.as_ref().map(|r| r.name.clone()),
        }
    }
}

/// Namespace filter for list endpoints
#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub namespace: Option<String>,
}

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

// =============================================================================
// REST Router
// =============================================================================

/// REST API router builder
pub struct RestRouter {
    claims: ClaimStoreRef,
    devices: DeviceStoreRef,
}

impl RestRouter {
    pub fn new(claims: ClaimStoreRef, devices: DeviceStoreRef) -> Self {
        Self { claims, devices }
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        let state = AppState {
            claims: self.claims,
            devices: self.devices,
        };

        Router::new()
            // Claim endpoints
            .route("/v1/claims", get(list_claims).post(create_claim))
            .route(
                "/v1/claims/:namespace/:name",
                get(get_claim).delete(delete_claim),
            )
            // Device endpoints
            .route("/v1/devices", get(list_devices).post(register_device))
            .route("/v1/devices/:namespace/:name", get(get_device))
            // Health endpoints
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .with_state(state)
    }
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    claims: ClaimStoreRef,
    devices: DeviceStoreRef,
}

// =============================================================================
// Handlers
// =============================================================================

/// List claims
async fn list_claims(State(state): State<AppState>, Query(query): Query<ListQuery>) -> Response {
    match state.claims.list(query.namespace.as_deref()).await {
        Ok(claims) => {
            let body: Vec<ClaimResponse> = claims.iter().map(ClaimResponse::from).collect();
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(e) => error_response(&e),
    }
}

/// Get claim info
async fn get_claim(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> Response {
    match state.claims.get(&ObjectKey::namespaced(namespace, name)).await {
        Ok(claim) => (StatusCode::OK, Json(ClaimResponse::from(&claim))).into_response(),
        Err(e) => error_response(&e),
    }
}

/// Create a claim
async fn create_claim(
    State(state): State<AppState>,
    Json(request): Json<CreateClaimRequest>,
) -> Response {
    info!("Creating BlockDeviceClaim: {}", request.name);

    if let Err(e) = parse_quantity(&request.capacity) {
        return error_response(&e);
    }

    let mut claim = BlockDeviceClaim::new(
        &request.name,
        BlockDeviceClaimSpec {
            requirements: ClaimRequirements::with_capacity(Quantity::from(request.capacity)),
            host_name: request.host_name,
            device_type: request.device_type,
            block_device_name: request.block_device_name,
        },
    );
    claim.metadata.namespace = Some(request.namespace.unwrap_or_else(|| "default".into()));

    match state.claims.create(&claim).await {
        Ok(created) => (StatusCode::CREATED, Json(ClaimResponse::from(&created))).into_response(),
        Err(e) => error_response(&e),
    }
}

/// Request claim deletion; completes once its device is released
async fn delete_claim(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> Response {
    let key = ObjectKey::namespaced(namespace, name);
    let mut claim = match state.claims.get(&key).await {
        Ok(claim) => claim,
        Err(e) => return error_response(&e),
    };
    claim.metadata.resource_version = None;

    match state.claims.delete(&claim).await {
        Ok(()) => {
            info!("Deletion requested for BlockDeviceClaim {}", key);
            StatusCode::ACCEPTED.into_response()
        }
        Err(e) => error_response(&e),
    }
}

/// List devices
async fn list_devices(State(state): State<AppState>, Query(query): Query<ListQuery>) -> Response {
    match state.devices.list(query.namespace.as_deref()).await {
        Ok(devices) => {
            let body: Vec<DeviceResponse> = devices.iter().map(DeviceResponse::from).collect();
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(e) => error_response(&e),
    }
}

/// Get device info
async fn get_device(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> Response {
    match state.devices.get(&ObjectKey::namespaced(namespace, name)).await {
        Ok(device) => (StatusCode::OK, Json(DeviceResponse::from(&device))).into_response(),
        Err(e) => error_response(&e),
    }
}

/// Register a discovered device
async fn register_device(
    State(state): State<AppState>,
    Json(request): Json<RegisterDeviceRequest>,
) -> Response {
    info!("Registering BlockDevice {} on {}", request.name, request.host_name);

    let storage = match parse_quantity(&request.capacity).map(u64::try_from) {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(_)) => {
            return error_response(&Error::Validation(format!(
                "{} out of range: {}",
                RESOURCE_CAPACITY, request.capacity
            )))
        }
        Err(e) => return error_response(&e),
    };

    let mut device = BlockDevice::new(
        &request.name,
        BlockDeviceSpec {
            path: request.path,
            capacity: DeviceCapacity {
                storage,
                logical_sector_size: None,
            },
            details: DeviceDetails {
                device_type: request.device_type,
                ..Default::default()
            },
            claim_ref: None,
        },
    );
    device.metadata.namespace = Some(request.namespace.unwrap_or_else(|| "default".into()));
    device
        .labels_mut()
        .insert(HOSTNAME_LABEL.to_string(), request.host_name);
    device.status = Some(BlockDeviceStatus {
        state: if request.active {
            DeviceState::Active
        } else {
            DeviceState::Inactive
        },
        claim_state: ClaimState::Unclaimed,
    });

    match state.devices.create(&device).await {
        Ok(created) => (StatusCode::CREATED, Json(DeviceResponse::from(&created))).into_response(),
        Err(e) => error_response(&e),
    }
}

/// Health check
async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness check
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.devices.list(None).await {
        Ok(_) => (StatusCode::OK, "ready"),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "object store unavailable"),
    }
}

// =============================================================================
// Error Mapping
// =============================================================================

fn error_response(err: &Error) -> Response {
    let (status, code) = match err {
        Error::ResourceNotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
        Error::ResourceExists { .. } => (StatusCode::CONFLICT, "already_exists"),
        Error::Conflict { .. } => (StatusCode::CONFLICT, "conflict"),
        Error::Validation(_) | Error::QuantityParse(_) | Error::InvalidRequirement { .. } => {
            (StatusCode::BAD_REQUEST, "invalid_request")
        }
        Error::StoreUnavailable(_) | Error::Kube(_) => {
            (StatusCode::SERVICE_UNAVAILABLE, "store_unavailable")
        }
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
    };
    if status.is_server_error() {
        error!("API request failed: {}", err);
    }

    (
        status,
        Json(ApiErrorResponse {
            error: code.into(),
            message: err.to_string(),
            details: None,
        }),
    )
        .into_response()
}
