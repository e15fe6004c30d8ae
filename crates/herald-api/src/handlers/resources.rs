//! Resource registration.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use herald_core::{ChangeDetection, Resource, ResourceId};
use serde::Deserialize;
use tracing::{info, instrument};

use crate::{error::ApiError, AppState};

/// Body of `POST /resources`.
#[derive(Debug, Deserialize)]
pub struct CreateResourceRequest {
    /// Base origins, optionally with a base path.
    pub addresses: Vec<String>,
    /// Wildcard path template relative to each address.
    pub path: String,
    /// Where the revision lives in document content.
    pub change: ChangeDetection,
}

/// Validates and registers a resource. Partitions are created lazily as
/// subscriptions join.
#[instrument(name = "create_resource", skip(state, request), fields(path = %request.path))]
pub async fn create_resource(
    State(state): State<AppState>,
    Json(request): Json<CreateResourceRequest>,
) -> Result<(StatusCode, Json<Resource>), ApiError> {
    let resource = Resource {
        id: ResourceId::new(),
        addresses: request.addresses,
        path: request.path,
        change: request.change,
        partitions: Default::default(),
        created_at: state.clock.now(),
    };
    resource.validate()?;
    state.storage.resources.create(&resource).await?;

    info!(resource_id = %resource.id, "resource registered");
    Ok((StatusCode::CREATED, Json(resource)))
}

/// Returns a resource with its partition occupancy.
#[instrument(name = "get_resource", skip(state))]
pub async fn get_resource(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
) -> Result<Json<Resource>, ApiError> {
    Ok(Json(state.storage.resources.find_by_id(id).await?))
}
