//! Subscription registration and removal.
//!
//! Creating a subscription claims a slot in a partition of its resource;
//! deleting it releases the slot.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use herald_core::{
    ContentOptions, DeliveryPolicy, Endpoint, PartitionId, ResourceId, Subscription,
    SubscriptionId,
};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{info, instrument, warn};

use crate::{error::ApiError, AppState};

/// Body of `POST /subscriptions`.
#[derive(Debug, Deserialize)]
pub struct CreateSubscriptionRequest {
    /// Resource to subscribe to.
    pub resource_id: ResourceId,
    /// Callback target and per-action overrides.
    pub endpoint: Endpoint,
    /// Response classification and retry policy.
    #[serde(default)]
    pub delivery: DeliveryPolicy,
    /// Body shape.
    #[serde(default)]
    pub content: ContentOptions,
    /// Extra templated values for the envelope.
    #[serde(default)]
    pub data: Map<String, Value>,
}

/// Validates templates against the resource, joins a partition and stores
/// the subscription.
#[instrument(
    name = "create_subscription",
    skip(state, request),
    fields(resource_id = %request.resource_id)
)]
pub async fn create_subscription(
    State(state): State<AppState>,
    Json(request): Json<CreateSubscriptionRequest>,
) -> Result<(StatusCode, Json<Subscription>), ApiError> {
    let resource = state.storage.resources.find_by_id(request.resource_id).await?;

    let mut subscription = Subscription {
        id: SubscriptionId::new(),
        resource_id: resource.id,
        partition: PartitionId::new(),
        endpoint: request.endpoint,
        delivery: request.delivery,
        content: request.content,
        data: request.data,
        created_at: state.clock.now(),
    };
    subscription.validate_against(&resource)?;

    subscription.partition = state.storage.resources.join_partition(resource.id).await?;
    if let Err(error) = state.storage.subscriptions.create(&subscription).await {
        if let Err(leave) =
            state.storage.resources.leave_partition(resource.id, subscription.partition).await
        {
            warn!(
                partition = %subscription.partition,
                error = %leave,
                "failed to release partition slot"
            );
        }
        return Err(error.into());
    }

    info!(
        subscription_id = %subscription.id,
        partition = %subscription.partition,
        "subscription registered"
    );
    Ok((StatusCode::CREATED, Json(subscription)))
}

/// Returns a subscription.
#[instrument(name = "get_subscription", skip(state))]
pub async fn get_subscription(
    State(state): State<AppState>,
    Path(id): Path<SubscriptionId>,
) -> Result<Json<Subscription>, ApiError> {
    Ok(Json(state.storage.subscriptions.find_by_id(id).await?))
}

/// Removes a subscription and frees its partition slot.
#[instrument(name = "delete_subscription", skip(state))]
pub async fn delete_subscription(
    State(state): State<AppState>,
    Path(id): Path<SubscriptionId>,
) -> Result<StatusCode, ApiError> {
    let subscription = state.storage.subscriptions.delete(id).await?;
    state
        .storage
        .resources
        .leave_partition(subscription.resource_id, subscription.partition)
        .await?;

    info!(
        subscription_id = %id,
        partition = %subscription.partition,
        "subscription removed"
    );
    Ok(StatusCode::NO_CONTENT)
}
