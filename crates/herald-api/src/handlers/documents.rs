//! Document ingestion and deletion.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use herald_core::{storage::DocumentWrite, Action, DocumentId, ResourceId};
use herald_delivery::IngestOutcome;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::instrument;

use crate::{error::ApiError, AppState};

/// Body of `POST /documents`.
#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    /// Concrete document URI.
    pub id: String,
    /// Current document content.
    pub content: Map<String, Value>,
}

/// Query of `DELETE /documents`.
#[derive(Debug, Deserialize)]
pub struct DeleteQuery {
    /// Concrete document URI.
    pub id: String,
}

/// What happened to an ingested snapshot.
#[derive(Debug, Serialize)]
pub struct IngestResponse {
    /// Document id as stored.
    pub id: DocumentId,
    /// Resource the id resolved to.
    pub resource_id: ResourceId,
    /// Derived revision.
    pub revision: i64,
    /// `created`, `advanced`, `unchanged` or `stale`.
    pub write: &'static str,
    /// Change handed to the pipeline, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enqueued: Option<Action>,
}

impl From<IngestOutcome> for IngestResponse {
    fn from(outcome: IngestOutcome) -> Self {
        let write = match outcome.write {
            DocumentWrite::Created => "created",
            DocumentWrite::Advanced { .. } => "advanced",
            DocumentWrite::Unchanged => "unchanged",
            DocumentWrite::Stale { .. } => "stale",
        };
        Self {
            id: outcome.document_id,
            resource_id: outcome.resource_id,
            revision: outcome.revision,
            write,
            enqueued: outcome.enqueued,
        }
    }
}

/// Stores a snapshot; a newer revision is queued for notification.
#[instrument(name = "ingest_document", skip(state, request), fields(document_id = %request.id))]
pub async fn ingest_document(
    State(state): State<AppState>,
    Json(request): Json<IngestRequest>,
) -> Result<(StatusCode, Json<IngestResponse>), ApiError> {
    let outcome = state.ingestor.ingest(&request.id, request.content).await?;
    Ok((StatusCode::ACCEPTED, Json(outcome.into())))
}

/// Removes a document and queues the `delete` notification.
#[instrument(name = "delete_document", skip(state))]
pub async fn delete_document(
    State(state): State<AppState>,
    Query(query): Query<DeleteQuery>,
) -> Result<StatusCode, ApiError> {
    state.ingestor.remove(&query.id).await?;
    Ok(StatusCode::ACCEPTED)
}
