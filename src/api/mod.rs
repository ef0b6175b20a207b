//! Peer wire surface
//!
//! Serves the four `/sync` routes peers call during rounds and announcements,
//! plus `/health`.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

use crate::entities::EntityDb;
use crate::error::EntityError;
use crate::feed::SignedFeed;
use crate::sync::{Announcement, Head, Pub, SyncHandle};

/// State shared across handlers
#[derive(Clone)]
pub struct ApiState {
    pub db: Arc<EntityDb>,
    /// Present when a coordinator is running
    pub sync: Option<SyncHandle>,
}

impl ApiState {
    pub fn new(db: Arc<EntityDb>) -> Self {
        Self { db, sync: None }
    }

    pub fn with_sync(mut self, handle: SyncHandle) -> Self {
        self.sync = Some(handle);
        self
    }
}

/// Handler error rendered as a JSON body
pub struct ApiError(StatusCode, String);

impl From<EntityError> for ApiError {
    fn from(e: EntityError) -> Self {
        error!(error = %e, "Request failed");
        ApiError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "error": self.1 }))).into_response()
    }
}

pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/sync/pubs", get(get_pubs))
        .route("/sync/heads", get(get_heads))
        .route("/sync/feed/:fingerprint", get(get_feed))
        .route("/sync/announce", post(announce))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Known pubs, including this node's own record.
async fn get_pubs(State(state): State<ApiState>) -> Result<Json<Vec<Pub>>, ApiError> {
    let mut pubs = state.db.get_pubs()?;
    if let Some(me) = state.db.get_self()? {
        pubs.push(me);
    }
    Ok(Json(pubs))
}

async fn get_heads(State(state): State<ApiState>) -> Result<Json<Vec<Head>>, ApiError> {
    Ok(Json(state.db.heads()?))
}

async fn get_feed(
    State(state): State<ApiState>,
    Path(fingerprint): Path<String>,
) -> Result<Json<SignedFeed>, ApiError> {
    match state.db.get_feed(&fingerprint)? {
        Some(signed) => Ok(Json(signed)),
        None => Err(ApiError(
            StatusCode::NOT_FOUND,
            format!("unknown feed {}", fingerprint),
        )),
    }
}

/// Register the announcing pub as due and ask for an early round.
async fn announce(
    State(state): State<ApiState>,
    Json(announcement): Json<Announcement>,
) -> Result<StatusCode, ApiError> {
    let origin = &announcement.origin.url;
    if origin.is_empty() {
        return Err(ApiError(StatusCode::BAD_REQUEST, "missing origin url".to_string()));
    }
    let is_self = state.db.get_self()?.map_or(false, |me| &me.url == origin);
    if !is_self {
        state.db.mark_due(origin)?;
        if let Some(sync) = &state.sync {
            sync.nudge();
        }
    }
    debug!(origin = %origin, heads = announcement.heads.len(), "Received announcement");
    Ok(StatusCode::ACCEPTED)
}
