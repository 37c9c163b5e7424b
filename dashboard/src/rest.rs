use crate::errors::Error;
use crate::history::{self, parse_hours};
use crate::model::{Failure, HistoricalResponse, LatestResponse, StatsResponse};
use crate::relay::LiveRelay;
use crate::store::ReadingStore;
use crate::stream::{live_stream, StreamItem};
use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{sse::Sse, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use futures_util::StreamExt;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct AppState {
    pub relay: LiveRelay,
    /// `None` when no store is configured or it could not be reached at startup.
    pub store: Option<Arc<dyn ReadingStore>>,
    pub default_device_id: String,
    pub heartbeat: Duration,
}

#[derive(Debug, Deserialize)]
pub struct HistoricalQuery {
    device_id: Option<String>,
    hours: Option<String>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/latest", get(get_latest))
        .route("/api/stream", get(get_stream))
        .route("/api/historical", get(get_historical))
        .route("/api/stats", get(get_stats))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn get_latest(State(state): State<AppState>) -> Response {
    match state.relay.latest() {
        Some(snapshot) => Json(LatestResponse {
            success: true,
            data: snapshot.as_ref(),
            timestamp: snapshot.timestamp,
        })
        .into_response(),
        None => Json(Failure::message("No MQTT messages yet")).into_response(),
    }
}

async fn get_stream(State(state): State<AppState>) -> impl IntoResponse {
    debug!("Opening live stream");
    let events = live_stream(state.relay.subscribe(), state.heartbeat).map(StreamItem::into_event);

    ([(header::CACHE_CONTROL, "no-cache")], Sse::new(events))
}

async fn get_historical(
    State(state): State<AppState>,
    Query(params): Query<HistoricalQuery>,
) -> Result<Json<HistoricalResponse>, AppError> {
    let hours = parse_hours(params.hours.as_deref())?;
    let device_id = params
        .device_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| state.default_device_id.clone());

    let store = state.store.as_ref().ok_or(Error::StoreUnavailable)?;
    let data = history::historical(store.as_ref(), &device_id, hours, Utc::now().timestamp()).await?;

    Ok(Json(HistoricalResponse {
        success: true,
        count: data.len(),
        data,
    }))
}

async fn get_stats(State(state): State<AppState>) -> Response {
    let Some(store) = state.store.as_ref() else {
        return Json(Failure::message("Store not available")).into_response();
    };

    match history::stats(store.as_ref(), &state.default_device_id, Utc::now().timestamp()).await {
        Ok(Some(stats)) => Json(StatsResponse {
            success: true,
            stats,
        })
        .into_response(),
        Ok(None) => Json(Failure::message("No data")).into_response(),
        Err(e) => {
            warn!("Stats query failed: {}", e);
            Json(Failure::message(e.to_string())).into_response()
        }
    }
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "live_viewers": state.relay.subscriber_count(),
        "has_live_data": state.relay.latest().is_some(),
        "store_connected": state.store.is_some(),
    }))
}

/// Failures still answer with a `success: false` envelope; only bad
/// parameters change the status code.
pub struct AppError(Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            Error::InvalidQuery(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::OK,
        };
        warn!("API error: {}", self.0);
        (status, Json(Failure::error(self.0.to_string()))).into_response()
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}
