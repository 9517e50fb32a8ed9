//! Routes for the webhook callback server

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::UNIX_EPOCH;
use twitch_toolkit::webhook::HubSubscriptionInfo;

use crate::state::AppState;

/// Standard API response wrapper
#[derive(Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
        }
    }
}

#[derive(Serialize)]
pub struct SubscriptionView {
    pub id: String,
    pub topic: String,
    pub event_name: String,
    pub status: String,
    pub subscribed_at: u64,
}

impl From<HubSubscriptionInfo> for SubscriptionView {
    fn from(info: HubSubscriptionInfo) -> Self {
        Self {
            id: info.id,
            topic: info.topic,
            event_name: info.event_name,
            status: format!("{:?}", info.status).to_lowercase(),
            subscribed_at: info
                .subscribed_at
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
        }
    }
}

#[derive(Deserialize)]
pub struct StreamParams {
    pub user_id: String,
}

/// Hub callback route
pub fn webhook_routes() -> Router<AppState> {
    Router::new().route("/webhook", get(hub_callback).post(hub_callback))
}

/// Subscription management routes
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/subscriptions", get(list_subscriptions))
        .route("/subscriptions/:id", delete(unsubscribe))
        .route("/subscriptions/streams", axum::routing::post(subscribe_stream))
}

async fn hub_callback(
    State(state): State<AppState>,
    method: Method,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    let reply = state
        .manager
        .handle_request(&method, &headers, &query, &body)
        .await;
    match reply.body {
        Some(body) => (reply.status, body).into_response(),
        None => reply.status.into_response(),
    }
}

async fn list_subscriptions(State(state): State<AppState>) -> impl IntoResponse {
    let subscriptions: Vec<SubscriptionView> = state
        .manager
        .subscriptions()
        .await
        .into_iter()
        .map(SubscriptionView::from)
        .collect();
    Json(ApiResponse::success(subscriptions))
}

async fn subscribe_stream(
    State(state): State<AppState>,
    Json(params): Json<StreamParams>,
) -> impl IntoResponse {
    // Resolves only after the hub has called back with a challenge
    match state.manager.subscribe_stream_up_down(&params.user_id).await {
        Ok(id) => (StatusCode::OK, Json(ApiResponse::success(id))),
        Err(e) => (
            StatusCode::BAD_GATEWAY,
            Json(ApiResponse::<String>::error(e.to_string())),
        ),
    }
}

async fn unsubscribe(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.manager.unsubscribe(&id).await {
        Ok(()) => (StatusCode::OK, Json(ApiResponse::success(id))),
        Err(e @ twitch_toolkit::Error::NotFound(_)) => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::<String>::error(e.to_string())),
        ),
        Err(e) => (
            StatusCode::BAD_GATEWAY,
            Json(ApiResponse::<String>::error(e.to_string())),
        ),
    }
}
