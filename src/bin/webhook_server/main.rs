//! Webhook callback server for the Twitch toolkit
//!
//! Receives hub challenges and notifications on `/webhook` and logs every
//! delivered event. Run with: `cargo run --bin webhook-server --features demo`

use axum::{response::IntoResponse, routing::get, Json, Router};
use std::net::SocketAddr;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod routes;
mod state;

use state::{AppState, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "webhook_server=debug,twitch_toolkit=debug,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::from_env()?;
    let state = AppState::new(&config)?;

    let mut events = state.manager.listen();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            tracing::info!(event = %event.name, id = %event.source_id, payload = %event.payload, "Notification received");
        }
    });

    if let Some(user_id) = config.stream_user_id.clone() {
        let manager = state.manager.clone();
        tokio::spawn(async move {
            match manager.subscribe_stream_up_down(&user_id).await {
                Ok(id) => tracing::info!(%id, %user_id, "Subscribed to stream up/down"),
                Err(e) => tracing::error!(error = %e, %user_id, "Stream subscription failed"),
            }
        });
    }

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(health_check))
        .merge(routes::webhook_routes())
        .nest("/api", routes::api_routes())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!(callback = %config.callback_url, "Webhook server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let report = state.manager.destroy().await;
    for (id, error) in &report.failed {
        tracing::warn!(%id, %error, "Subscription left on the hub");
    }
    tracing::info!(removed = report.removed.len(), "Webhook server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "twitch-webhook-server",
        "version": env!("CARGO_PKG_VERSION")
    }))
}
