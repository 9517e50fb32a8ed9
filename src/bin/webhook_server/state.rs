//! Application state for the webhook callback server

use std::env;
use std::sync::Arc;
use twitch_toolkit::{Result, WebhookConfig, WebhookManager};

/// Settings read from the environment
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub client_id: String,
    pub callback_url: String,
    pub app_token: Option<String>,
    /// Subscribe to stream up/down for this user on startup
    pub stream_user_id: Option<String>,
}

impl ServerConfig {
    /// Read `TWITCH_*` variables and `PORT`
    pub fn from_env() -> std::result::Result<Self, String> {
        let port = match env::var("PORT") {
            Ok(port) => port
                .parse()
                .map_err(|e| format!("Invalid PORT {port}: {e}"))?,
            Err(_) => 3000,
        };
        let client_id =
            env::var("TWITCH_CLIENT_ID").map_err(|_| "TWITCH_CLIENT_ID is not set".to_string())?;
        let callback_url = env::var("TWITCH_CALLBACK_URL")
            .unwrap_or_else(|_| format!("http://127.0.0.1:{port}/webhook"));

        Ok(Self {
            port,
            client_id,
            callback_url,
            app_token: env::var("TWITCH_APP_TOKEN").ok(),
            stream_user_id: env::var("TWITCH_STREAM_USER_ID").ok(),
        })
    }
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<WebhookManager>,
}

impl AppState {
    /// Create the hub manager from server settings
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let mut webhook = WebhookConfig::new(&config.client_id, &config.callback_url);
        if let Some(token) = &config.app_token {
            webhook = webhook.with_bearer_token(token);
        }

        Ok(Self {
            manager: Arc::new(WebhookManager::new(webhook)?),
        })
    }
}
