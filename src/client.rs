//! HTTP client wrapper for the Twitch Helix API hub

use reqwest::Client as ReqwestClient;

use crate::error::{Error, Result};

/// Base URL for the Helix API
pub const API_BASE_URL: &str = "https://api.twitch.tv/helix";

/// Twitch API client used for hub (un)subscribe requests
#[derive(Debug, Clone)]
pub struct Client {
    http: ReqwestClient,
    client_id: String,
    base_url: String,
    bearer_token: Option<String>,
}

impl Client {
    /// Create a new client against the public Helix API
    pub fn new(client_id: impl Into<String>) -> Result<Self> {
        Self::with_base_url(client_id, API_BASE_URL)
    }

    /// Create a new client against a custom base URL
    pub fn with_base_url(client_id: impl Into<String>, base_url: impl Into<String>) -> Result<Self> {
        let http = ReqwestClient::builder().build().map_err(Error::Http)?;

        Ok(Self {
            http,
            client_id: client_id.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            bearer_token: None,
        })
    }

    /// Attach an app access token sent as `Authorization: Bearer`
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Get the client id sent with every request
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Get the hub endpoint URL
    pub fn hub_url(&self) -> String {
        format!("{}/webhooks/hub", self.base_url)
    }

    /// POST a form-encoded request to the hub.
    ///
    /// Success only means the hub accepted the request; the subscription
    /// itself is confirmed later through the callback.
    pub async fn post_hub(&self, form: &[(&str, String)]) -> Result<()> {
        let mut request = self
            .http
            .post(self.hub_url())
            .header("Client-ID", &self.client_id)
            .form(form);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(Error::Http)?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.map_err(Error::Http)?;
        if let Ok(error_obj) = serde_json::from_str::<serde_json::Value>(&body) {
            if let Some(message) = error_obj.get("message").and_then(|v| v.as_str()) {
                return Err(Error::Api(format!("HTTP {} - {}", status.as_u16(), message)));
            }
        }
        Err(Error::Api(format!("HTTP {} - {}", status.as_u16(), body)))
    }
}
