//! Hub subscription manager
//!
//! Subscriptions are confirmed asynchronously: the outbound hub request only
//! tells us the hub accepted it, the subscription becomes live when the hub
//! calls back with a challenge GET. Notifications then arrive as signed POSTs.

use rand::distributions::Alphanumeric;
use rand::Rng;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, SystemTime};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn, Instrument, Span};

use super::signature::{self, SIGNATURE_HEADER};
use crate::client::{Client, API_BASE_URL};
use crate::correlation::{self, CorrelationTable};
use crate::error::{Error, Result};
use crate::events::{Event, EventSink};
use crate::topic::{self, STREAM_UP_DOWN_EVENT, USER_FOLLOWS_EVENT};

/// Default lease requested from the hub (10 days)
pub const DEFAULT_LEASE_SECONDS: u64 = 864_000;

const SECRET_LEN: usize = 32;

/// Configuration for [`WebhookManager`]
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    /// Application client id sent as `Client-ID`
    pub client_id: String,
    /// Public URL the hub calls back
    pub callback_url: String,
    /// Helix API base URL
    pub api_base_url: String,
    /// App access token sent as `Authorization: Bearer`
    pub bearer_token: Option<String>,
    /// Requested lease duration
    pub lease_seconds: u64,
    /// How long to wait for the hub callback (None waits forever)
    pub challenge_timeout: Option<Duration>,
}

impl WebhookConfig {
    /// Create a config with default lease and no challenge timeout
    pub fn new(client_id: impl Into<String>, callback_url: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            callback_url: callback_url.into(),
            api_base_url: API_BASE_URL.to_string(),
            bearer_token: None,
            lease_seconds: DEFAULT_LEASE_SECONDS,
            challenge_timeout: None,
        }
    }

    /// Use a custom API base URL
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.api_base_url = base_url.into();
        self
    }

    /// Send an app access token with hub requests
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    /// Set the requested lease duration
    pub fn lease_seconds(mut self, seconds: u64) -> Self {
        self.lease_seconds = seconds;
        self
    }

    /// Bound the wait for hub callbacks
    pub fn challenge_timeout(mut self, timeout: Duration) -> Self {
        self.challenge_timeout = Some(timeout);
        self
    }
}

/// Lifecycle of a hub subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubStatus {
    /// Requested, waiting for the challenge
    Pending,
    /// Challenge answered, notifications flow
    Confirmed,
    /// Unsubscribe requested, waiting for the challenge
    Unsubscribing,
}

/// Secret-free view of a hub subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubSubscriptionInfo {
    /// Subscription id, also the `item.id` of its callback URL
    pub id: String,
    /// Hub topic URL
    pub topic: String,
    /// Name notifications are emitted under
    pub event_name: String,
    /// When the subscribe request was made
    pub subscribed_at: SystemTime,
    /// Current lifecycle state
    pub status: HubStatus,
}

struct HubSubscription {
    id: String,
    topic: String,
    event_name: String,
    secret: String,
    subscribed_at: SystemTime,
    seq: u64,
    status: HubStatus,
}

impl std::fmt::Debug for HubSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubSubscription")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("event_name", &self.event_name)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl HubSubscription {
    fn info(&self) -> HubSubscriptionInfo {
        HubSubscriptionInfo {
            id: self.id.clone(),
            topic: self.topic.clone(),
            event_name: self.event_name.clone(),
            subscribed_at: self.subscribed_at,
            status: self.status,
        }
    }
}

#[derive(Debug, Default)]
struct HubState {
    subscriptions: HashMap<String, HubSubscription>,
    // Keyed by subscription id; at most one outstanding challenge each
    challenges: CorrelationTable<String, ()>,
    next_seq: u64,
}

/// Answer to an inbound hub request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubReply {
    /// HTTP status to answer with
    pub status: StatusCode,
    /// Response body; the challenge string when verifying
    pub body: Option<String>,
}

impl HubReply {
    fn status(status: StatusCode) -> Self {
        Self { status, body: None }
    }

    fn text(body: impl Into<String>) -> Self {
        Self {
            status: StatusCode::OK,
            body: Some(body.into()),
        }
    }
}

/// Outcome of [`WebhookManager::destroy`]
#[derive(Debug, Default)]
pub struct DestroyReport {
    /// Subscriptions the hub confirmed removing
    pub removed: Vec<String>,
    /// Subscriptions whose unsubscribe failed
    pub failed: Vec<(String, Error)>,
}

impl DestroyReport {
    /// Check if every unsubscribe succeeded
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Manages WebSub subscriptions against the Twitch hub
pub struct WebhookManager {
    client: Client,
    config: WebhookConfig,
    state: Mutex<HubState>,
    events: EventSink,
    span: Span,
}

impl std::fmt::Debug for WebhookManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookManager")
            .field("callback_url", &self.config.callback_url)
            .field("hub_url", &self.client.hub_url())
            .finish_non_exhaustive()
    }
}

impl WebhookManager {
    /// Create a new manager; logs go to a `webhook` span
    pub fn new(config: WebhookConfig) -> Result<Self> {
        let span = tracing::info_span!("webhook", callback = %config.callback_url);
        Self::with_span(config, span)
    }

    /// Create a new manager logging under the given span
    pub fn with_span(config: WebhookConfig, span: Span) -> Result<Self> {
        let mut client = Client::with_base_url(&config.client_id, &config.api_base_url)?;
        if let Some(token) = &config.bearer_token {
            client = client.with_bearer_token(token);
        }

        Ok(Self {
            client,
            config,
            state: Mutex::new(HubState::default()),
            events: EventSink::new(),
            span,
        })
    }

    /// Get the manager configuration
    pub fn config(&self) -> &WebhookConfig {
        &self.config
    }

    /// The event sink notifications are emitted on
    pub fn events(&self) -> &EventSink {
        &self.events
    }

    /// Register a handler for an event name
    pub async fn on<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.events.on(name, handler).await;
    }

    /// Receive every notification emitted from now on
    pub fn listen(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.events.listen()
    }

    /// Tracked subscriptions in registration order
    pub async fn subscriptions(&self) -> Vec<HubSubscriptionInfo> {
        let state = self.state.lock().await;
        let mut subscriptions: Vec<&HubSubscription> = state.subscriptions.values().collect();
        subscriptions.sort_by_key(|s| s.seq);
        subscriptions.into_iter().map(HubSubscription::info).collect()
    }

    /// Ids of subscriptions waiting for a hub callback
    pub async fn pending_challenges(&self) -> Vec<String> {
        let mut ids = self.state.lock().await.challenges.tokens();
        ids.sort();
        ids
    }

    /// Subscribe to a hub topic.
    ///
    /// Resolves with the subscription id once the hub verifies the callback
    /// with a challenge. Notifications are emitted as `event_name`.
    pub async fn subscribe(&self, topic: &str, event_name: &str) -> Result<String> {
        self.subscribe_inner(topic, event_name)
            .instrument(self.span.clone())
            .await
    }

    /// Subscribe to follow notifications; `from_id` wins if both are given
    pub async fn subscribe_user_follows(
        &self,
        from_id: Option<&str>,
        to_id: Option<&str>,
    ) -> Result<String> {
        if from_id.is_none() && to_id.is_none() {
            return Err(Error::InvalidParameter(
                "One of from_id or to_id is required".to_string(),
            ));
        }
        let topic = topic::user_follows_topic(self.client.base_url(), from_id, to_id);
        self.subscribe(&topic, USER_FOLLOWS_EVENT).await
    }

    /// Subscribe to stream up/down notifications for a user
    pub async fn subscribe_stream_up_down(&self, user_id: &str) -> Result<String> {
        if user_id.is_empty() {
            return Err(Error::InvalidParameter("Missing user id".to_string()));
        }
        let topic = topic::stream_topic(self.client.base_url(), user_id);
        self.subscribe(&topic, STREAM_UP_DOWN_EVENT).await
    }

    /// Unsubscribe a tracked subscription.
    ///
    /// Resolves once the hub confirms with a challenge GET for the same id.
    pub async fn unsubscribe(&self, id: &str) -> Result<()> {
        self.unsubscribe_inner(id)
            .instrument(self.span.clone())
            .await
    }

    /// Unsubscribe everything, one subscription at a time, then forget all
    /// state. A failed unsubscribe does not stop the others.
    pub async fn destroy(&self) -> DestroyReport {
        async {
            let ids: Vec<String> = self
                .subscriptions()
                .await
                .into_iter()
                .map(|info| info.id)
                .collect();
            debug!(count = ids.len(), "Draining hub subscriptions");

            let mut report = DestroyReport::default();
            for id in ids {
                match self.unsubscribe_inner(&id).await {
                    Ok(()) => report.removed.push(id),
                    Err(e) => {
                        warn!(id = %id, error = %e, "Failed to unsubscribe");
                        report.failed.push((id, e));
                    }
                }
            }

            let mut state = self.state.lock().await;
            state.subscriptions.clear();
            state.challenges.reject_all(|| Error::Closed);
            info!(
                removed = report.removed.len(),
                failed = report.failed.len(),
                "Hub subscriptions drained"
            );
            report
        }
        .instrument(self.span.clone())
        .await
    }

    /// Handle an inbound hub request on the callback URL.
    ///
    /// GET carries challenges and denials, POST carries notifications.
    pub async fn handle_request(
        &self,
        method: &Method,
        headers: &HeaderMap,
        query: &HashMap<String, String>,
        body: &[u8],
    ) -> HubReply {
        async {
            if method == Method::GET {
                self.handle_get(query).await
            } else if method == Method::POST {
                self.handle_post(headers, query, body).await
            } else {
                warn!(%method, "Unsupported hub request method");
                HubReply::status(StatusCode::METHOD_NOT_ALLOWED)
            }
        }
        .instrument(self.span.clone())
        .await
    }

    async fn subscribe_inner(&self, topic: &str, event_name: &str) -> Result<String> {
        if topic.is_empty() {
            return Err(Error::InvalidParameter("Missing topic".to_string()));
        }
        if event_name.is_empty() {
            return Err(Error::InvalidParameter("Missing event name".to_string()));
        }

        let id = correlation::new_token();
        let secret = generate_secret();

        // Registered before the request so an early challenge finds it
        let rx = {
            let mut state = self.state.lock().await;
            let seq = state.next_seq;
            state.next_seq += 1;
            let rx = state.challenges.register(id.clone(), ())?;
            state.subscriptions.insert(
                id.clone(),
                HubSubscription {
                    id: id.clone(),
                    topic: topic.to_string(),
                    event_name: event_name.to_string(),
                    secret: secret.clone(),
                    subscribed_at: SystemTime::now(),
                    seq,
                    status: HubStatus::Pending,
                },
            );
            rx
        };

        let form = self.hub_form("subscribe", &id, topic, &secret);
        if let Err(e) = self.client.post_hub(&form).await {
            warn!(id = %id, topic, error = %e, "Hub refused subscription request");
            let mut state = self.state.lock().await;
            state.subscriptions.remove(&id);
            state.challenges.take(&id);
            return Err(e);
        }
        debug!(id = %id, topic, "Hub accepted subscription request, waiting for challenge");

        self.await_challenge(&id, rx).await?;
        info!(id = %id, topic, event_name, "Hub subscription confirmed");
        Ok(id)
    }

    async fn unsubscribe_inner(&self, id: &str) -> Result<()> {
        let (topic, secret, previous, rx) = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let subscription = state
                .subscriptions
                .get_mut(id)
                .ok_or_else(|| Error::NotFound(format!("Subscription with id {id} missing")))?;
            let previous = subscription.status;
            subscription.status = HubStatus::Unsubscribing;
            let topic = subscription.topic.clone();
            let secret = subscription.secret.clone();

            if let Some(pending) = state.challenges.take(id) {
                pending.reject(Error::Cancelled(format!(
                    "Subscription {id} is being unsubscribed"
                )));
            }
            let rx = state.challenges.register(id, ())?;
            (topic, secret, previous, rx)
        };

        let form = self.hub_form("unsubscribe", id, &topic, &secret);
        if let Err(e) = self.client.post_hub(&form).await {
            let mut state = self.state.lock().await;
            state.challenges.take(id);
            if let Some(subscription) = state.subscriptions.get_mut(id) {
                subscription.status = previous;
            }
            return Err(e);
        }
        debug!(id = %id, topic = %topic, "Hub accepted unsubscribe request, waiting for challenge");

        self.await_challenge(id, rx).await?;
        info!(id = %id, "Hub subscription removed");
        Ok(())
    }

    async fn await_challenge(
        &self,
        id: &str,
        rx: oneshot::Receiver<Result<String>>,
    ) -> Result<String> {
        let received = match self.config.challenge_timeout {
            None => rx.await,
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(received) => received,
                Err(_) => {
                    warn!(id = %id, ?limit, "No hub challenge received");
                    let mut state = self.state.lock().await;
                    state.challenges.take(id);
                    let unconfirmed = state
                        .subscriptions
                        .get(id)
                        .map(|subscription| subscription.status);
                    match unconfirmed {
                        Some(HubStatus::Pending) => {
                            state.subscriptions.remove(id);
                        }
                        Some(HubStatus::Unsubscribing) => {
                            if let Some(subscription) = state.subscriptions.get_mut(id) {
                                subscription.status = HubStatus::Confirmed;
                            }
                        }
                        _ => {}
                    }
                    return Err(Error::Timeout);
                }
            },
        };
        received.map_err(|_| Error::Cancelled(format!("Challenge for {id} was dropped")))?
    }

    fn hub_form(&self, mode: &str, id: &str, topic: &str, secret: &str) -> Vec<(&'static str, String)> {
        let separator = if self.config.callback_url.contains('?') { '&' } else { '?' };
        vec![
            (
                "hub.callback",
                format!("{}{separator}item.id={id}", self.config.callback_url),
            ),
            ("hub.mode", mode.to_string()),
            ("hub.topic", topic.to_string()),
            ("hub.lease_seconds", self.config.lease_seconds.to_string()),
            ("hub.secret", secret.to_string()),
        ]
    }

    async fn handle_get(&self, query: &HashMap<String, String>) -> HubReply {
        let Some(id) = query.get("item.id") else {
            warn!("Missing item.id parameter");
            return HubReply::status(StatusCode::BAD_REQUEST);
        };

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let Some(subscription) = state.subscriptions.get_mut(id) else {
            warn!(id = %id, "Subscription with id missing");
            return HubReply::status(StatusCode::GONE);
        };

        if query.get("hub.mode").map(String::as_str) == Some("denied") {
            let reason = query
                .get("hub.reason")
                .cloned()
                .unwrap_or_else(|| "unknown".to_string());
            warn!(id = %id, reason = %reason, "Hub subscription denied");
            // A denial may also follow an earlier confirmation
            state.subscriptions.remove(id);
            state.challenges.reject(id, Error::Denied(reason));
            return HubReply::status(StatusCode::OK);
        }

        let Some(challenge) = query.get("hub.challenge") else {
            warn!(id = %id, "Missing the hub.challenge parameter");
            return HubReply::status(StatusCode::BAD_REQUEST);
        };

        if subscription.status == HubStatus::Unsubscribing {
            state.subscriptions.remove(id);
        } else {
            subscription.status = HubStatus::Confirmed;
        }
        state.challenges.resolve(id, id.clone());
        debug!(id = %id, "Sending hub.challenge");
        HubReply::text(challenge.as_str())
    }

    async fn handle_post(
        &self,
        headers: &HeaderMap,
        query: &HashMap<String, String>,
        body: &[u8],
    ) -> HubReply {
        let payload: Value = match serde_json::from_slice(body) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Invalid notification body");
                return HubReply::status(StatusCode::BAD_REQUEST);
            }
        };
        let id = payload
            .get("item.id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| query.get("item.id").cloned());
        let Some(id) = id else {
            warn!("Notification without item.id");
            return HubReply::status(StatusCode::BAD_REQUEST);
        };

        let event_name = {
            let state = self.state.lock().await;
            let Some(subscription) = state.subscriptions.get(&id) else {
                warn!(id = %id, "Notification for unknown subscription");
                return HubReply::status(StatusCode::GONE);
            };
            let valid = headers
                .get(SIGNATURE_HEADER)
                .and_then(|value| value.to_str().ok())
                .is_some_and(|header| signature::verify(header, &subscription.secret, body));
            if !valid {
                warn!(id = %id, "Invalid notification signature");
                return HubReply::status(StatusCode::FORBIDDEN);
            }
            subscription.event_name.clone()
        };

        let data = payload.get("data").cloned().unwrap_or(Value::Null);
        debug!(id = %id, event = %event_name, "Emitting hub notification");
        self.events.emit(Event::new(event_name, id, data)).await;
        HubReply::status(StatusCode::OK)
    }
}

fn generate_secret() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SECRET_LEN)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Mock, ServerGuard};
    use reqwest::header::HeaderValue;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    const CALLBACK: &str = "https://example.com/webhook";
    const WAIT: Duration = Duration::from_secs(5);

    async fn setup() -> (ServerGuard, Arc<WebhookManager>) {
        let server = mockito::Server::new_async().await;
        let config = WebhookConfig::new("client-id", CALLBACK).with_base_url(server.url());
        let manager = Arc::new(WebhookManager::new(config).unwrap());
        (server, manager)
    }

    async fn mock_hub(server: &mut ServerGuard, mode: &str, status: usize) -> Mock {
        server
            .mock("POST", "/webhooks/hub")
            .match_header("client-id", "client-id")
            .match_body(Matcher::UrlEncoded("hub.mode".into(), mode.into()))
            .with_status(status)
            .create_async()
            .await
    }

    fn query(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    async fn get(manager: &WebhookManager, pairs: &[(&str, &str)]) -> HubReply {
        manager
            .handle_request(&Method::GET, &HeaderMap::new(), &query(pairs), b"")
            .await
    }

    async fn post(manager: &WebhookManager, signature: Option<String>, body: &[u8]) -> HubReply {
        let mut headers = HeaderMap::new();
        if let Some(signature) = signature {
            headers.insert(SIGNATURE_HEADER, HeaderValue::from_str(&signature).unwrap());
        }
        manager
            .handle_request(&Method::POST, &headers, &HashMap::new(), body)
            .await
    }

    async fn next_challenge(manager: &WebhookManager) -> String {
        timeout(WAIT, async {
            loop {
                if let Some(id) = manager.pending_challenges().await.into_iter().next() {
                    return id;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("no challenge registered")
    }

    /// Answer every outstanding challenge the way the hub would
    fn spawn_challenge_responder(manager: &Arc<WebhookManager>) -> JoinHandle<()> {
        let manager = manager.clone();
        tokio::spawn(async move {
            loop {
                for id in manager.pending_challenges().await {
                    get(&manager, &[("item.id", &id), ("hub.challenge", "ok")]).await;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
    }

    async fn secret_of(manager: &WebhookManager, id: &str) -> String {
        manager.state.lock().await.subscriptions[id].secret.clone()
    }

    // ============ Config Tests ============

    #[test]
    fn test_config_defaults() {
        let config = WebhookConfig::new("id", CALLBACK);
        assert_eq!(config.api_base_url, API_BASE_URL);
        assert_eq!(config.lease_seconds, 864_000);
        assert!(config.challenge_timeout.is_none());
        assert!(config.bearer_token.is_none());
    }

    #[test]
    fn test_generate_secret() {
        let secret = generate_secret();
        assert_eq!(secret.len(), 32);
        assert!(secret.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(secret, generate_secret());
    }

    #[test]
    fn test_hub_form_callback() {
        let manager = WebhookManager::new(WebhookConfig::new("id", CALLBACK)).unwrap();
        let form = manager.hub_form("subscribe", "abc", "topic", "s3cret");
        assert_eq!(form[0], ("hub.callback", format!("{CALLBACK}?item.id=abc")));
        assert_eq!(form[3], ("hub.lease_seconds", "864000".to_string()));

        let manager =
            WebhookManager::new(WebhookConfig::new("id", "https://example.com/cb?app=1")).unwrap();
        let form = manager.hub_form("subscribe", "abc", "topic", "s3cret");
        assert_eq!(form[0].1, "https://example.com/cb?app=1&item.id=abc");
    }

    // ============ Subscribe Tests ============

    #[tokio::test]
    async fn test_subscribe_resolves_on_challenge() {
        let (mut server, manager) = setup().await;
        let topic = topic::stream_topic(&server.url(), "123");
        let mock = server
            .mock("POST", "/webhooks/hub")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("hub.mode".into(), "subscribe".into()),
                Matcher::UrlEncoded("hub.topic".into(), topic.clone()),
                Matcher::UrlEncoded("hub.lease_seconds".into(), "864000".into()),
                Matcher::Regex("hub.secret=[A-Za-z0-9]{32}".into()),
                Matcher::Regex("hub.callback=https%3A%2F%2Fexample.com%2Fwebhook%3Fitem.id%3D".into()),
            ]))
            .with_status(202)
            .create_async()
            .await;

        let sub = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.subscribe_stream_up_down("123").await })
        };
        let id = next_challenge(&manager).await;

        let reply = get(&manager, &[("item.id", &id), ("hub.challenge", "abc123")]).await;
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(reply.body.as_deref(), Some("abc123"));

        assert_eq!(sub.await.unwrap().unwrap(), id);
        mock.assert_async().await;

        let subscriptions = manager.subscriptions().await;
        assert_eq!(subscriptions.len(), 1);
        assert_eq!(subscriptions[0].topic, topic);
        assert_eq!(subscriptions[0].event_name, STREAM_UP_DOWN_EVENT);
        assert_eq!(subscriptions[0].status, HubStatus::Confirmed);
        assert!(manager.pending_challenges().await.is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_denied() {
        let (mut server, manager) = setup().await;
        let _mock = mock_hub(&mut server, "subscribe", 202).await;

        let sub = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.subscribe("https://topic", "custom").await })
        };
        let id = next_challenge(&manager).await;

        let reply = get(
            &manager,
            &[("item.id", &id), ("hub.mode", "denied"), ("hub.reason", "unauthorized")],
        )
        .await;
        assert_eq!(reply.status, StatusCode::OK);

        let err = sub.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Denied(ref reason) if reason == "unauthorized"));
        assert!(err.to_string().contains("Reason: unauthorized"));
        assert!(manager.subscriptions().await.is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_hub_refuses_request() {
        let (mut server, manager) = setup().await;
        let _mock = server
            .mock("POST", "/webhooks/hub")
            .with_status(400)
            .with_body(r#"{"error":"Bad Request","message":"invalid topic"}"#)
            .create_async()
            .await;

        let err = manager.subscribe("bad", "event").await.unwrap_err();
        assert!(matches!(err, Error::Api(ref msg) if msg.contains("invalid topic")));
        assert!(manager.subscriptions().await.is_empty());
        assert!(manager.pending_challenges().await.is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_validation() {
        let (_server, manager) = setup().await;
        assert!(matches!(
            manager.subscribe("", "event").await,
            Err(Error::InvalidParameter(_))
        ));
        assert!(matches!(
            manager.subscribe("topic", "").await,
            Err(Error::InvalidParameter(_))
        ));
        assert!(matches!(
            manager.subscribe_user_follows(None, None).await,
            Err(Error::InvalidParameter(_))
        ));
    }

    #[tokio::test]
    async fn test_subscribe_user_follows_topic() {
        let (mut server, manager) = setup().await;
        let expected = topic::user_follows_topic(&server.url(), Some("42"), None);
        let _mock = server
            .mock("POST", "/webhooks/hub")
            .match_body(Matcher::UrlEncoded("hub.topic".into(), expected.clone()))
            .with_status(202)
            .create_async()
            .await;
        let responder = spawn_challenge_responder(&manager);

        let id = manager.subscribe_user_follows(Some("42"), None).await.unwrap();
        responder.abort();

        let subscriptions = manager.subscriptions().await;
        assert_eq!(subscriptions[0].id, id);
        assert_eq!(subscriptions[0].topic, expected);
        assert_eq!(subscriptions[0].event_name, USER_FOLLOWS_EVENT);
    }

    #[tokio::test]
    async fn test_subscribe_challenge_timeout() {
        let mut server = mockito::Server::new_async().await;
        let _mock = mock_hub(&mut server, "subscribe", 202).await;
        let config = WebhookConfig::new("client-id", CALLBACK)
            .with_base_url(server.url())
            .challenge_timeout(Duration::from_millis(50));
        let manager = WebhookManager::new(config).unwrap();

        let err = manager.subscribe("topic", "event").await.unwrap_err();
        assert!(matches!(err, Error::Timeout));
        assert!(manager.subscriptions().await.is_empty());
        assert!(manager.pending_challenges().await.is_empty());
    }

    // ============ Inbound GET Tests ============

    #[tokio::test]
    async fn test_get_without_challenge_is_malformed() {
        let (mut server, manager) = setup().await;
        let _mock = mock_hub(&mut server, "subscribe", 202).await;
        let sub = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.subscribe("topic", "event").await })
        };
        let id = next_challenge(&manager).await;

        let reply = get(&manager, &[("item.id", &id)]).await;
        assert_eq!(reply.status, StatusCode::BAD_REQUEST);
        assert_eq!(manager.pending_challenges().await, vec![id.clone()]);
        assert_eq!(manager.subscriptions().await[0].status, HubStatus::Pending);

        sub.abort();
    }

    #[tokio::test]
    async fn test_get_missing_or_unknown_id() {
        let (_server, manager) = setup().await;
        assert_eq!(
            get(&manager, &[("hub.challenge", "x")]).await.status,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            get(&manager, &[("item.id", "nope"), ("hub.challenge", "x")]).await.status,
            StatusCode::GONE
        );
    }

    #[tokio::test]
    async fn test_unsupported_method() {
        let (_server, manager) = setup().await;
        let reply = manager
            .handle_request(&Method::PUT, &HeaderMap::new(), &HashMap::new(), b"")
            .await;
        assert_eq!(reply.status, StatusCode::METHOD_NOT_ALLOWED);
    }

    // ============ Inbound POST Tests ============

    #[tokio::test]
    async fn test_post_with_valid_signature_emits() {
        let (mut server, manager) = setup().await;
        let _mock = mock_hub(&mut server, "subscribe", 202).await;
        let responder = spawn_challenge_responder(&manager);
        let id = manager.subscribe("topic", "stream_up_down").await.unwrap();
        responder.abort();

        let mut events = manager.listen();
        let body = json!({"item.id": id, "data": [{"type": "live"}]}).to_string();
        let signature = signature::sign(&secret_of(&manager, &id).await, body.as_bytes()).unwrap();

        let reply = post(&manager, Some(signature), body.as_bytes()).await;
        assert_eq!(reply.status, StatusCode::OK);

        let event = events.recv().await.unwrap();
        assert_eq!(event.name, "stream_up_down");
        assert_eq!(event.source_id, id);
        assert_eq!(event.payload, json!([{"type": "live"}]));
    }

    #[tokio::test]
    async fn test_post_with_bad_signature_is_forbidden() {
        let (mut server, manager) = setup().await;
        let _mock = mock_hub(&mut server, "subscribe", 202).await;
        let responder = spawn_challenge_responder(&manager);
        let id = manager.subscribe("topic", "event").await.unwrap();
        responder.abort();

        let mut events = manager.listen();
        let body = json!({"item.id": id, "data": []}).to_string();
        let forged = signature::sign("not-the-secret", body.as_bytes()).unwrap();

        assert_eq!(
            post(&manager, Some(forged), body.as_bytes()).await.status,
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            post(&manager, None, body.as_bytes()).await.status,
            StatusCode::FORBIDDEN
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_post_unknown_or_missing_id() {
        let (_server, manager) = setup().await;
        let body = json!({"item.id": "nope", "data": []}).to_string();
        assert_eq!(post(&manager, None, body.as_bytes()).await.status, StatusCode::GONE);

        let body = json!({"data": []}).to_string();
        assert_eq!(
            post(&manager, None, body.as_bytes()).await.status,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            post(&manager, None, b"not json").await.status,
            StatusCode::BAD_REQUEST
        );
    }

    // ============ Unsubscribe Tests ============

    #[tokio::test]
    async fn test_unsubscribe_unknown_id() {
        let (_server, manager) = setup().await;
        let err = manager.unsubscribe("missing").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_unsubscribe_resolves_on_challenge() {
        let (mut server, manager) = setup().await;
        let _subscribe = mock_hub(&mut server, "subscribe", 202).await;
        let unsubscribe = mock_hub(&mut server, "unsubscribe", 202).await;
        let responder = spawn_challenge_responder(&manager);

        let id = manager.subscribe("topic", "event").await.unwrap();
        manager.unsubscribe(&id).await.unwrap();
        responder.abort();

        unsubscribe.assert_async().await;
        assert!(manager.subscriptions().await.is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_cancels_pending_subscribe() {
        let (mut server, manager) = setup().await;
        let _subscribe = mock_hub(&mut server, "subscribe", 202).await;
        let _unsubscribe = mock_hub(&mut server, "unsubscribe", 202).await;

        let sub = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.subscribe("topic", "event").await })
        };
        let id = next_challenge(&manager).await;
        let unsub = {
            let manager = manager.clone();
            let id = id.clone();
            tokio::spawn(async move { manager.unsubscribe(&id).await })
        };

        let err = timeout(WAIT, sub).await.unwrap().unwrap().unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));

        get(&manager, &[("item.id", &id), ("hub.challenge", "bye")]).await;
        timeout(WAIT, unsub).await.unwrap().unwrap().unwrap();
        assert!(manager.subscriptions().await.is_empty());
    }

    // ============ Destroy Tests ============

    #[tokio::test]
    async fn test_destroy_continues_after_failure() {
        let (mut server, manager) = setup().await;
        let _subscribe = mock_hub(&mut server, "subscribe", 202).await;
        let mut unsubscribe_mocks = Vec::new();
        for (topic, status) in [("t1", 202), ("t2", 500), ("t3", 202)] {
            let mock = server
                .mock("POST", "/webhooks/hub")
                .match_body(Matcher::AllOf(vec![
                    Matcher::UrlEncoded("hub.mode".into(), "unsubscribe".into()),
                    Matcher::UrlEncoded("hub.topic".into(), topic.into()),
                ]))
                .with_status(status)
                .create_async()
                .await;
            unsubscribe_mocks.push(mock);
        }
        let responder = spawn_challenge_responder(&manager);

        let first = manager.subscribe("t1", "event").await.unwrap();
        let second = manager.subscribe("t2", "event").await.unwrap();
        let third = manager.subscribe("t3", "event").await.unwrap();

        let report = manager.destroy().await;
        responder.abort();

        for mock in &unsubscribe_mocks {
            mock.assert_async().await;
        }
        assert_eq!(report.removed, vec![first, third]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, second);
        assert!(matches!(report.failed[0].1, Error::Api(_)));
        assert!(!report.is_success());
        assert!(manager.subscriptions().await.is_empty());
        assert!(manager.pending_challenges().await.is_empty());
    }

    // ============ Thread Safety Tests ============

    #[test]
    fn test_manager_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<WebhookManager>();
    }
}
