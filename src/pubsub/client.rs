//! PubSub WebSocket client

use futures_util::{
    future::BoxFuture,
    stream::{SplitSink, SplitStream},
    FutureExt, SinkExt, StreamExt,
};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn, Instrument, Span};

use super::config::PubSubConfig;
use super::message::{InboundFrame, MessageData, OutboundFrame};
use crate::correlation::{self, CorrelationTable};
use crate::error::{Error, Result};
use crate::events::{Event, EventSink};
use crate::topic::{self, TopicKind};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Connection state of the PubSub client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected
    Disconnected,
    /// Attempting to connect
    Connecting,
    /// Connected and ready
    Connected,
    /// Connection lost, attempting to reconnect
    Reconnecting,
    /// Client has been closed
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Reconnecting => write!(f, "Reconnecting"),
            ConnectionState::Closed => write!(f, "Closed"),
        }
    }
}

/// Status of a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    /// LISTEN sent, waiting for confirmation
    Pending,
    /// Subscription is active
    Active,
    /// UNLISTEN sent, waiting for confirmation
    Unsubscribing,
}

/// Read-only view of a subscription held by the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubSubscription {
    /// Subscription id (nonce of the first LISTEN)
    pub id: String,
    /// Topic kinds
    pub kinds: Vec<TopicKind>,
    /// Channel or user id the topics are scoped to
    pub target_id: String,
    /// Current status
    pub status: SubscriptionStatus,
}

#[derive(Debug, Clone)]
struct SubscriptionRecord {
    id: String,
    kinds: Vec<TopicKind>,
    target_id: String,
    auth_token: String,
    status: SubscriptionStatus,
    // Nonce of the outstanding LISTEN/UNLISTEN, if any
    request: Option<String>,
}

impl SubscriptionRecord {
    fn topics(&self) -> Vec<String> {
        self.kinds
            .iter()
            .map(|kind| topic::resolve(*kind, &self.target_id))
            .collect()
    }

    fn view(&self) -> PubSubSubscription {
        PubSubSubscription {
            id: self.id.clone(),
            kinds: self.kinds.clone(),
            target_id: self.target_id.clone(),
            status: self.status,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    Listen,
    Unlisten,
}

#[derive(Debug)]
struct PendingRequest {
    kind: RequestKind,
    subscription_id: String,
}

/// Pending requests and durable subscriptions, guarded by one lock
#[derive(Debug, Default)]
struct Registry {
    pending: CorrelationTable<String, PendingRequest>,
    subscriptions: Vec<SubscriptionRecord>,
}

impl Registry {
    fn find(&self, id: &str) -> Option<&SubscriptionRecord> {
        self.subscriptions.iter().find(|record| record.id == id)
    }

    fn find_mut(&mut self, id: &str) -> Option<&mut SubscriptionRecord> {
        self.subscriptions.iter_mut().find(|record| record.id == id)
    }

    fn remove(&mut self, id: &str) -> bool {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|record| record.id != id);
        self.subscriptions.len() != before
    }

    /// Subscriptions stop being confirmed once their connection is gone
    fn mark_unconfirmed(&mut self) {
        for record in &mut self.subscriptions {
            record.status = SubscriptionStatus::Pending;
        }
    }

    /// Forget the outstanding request of a subscription whose request failed
    fn clear_request(&mut self, request: &PendingRequest) {
        if let Some(record) = self.find_mut(&request.subscription_id) {
            record.request = None;
            if request.kind == RequestKind::Unlisten {
                record.status = SubscriptionStatus::Active;
            }
        }
    }
}

struct Inner {
    config: PubSubConfig,
    span: Span,
    state_tx: watch::Sender<ConnectionState>,
    sink: Mutex<Option<WsSink>>,
    generation: AtomicU64,
    registry: Mutex<Registry>,
    events: EventSink,
    last_pong: RwLock<Option<Instant>>,
    connected_at: RwLock<Option<Instant>>,
    reconnect_attempts: AtomicU32,
    close_waiter: Mutex<Option<oneshot::Sender<()>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    keepalive: Mutex<Option<JoinHandle<()>>>,
    // Serializes connect, reconnect and disconnect
    lifecycle: Mutex<()>,
}

/// Twitch PubSub client
///
/// Owns one WebSocket connection at a time, keeps it alive with PING/PONG,
/// replays every subscription after a reconnect and surfaces topic messages
/// as named events (`{kind}.{target_id}`). Clones share the same connection.
#[derive(Clone)]
pub struct PubSubClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for PubSubClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSubClient")
            .field("url", &self.inner.config.url)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Default for PubSubClient {
    fn default() -> Self {
        Self::new(PubSubConfig::default())
    }
}

impl PubSubClient {
    /// Create a new client; logs go to a `pubsub` span
    pub fn new(config: PubSubConfig) -> Self {
        let span = tracing::info_span!("pubsub", url = %config.url);
        Self::with_span(config, span)
    }

    /// Create a new client logging under the given span
    pub fn with_span(config: PubSubConfig, span: Span) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                config,
                span,
                state_tx,
                sink: Mutex::new(None),
                generation: AtomicU64::new(0),
                registry: Mutex::new(Registry::default()),
                events: EventSink::new(),
                last_pong: RwLock::new(None),
                connected_at: RwLock::new(None),
                reconnect_attempts: AtomicU32::new(0),
                close_waiter: Mutex::new(None),
                reader: Mutex::new(None),
                keepalive: Mutex::new(None),
                lifecycle: Mutex::new(()),
            }),
        }
    }

    /// Get the client configuration
    pub fn config(&self) -> &PubSubConfig {
        &self.inner.config
    }

    /// Get the current connection state
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Check if currently connected
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Subscribe to state changes
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// When the last PONG was received on the current connection
    pub async fn last_pong_time(&self) -> Option<Instant> {
        *self.inner.last_pong.read().await
    }

    /// Number of consecutive reconnect attempts since the last stable connection
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.reconnect_attempts.load(Ordering::SeqCst)
    }

    /// Number of requests waiting for a RESPONSE
    pub async fn pending_requests(&self) -> usize {
        self.inner.registry.lock().await.pending.len()
    }

    /// Subscriptions in registration order
    pub async fn subscriptions(&self) -> Vec<PubSubSubscription> {
        let registry = self.inner.registry.lock().await;
        registry
            .subscriptions
            .iter()
            .map(SubscriptionRecord::view)
            .collect()
    }

    /// The event sink topic messages are emitted on
    pub fn events(&self) -> &EventSink {
        &self.inner.events
    }

    /// Register a handler for a named event such as `bits.44322889`
    pub async fn on<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.inner.events.on(name, handler).await;
    }

    /// Receive every event emitted from now on
    pub fn listen(&self) -> broadcast::Receiver<Event> {
        self.inner.events.listen()
    }

    /// Connect to the PubSub server.
    ///
    /// Resolves once the WebSocket handshake completes. Does nothing if
    /// already connected; fails if the client has been closed.
    pub async fn connect(&self) -> Result<()> {
        let inner = self.inner.clone();
        let span = inner.span.clone();
        async move {
            let _lifecycle = inner.lifecycle.lock().await;
            inner.reconnect_attempts.store(0, Ordering::SeqCst);
            inner.connect().await
        }
        .instrument(span)
        .await
    }

    /// Close the connection and wait for the close handshake.
    ///
    /// Pending requests are rejected with [`Error::Closed`] and no reconnect
    /// is attempted.
    pub async fn disconnect(&self) -> Result<()> {
        let inner = self.inner.clone();
        let span = inner.span.clone();
        async move { inner.disconnect().await }.instrument(span).await
    }

    /// Disconnect permanently. The client cannot be connected again.
    pub async fn close(&self) -> Result<()> {
        self.inner.set_state(ConnectionState::Closed);
        self.disconnect().await
    }

    /// Tear down the connection, open a new one and replay every subscription
    /// in registration order.
    pub async fn reconnect(&self) -> Result<()> {
        let inner = self.inner.clone();
        let span = inner.span.clone();
        async move {
            if inner.state() == ConnectionState::Closed {
                return Err(Error::WebSocket("Client has been closed".to_string()));
            }
            let _lifecycle = inner.lifecycle.lock().await;
            let result = inner.reconnect().await;
            if result.is_err() {
                inner.set_state(ConnectionState::Disconnected);
            }
            result
        }
        .instrument(span)
        .await
    }

    /// Listen to `kinds` for `target_id`.
    ///
    /// Sends one LISTEN frame for all topics and resolves with the
    /// subscription id once the server confirms. The subscription is kept and
    /// replayed after reconnects until [`unsubscribe`](Self::unsubscribe).
    pub async fn subscribe(
        &self,
        kinds: &[TopicKind],
        target_id: &str,
        auth_token: &str,
    ) -> Result<String> {
        let inner = self.inner.clone();
        let span = inner.span.clone();
        async move { inner.subscribe(kinds, target_id, auth_token).await }
            .instrument(span)
            .await
    }

    /// Stop listening to the topics of a subscription
    pub async fn unsubscribe(&self, id: &str) -> Result<()> {
        let inner = self.inner.clone();
        let span = inner.span.clone();
        async move { inner.unsubscribe(id).await }
            .instrument(span)
            .await
    }
}

impl Inner {
    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            // Closed is terminal
            if *current == state || *current == ConnectionState::Closed {
                return false;
            }
            *current = state;
            true
        });
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    async fn connect(self: &Arc<Self>) -> Result<()> {
        match self.state() {
            ConnectionState::Connected => return Ok(()),
            ConnectionState::Closed => {
                return Err(Error::WebSocket("Client has been closed".to_string()))
            }
            _ => {}
        }

        self.set_state(ConnectionState::Connecting);
        match self.open().await {
            Ok(()) => {
                self.set_state(ConnectionState::Connected);
                // Also covers a connect during a pending recovery, which the
                // new generation makes stale
                self.replay().await;
                Ok(())
            }
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Open a new connection and start its reader and keepalive tasks
    async fn open(self: &Arc<Self>) -> Result<()> {
        debug!("Connecting Twitch PubSub");
        let (ws_stream, _response) = connect_async(self.config.url.as_str())
            .await
            .map_err(map_ws_error)?;
        let (sink, stream) = ws_stream.split();

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.sink.lock().await = Some(sink);
        *self.last_pong.write().await = None;
        *self.connected_at.write().await = Some(Instant::now());

        let reader = tokio::spawn(
            self.clone()
                .read_loop(stream, generation)
                .instrument(self.span.clone()),
        );
        let keepalive = tokio::spawn(
            self.clone()
                .keepalive_loop(generation)
                .instrument(self.span.clone()),
        );
        if let Some(stale) = self.reader.lock().await.replace(reader) {
            stale.abort();
        }
        if let Some(stale) = self.keepalive.lock().await.replace(keepalive) {
            stale.abort();
        }

        info!(generation, "Twitch PubSub connected");
        Ok(())
    }

    /// Invalidate the current connection and reject everything pending on it
    async fn teardown(&self, error: impl Fn() -> Error) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(task) = self.keepalive.lock().await.take() {
            task.abort();
        }
        if let Some(task) = self.reader.lock().await.take() {
            task.abort();
        }
        let sink = self.sink.lock().await.take();
        if let Some(mut sink) = sink {
            let _ = tokio::time::timeout(self.config.close_timeout, sink.close()).await;
        }
        *self.connected_at.write().await = None;
        self.fail_pending(error).await;
    }

    async fn fail_pending(&self, error: impl Fn() -> Error) {
        let mut registry = self.registry.lock().await;
        let failed = registry.pending.reject_all(error);
        for (nonce, request) in &failed {
            debug!(nonce = %nonce, subscription = %request.subscription_id, "Rejected pending request");
            registry.clear_request(request);
        }
        registry.mark_unconfirmed();
    }

    async fn expire_pending(&self) {
        let mut registry = self.registry.lock().await;
        let expired = registry
            .pending
            .expire(self.config.pending_ttl, Instant::now());
        for (nonce, request) in &expired {
            warn!(nonce = %nonce, subscription = %request.subscription_id, "Pending request expired");
            registry.clear_request(request);
        }
    }

    async fn reconnect(self: &Arc<Self>) -> Result<()> {
        info!("Reconnecting Twitch PubSub");
        self.teardown(|| Error::ConnectionLost).await;
        self.set_state(ConnectionState::Reconnecting);
        self.open().await?;
        self.set_state(ConnectionState::Connected);
        self.replay().await;
        Ok(())
    }

    /// Reconnect in the background, backing off between failed attempts.
    ///
    /// `generation` is the connection that triggered the recovery; if it has
    /// already been replaced by the time the attempt runs, nothing happens.
    fn recover(self: Arc<Self>, mut generation: u64, mut delay: Duration) -> BoxFuture<'static, ()> {
        async move {
            loop {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }

                let _lifecycle = self.lifecycle.lock().await;
                if !self.is_current(generation) || self.state() == ConnectionState::Closed {
                    debug!(generation, "Skipping stale reconnect");
                    return;
                }

                let error = match self.reconnect().await {
                    Ok(()) => return,
                    Err(e) => e,
                };

                generation = self.generation.load(Ordering::SeqCst);
                let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst);
                if !self.config.reconnect.should_attempt(attempt) {
                    error!(error = %error, attempt, "Giving up reconnecting Twitch PubSub");
                    self.set_state(ConnectionState::Disconnected);
                    return;
                }
                delay = self.config.reconnect.jittered_delay(attempt);
                warn!(error = %error, attempt, ?delay, "Reconnect failed, retrying");
            }
        }
        .boxed()
    }

    fn spawn_recover(self: &Arc<Self>, generation: u64, delay: Duration) {
        tokio::spawn(
            self.clone()
                .recover(generation, delay)
                .instrument(self.span.clone()),
        );
    }

    /// Re-send LISTEN for every durable subscription, one at a time
    async fn replay(self: &Arc<Self>) {
        let records: Vec<(String, Vec<String>, String)> = {
            let registry = self.registry.lock().await;
            registry
                .subscriptions
                .iter()
                .map(|record| (record.id.clone(), record.topics(), record.auth_token.clone()))
                .collect()
        };
        if records.is_empty() {
            return;
        }

        let mut waiting = Vec::with_capacity(records.len());
        for (id, topics, auth_token) in records {
            let nonce = correlation::new_token();
            match self
                .send_request(RequestKind::Listen, &nonce, &id, topics, &auth_token, None)
                .await
            {
                Ok(rx) => waiting.push((id, rx)),
                Err(e) => {
                    warn!(subscription = %id, error = %e, "Failed to replay subscription");
                    break;
                }
            }
        }

        tokio::spawn(
            async move {
                for (id, rx) in waiting {
                    match rx.await {
                        Ok(Ok(_)) => debug!(subscription = %id, "Subscription restored"),
                        Ok(Err(e)) => warn!(subscription = %id, error = %e, "Subscription not restored"),
                        Err(_) => {}
                    }
                }
            }
            .instrument(self.span.clone()),
        );
    }

    async fn disconnect(self: &Arc<Self>) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.sink.lock().await.is_none() {
            // Stops a recovery waiting between attempts
            self.generation.fetch_add(1, Ordering::SeqCst);
            self.set_state(ConnectionState::Disconnected);
            return Ok(());
        }

        debug!("Disconnecting Twitch PubSub");
        let (tx, rx) = oneshot::channel();
        *self.close_waiter.lock().await = Some(tx);
        if let Some(task) = self.keepalive.lock().await.take() {
            task.abort();
        }
        {
            let mut guard = self.sink.lock().await;
            if let Some(sink) = guard.as_mut() {
                let _ = sink.send(Message::Close(None)).await;
            }
        }

        if tokio::time::timeout(self.config.close_timeout, rx).await.is_err() {
            warn!("Close handshake timed out");
        }
        *self.close_waiter.lock().await = None;
        self.teardown(|| Error::Closed).await;
        self.set_state(ConnectionState::Disconnected);
        info!("Twitch PubSub disconnected");
        Ok(())
    }

    async fn subscribe(
        self: &Arc<Self>,
        kinds: &[TopicKind],
        target_id: &str,
        auth_token: &str,
    ) -> Result<String> {
        if kinds.is_empty() {
            return Err(Error::InvalidParameter("Missing topic kinds".to_string()));
        }
        if target_id.is_empty() {
            return Err(Error::InvalidParameter("Missing target id".to_string()));
        }
        if auth_token.is_empty() {
            return Err(Error::InvalidParameter("Missing auth token".to_string()));
        }

        let nonce = correlation::new_token();
        let record = SubscriptionRecord {
            id: nonce.clone(),
            kinds: kinds.to_vec(),
            target_id: target_id.to_string(),
            auth_token: auth_token.to_string(),
            status: SubscriptionStatus::Pending,
            request: None,
        };
        let topics = record.topics();
        debug!(topics = ?topics, "Sending topic subscription");

        let rx = self
            .send_request(RequestKind::Listen, &nonce, &nonce, topics, auth_token, Some(record))
            .await?;
        rx.await.map_err(|_| Error::ConnectionLost)?
    }

    async fn unsubscribe(self: &Arc<Self>, id: &str) -> Result<()> {
        let (topics, auth_token) = {
            let registry = self.registry.lock().await;
            let record = registry
                .find(id)
                .ok_or_else(|| Error::NotFound(format!("Unable to find subscription with id {id}")))?;
            (record.topics(), record.auth_token.clone())
        };
        debug!(subscription = %id, "Sending topic unsubscription");

        let nonce = correlation::new_token();
        let rx = self
            .send_request(RequestKind::Unlisten, &nonce, id, topics, &auth_token, None)
            .await?;
        rx.await.map_err(|_| Error::ConnectionLost)??;
        Ok(())
    }

    /// Register a pending request under `nonce` and send its frame.
    ///
    /// A new durable record is stored under the same lock as the pending
    /// entry, so a fast RESPONSE always finds it.
    async fn send_request(
        &self,
        kind: RequestKind,
        nonce: &str,
        subscription_id: &str,
        topics: Vec<String>,
        auth_token: &str,
        new_record: Option<SubscriptionRecord>,
    ) -> Result<oneshot::Receiver<Result<String>>> {
        self.expire_pending().await;

        let frame = match kind {
            RequestKind::Listen => OutboundFrame::listen(nonce, topics, auth_token),
            RequestKind::Unlisten => OutboundFrame::unlisten(nonce, topics, auth_token),
        };

        let rx = {
            let mut registry = self.registry.lock().await;
            let rx = registry.pending.register(
                nonce,
                PendingRequest {
                    kind,
                    subscription_id: subscription_id.to_string(),
                },
            )?;
            if let Some(record) = new_record {
                registry.subscriptions.push(record);
            }
            if let Some(record) = registry.find_mut(subscription_id) {
                record.request = Some(nonce.to_string());
                record.status = match kind {
                    RequestKind::Listen => SubscriptionStatus::Pending,
                    RequestKind::Unlisten => SubscriptionStatus::Unsubscribing,
                };
            }
            rx
        };

        if let Err(e) = self.send_frame(&frame).await {
            let mut registry = self.registry.lock().await;
            if let Some(pending) = registry.pending.take(nonce) {
                registry.clear_request(pending.context());
            }
            let confirmed = registry
                .find(subscription_id)
                .is_some_and(|record| record.status == SubscriptionStatus::Active);
            if kind == RequestKind::Listen && nonce == subscription_id && !confirmed {
                registry.remove(subscription_id);
            }
            return Err(e);
        }
        Ok(rx)
    }

    async fn send_frame(&self, frame: &OutboundFrame) -> Result<()> {
        let text = serde_json::to_string(frame)?;
        let mut guard = self.sink.lock().await;
        let sink = guard
            .as_mut()
            .ok_or_else(|| Error::WebSocket("Not connected".to_string()))?;
        sink.send(Message::Text(text))
            .await
            .map_err(|e| Error::WebSocket(format!("Failed to send: {e}")))
    }

    /// Transport-level ping followed by an application PING
    async fn send_ping(&self) -> Result<()> {
        let text = serde_json::to_string(&OutboundFrame::Ping)?;
        let mut guard = self.sink.lock().await;
        let sink = guard
            .as_mut()
            .ok_or_else(|| Error::WebSocket("Not connected".to_string()))?;
        sink.send(Message::Ping(Vec::new()))
            .await
            .map_err(|e| Error::WebSocket(format!("Failed to send: {e}")))?;
        sink.send(Message::Text(text))
            .await
            .map_err(|e| Error::WebSocket(format!("Failed to send: {e}")))
    }

    async fn read_loop(self: Arc<Self>, mut stream: WsStream, generation: u64) {
        while let Some(message) = stream.next().await {
            if !self.is_current(generation) {
                return;
            }
            match message {
                Ok(Message::Text(text)) => {
                    if let Err(e) = self.handle_text(&text, generation).await {
                        error!(error = %e, frame = %text, "Dropping invalid PubSub frame");
                    }
                }
                // tungstenite answers pings itself
                Ok(Message::Ping(_)) => debug!("WS PING received"),
                Ok(Message::Pong(_)) => debug!("WS PONG received"),
                Ok(Message::Close(frame)) => debug!(?frame, "Close frame received"),
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "PubSub transport error");
                    break;
                }
            }
        }
        self.on_closed(generation).await;
    }

    async fn on_closed(self: &Arc<Self>, generation: u64) {
        if !self.is_current(generation) {
            return;
        }
        if let Some(waiter) = self.close_waiter.lock().await.take() {
            debug!("Twitch PubSub connection closed");
            let _ = waiter.send(());
            return;
        }

        warn!("Twitch PubSub connection dropped");
        self.fail_pending(|| Error::ConnectionLost).await;

        let reconnect = &self.config.reconnect;
        if !reconnect.enabled || self.state() == ConnectionState::Closed {
            self.sink.lock().await.take();
            self.set_state(ConnectionState::Disconnected);
            return;
        }

        let stable = self
            .connected_at
            .read()
            .await
            .is_some_and(|at| at.elapsed() >= reconnect.stable_after);
        if stable {
            self.reconnect_attempts.store(0, Ordering::SeqCst);
        }
        let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst);
        if !reconnect.should_attempt(attempt) {
            error!(attempt, "Reconnect attempts exhausted");
            self.sink.lock().await.take();
            self.set_state(ConnectionState::Disconnected);
            return;
        }

        let delay = reconnect.jittered_delay(attempt);
        debug!(attempt, ?delay, "Scheduling reconnect");
        self.set_state(ConnectionState::Reconnecting);
        self.spawn_recover(generation, delay);
    }

    async fn handle_text(self: &Arc<Self>, text: &str, generation: u64) -> Result<()> {
        debug!(frame = %text, "New message received");
        match InboundFrame::parse(text)? {
            InboundFrame::Pong => {
                if self.is_current(generation) {
                    *self.last_pong.write().await = Some(Instant::now());
                } else {
                    debug!(generation, "Ignoring PONG from a stale connection");
                }
            }
            InboundFrame::Reconnect => {
                info!(grace = ?self.config.reconnect_grace, "Server requested reconnect");
                self.spawn_recover(generation, self.config.reconnect_grace);
            }
            InboundFrame::Response { nonce, error } => self.handle_response(nonce, error).await,
            InboundFrame::Message(data) => self.handle_message(data).await,
            InboundFrame::Other(frame_type) => {
                debug!(frame_type = %frame_type, "Ignoring frame");
            }
        }
        Ok(())
    }

    async fn handle_response(&self, nonce: Option<String>, error: Option<String>) {
        let Some(nonce) = nonce else {
            warn!("RESPONSE without nonce");
            return;
        };

        let mut registry = self.registry.lock().await;
        let Some(pending) = registry.pending.take(&nonce) else {
            warn!(nonce = %nonce, "Request for RESPONSE not found");
            return;
        };

        match error {
            None => {
                let request = pending.resolve(nonce.clone());
                match request.kind {
                    RequestKind::Listen => {
                        if let Some(record) = registry.find_mut(&request.subscription_id) {
                            if record.request.as_deref() == Some(nonce.as_str()) {
                                record.status = SubscriptionStatus::Active;
                                record.request = None;
                            }
                        }
                    }
                    RequestKind::Unlisten => {
                        registry.remove(&request.subscription_id);
                    }
                }
                debug!(nonce = %nonce, subscription = %request.subscription_id, "Request confirmed");
            }
            Some(error) => {
                warn!(nonce = %nonce, error = %error, "Request rejected");
                let request = pending.reject(Error::Rejected(error));
                match request.kind {
                    // A rejected LISTEN is not replayed
                    RequestKind::Listen => {
                        registry.remove(&request.subscription_id);
                    }
                    RequestKind::Unlisten => registry.clear_request(&request),
                }
            }
        }
    }

    async fn handle_message(&self, data: MessageData) {
        let Some((kind, id)) = topic::parse_topic(&data.topic) else {
            warn!(topic = %data.topic, "Unknown topic");
            return;
        };
        let name = format!("{kind}.{id}");
        let payload = data.payload();
        self.events.emit(Event::new(name, id, payload)).await;
    }

    async fn keepalive_loop(self: Arc<Self>, generation: u64) {
        let period = self.config.keepalive_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if !self.is_current(generation) {
                return;
            }
            self.expire_pending().await;

            debug!("Refreshing the PubSub with a PING command");
            let sent_at = Instant::now();
            if let Err(e) = self.send_ping().await {
                warn!(error = %e, "Failed to send keepalive");
            }

            tokio::time::sleep(self.config.pong_timeout).await;
            if !self.is_current(generation) {
                return;
            }
            let answered = self
                .last_pong
                .read()
                .await
                .is_some_and(|at| at >= sent_at);
            if !answered {
                warn!(timeout = ?self.config.pong_timeout, "No PONG received, reconnecting");
                self.spawn_recover(generation, Duration::ZERO);
                return;
            }
        }
    }
}

fn map_ws_error(e: WsError) -> Error {
    match e {
        WsError::Io(io_err) => Error::WebSocket(format!("IO error: {io_err}")),
        WsError::Tls(tls_err) => Error::WebSocket(format!("TLS error: {tls_err}")),
        WsError::ConnectionClosed => Error::WebSocket("Connection closed".to_string()),
        WsError::AlreadyClosed => Error::WebSocket("Already closed".to_string()),
        WsError::Protocol(p) => Error::WebSocket(format!("Protocol error: {p}")),
        WsError::Url(u) => Error::WebSocket(format!("URL error: {u}")),
        WsError::Http(resp) => Error::WebSocket(format!("HTTP error: status {}", resp.status())),
        WsError::HttpFormat(e) => Error::WebSocket(format!("HTTP format error: {e}")),
        _ => Error::WebSocket(format!("WebSocket error: {e}")),
    }
}
