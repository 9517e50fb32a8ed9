//! Twitch push notification toolkit
//!
//! Two independent channels for receiving real-time Twitch events:
//! - PubSub (persistent WebSocket with keepalive, reconnect and replay)
//! - Webhooks (WebSub hub subscriptions with signed callbacks)
//!
//! Both surface notifications as named [`Event`]s on an [`EventSink`].

pub mod client;
pub mod correlation;
pub mod error;
pub mod events;
pub mod pubsub;
pub mod topic;
pub mod webhook;

pub use client::{Client, API_BASE_URL};
pub use error::{Error, Result};
pub use events::{Event, EventSink};
pub use pubsub::{ConnectionState, PubSubClient, PubSubConfig, ReconnectConfig};
pub use topic::TopicKind;
pub use webhook::{WebhookConfig, WebhookManager};
