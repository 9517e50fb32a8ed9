//! PubSub socket channel
//!
//! Keeps a single WebSocket connection to Twitch PubSub alive, correlates
//! LISTEN/UNLISTEN requests with their RESPONSE frames by nonce, replays
//! subscriptions after reconnects and turns MESSAGE frames into named events.
//!
//! # Example
//!
//! ```ignore
//! use twitch_toolkit::pubsub::{PubSubClient, PubSubConfig};
//! use twitch_toolkit::TopicKind;
//!
//! let client = PubSubClient::new(PubSubConfig::default());
//! client.connect().await?;
//!
//! client.on("bits.44322889", |event| println!("{}", event.payload)).await;
//! client.subscribe(&[TopicKind::Bits], "44322889", &token).await?;
//! ```

mod client;
mod config;
mod message;

pub use client::{ConnectionState, PubSubClient, PubSubSubscription, SubscriptionStatus};
pub use config::{PubSubConfig, ReconnectConfig, PUBSUB_URL};
pub use message::{InboundFrame, ListenData, MessageData, OutboundFrame};
