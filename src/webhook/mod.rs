//! WebSub hub subscriptions
//!
//! [`WebhookManager`] performs the subscribe/unsubscribe handshake with the
//! Twitch hub and validates the callbacks the hub sends to `callback_url`.
//! Wire [`WebhookManager::handle_request`] into whatever HTTP server receives
//! those callbacks.

mod manager;
pub mod signature;

pub use manager::{
    DestroyReport, HubReply, HubStatus, HubSubscriptionInfo, WebhookConfig, WebhookManager,
    DEFAULT_LEASE_SECONDS,
};
pub use signature::SIGNATURE_HEADER;
