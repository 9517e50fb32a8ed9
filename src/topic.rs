//! Topic resolution for the PubSub and Webhook channels
//!
//! PubSub topics are `{prefix}.{id}` strings where the prefix identifies the
//! kind of event (bits, subscriptions, ...). Webhook topics are Helix API URLs.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Event name used for user follow notifications
pub const USER_FOLLOWS_EVENT: &str = "user_follows";

/// Event name used for stream up/down notifications
pub const STREAM_UP_DOWN_EVENT: &str = "stream_up_down";

/// Logical kind of a PubSub subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopicKind {
    /// Bits (cheer) events on a channel
    Bits,
    /// Channel subscription events
    Subscription,
    /// Commerce (purchase) events on a channel
    Commerce,
    /// Whispers to a user
    Whisper,
}

impl TopicKind {
    /// Every known kind
    pub const ALL: [TopicKind; 4] = [
        TopicKind::Bits,
        TopicKind::Subscription,
        TopicKind::Commerce,
        TopicKind::Whisper,
    ];

    /// Name used in event names (`bits`, `whisper`, ...)
    pub fn as_str(&self) -> &'static str {
        match self {
            TopicKind::Bits => "bits",
            TopicKind::Subscription => "subscription",
            TopicKind::Commerce => "commerce",
            TopicKind::Whisper => "whisper",
        }
    }

    /// Topic prefix on the wire
    pub fn prefix(&self) -> &'static str {
        match self {
            TopicKind::Bits => "channel-bits-events-v1",
            TopicKind::Subscription => "channel-subscribe-events-v1",
            TopicKind::Commerce => "channel-commerce-events-v1",
            TopicKind::Whisper => "whispers",
        }
    }

    /// Map a wire prefix back to its kind
    pub fn from_prefix(prefix: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.prefix() == prefix)
    }
}

impl fmt::Display for TopicKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TopicKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| Error::UnknownTopic(s.to_string()))
    }
}

/// Resolve a kind and target id into a PubSub topic string
pub fn resolve(kind: TopicKind, id: &str) -> String {
    format!("{}.{}", kind.prefix(), id)
}

/// Split a PubSub topic into its kind and trailing id.
///
/// Returns `None` when the topic has no id or the prefix is unknown.
pub fn parse_topic(topic: &str) -> Option<(TopicKind, &str)> {
    let (prefix, id) = topic.rsplit_once('.')?;
    if id.is_empty() {
        return None;
    }
    let prefix = prefix.split('.').next().unwrap_or(prefix);
    TopicKind::from_prefix(prefix).map(|kind| (kind, id))
}

/// Helix topic URL for user follow notifications.
///
/// `from_id` takes precedence when both are given.
pub fn user_follows_topic(base_url: &str, from_id: Option<&str>, to_id: Option<&str>) -> String {
    let mut topic = format!("{base_url}/users/follows?first=1");
    if let Some(from) = from_id {
        topic.push_str("&from_id=");
        topic.push_str(from);
    } else if let Some(to) = to_id {
        topic.push_str("&to_id=");
        topic.push_str(to);
    }
    topic
}

/// Helix topic URL for stream up/down notifications
pub fn stream_topic(base_url: &str, user_id: &str) -> String {
    format!("{base_url}/streams?user_id={user_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::API_BASE_URL;

    #[test]
    fn test_resolve_bits() {
        assert_eq!(
            resolve(TopicKind::Bits, "44322889"),
            "channel-bits-events-v1.44322889"
        );
    }

    #[test]
    fn test_resolve_whisper() {
        assert_eq!(resolve(TopicKind::Whisper, "1"), "whispers.1");
    }

    #[test]
    fn test_round_trip_every_kind() {
        for kind in TopicKind::ALL {
            let topic = resolve(kind, "12826");
            assert_eq!(parse_topic(&topic), Some((kind, "12826")));
        }
    }

    #[test]
    fn test_parse_unknown_prefix() {
        assert_eq!(parse_topic("video-playback.12826"), None);
        assert_eq!(parse_topic("whispers"), None);
        assert_eq!(parse_topic("whispers."), None);
        assert_eq!(parse_topic("channel-bits-events-v1."), None);
    }

    #[test]
    fn test_kind_from_str() {
        assert_eq!("bits".parse::<TopicKind>().unwrap(), TopicKind::Bits);
        assert_eq!("commerce".parse::<TopicKind>().unwrap(), TopicKind::Commerce);
        let err = "follows".parse::<TopicKind>().unwrap_err();
        assert!(matches!(err, Error::UnknownTopic(ref s) if s == "follows"));
    }

    #[test]
    fn test_kind_serde() {
        let json = serde_json::to_string(&TopicKind::Subscription).unwrap();
        assert_eq!(json, r#""subscription""#);
        let kind: TopicKind = serde_json::from_str(r#""whisper""#).unwrap();
        assert_eq!(kind, TopicKind::Whisper);
    }

    #[test]
    fn test_user_follows_topic() {
        assert_eq!(
            user_follows_topic(API_BASE_URL, None, Some("123")),
            "https://api.twitch.tv/helix/users/follows?first=1&to_id=123"
        );
        assert_eq!(
            user_follows_topic(API_BASE_URL, Some("9"), Some("123")),
            "https://api.twitch.tv/helix/users/follows?first=1&from_id=9"
        );
    }

    #[test]
    fn test_stream_topic() {
        assert_eq!(
            stream_topic(API_BASE_URL, "123"),
            "https://api.twitch.tv/helix/streams?user_id=123"
        );
    }
}
