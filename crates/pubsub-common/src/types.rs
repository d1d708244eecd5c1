//! Protocol constants, error codes and topic key helpers.

/// Default pub/sub WebSocket endpoint.
pub const DEFAULT_ENDPOINT: &str = "wss://pubsub-edge.twitch.tv";

/// Application-level keepalive frame sent by the client.
pub const PING_FRAME: &str = r#"{"type":"PING"}"#;

/// Topic namespace for channel points redemptions.
pub const CHANNEL_POINTS_NAMESPACE: &str = "channel-points-channel-v1";

/// Error codes carried in the `error` field of RESPONSE frames.
pub mod error_code {
    /// The auth token was rejected; the session must be terminated.
    pub const BAD_AUTH: &str = "ERR_BADAUTH";
    /// The request could not be parsed by the server.
    pub const BAD_MESSAGE: &str = "ERR_BADMESSAGE";
    /// The requested topic is unknown or not permitted.
    pub const BAD_TOPIC: &str = "ERR_BADTOPIC";
    /// Transient upstream failure.
    pub const SERVER: &str = "ERR_SERVER";
}

/// Event type tags found inside MESSAGE payloads.
pub mod event_type {
    /// A viewer redeemed a channel points reward.
    pub const REWARD_REDEEMED: &str = "reward-redeemed";
}

/// Builds a topic key of the form `<namespace>.<channel-id>`.
///
/// # Examples
///
/// ```
/// use pubsub_common::types::topic_key;
/// assert_eq!(topic_key("channel-points-channel-v1", "123"), "channel-points-channel-v1.123");
/// ```
#[must_use]
pub fn topic_key(namespace: &str, channel_id: &str) -> String {
    format!("{namespace}.{channel_id}")
}

/// Topic key for channel points redemptions on the given channel.
#[must_use]
pub fn channel_points_topic(channel_id: &str) -> String {
    topic_key(CHANNEL_POINTS_NAMESPACE, channel_id)
}
