//! Application events carried inside MESSAGE envelopes.
//!
//! A MESSAGE's `data` is `{"topic": "...", "message": "<escaped JSON>"}`,
//! where the escaped string itself decodes to `{"type": "...", "data": {...}}`.
//! [`Envelope::unwrap_event`] peels both layers and types the inner `data`
//! by its tag.

use crate::envelope::{CodecError, Envelope, MessageKind, UnwrapStage};
use crate::types::event_type;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A notification unwrapped from a MESSAGE envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    /// Topic key the notification was published on.
    pub topic: String,
    /// Event type tag, e.g. `reward-redeemed`.
    pub event_type: String,
    /// Typed payload, or the raw JSON text for unrecognized tags.
    pub payload: EventPayload,
}

/// Payload variants keyed by event type tag.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    /// `reward-redeemed`.
    RewardRedeemed(Box<RewardRedeemed>),
    /// Any other tag; the inner `data` as JSON text.
    Raw(String),
}

/// A viewer redeemed a channel points reward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardRedeemed {
    /// When the event was published.
    pub timestamp: DateTime<Utc>,
    /// The redemption itself.
    pub redemption: Redemption,
}

/// Details of a single redemption.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Redemption {
    /// Redemption id.
    pub id: String,
    /// Viewer who redeemed.
    pub user: RedeemingUser,
    /// Channel the reward belongs to.
    pub channel_id: String,
    /// When the reward was redeemed.
    pub redeemed_at: DateTime<Utc>,
    /// The redeemed reward.
    pub reward: Reward,
    /// `UNFULFILLED`, `FULFILLED` or `CANCELED`.
    #[serde(default)]
    pub status: String,
    /// Text entered by the viewer, when the reward asks for it.
    #[serde(default)]
    pub user_input: Option<String>,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedeemingUser {
    pub id: String,
    pub login: String,
    pub display_name: String,
}

/// Custom reward definition as it was at redemption time.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reward {
    pub id: String,
    pub channel_id: String,
    pub title: String,
    #[serde(default)]
    pub prompt: String,
    pub cost: i64,
    #[serde(default)]
    pub is_user_input_required: bool,
    #[serde(default)]
    pub is_sub_only: bool,
    #[serde(default)]
    pub image: Option<RewardImage>,
    #[serde(default)]
    pub default_image: Option<RewardImage>,
    #[serde(default)]
    pub background_color: String,
    #[serde(default)]
    pub is_enabled: bool,
    #[serde(default)]
    pub is_paused: bool,
    #[serde(default)]
    pub is_in_stock: bool,
    #[serde(default)]
    pub max_per_stream: MaxPerStream,
    #[serde(default)]
    pub should_redemptions_skip_request_queue: bool,
    #[serde(default)]
    pub template_id: Option<serde_json::Value>,
    #[serde(default)]
    pub updated_for_indicator_at: Option<DateTime<Utc>>,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardImage {
    pub url_1x: String,
    pub url_2x: String,
    pub url_4x: String,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaxPerStream {
    pub is_enabled: bool,
    pub max_per_stream: i64,
}

#[derive(Deserialize)]
struct TopicMessage {
    topic: String,
    message: String,
}

#[derive(Deserialize)]
struct TaggedData {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    data: serde_json::Value,
}

impl Envelope {
    /// Unwraps a MESSAGE envelope into a typed [`InboundEvent`].
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::NotAMessage`] for other kinds,
    /// [`CodecError::MissingData`] without a payload, and
    /// [`CodecError::UnwrapFailed`] when any nested layer fails to decode.
    pub fn unwrap_event(&self) -> Result<InboundEvent, CodecError> {
        if self.kind != MessageKind::Message {
            return Err(CodecError::NotAMessage(self.kind));
        }
        let data = self.data.as_ref().ok_or(CodecError::MissingData)?;

        let outer: TopicMessage = match data {
            serde_json::Value::String(s) => serde_json::from_str(s),
            other => TopicMessage::deserialize(other),
        }
        .map_err(|source| CodecError::UnwrapFailed {
            stage: UnwrapStage::Outer,
            source,
        })?;

        let inner: TaggedData =
            serde_json::from_str(&outer.message).map_err(|source| CodecError::UnwrapFailed {
                stage: UnwrapStage::Inner,
                source,
            })?;

        let payload = if inner.event_type == event_type::REWARD_REDEEMED {
            let redeemed = RewardRedeemed::deserialize(&inner.data).map_err(|source| {
                CodecError::UnwrapFailed {
                    stage: UnwrapStage::Event,
                    source,
                }
            })?;
            EventPayload::RewardRedeemed(Box::new(redeemed))
        } else {
            EventPayload::Raw(inner.data.to_string())
        };

        Ok(InboundEvent {
            topic: outer.topic,
            event_type: inner.event_type,
            payload,
        })
    }
}
