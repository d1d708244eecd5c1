//! Envelope framing for the JSON-over-WebSocket pub/sub protocol.
//!
//! Every frame on the socket is a single JSON object:
//!
//! ```text
//! {"type": "LISTEN", "nonce": "<64 hex>", "data": {"auth_token": "...", "topics": ["..."]}}
//! {"type": "RESPONSE", "error": "", "nonce": "<echo>"}
//! {"type": "MESSAGE", "data": {"topic": "...", "message": "<escaped JSON string>"}}
//! {"type": "PING"} / {"type": "PONG"}
//! ```
//!
//! The `data` member is kept as an opaque [`serde_json::Value`]; the typed
//! views live in [`AuthPayload`] and [`crate::event`].

use crate::nonce;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Kind tag of an envelope (`type` on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageKind {
    /// Client → server: subscribe to topics.
    Listen,
    /// Client → server: unsubscribe from topics.
    Unlisten,
    /// Client → server keepalive.
    Ping,
    /// Server → client keepalive reply.
    Pong,
    /// Server → client topic notification.
    Message,
    /// Server → client acknowledgement of a LISTEN/UNLISTEN.
    Response,
    /// Server → client request to reconnect.
    Reconnect,
    /// Any tag this client does not know about.
    #[serde(other)]
    Unknown,
}

/// Subscription requests the client can encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Subscribe.
    Listen,
    /// Unsubscribe.
    Unlisten,
}

impl From<RequestKind> for MessageKind {
    fn from(kind: RequestKind) -> Self {
        match kind {
            RequestKind::Listen => Self::Listen,
            RequestKind::Unlisten => Self::Unlisten,
        }
    }
}

/// Errors produced while encoding or decoding protocol messages.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The frame is not valid JSON or does not match the envelope shape.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(#[source] serde_json::Error),
    /// One of the nested decoding stages of a MESSAGE payload failed.
    #[error("failed to unwrap message ({stage}): {source}")]
    UnwrapFailed {
        /// Which nested layer could not be decoded.
        stage: UnwrapStage,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
    /// Unwrap was attempted on an envelope that is not a MESSAGE.
    #[error("cannot unwrap a {0:?} envelope")]
    NotAMessage(MessageKind),
    /// The envelope carries no `data` member.
    #[error("envelope has no data")]
    MissingData,
    /// Serializing an outbound envelope failed.
    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),
    /// The OS entropy source could not produce a nonce.
    #[error("failed to generate nonce: {0}")]
    Nonce(#[from] rand::Error),
}

/// Nested layer of a MESSAGE payload, used to report where unwrapping failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnwrapStage {
    /// `data` → `{topic, message}`.
    Outer,
    /// `message` string → `{type, data}`.
    Inner,
    /// Inner `data` → typed event variant.
    Event,
}

impl std::fmt::Display for UnwrapStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Outer => "outer",
            Self::Inner => "inner",
            Self::Event => "event",
        })
    }
}

/// Authorization payload carried by LISTEN and UNLISTEN requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthPayload {
    /// OAuth access token.
    pub auth_token: String,
    /// One topic key per subscription target.
    pub topics: Vec<String>,
}

/// One wire-level message of the pub/sub protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message kind.
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Error code reported by the server, empty on success.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    /// Correlation nonce, empty when not applicable.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub nonce: String,
    /// Opaque payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Envelope {
    /// Builds a LISTEN/UNLISTEN request with a freshly generated nonce.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Nonce`] if no entropy is available, or
    /// [`CodecError::Encode`] if the payload cannot be serialized.
    ///
    /// # Examples
    ///
    /// ```
    /// use pubsub_common::{Envelope, MessageKind, RequestKind};
    /// let topics = vec!["channel-points-channel-v1.123".to_string()];
    /// let env = Envelope::request(RequestKind::Listen, "abc", &topics).unwrap();
    /// assert_eq!(env.kind, MessageKind::Listen);
    /// assert_eq!(env.nonce.len(), 64);
    /// ```
    pub fn request(kind: RequestKind, token: &str, topics: &[String]) -> Result<Self, CodecError> {
        let payload = AuthPayload {
            auth_token: token.to_string(),
            topics: topics.to_vec(),
        };
        Ok(Self {
            kind: kind.into(),
            error: String::new(),
            nonce: nonce::generate()?,
            data: Some(serde_json::to_value(&payload).map_err(CodecError::Encode)?),
        })
    }

    /// Builds a bare keepalive envelope.
    #[must_use]
    pub const fn ping() -> Self {
        Self {
            kind: MessageKind::Ping,
            error: String::new(),
            nonce: String::new(),
            data: None,
        }
    }

    /// Parses one wire frame.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::MalformedEnvelope`] on JSON syntax or shape errors.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        serde_json::from_slice(bytes).map_err(CodecError::MalformedEnvelope)
    }

    /// Serializes the envelope to its text frame.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] if serialization fails.
    pub fn to_text(&self) -> Result<String, CodecError> {
        serde_json::to_string(self).map_err(CodecError::Encode)
    }

    /// Extracts the [`AuthPayload`] of a LISTEN/UNLISTEN envelope.
    ///
    /// Accepts the payload either as an embedded object or as a JSON string
    /// holding that object.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::MissingData`] when there is no payload, or
    /// [`CodecError::MalformedEnvelope`] when it is not an auth payload.
    pub fn auth_payload(&self) -> Result<AuthPayload, CodecError> {
        let data = self.data.as_ref().ok_or(CodecError::MissingData)?;
        match data {
            serde_json::Value::String(s) => {
                serde_json::from_str(s).map_err(CodecError::MalformedEnvelope)
            }
            other => AuthPayload::deserialize(other).map_err(CodecError::MalformedEnvelope),
        }
    }

    /// True if the server flagged this envelope with the given error code.
    #[must_use]
    pub fn has_error(&self, code: &str) -> bool {
        self.error == code
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{channel_points_topic, error_code, PING_FRAME};

    #[test]
    fn listen_request_serializes_expected_fields() {
        let topics = vec![channel_points_topic("123")];
        let env = Envelope::request(RequestKind::Listen, "abc", &topics).unwrap();
        let v: serde_json::Value = serde_json::from_str(&env.to_text().unwrap()).unwrap();

        assert_eq!(v["type"], "LISTEN");
        assert_eq!(v["nonce"].as_str().unwrap().len(), 64);
        assert_eq!(v["data"]["auth_token"], "abc");
        assert_eq!(v["data"]["topics"][0], "channel-points-channel-v1.123");
        assert!(v.get("error").is_none());
    }

    #[test]
    fn unlisten_request_has_unlisten_kind() {
        let env = Envelope::request(RequestKind::Unlisten, "t", &["x.1".to_string()]).unwrap();
        assert_eq!(env.kind, MessageKind::Unlisten);
        assert!(env.to_text().unwrap().contains(r#""type":"UNLISTEN""#));
    }

    #[test]
    fn ping_serializes_to_bare_frame() {
        assert_eq!(Envelope::ping().to_text().unwrap(), PING_FRAME);
    }

    #[test]
    fn decode_response_with_error() {
        let env =
            Envelope::decode(br#"{"type":"RESPONSE","error":"ERR_BADAUTH","nonce":"n1"}"#).unwrap();
        assert_eq!(env.kind, MessageKind::Response);
        assert!(env.has_error(error_code::BAD_AUTH));
        assert_eq!(env.nonce, "n1");
        assert!(env.data.is_none());
    }

    #[test]
    fn decode_pong_without_optional_fields() {
        let env = Envelope::decode(br#"{"type":"PONG"}"#).unwrap();
        assert_eq!(env.kind, MessageKind::Pong);
        assert!(env.error.is_empty());
        assert!(env.nonce.is_empty());
    }

    #[test]
    fn decode_unknown_kind_is_tolerated() {
        let env = Envelope::decode(br#"{"type":"SOMETHING_NEW"}"#).unwrap();
        assert_eq!(env.kind, MessageKind::Unknown);
    }

    #[test]
    fn decode_syntax_error_is_malformed() {
        assert!(matches!(
            Envelope::decode(b"{\"type\":"),
            Err(CodecError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn decode_missing_type_is_malformed() {
        assert!(matches!(
            Envelope::decode(br#"{"nonce":"x"}"#),
            Err(CodecError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn auth_payload_accepts_string_encoded_data() {
        let frame = r#"{"type":"LISTEN","nonce":"n","data":"{\"auth_token\":\"t\",\"topics\":[\"a.1\"]}"}"#;
        let payload = Envelope::decode(frame.as_bytes())
            .unwrap()
            .auth_payload()
            .unwrap();
        assert_eq!(payload.auth_token, "t");
        assert_eq!(payload.topics, vec!["a.1".to_string()]);
    }

    #[test]
    fn auth_payload_missing_data() {
        assert!(matches!(
            Envelope::ping().auth_payload(),
            Err(CodecError::MissingData)
        ));
    }
}
