//! Wire types and codec shared by the pub/sub client.
//!
//! This crate provides:
//! - Envelope framing, LISTEN/UNLISTEN request encoding and decoding ([`envelope`])
//! - Typed unwrapping of MESSAGE payloads into application events ([`event`])
//! - Random hex nonces for request correlation ([`nonce`])
//! - Topic keys, error codes and protocol constants ([`types`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod envelope;
pub mod event;
pub mod nonce;
pub mod types;

pub use envelope::{AuthPayload, CodecError, Envelope, MessageKind, RequestKind};
pub use event::{EventPayload, InboundEvent, RewardRedeemed};
