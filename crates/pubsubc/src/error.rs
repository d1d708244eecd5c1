use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use pubsub_common::CodecError;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Errors that can occur while acquiring a token or running a session.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Required configuration is missing or out of range.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
    /// The WebSocket dial failed at the transport level.
    #[error("dial failed to connect: {0}")]
    DialFailed(#[source] tungstenite::Error),
    /// The WebSocket dial did not complete in time.
    #[error("dial timed out after {0:?}")]
    DialTimeout(Duration),
    /// The initial LISTEN could not be written.
    #[error("pubsub client failed to auth: {0}")]
    AuthSendFailed(#[source] tungstenite::Error),
    /// The OAuth callback listener could not bind its port.
    #[error("failed to bind oauth callback listener on {addr}: {source}")]
    ListenerBind {
        /// Address that was requested.
        addr: SocketAddr,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The OAuth callback listener stopped unexpectedly.
    #[error("oauth callback listener closed unexpectedly: {0}")]
    ListenerFailed(#[source] std::io::Error),
    /// The callback `state` did not match the most recently issued value.
    #[error("session state mismatch")]
    StateMismatch,
    /// The authorization code could not be exchanged for a token.
    #[error("failed to exchange oauth code for a token")]
    ExchangeFailed(String),
    /// The token channel closed before a token was delivered.
    #[error("token source closed before delivering a token")]
    TokenUnavailable,
    /// WebSocket transport error after the session started.
    #[error("websocket error: {0}")]
    Transport(#[from] tungstenite::Error),
    /// The close rendezvous did not complete in time.
    #[error("close did not complete within {0:?}")]
    CloseTimeout(Duration),
    /// Installing the shutdown signal handler failed.
    #[error("failed to listen for shutdown signal: {0}")]
    Signal(#[source] std::io::Error),
    /// Envelope encoding or decoding error.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl ClientError {
    /// HTTP status reported to the browser for errors on the OAuth callback surface.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::StateMismatch | Self::ExchangeFailed(_) => StatusCode::UNAUTHORIZED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ClientError {
    fn into_response(self) -> Response {
        (self.status_code(), self.to_string()).into_response()
    }
}
