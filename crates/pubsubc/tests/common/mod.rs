#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use pubsubc::connection::SessionConfig;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

/// What the mock server saw from the client.
#[derive(Debug, Clone, PartialEq)]
pub enum Recorded {
    Text(Value),
    Close(Option<u16>),
}

impl Recorded {
    pub fn kind(&self) -> Option<&str> {
        match self {
            Self::Text(v) => v["type"].as_str(),
            Self::Close(_) => None,
        }
    }
}

/// Single-connection pub/sub server that records client frames and lets
/// the test push frames to the client.
pub struct MockPubsub {
    pub addr: SocketAddr,
    frames_rx: mpsc::UnboundedReceiver<Recorded>,
    push_tx: mpsc::UnboundedSender<Message>,
}

impl MockPubsub {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (push_tx, mut push_rx) = mpsc::unbounded_channel::<Message>();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let (mut ws_tx, mut ws_rx) = ws.split();
            loop {
                tokio::select! {
                    msg = ws_rx.next() => {
                        let Some(Ok(msg)) = msg else { break };
                        let recorded = match msg {
                            Message::Text(text) => Recorded::Text(serde_json::from_str(&text).unwrap()),
                            Message::Close(frame) => Recorded::Close(frame.map(|f| u16::from(f.code))),
                            _ => continue,
                        };
                        if frames_tx.send(recorded).is_err() {
                            break;
                        }
                    }
                    Some(msg) = push_rx.recv() => {
                        if ws_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Self {
            addr,
            frames_rx,
            push_tx,
        }
    }

    pub fn endpoint(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn push(&self, frame: &Value) {
        self.push_raw(&frame.to_string());
    }

    pub fn push_raw(&self, text: &str) {
        self.push_tx.send(Message::Text(text.to_string().into())).unwrap();
    }

    /// Server-initiated close with the given status code.
    pub fn push_close(&self, code: u16) {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: "".into(),
        };
        self.push_tx.send(Message::Close(Some(frame))).unwrap();
    }

    pub async fn next_frame(&mut self) -> Recorded {
        tokio::time::timeout(Duration::from_secs(5), self.frames_rx.recv())
            .await
            .expect("timeout waiting for client frame")
            .expect("mock server stopped")
    }

    /// Skips frames until one of `kind` arrives.
    pub async fn expect_kind(&mut self, kind: &str) -> Value {
        loop {
            if let Recorded::Text(v) = self.next_frame().await {
                if v["type"] == kind {
                    return v;
                }
            }
        }
    }

    /// Collects every frame up to and including the close frame, ignoring PINGs.
    pub async fn frames_until_close(&mut self) -> Vec<Recorded> {
        let mut frames = Vec::new();
        loop {
            let frame = self.next_frame().await;
            let done = matches!(frame, Recorded::Close(_));
            if frame.kind() != Some("PING") {
                frames.push(frame);
            }
            if done {
                return frames;
            }
        }
    }

    /// Frames received within `wait`, ignoring PINGs.
    pub async fn drain(&mut self, wait: Duration) -> Vec<Recorded> {
        let mut frames = Vec::new();
        while let Ok(Some(frame)) = tokio::time::timeout(wait, self.frames_rx.recv()).await {
            if frame.kind() != Some("PING") {
                frames.push(frame);
            }
        }
        frames
    }
}

pub fn session_config(endpoint: String, ping_interval: Duration) -> SessionConfig {
    SessionConfig {
        endpoint,
        topics: vec!["channel-points-channel-v1.123".to_string()],
        ping_interval,
        dial_timeout: Duration::from_secs(5),
        final_write_timeout: Duration::from_secs(3),
    }
}

pub fn message_frame(topic: &str, event_type: &str, data: &Value) -> Value {
    json!({
        "type": "MESSAGE",
        "data": {
            "topic": topic,
            "message": json!({"type": event_type, "data": data}).to_string(),
        }
    })
}

pub fn redemption_data() -> Value {
    json!({
        "timestamp": "2021-03-04T17:02:15.123456789Z",
        "redemption": {
            "id": "r-1",
            "user": {"id": "u-1", "login": "viewer", "display_name": "Viewer"},
            "channel_id": "123",
            "redeemed_at": "2021-03-04T17:02:15.123456789Z",
            "reward": {
                "id": "w-1",
                "channel_id": "123",
                "title": "Hydrate",
                "prompt": "",
                "cost": 100,
                "is_user_input_required": false,
                "is_sub_only": false,
                "default_image": {
                    "url_1x": "https://example.com/1.png",
                    "url_2x": "https://example.com/2.png",
                    "url_4x": "https://example.com/4.png"
                },
                "background_color": "#FFFFFF",
                "is_enabled": true,
                "is_paused": false,
                "is_in_stock": true,
                "max_per_stream": {"is_enabled": false, "max_per_stream": 0},
                "should_redemptions_skip_request_queue": false
            },
            "status": "FULFILLED"
        }
    })
}
