use crate::config::ClientConfig;
use crate::error::ClientError;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use pubsub_common::types::{error_code, PING_FRAME};
use pubsub_common::{Envelope, InboundEvent, MessageKind, RequestKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Reply half of a shutdown request: the writer hands the sink back on it
/// once it is done writing.
type ShutdownRequest = oneshot::Sender<WsSink>;

const BAD_AUTH_REASON: &str = "internal server error [BAD AUTH]";

/// Lifecycle of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Dialing the endpoint.
    Connecting,
    /// LISTEN sent.
    Authenticated,
    /// Reader and writer loops running.
    Running,
    /// Close rendezvous in progress.
    Closing,
    /// Transport closed.
    Closed,
    /// Dial, auth or transport failure.
    Failed,
}

/// Parameters for one pub/sub session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// WebSocket URL.
    pub endpoint: String,
    /// Topic keys to LISTEN on.
    pub topics: Vec<String>,
    /// PING cadence.
    pub ping_interval: Duration,
    /// Upper bound on the initial dial.
    pub dial_timeout: Duration,
    /// Upper bound on each write during close (UNLISTEN, close frame).
    pub final_write_timeout: Duration,
}

impl From<&ClientConfig> for SessionConfig {
    fn from(config: &ClientConfig) -> Self {
        Self {
            endpoint: config.endpoint.clone(),
            topics: config.topics(),
            ping_interval: config.ping_interval(),
            dial_timeout: Duration::from_secs(config.timeouts.dial_s),
            final_write_timeout: Duration::from_secs(config.timeouts.final_write_s),
        }
    }
}

/// An open pub/sub session: one WebSocket, one LISTEN, a reader loop and a
/// writer/heartbeat loop.
///
/// Dropping the session without calling [`Session::close`] stops the writer
/// and abandons the socket without UNLISTEN.
#[derive(Debug)]
pub struct Session {
    shutdown_tx: Option<mpsc::Sender<ShutdownRequest>>,
    state: Arc<watch::Sender<SessionState>>,
    bad_auth: Arc<AtomicBool>,
    final_write_timeout: Duration,
}

impl Session {
    /// Dials the endpoint, sends LISTEN with `token`, and starts the reader
    /// and writer loops.
    ///
    /// The reader exits silently when `cancel` fires. Unwrapped MESSAGE
    /// events go to `events`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::DialTimeout`] or [`ClientError::DialFailed`]
    /// if the socket cannot be opened, and [`ClientError::AuthSendFailed`]
    /// or [`ClientError::Codec`] if LISTEN cannot be sent.
    pub async fn open(
        config: &SessionConfig,
        token: &str,
        cancel: CancellationToken,
        events: broadcast::Sender<InboundEvent>,
    ) -> Result<Self, ClientError> {
        let state = Arc::new(watch::channel(SessionState::Connecting).0);

        let (ws, _) = match timeout(
            config.dial_timeout,
            tokio_tungstenite::connect_async(config.endpoint.as_str()),
        )
        .await
        {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                state.send_replace(SessionState::Failed);
                return Err(ClientError::DialFailed(e));
            }
            Err(_) => {
                state.send_replace(SessionState::Failed);
                return Err(ClientError::DialTimeout(config.dial_timeout));
            }
        };
        debug!(endpoint = %config.endpoint, "connected");
        let (mut ws_tx, ws_rx) = ws.split();

        let listen = Envelope::request(RequestKind::Listen, token, &config.topics)
            .and_then(|env| env.to_text())
            .inspect_err(|_| {
                state.send_replace(SessionState::Failed);
            })?;
        if let Err(e) = ws_tx.send(Message::Text(listen.into())).await {
            state.send_replace(SessionState::Failed);
            return Err(ClientError::AuthSendFailed(e));
        }
        state.send_replace(SessionState::Authenticated);
        info!(topics = ?config.topics, "listen sent");

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<ShutdownRequest>(1);
        let bad_auth = Arc::new(AtomicBool::new(false));
        let read_stop = cancel.child_token();

        tokio::spawn(
            Reader {
                ws_rx,
                cancel,
                read_stop: read_stop.clone(),
                events,
                bad_auth: bad_auth.clone(),
                shutdown_tx: shutdown_tx.downgrade(),
                state: state.clone(),
                final_write_timeout: config.final_write_timeout,
            }
            .run(),
        );
        tokio::spawn(
            Writer {
                ws_tx,
                shutdown_rx,
                read_stop,
                bad_auth: bad_auth.clone(),
                state: state.clone(),
                token: token.to_string(),
                topics: config.topics.clone(),
                ping_interval: config.ping_interval,
                final_write_timeout: config.final_write_timeout,
            }
            .run(),
        );

        state.send_replace(SessionState::Running);
        Ok(Self {
            shutdown_tx: Some(shutdown_tx),
            state,
            bad_auth,
            final_write_timeout: config.final_write_timeout,
        })
    }

    /// Unsubscribes and closes the socket with a normal-closure frame.
    ///
    /// Blocks until the writer has sent UNLISTEN (or skipped it because the
    /// server rejected the token). Subsequent calls return immediately.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Transport`] if the close frame cannot be
    /// written, or [`ClientError::CloseTimeout`] if writing it stalls.
    pub async fn close(&mut self) -> Result<(), ClientError> {
        let Some(shutdown_tx) = self.shutdown_tx.take() else {
            return Ok(());
        };
        request_close(
            &shutdown_tx,
            &self.state,
            CloseCode::Normal,
            "",
            self.final_write_timeout,
        )
        .await
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watches lifecycle transitions.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// True once the server answered with `ERR_BADAUTH`.
    #[must_use]
    pub fn is_auth_rejected(&self) -> bool {
        self.bad_auth.load(Ordering::Acquire)
    }
}

/// Rendezvous with the writer, then close the socket with `code`.
///
/// A writer that is already gone means the socket was closed elsewhere, so
/// that case is a no-op.
async fn request_close(
    shutdown_tx: &mpsc::Sender<ShutdownRequest>,
    state: &watch::Sender<SessionState>,
    code: CloseCode,
    reason: &'static str,
    write_timeout: Duration,
) -> Result<(), ClientError> {
    let closing = state.send_if_modified(|s| {
        let live = matches!(*s, SessionState::Authenticated | SessionState::Running);
        if live {
            *s = SessionState::Closing;
        }
        live
    });

    let (reply_tx, reply_rx) = oneshot::channel();
    let sink = match shutdown_tx.send(reply_tx).await {
        Ok(()) => reply_rx.await.ok(),
        Err(_) => None,
    };
    let Some(mut sink) = sink else {
        debug!("close requested but writer already stopped");
        if closing {
            state.send_replace(SessionState::Closed);
        }
        return Ok(());
    };

    if !closing {
        // Peer already closed; only flush the queued close reply.
        if let Ok(Err(e)) = timeout(write_timeout, sink.close()).await {
            debug!(error = %e, "flush after server close failed");
        }
        return Ok(());
    }

    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    let result = timeout(write_timeout, async {
        sink.send(Message::Close(Some(frame))).await?;
        sink.close().await
    })
    .await;
    state.send_replace(SessionState::Closed);

    match result {
        Ok(Ok(()) | Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed)) => {
            info!(code = u16::from(code), "pubsub session closed");
            Ok(())
        }
        Ok(Err(e)) => Err(ClientError::Transport(e)),
        Err(_) => Err(ClientError::CloseTimeout(write_timeout)),
    }
}

fn is_terminal(state: &SessionState) -> bool {
    matches!(state, SessionState::Closed | SessionState::Failed)
}

struct Reader {
    ws_rx: WsSource,
    cancel: CancellationToken,
    read_stop: CancellationToken,
    events: broadcast::Sender<InboundEvent>,
    bad_auth: Arc<AtomicBool>,
    shutdown_tx: mpsc::WeakSender<ShutdownRequest>,
    state: Arc<watch::Sender<SessionState>>,
    final_write_timeout: Duration,
}

impl Reader {
    async fn run(mut self) {
        loop {
            let msg = tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    debug!("reader cancelled");
                    return;
                }
                () = self.read_stop.cancelled() => {
                    debug!("reader stopped for shutdown");
                    return;
                }
                msg = self.ws_rx.next() => msg,
            };

            let msg = match msg {
                None | Some(Err(tungstenite::Error::ConnectionClosed)) => {
                    debug!("pubsub connection closed");
                    return;
                }
                Some(Err(e)) => {
                    error!(error = %e, "pubsub read failed");
                    self.state.send_replace(SessionState::Failed);
                    return;
                }
                Some(Ok(msg)) => msg,
            };

            let envelope = match msg {
                Message::Text(text) => Envelope::decode(text.as_bytes()),
                Message::Binary(data) => Envelope::decode(&data),
                Message::Close(frame) => {
                    self.server_closed(frame.as_ref());
                    return;
                }
                _ => continue,
            };
            let envelope = match envelope {
                Ok(env) => env,
                Err(e) => {
                    warn!(error = %e, "dropping undecodable frame");
                    continue;
                }
            };

            if !envelope.error.is_empty() {
                info!(error = %envelope.error, nonce = %envelope.nonce, "pubsub server reported an error");
                if envelope.has_error(error_code::BAD_AUTH) {
                    self.bad_auth.store(true, Ordering::Release);
                    self.close_bad_auth().await;
                    return;
                }
            }

            match envelope.kind {
                MessageKind::Message => match envelope.unwrap_event() {
                    Ok(event) => self.dispatch(event),
                    Err(e) => warn!(error = %e, "dropping message"),
                },
                MessageKind::Pong => debug!("pong received"),
                MessageKind::Response => debug!(nonce = %envelope.nonce, "response received"),
                MessageKind::Reconnect => warn!("server requested reconnect"),
                kind => debug!(kind = ?kind, "ignoring envelope"),
            }
        }
    }

    fn server_closed(&self, frame: Option<&CloseFrame>) {
        match frame {
            None => {
                debug!("server closed the pubsub connection");
                self.state.send_replace(SessionState::Closed);
            }
            Some(f) if f.code == CloseCode::Normal => {
                debug!(reason = %f.reason, "server closed the pubsub connection");
                self.state.send_replace(SessionState::Closed);
            }
            Some(f) => {
                error!(code = u16::from(f.code), reason = %f.reason, "server closed the pubsub connection abnormally");
                self.state.send_replace(SessionState::Failed);
            }
        }
    }

    fn dispatch(&self, event: InboundEvent) {
        debug!(topic = %event.topic, event_type = %event.event_type, "event received");
        if self.events.send(event).is_err() {
            debug!("event dropped: no active subscribers");
        }
    }

    async fn close_bad_auth(&self) {
        let Some(shutdown_tx) = self.shutdown_tx.upgrade() else {
            return;
        };
        if let Err(e) = request_close(
            &shutdown_tx,
            &self.state,
            CloseCode::Error,
            BAD_AUTH_REASON,
            self.final_write_timeout,
        )
        .await
        {
            warn!(error = %e, "failed to close session after bad auth");
        }
    }
}

struct Writer {
    ws_tx: WsSink,
    shutdown_rx: mpsc::Receiver<ShutdownRequest>,
    read_stop: CancellationToken,
    bad_auth: Arc<AtomicBool>,
    state: Arc<watch::Sender<SessionState>>,
    token: String,
    topics: Vec<String>,
    ping_interval: Duration,
    final_write_timeout: Duration,
}

impl Writer {
    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.ping_interval);
        loop {
            tokio::select! {
                biased;
                req = self.shutdown_rx.recv() => {
                    let Some(reply) = req else {
                        debug!("session dropped, writer exiting");
                        self.read_stop.cancel();
                        return;
                    };
                    self.read_stop.cancel();
                    if !self.bad_auth.load(Ordering::Acquire) && !is_terminal(&self.state.borrow()) {
                        self.unlisten().await;
                    }
                    // Closer gone means nobody will send the close frame.
                    if reply.send(self.ws_tx).is_err() {
                        debug!("close requester went away");
                    }
                    return;
                }
                _ = ticker.tick() => {
                    match self.ws_tx.send(Message::Text(PING_FRAME.into())).await {
                        Ok(()) => debug!("ping sent"),
                        Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                            debug!("connection closed, writer exiting");
                            return;
                        }
                        Err(e) => {
                            let failed = self.state.send_if_modified(|s| {
                                let live = !is_terminal(s);
                                if live {
                                    *s = SessionState::Failed;
                                }
                                live
                            });
                            if failed {
                                error!(error = %e, "failed to send ping");
                            } else {
                                debug!(error = %e, "connection already ended, writer exiting");
                            }
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn unlisten(&mut self) {
        let text = match Envelope::request(RequestKind::Unlisten, &self.token, &self.topics)
            .and_then(|env| env.to_text())
        {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "failed to encode unlisten");
                return;
            }
        };
        match timeout(
            self.final_write_timeout,
            self.ws_tx.send(Message::Text(text.into())),
        )
        .await
        {
            Ok(Ok(())) => info!("unlisten sent"),
            Ok(Err(e)) => warn!(error = %e, "failed to send unlisten"),
            Err(_) => warn!(timeout = ?self.final_write_timeout, "unlisten send timed out"),
        }
    }
}
