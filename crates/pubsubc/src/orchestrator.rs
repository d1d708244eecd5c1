use crate::config::ClientConfig;
use crate::connection::{Session, SessionConfig};
use crate::error::ClientError;
use crate::oauth::{self, TokenAcquisition};
use pubsub_common::InboundEvent;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Ties token acquisition, the pub/sub session and shutdown together.
///
/// [`Orchestrator::run`] waits for a token, a cancellation, or a fatal
/// error from a subordinate task, whichever comes first, and on the way out
/// closes whatever it opened.
#[derive(Debug)]
pub struct Orchestrator {
    config: ClientConfig,
    events: broadcast::Sender<InboundEvent>,
    cancel: CancellationToken,
    fatal_tx: mpsc::Sender<ClientError>,
    fatal_rx: mpsc::Receiver<ClientError>,
}

impl Orchestrator {
    /// Creates an orchestrator that publishes events on `events`.
    #[must_use]
    pub fn new(config: ClientConfig, events: broadcast::Sender<InboundEvent>) -> Self {
        let (fatal_tx, fatal_rx) = mpsc::channel(8);
        Self {
            config,
            events,
            cancel: CancellationToken::new(),
            fatal_tx,
            fatal_rx,
        }
    }

    /// Token that stops [`Orchestrator::run`] cleanly when cancelled.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Channel for reporting errors that must end the process.
    #[must_use]
    pub fn fatal_sender(&self) -> mpsc::Sender<ClientError> {
        self.fatal_tx.clone()
    }

    /// Runs until cancelled or a fatal error occurs.
    ///
    /// # Errors
    ///
    /// Returns the first fatal error: a listener or dial failure, an error
    /// reported on the fatal channel, or a close that failed or timed out.
    pub async fn run(mut self) -> Result<(), ClientError> {
        let TokenAcquisition {
            mut token_rx,
            listener,
        } = oauth::acquire(
            &self.config.access_token,
            &self.config.oauth,
            self.fatal_tx.clone(),
        )
        .await?;

        let session_config = SessionConfig::from(&self.config);
        let mut session: Option<Session> = None;
        let mut awaiting_token = true;

        let outcome = loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    info!("shutdown requested");
                    break Ok(());
                }
                Some(e) = self.fatal_rx.recv() => {
                    error!(error = %e, "fatal error");
                    break Err(e);
                }
                token = &mut token_rx, if awaiting_token => {
                    awaiting_token = false;
                    let Ok(token) = token else {
                        break Err(ClientError::TokenUnavailable);
                    };
                    if let Some(listener) = &listener {
                        listener.close();
                    }
                    match Session::open(
                        &session_config,
                        &token,
                        self.cancel.child_token(),
                        self.events.clone(),
                    )
                    .await
                    {
                        Ok(s) => session = Some(s),
                        Err(e) => {
                            error!(error = %e, "failed to open pubsub session");
                            break Err(e);
                        }
                    }
                }
            }
        };

        let close_timeout = self.config.close_timeout();
        if let Some(listener) = listener {
            if timeout(close_timeout, listener.shutdown()).await.is_err() {
                debug!("oauth callback listener did not stop in time");
            }
        }

        let Some(mut session) = session else {
            return outcome;
        };
        let closed = match timeout(close_timeout, session.close()).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::CloseTimeout(close_timeout)),
        };
        if let Err(e) = closed {
            error!(error = %e, "failed to close pubsub session");
            return outcome.and(Err(e));
        }
        outcome
    }
}
