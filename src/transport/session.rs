//! Session transport: handshake, channel lifecycle and event delivery
//!
//! One [`SessionTransport`] owns at most one live channel. Connecting is
//! guarded so overlapping `connect()` calls cannot create two sessions,
//! and `disconnect()` cancels a connect that is still in flight.

use super::channel::{ChannelConnector, ChannelFrame, ChannelInbound, ChannelIo};
use super::handshake::SessionApi;
use super::protocol::{
    is_normal_closure, ClientMessage, ServerMessage, TransportEvent, CLOSE_ABNORMAL, CLOSE_NORMAL,
};
use crate::identity::{IdentityContext, UserProfile};
use crate::utils::{retry, RetryPolicy};
use crate::{BriefError, Result};
use parking_lot::Mutex;
use reqwest::Url;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Connection status of the transport
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionStatus {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Error,
}

/// An established conversation session
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Session {
    pub session_id: String,
    pub agent_id: Option<String>,
    pub user_id: String,
}

/// Result of a `connect()` call
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// A new session was established
    Connected(Session),
    /// Another connect is in flight; this call did nothing
    AlreadyConnecting,
    /// A session is already live
    AlreadyConnected(Session),
    /// `disconnect()` was called before the connect finished
    Cancelled,
}

/// Result of [`SessionTransport::begin`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectStart {
    /// The connect is claimed; pass the ticket to `finish`
    Begun(ConnectTicket),
    /// Nothing to do
    Done(ConnectOutcome),
}

/// A connect claimed by [`SessionTransport::begin`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectTicket {
    pub epoch: u64,
    generation: u64,
}

/// Transport event tagged with the epoch it was connected under
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportEnvelope {
    pub epoch: u64,
    pub event: TransportEvent,
}

struct TransportState {
    status: ConnectionStatus,
    session: Option<Session>,
    outbound: Option<mpsc::UnboundedSender<ChannelFrame>>,
    pump: Option<JoinHandle<()>>,
    epoch: u64,
    generation: u64,
}

struct Inner {
    api: Arc<dyn SessionApi>,
    connector: Arc<dyn ChannelConnector>,
    ws_base_url: String,
    retry: RetryPolicy,
    state: Mutex<TransportState>,
    events: mpsc::UnboundedSender<TransportEnvelope>,
    cancel: watch::Sender<u64>,
}

/// Client side of a conversation session
#[derive(Clone)]
pub struct SessionTransport {
    inner: Arc<Inner>,
}

impl SessionTransport {
    /// Create a transport and the receiver its events are delivered on
    pub fn new(
        api: Arc<dyn SessionApi>,
        connector: Arc<dyn ChannelConnector>,
        ws_base_url: impl Into<String>,
        retry: RetryPolicy,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEnvelope>) {
        let (events, rx) = mpsc::unbounded_channel();
        let (cancel, _) = watch::channel(0);

        let inner = Inner {
            api,
            connector,
            ws_base_url: ws_base_url.into().trim_end_matches('/').to_string(),
            retry,
            state: Mutex::new(TransportState {
                status: ConnectionStatus::Idle,
                session: None,
                outbound: None,
                pump: None,
                epoch: 0,
                generation: 0,
            }),
            events,
            cancel,
        };

        (
            Self {
                inner: Arc::new(inner),
            },
            rx,
        )
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.state.lock().status
    }

    pub fn session(&self) -> Option<Session> {
        self.inner.state.lock().session.clone()
    }

    /// Establish a session for the signed-in user
    ///
    /// The handshake runs once; opening the channel is retried with the
    /// configured backoff. Events of the new session are tagged with `epoch`.
    pub async fn connect(&self, identity: &IdentityContext, epoch: u64) -> Result<ConnectOutcome> {
        match self.begin(epoch) {
            ConnectStart::Begun(ticket) => self.finish(identity, ticket).await,
            ConnectStart::Done(outcome) => Ok(outcome),
        }
    }

    /// Claim the transport for a connect under `epoch`
    ///
    /// Runs synchronously so a `disconnect()` issued right after it always
    /// cancels the connect, even before [`finish`](Self::finish) first runs.
    /// A connect or session left over from an older epoch is torn down.
    pub fn begin(&self, epoch: u64) -> ConnectStart {
        let mut state = self.inner.state.lock();
        match state.status {
            ConnectionStatus::Connecting if state.epoch == epoch => {
                info!("Connect already in progress, ignoring");
                return ConnectStart::Done(ConnectOutcome::AlreadyConnecting);
            }
            ConnectionStatus::Connected if state.epoch == epoch => {
                if let Some(session) = state.session.clone() {
                    info!("Already connected to session {}", session.session_id);
                    return ConnectStart::Done(ConnectOutcome::AlreadyConnected(session));
                }
            }
            ConnectionStatus::Connecting | ConnectionStatus::Connected => {
                info!("Replacing connection of epoch {}", state.epoch);
                self.close_channel(&mut state);
            }
            _ => {}
        }

        state.status = ConnectionStatus::Connecting;
        state.epoch = epoch;
        state.generation += 1;
        self.inner.cancel.send_replace(state.generation);
        ConnectStart::Begun(ConnectTicket {
            epoch,
            generation: state.generation,
        })
    }

    /// Run the handshake and open the channel for a claimed connect
    pub async fn finish(
        &self,
        identity: &IdentityContext,
        ticket: ConnectTicket,
    ) -> Result<ConnectOutcome> {
        let ConnectTicket { epoch, generation } = ticket;
        let mut cancelled = self.inner.cancel.subscribe();
        if *cancelled.borrow_and_update() != generation {
            debug!("Connect for epoch {} cancelled before it started", epoch);
            return Ok(ConnectOutcome::Cancelled);
        }

        let result = tokio::select! {
            biased;
            _ = cancelled.wait_for(|current| *current != generation) => {
                info!("Connect cancelled");
                return Ok(ConnectOutcome::Cancelled);
            }
            result = self.establish(identity) => result,
        };

        let (session, io) = match result {
            Ok(established) => established,
            Err(e) => {
                let mut state = self.inner.state.lock();
                if state.generation == generation {
                    state.status = ConnectionStatus::Error;
                }
                error!("Connect failed: {}", e);
                return Err(e);
            }
        };

        let mut state = self.inner.state.lock();
        if state.generation != generation {
            // Disconnected between establishing and taking the lock
            let _ = io.outbound.send(ChannelFrame::Close {
                code: CLOSE_NORMAL,
                reason: "Client disconnect".into(),
            });
            return Ok(ConnectOutcome::Cancelled);
        }

        let _ = self.inner.events.send(TransportEnvelope {
            epoch,
            event: TransportEvent::Opened,
        });

        state.outbound = Some(io.outbound);
        state.pump = Some(tokio::spawn(pump(
            self.inner.clone(),
            io.inbound,
            epoch,
            generation,
        )));
        state.session = Some(session.clone());
        state.status = ConnectionStatus::Connected;
        info!("Connected to session {}", session.session_id);

        Ok(ConnectOutcome::Connected(session))
    }

    async fn establish(&self, identity: &IdentityContext) -> Result<(Session, ChannelIo)> {
        let user = identity
            .current_user()
            .ok_or_else(|| BriefError::AuthenticationError("Not authenticated".into()))?;
        let token = identity.token();

        let info = self.inner.api.create_session(&user, token.as_deref()).await?;
        let url = self.channel_url(&info.session_id, &user)?;

        let connector = self.inner.connector.clone();
        let io = retry(&self.inner.retry, |attempt| {
            let connector = connector.clone();
            let url = url.clone();
            async move {
                debug!("Opening channel, attempt {}", attempt);
                connector.open(&url).await
            }
        })
        .await?;

        let session = Session {
            session_id: info.session_id,
            agent_id: info.agent_id,
            user_id: user.id,
        };
        Ok((session, io))
    }

    fn channel_url(&self, session_id: &str, user: &UserProfile) -> Result<String> {
        let base = format!(
            "{}/api/session/{}/chat",
            self.inner.ws_base_url, session_id
        );
        let mut url = Url::parse(&base)
            .map_err(|e| BriefError::ConfigError(format!("Invalid channel URL {}: {}", base, e)))?;
        url.query_pairs_mut().append_pair("userId", &user.id);
        Ok(url.into())
    }

    /// Send a user turn over the open channel
    pub fn send(&self, text: &str) -> Result<()> {
        let state = self.inner.state.lock();
        let outbound = state
            .outbound
            .as_ref()
            .ok_or_else(|| BriefError::TransportError("Not connected".into()))?;

        let frame = ClientMessage::Message {
            content: text.to_string(),
        }
        .to_json()?;

        outbound
            .send(ChannelFrame::Text(frame))
            .map_err(|_| BriefError::TransportError("Channel closed".into()))?;
        debug!("Sent user turn ({} chars)", text.len());
        Ok(())
    }

    /// Close the channel and cancel any connect in flight
    ///
    /// Safe to call repeatedly; the status always ends up `Disconnected`.
    pub fn disconnect(&self) {
        let mut state = self.inner.state.lock();
        self.close_channel(&mut state);
        state.status = ConnectionStatus::Disconnected;
    }

    fn close_channel(&self, state: &mut TransportState) {
        state.generation += 1;
        self.inner.cancel.send_replace(state.generation);

        if let Some(outbound) = state.outbound.take() {
            if let Ok(close) = ClientMessage::Close.to_json() {
                let _ = outbound.send(ChannelFrame::Text(close));
            }
            let _ = outbound.send(ChannelFrame::Close {
                code: CLOSE_NORMAL,
                reason: "Client disconnect".into(),
            });
        }
        if let Some(pump) = state.pump.take() {
            pump.abort();
        }
        if let Some(session) = state.session.take() {
            info!("Disconnected from session {}", session.session_id);
        }
    }
}

impl std::fmt::Debug for SessionTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionTransport")
            .field("ws_base_url", &self.inner.ws_base_url)
            .field("status", &self.status())
            .finish()
    }
}

/// Forward inbound frames as transport events until the channel closes
async fn pump(
    inner: Arc<Inner>,
    mut inbound: mpsc::UnboundedReceiver<ChannelInbound>,
    epoch: u64,
    generation: u64,
) {
    let (code, reason) = loop {
        match inbound.recv().await {
            Some(ChannelInbound::Text(text)) => {
                let message = match ServerMessage::parse(&text) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!("Dropping frame: {}", e);
                        continue;
                    }
                };
                if let ServerMessage::Unknown(kind) = &message {
                    debug!("Ignoring frame of type {}", kind);
                }
                if let Some(event) = TransportEvent::from_server(message) {
                    let _ = inner.events.send(TransportEnvelope { epoch, event });
                }
            }
            Some(ChannelInbound::Closed { code, reason }) => break (code, reason),
            None => break (CLOSE_ABNORMAL, "abnormal closure".to_string()),
        }
    };

    {
        let mut state = inner.state.lock();
        if state.generation != generation {
            return;
        }
        state.outbound = None;
        state.session = None;
        state.pump = None;
        state.status = if is_normal_closure(code) {
            ConnectionStatus::Disconnected
        } else {
            ConnectionStatus::Error
        };
    }

    if is_normal_closure(code) {
        info!("Session closed normally ({})", code);
    } else {
        warn!("Session closed unexpectedly ({}): {}", code, reason);
    }
    let _ = inner.events.send(TransportEnvelope {
        epoch,
        event: TransportEvent::Closed { code, reason },
    });
}
