use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use secrecy::{ExposeSecret as _, SecretString};
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::dispatcher::{ConnectEvent, DisconnectEvent, DisconnectReason, Dispatcher, ErrorEvent};
use super::types::request::ClientFrame;
use super::types::response::{ServerFrame, decode};
use crate::Result;
use crate::error::Error;
use crate::ws::config::Config;
use crate::ws::connection::{self, ConnectionState, Termination};
use crate::ws::reconnect::ReconnectPolicy;
use crate::ws::{WireProtocol, WsError};

/// Path of the team-chat WebSocket endpoint.
pub const TEAM_CHAT_PATH: &str = "/ws/team-chat";

/// JSON frame protocol spoken on the team-chat socket.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default)]
pub struct ChatProtocol;

impl WireProtocol for ChatProtocol {
    type Message = ServerFrame;

    fn parse(&self, bytes: &[u8]) -> Result<Option<ServerFrame>> {
        decode(bytes)
    }

    fn ping(&self) -> Result<String> {
        ClientFrame::Ping.encode()
    }

    fn is_pong(&self, message: &ServerFrame) -> bool {
        matches!(message, ServerFrame::Pong)
    }
}

/// Identity established for the lifetime of one connection.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Team the connection is bound to
    pub team_id: String,
    /// Identity confirmed by the server's `connected` frame, once it has arrived
    pub user_id: Option<String>,
}

/// Real-time team-chat session client.
///
/// Owns at most one physical connection at a time. [`Client::connect`] opens a connection bound
/// to a team, sends `join_team` right after every open and reconnects after involuntary closes
/// according to the configured [`ReconnectConfig`](crate::ws::config::ReconnectConfig).
/// Everything that arrives from the server is delivered through [`Client::dispatcher`].
///
/// Clones share the same session. The connection is shut down when the last clone is dropped.
///
/// # Examples
///
/// ```rust, no_run
/// use team_chat_transport::chat::Client;
/// use team_chat_transport::ws::config::Config;
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let client = Client::new("wss://practice.example.com", Config::default())?
///         .with_token("bearer-token");
///
///     let _messages = client.dispatcher().on_message(|message| {
///         println!("{}: {}", message.sender_name, message.content);
///     });
///
///     client.connect("team-1")?;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Client {
    owner: Arc<Owner>,
}

/// Shuts the session down once every [`Client`] clone is gone. Background tasks hold the inner
/// state directly and so do not keep the session alive.
struct Owner(Arc<ClientInner>);

impl Drop for Owner {
    fn drop(&mut self) {
        drop(self.0.shutdown());
    }
}

struct ClientInner {
    /// Configuration for the WebSocket connection
    config: Config,
    /// Endpoint without the token query parameter
    endpoint: Url,
    /// Bearer token appended to the endpoint on every open
    token: RwLock<Option<SecretString>>,
    /// Subscriber registries
    dispatcher: Dispatcher,
    /// Reconnection timer
    reconnect: ReconnectPolicy,
    /// Watch channel sender for state changes
    state_tx: watch::Sender<ConnectionState>,
    /// Incremented by every `connect`; tags the work belonging to one connect request
    generation: AtomicU64,
    /// The connection currently owned by this client, if any
    current: Mutex<Option<Active>>,
    /// Held by a connection task from before it opens until its socket is dropped
    socket: AsyncMutex<()>,
}

/// Book-keeping for the connection belonging to the latest `connect`.
struct Active {
    generation: u64,
    team_id: String,
    cancel: CancellationToken,
    /// Present only while the socket is open
    outbound: Option<mpsc::UnboundedSender<String>>,
    session: Option<Session>,
}

impl Client {
    /// Create a new client for the server at `endpoint`.
    ///
    /// The `endpoint` should be the base WebSocket URL (e.g. `wss://...`); the team-chat path is
    /// appended automatically. No connection is made until [`Client::connect`].
    pub fn new(endpoint: &str, config: Config) -> Result<Self> {
        let endpoint = team_chat_endpoint(endpoint)?;
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

        let inner = ClientInner {
            reconnect: ReconnectPolicy::new(config.reconnect.clone()),
            config,
            endpoint,
            token: RwLock::new(None),
            dispatcher: Dispatcher::new(),
            state_tx,
            generation: AtomicU64::new(0),
            current: Mutex::new(None),
            socket: AsyncMutex::new(()),
        };

        Ok(Self {
            owner: Arc::new(Owner(Arc::new(inner))),
        })
    }

    /// Supply the bearer token and return the client, for chaining after [`Client::new`].
    #[must_use]
    pub fn with_token<S: Into<String>>(self, token: S) -> Self {
        self.set_token(token);
        self
    }

    /// Supply or replace the bearer token used for every subsequent open.
    pub fn set_token<S: Into<String>>(&self, token: S) {
        *self
            .inner()
            .token
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(SecretString::from(token.into()));
    }

    /// Forget the bearer token. Pending reconnections will stop at their next attempt.
    pub fn clear_token(&self) {
        *self
            .inner()
            .token
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Connect to `team_id`, replacing any connection this client already owns.
    ///
    /// Returns immediately; the outcome is reported to `connect`, `disconnect` and `error`
    /// subscribers. The new socket is opened only after the previous one has been dropped.
    ///
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime, since the connection runs on a spawned task.
    ///
    /// # Errors
    ///
    /// Fails with [`Kind::Unauthenticated`](crate::error::Kind::Unauthenticated) when no token was
    /// supplied. No attempt is made and no retry is scheduled in that case.
    pub fn connect<S: Into<String>>(&self, team_id: S) -> Result<()> {
        let inner = self.inner();
        let team_id = team_id.into();

        if !inner.has_token() {
            #[cfg(feature = "tracing")]
            tracing::warn!(team_id = %team_id, "Refusing to connect without a bearer token");
            return Err(Error::unauthenticated());
        }

        if let Some(previous) = inner.shutdown() {
            inner.notify_disconnect(previous, DisconnectReason::Requested);
        }

        let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut current = inner.lock_current();
            *current = Some(Active {
                generation,
                team_id: team_id.clone(),
                cancel: CancellationToken::new(),
                outbound: None,
                session: None,
            });
            inner.set_state(ConnectionState::Connecting);
        }

        #[cfg(feature = "tracing")]
        tracing::info!(team_id = %team_id, endpoint = %inner.endpoint, "Connecting to team chat");

        tokio::spawn(ClientInner::establish(Arc::clone(inner), generation, team_id, 0));
        Ok(())
    }

    /// Close the connection and cancel any pending reconnection.
    ///
    /// Terminal until [`Client::connect`] is called again. When a connection was open,
    /// `disconnect` subscribers are notified with [`DisconnectReason::Requested`].
    pub fn disconnect(&self) {
        let inner = self.inner();
        if let Some(previous) = inner.shutdown() {
            inner.notify_disconnect(previous, DisconnectReason::Requested);
        }
    }

    /// Post a message to the bound team.
    ///
    /// The frame is handed to the open connection immediately; nothing is queued for later.
    ///
    /// # Errors
    ///
    /// Fails with [`Kind::InvalidState`](crate::error::Kind::InvalidState) when the client is not
    /// connected. Nothing is written to the wire in that case.
    pub fn send<S: Into<String>>(&self, message: S) -> Result<()> {
        self.send_frame(&ClientFrame::send_message(message))
    }

    fn send_frame(&self, frame: &ClientFrame) -> Result<()> {
        let inner = self.inner();
        let current = inner.lock_current();

        let outbound = current
            .as_ref()
            .and_then(|active| active.outbound.as_ref())
            .filter(|_| inner.state().is_connected())
            .ok_or(WsError::NotConnected)?;

        let json = frame.encode()?;
        outbound
            .send(json)
            .map_err(|_e| WsError::NotConnected)?;
        Ok(())
    }

    /// Subscriber registries for everything this client delivers.
    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner().dispatcher
    }

    /// Get the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner().state()
    }

    /// Subscribe to connection state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner().state_tx.subscribe()
    }

    /// Identity of the open connection, if any.
    #[must_use]
    pub fn session(&self) -> Option<Session> {
        self.inner()
            .lock_current()
            .as_ref()
            .and_then(|active| active.session.clone())
    }

    /// Team the latest `connect` bound this client to, while it has not been disconnected.
    #[must_use]
    pub fn team_id(&self) -> Option<String> {
        self.inner()
            .lock_current()
            .as_ref()
            .map(|active| active.team_id.clone())
    }

    /// Whether a reconnection attempt is scheduled.
    #[must_use]
    pub fn reconnect_pending(&self) -> bool {
        self.inner().reconnect.is_pending()
    }

    fn inner(&self) -> &Arc<ClientInner> {
        &self.owner.0
    }
}

impl ClientInner {
    fn lock_current(&self) -> MutexGuard<'_, Option<Active>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    fn has_token(&self) -> bool {
        self.token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Endpoint with the bearer token in the query string.
    fn authenticated_url(&self) -> Option<Url> {
        let token = self.token.read().unwrap_or_else(PoisonError::into_inner);
        let token = token.as_ref()?;

        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("token", token.expose_secret());
        Some(url)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.lock_current()
            .as_ref()
            .is_some_and(|active| active.generation == generation)
    }

    fn cancel_token(&self, generation: u64) -> Option<CancellationToken> {
        self.lock_current()
            .as_ref()
            .filter(|active| active.generation == generation)
            .map(|active| active.cancel.clone())
    }

    /// Cancel the reconnection timer, then tear down the connection.
    ///
    /// Returns the bound team if a connection was open at the time.
    fn shutdown(&self) -> Option<String> {
        self.reconnect.cancel();

        let (previous, was_connected) = {
            let mut current = self.lock_current();
            let was_connected = self.state().is_connected();
            let previous = current.take();
            self.set_state(ConnectionState::Disconnected);
            (previous, was_connected)
        };

        let active = previous?;
        active.cancel.cancel();

        #[cfg(feature = "tracing")]
        tracing::debug!(team_id = %active.team_id, "Tore down team chat connection");

        was_connected.then_some(active.team_id)
    }

    fn notify_disconnect(&self, team_id: String, reason: DisconnectReason) {
        self.dispatcher
            .emit_disconnect(&DisconnectEvent { team_id, reason });
    }

    /// Open one physical connection for `generation` and drive it until it ends.
    async fn establish(inner: Arc<Self>, generation: u64, team_id: String, attempt: u32) {
        let Some(cancel) = inner.cancel_token(generation) else {
            return;
        };

        let Some(url) = inner.authenticated_url() else {
            #[cfg(feature = "tracing")]
            tracing::warn!(team_id = %team_id, "Bearer token was cleared; giving up on reconnection");
            let mut current = inner.lock_current();
            if current.as_ref().is_some_and(|active| active.generation == generation) {
                *current = None;
                inner.set_state(ConnectionState::Disconnected);
            }
            return;
        };

        // Wait for the superseded connection, if any, to let go of its socket.
        let slot = tokio::select! {
            () = cancel.cancelled() => return,
            slot = inner.socket.lock() => slot,
        };

        let opened = tokio::select! {
            () = cancel.cancelled() => return,
            opened = connection::open(url.as_str()) => opened,
        };

        let ws_stream = match opened {
            Ok(ws_stream) => ws_stream,
            Err(e) => {
                drop(slot);
                #[cfg(feature = "tracing")]
                tracing::warn!(team_id = %team_id, attempt, error = %e, "Unable to connect");
                if inner.is_current(generation) {
                    inner
                        .dispatcher
                        .emit_error(&ErrorEvent::Transport(e.to_string()));
                    inner.connection_lost(generation, team_id, attempt.saturating_add(1), None);
                }
                return;
            }
        };

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        {
            let mut current = inner.lock_current();
            let Some(active) = current
                .as_mut()
                .filter(|active| active.generation == generation)
            else {
                // Superseded while opening; dropping the stream closes it.
                return;
            };

            // `join_team` is first in the queue, ahead of anything `send` may add.
            match ClientFrame::join_team(team_id.clone()).encode() {
                Ok(join) => drop(outbound_tx.send(join)),
                Err(e) => {
                    #[cfg(feature = "tracing")]
                    tracing::error!(error = %e, "Unable to encode join_team");
                    #[cfg(not(feature = "tracing"))]
                    let _ = &e;
                    return;
                }
            }

            active.outbound = Some(outbound_tx);
            active.session = Some(Session {
                team_id: team_id.clone(),
                user_id: None,
            });
            inner.set_state(ConnectionState::Connected {
                since: std::time::Instant::now(),
            });
        }
        inner.reconnect.reset();

        #[cfg(feature = "tracing")]
        tracing::info!(team_id = %team_id, attempt, "Connected to team chat");

        inner.dispatcher.emit_connect(&ConnectEvent {
            team_id: team_id.clone(),
            attempt,
        });

        let termination = connection::run(
            ws_stream,
            &ChatProtocol,
            &inner.config,
            &mut outbound_rx,
            &cancel,
            |frame| inner.handle_frame(generation, &frame),
        )
        .await;
        drop(outbound_rx);
        drop(slot);

        let reason = match termination {
            Termination::Requested => return,
            Termination::Closed => {
                #[cfg(feature = "tracing")]
                tracing::info!(team_id = %team_id, "Team chat connection closed by server");
                DisconnectReason::Closed
            }
            Termination::Failed(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(team_id = %team_id, error = %e, "Team chat connection failed");
                if inner.is_current(generation) {
                    inner
                        .dispatcher
                        .emit_error(&ErrorEvent::Transport(e.to_string()));
                }
                DisconnectReason::Failed
            }
        };

        inner.connection_lost(generation, team_id, 1, Some(reason));
    }

    /// Involuntary close: notify, then hand over to the reconnection policy.
    ///
    /// `reason` is `None` when the socket never opened, in which case subscribers saw no
    /// `connect` and are not told about a disconnect either.
    fn connection_lost(
        self: &Arc<Self>,
        generation: u64,
        team_id: String,
        attempt: u32,
        reason: Option<DisconnectReason>,
    ) {
        {
            let mut current = self.lock_current();
            let Some(active) = current
                .as_mut()
                .filter(|active| active.generation == generation)
            else {
                return;
            };
            active.outbound = None;
            active.session = None;
            self.set_state(ConnectionState::ClosedPendingReconnect { attempt });
        }

        if let Some(reason) = reason {
            self.notify_disconnect(team_id.clone(), reason);
        }

        // A subscriber may have called `connect` or `disconnect` from the notification.
        if !self.is_current(generation) {
            return;
        }

        let inner = Arc::downgrade(self);
        let retry_team = team_id.clone();
        let scheduled = self.reconnect.schedule(attempt, move || {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            {
                let current = inner.lock_current();
                if !current
                    .as_ref()
                    .is_some_and(|active| active.generation == generation)
                {
                    return;
                }
                inner.set_state(ConnectionState::Connecting);
            }

            #[cfg(feature = "tracing")]
            tracing::info!(team_id = %retry_team, attempt, "Reconnecting to team chat");

            tokio::spawn(Self::establish(inner, generation, retry_team, attempt));
        });

        if scheduled.is_none() {
            #[cfg(feature = "tracing")]
            tracing::warn!(team_id = %team_id, attempt, "Giving up on reconnection");

            let gave_up = {
                let mut current = self.lock_current();
                let ours = current
                    .as_ref()
                    .is_some_and(|active| active.generation == generation);
                if ours {
                    *current = None;
                    self.set_state(ConnectionState::Disconnected);
                }
                ours
            };
            if gave_up {
                self.notify_disconnect(team_id, DisconnectReason::RetriesExhausted);
            }
        }
    }

    /// Handle one decoded frame from the connection tagged `generation`.
    fn handle_frame(&self, generation: u64, frame: &ServerFrame) {
        {
            let mut current = self.lock_current();
            let Some(active) = current
                .as_mut()
                .filter(|active| active.generation == generation)
            else {
                #[cfg(feature = "tracing")]
                tracing::trace!(kind = frame.kind(), "Dropping frame from superseded connection");
                return;
            };

            match frame {
                ServerFrame::Connected { user_id } => {
                    #[cfg(feature = "tracing")]
                    tracing::info!(user_id = %user_id, team_id = %active.team_id, "Server confirmed identity");
                    if let Some(session) = active.session.as_mut() {
                        session.user_id = Some(user_id.clone());
                    }
                }
                ServerFrame::TeamJoined(joined) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(
                        team_id = %active.team_id,
                        recent = joined.recent_messages.len(),
                        "Joined team"
                    );
                    #[cfg(not(feature = "tracing"))]
                    let _ = joined;
                }
                ServerFrame::Error { error } => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(team_id = %active.team_id, error = %error, "Server reported an error");
                    #[cfg(not(feature = "tracing"))]
                    let _ = error;
                }
                _ => {}
            }
        }

        self.dispatcher.dispatch(frame);
    }
}

/// Normalize `endpoint` into the team-chat URL, without a token.
fn team_chat_endpoint(endpoint: &str) -> Result<Url> {
    let trimmed = endpoint.trim_end_matches('/');
    let base = trimmed
        .strip_suffix(TEAM_CHAT_PATH)
        .or_else(|| trimmed.strip_suffix("/ws"))
        .unwrap_or(trimmed);

    let url = Url::parse(&format!("{base}{TEAM_CHAT_PATH}"))?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(Error::validation(format!(
            "team chat endpoint must use ws or wss, got {other}"
        ))),
    }
}
