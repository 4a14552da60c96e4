//! Typed fan-out of decoded frames and connection lifecycle events.
//!
//! Each event kind has its own registry. A dispatch pass snapshots the registry before invoking
//! anything, so handlers that subscribe or unsubscribe while running only affect later passes.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use serde_json::Value;

use super::types::response::{ChatMessage, Presence, ServerFrame, TeamJoined};

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Delivered to `connect` subscribers once a connection is open and `join_team` is queued.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectEvent {
    /// Team the connection is bound to
    pub team_id: String,
    /// Reconnection attempt that succeeded, `0` for the initial connect
    pub attempt: u32,
}

/// Why a connection went away.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The server closed the connection
    Closed,
    /// The connection failed: socket error, failed open or missed heartbeat
    Failed,
    /// `disconnect` was called
    Requested,
    /// The reconnection policy ran out of attempts
    RetriesExhausted,
}

/// Delivered to `disconnect` subscribers.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectEvent {
    /// Team the lost connection was bound to
    pub team_id: String,
    pub reason: DisconnectReason,
}

/// Delivered to `error` subscribers. Errors are informational; the transport recovers by itself.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorEvent {
    /// The server sent an `error` frame, e.g. rejecting the token
    Server(String),
    /// The socket failed or the heartbeat timed out
    Transport(String),
}

impl fmt::Display for ErrorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server(message) => write!(f, "server error: {message}"),
            Self::Transport(message) => write!(f, "transport error: {message}"),
        }
    }
}

/// Revocation handle returned by every `on_*` registration.
///
/// [`Subscription::unsubscribe`] removes exactly the handler it was created for. Calling it more
/// than once, or after the dispatcher is gone, does nothing. Dropping the handle does not revoke.
#[derive(Clone)]
#[must_use = "keep the subscription to be able to unsubscribe"]
pub struct Subscription {
    revoke: Arc<dyn Fn() + Send + Sync>,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        (self.revoke)();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

struct Registry<T> {
    next_id: AtomicU64,
    handlers: DashMap<u64, Handler<T>>,
}

impl<T: 'static> Registry<T> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(0),
            handlers: DashMap::new(),
        })
    }

    fn insert(self: &Arc<Self>, handler: Handler<T>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers.insert(id, handler);

        let registry: Weak<Self> = Arc::downgrade(self);
        Subscription {
            revoke: Arc::new(move || {
                if let Some(registry) = registry.upgrade() {
                    registry.handlers.remove(&id);
                }
            }),
        }
    }

    /// Invoke every handler registered when the pass started. Returns how many ran.
    fn emit(&self, event: &T) -> usize {
        // Collect before calling out: a handler may touch this map.
        let snapshot: Vec<Handler<T>> = self
            .handlers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        for handler in &snapshot {
            handler(event);
        }

        snapshot.len()
    }

    fn len(&self) -> usize {
        self.handlers.len()
    }
}

/// Subscriber registries, one per event kind.
pub struct Dispatcher {
    message: Arc<Registry<ChatMessage>>,
    team_joined: Arc<Registry<TeamJoined>>,
    error: Arc<Registry<ErrorEvent>>,
    connect: Arc<Registry<ConnectEvent>>,
    disconnect: Arc<Registry<DisconnectEvent>>,
    user_joined: Arc<Registry<Presence>>,
    user_left: Arc<Registry<Presence>>,
    typing: Arc<Registry<Value>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self {
            message: Registry::new(),
            team_joined: Registry::new(),
            error: Registry::new(),
            connect: Registry::new(),
            disconnect: Registry::new(),
            user_joined: Registry::new(),
            user_left: Registry::new(),
            typing: Registry::new(),
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("handlers", &self.handler_count())
            .finish()
    }
}

impl Dispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Called for every `new_message` frame.
    pub fn on_message<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ChatMessage) + Send + Sync + 'static,
    {
        self.message.insert(Arc::new(handler))
    }

    /// Called once per `team_joined` frame with the whole history batch.
    pub fn on_team_joined<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&TeamJoined) + Send + Sync + 'static,
    {
        self.team_joined.insert(Arc::new(handler))
    }

    pub fn on_error<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ErrorEvent) + Send + Sync + 'static,
    {
        self.error.insert(Arc::new(handler))
    }

    pub fn on_connect<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ConnectEvent) + Send + Sync + 'static,
    {
        self.connect.insert(Arc::new(handler))
    }

    pub fn on_disconnect<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&DisconnectEvent) + Send + Sync + 'static,
    {
        self.disconnect.insert(Arc::new(handler))
    }

    pub fn on_user_joined<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Presence) + Send + Sync + 'static,
    {
        self.user_joined.insert(Arc::new(handler))
    }

    pub fn on_user_left<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Presence) + Send + Sync + 'static,
    {
        self.user_left.insert(Arc::new(handler))
    }

    /// Called with the opaque payload of every `typing_indicator` frame.
    pub fn on_typing<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.typing.insert(Arc::new(handler))
    }

    /// Fan a decoded frame out to the registry for its kind. Returns how many handlers ran.
    ///
    /// `connected` and `pong` are consumed by the transport and reach no registry here.
    pub fn dispatch(&self, frame: &ServerFrame) -> usize {
        match frame {
            ServerFrame::NewMessage { data } => self.message.emit(data),
            ServerFrame::TeamJoined(joined) => self.team_joined.emit(joined),
            ServerFrame::UserJoined { data } => self.user_joined.emit(data),
            ServerFrame::UserLeft { data } => self.user_left.emit(data),
            ServerFrame::TypingIndicator { data } => self.typing.emit(data),
            ServerFrame::Error { error } => self.error.emit(&ErrorEvent::Server(error.clone())),
            ServerFrame::Connected { .. } | ServerFrame::Pong => 0,
            ServerFrame::Unknown => {
                #[cfg(feature = "tracing")]
                tracing::debug!("Dropping frame with unrecognized type");
                0
            }
        }
    }

    pub(crate) fn emit_connect(&self, event: &ConnectEvent) -> usize {
        self.connect.emit(event)
    }

    pub(crate) fn emit_disconnect(&self, event: &DisconnectEvent) -> usize {
        self.disconnect.emit(event)
    }

    pub(crate) fn emit_error(&self, event: &ErrorEvent) -> usize {
        self.error.emit(event)
    }

    /// Number of live handlers across all kinds.
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.message.len()
            + self.team_joined.len()
            + self.error.len()
            + self.connect.len()
            + self.disconnect.len()
            + self.user_joined.len()
            + self.user_left.len()
            + self.typing.len()
    }
}
