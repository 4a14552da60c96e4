#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::time::Duration;

use futures::stream::SplitSink;
use futures::{SinkExt as _, StreamExt as _};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, interval, timeout};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;

use super::config::Config;
use super::error::WsError;
use super::traits::WireProtocol;
use crate::Result;
use crate::error::Error;

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = SplitSink<WsStream, Message>;

/// Upper bound on the closing handshake of a cancelled connection.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Connection state tracking.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected, and not trying to be
    Disconnected,
    /// Opening the socket
    Connecting,
    /// Socket open and `join_team` sent
    Connected {
        /// When the connection was established
        since: std::time::Instant,
    },
    /// Lost the connection involuntarily; a reconnection timer is armed
    ClosedPendingReconnect {
        /// Reconnection attempt the armed timer will make
        attempt: u32,
    },
}

impl ConnectionState {
    /// Check if the connection is currently active.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected { .. })
    }
}

/// How a connection ended.
#[non_exhaustive]
#[derive(Debug)]
pub enum Termination {
    /// The owner cancelled the connection
    Requested,
    /// The peer closed the connection or the stream ended
    Closed,
    /// Socket error or missed heartbeat
    Failed(Error),
}

/// Signals from the heartbeat loop to the message loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Beat {
    Ping,
    TimedOut,
}

/// Open a WebSocket connection to `url`.
pub(crate) async fn open(url: &str) -> Result<WsStream> {
    let (ws_stream, _) = connect_async(url).await?;
    Ok(ws_stream)
}

/// Drive an open connection until it ends.
///
/// Outbound text queued on `outbound` is written in order. Every inbound text frame is decoded
/// with `protocol` and handed to `on_message`; frames that fail to decode are logged and dropped.
/// When the config enables a heartbeat, a probe is sent every interval and a missing
/// acknowledgment ends the connection with [`Termination::Failed`].
///
/// Cancellation also interrupts a write in progress. The stream is consumed, so the socket is
/// closed once this returns.
pub(crate) async fn run<P, F>(
    ws_stream: WsStream,
    protocol: &P,
    config: &Config,
    outbound: &mut mpsc::UnboundedReceiver<String>,
    cancel: &CancellationToken,
    mut on_message: F,
) -> Termination
where
    P: WireProtocol,
    F: FnMut(P::Message),
{
    let (mut write, mut read) = ws_stream.split();

    // Channel to notify heartbeat loop when PONG is received
    let (pong_tx, pong_rx) = watch::channel(Instant::now());
    let (beat_tx, mut beat_rx) = mpsc::unbounded_channel();

    let heartbeat_timeout = config.heartbeat_timeout;
    let heartbeat_handle = config.heartbeat_interval.map(|every| {
        tokio::spawn(heartbeat_loop(beat_tx, every, heartbeat_timeout, pong_rx))
    });

    let termination = loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                _ = timeout(CLOSE_TIMEOUT, write.send(Message::Close(None))).await;
                break Termination::Requested;
            }

            // Handle incoming messages
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        #[cfg(feature = "tracing")]
                        tracing::trace!(%text, "Received WebSocket text message");

                        match protocol.parse(text.as_bytes()) {
                            Ok(Some(message)) => {
                                if protocol.is_pong(&message) {
                                    _ = pong_tx.send(Instant::now());
                                }
                                on_message(message);
                            }
                            Ok(None) => {}
                            Err(e) => {
                                #[cfg(feature = "tracing")]
                                tracing::warn!(%text, error = %e, "Failed to parse WebSocket message");
                                #[cfg(not(feature = "tracing"))]
                                let _ = (&text, &e);
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break Termination::Closed,
                    Some(Err(e)) => break Termination::Failed(WsError::Connection(e).into()),
                    Some(Ok(_)) => {
                        // Ignore binary frames and transport-level PING/PONG.
                    }
                }
            }

            // Handle outgoing frames from the session
            Some(text) = outbound.recv() => {
                match send_or_cancel(&mut write, text, cancel).await {
                    Some(Ok(())) => {}
                    Some(Err(e)) => break Termination::Failed(e),
                    None => break Termination::Requested,
                }
            }

            // Handle requests from the heartbeat loop
            Some(beat) = beat_rx.recv() => {
                match beat {
                    Beat::Ping => match protocol.ping() {
                        Ok(ping) => match send_or_cancel(&mut write, ping, cancel).await {
                            Some(Ok(())) => {}
                            Some(Err(e)) => break Termination::Failed(e),
                            None => break Termination::Requested,
                        },
                        Err(e) => {
                            #[cfg(feature = "tracing")]
                            tracing::warn!(error = %e, "Unable to encode heartbeat probe");
                            #[cfg(not(feature = "tracing"))]
                            let _ = &e;
                        }
                    },
                    Beat::TimedOut => {
                        break Termination::Failed(WsError::HeartbeatTimeout(heartbeat_timeout).into());
                    }
                }
            }
        }
    };

    // Cleanup
    if let Some(handle) = heartbeat_handle {
        handle.abort();
    }

    termination
}

/// Write one text frame unless `cancel` fires first. `None` means cancelled.
///
/// A cancelled write is abandoned mid-frame; the caller must drop the socket instead of closing
/// it gracefully, or the partial frame would be completed first.
async fn send_or_cancel(
    write: &mut WsWrite,
    text: String,
    cancel: &CancellationToken,
) -> Option<Result<()>> {
    tokio::select! {
        biased;

        () = cancel.cancelled() => None,
        sent = write.send(Message::Text(text.into())) => Some(sent.map_err(Error::from)),
    }
}

/// Heartbeat loop that requests probes and monitors acknowledgments.
async fn heartbeat_loop(
    beat_tx: mpsc::UnboundedSender<Beat>,
    every: Duration,
    heartbeat_timeout: Duration,
    mut pong_rx: watch::Receiver<Instant>,
) {
    let mut ping_interval = interval(every);
    // The first tick completes immediately; the first probe goes out one interval after open.
    ping_interval.tick().await;

    loop {
        ping_interval.tick().await;

        // Mark current PONG state as seen before sending PING
        // This prevents changed() from returning immediately due to a stale PONG
        drop(pong_rx.borrow_and_update());

        let ping_sent = Instant::now();
        if beat_tx.send(Beat::Ping).is_err() {
            // Message loop has terminated
            break;
        }

        match timeout(heartbeat_timeout, pong_rx.changed()).await {
            Ok(Ok(())) => {
                let last_pong = *pong_rx.borrow_and_update();
                if last_pong < ping_sent {
                    #[cfg(feature = "tracing")]
                    tracing::debug!("PONG received but older than last PING, connection may be stale");
                    _ = beat_tx.send(Beat::TimedOut);
                    break;
                }
            }
            Ok(Err(_)) => {
                // Channel closed, connection is terminating
                break;
            }
            Err(_) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    "Heartbeat timeout: no PONG received within {:?}",
                    heartbeat_timeout
                );
                _ = beat_tx.send(Beat::TimedOut);
                break;
            }
        }
    }
}
