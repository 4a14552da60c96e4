#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::{SinkExt as _, StreamExt as _};
use serde_json::{Value, json};
use team_chat_transport::chat::{
    Client, ConnectEvent, DisconnectEvent, DisconnectReason, ErrorEvent,
};
use team_chat_transport::error::Kind;
use team_chat_transport::ws::ConnectionState;
use team_chat_transport::ws::config::{Config, ReconnectConfig};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};

const RECONNECT_DELAY: Duration = Duration::from_millis(300);

#[derive(Clone, Debug)]
enum ServerCommand {
    Text(String),
    Close,
}

/// Frame received by the mock server, tagged with the connection it arrived on.
#[derive(Debug)]
struct Inbound {
    connection: usize,
    frame: Value,
}

/// Mock team-chat server.
struct MockChatServer {
    addr: SocketAddr,
    /// Commands delivered to ALL live connections
    command_tx: broadcast::Sender<ServerCommand>,
    /// Frames sent by clients
    inbound_rx: mpsc::UnboundedReceiver<Inbound>,
    /// Connections accepted so far
    accepted: Arc<AtomicUsize>,
    /// Connections currently open
    live: Arc<AtomicUsize>,
    /// Query string of every handshake request
    queries: Arc<Mutex<Vec<String>>>,
}

impl MockChatServer {
    /// Start a mock server on a random port.
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (command_tx, _) = broadcast::channel::<ServerCommand>(100);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Inbound>();
        let accepted = Arc::new(AtomicUsize::new(0));
        let live = Arc::new(AtomicUsize::new(0));
        let queries = Arc::new(Mutex::new(Vec::new()));

        let commands = command_tx.clone();
        let accepted_count = Arc::clone(&accepted);
        let live_count = Arc::clone(&live);
        let seen_queries = Arc::clone(&queries);

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };

                let query_sink = Arc::clone(&seen_queries);
                let callback = move |request: &Request, response: Response| {
                    let query = request.uri().query().unwrap_or_default().to_owned();
                    query_sink.lock().unwrap().push(query);
                    Ok(response)
                };
                let Ok(ws_stream) = tokio_tungstenite::accept_hdr_async(stream, callback).await
                else {
                    continue;
                };

                let connection = accepted_count.fetch_add(1, Ordering::SeqCst);
                live_count.fetch_add(1, Ordering::SeqCst);

                let (mut write, mut read) = ws_stream.split();
                let inbound_tx = inbound_tx.clone();
                let mut command_rx = commands.subscribe();
                let live_count = Arc::clone(&live_count);

                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            msg = read.next() => {
                                match msg {
                                    Some(Ok(Message::Text(text))) => {
                                        let frame = serde_json::from_str(&text).unwrap();
                                        drop(inbound_tx.send(Inbound { connection, frame }));
                                    }
                                    Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                                    Some(Ok(_)) => {}
                                }
                            }
                            command = command_rx.recv() => {
                                match command {
                                    Ok(ServerCommand::Text(text)) => {
                                        if write.send(Message::Text(text.into())).await.is_err() {
                                            break;
                                        }
                                    }
                                    Ok(ServerCommand::Close) | Err(_) => {
                                        drop(write.send(Message::Close(None)).await);
                                        break;
                                    }
                                }
                            }
                        }
                    }
                    live_count.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });

        Self {
            addr,
            command_tx,
            inbound_rx,
            accepted,
            live,
            queries,
        }
    }

    fn ws_url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Send a frame to all connected clients.
    fn send(&self, frame: &Value) {
        drop(self.command_tx.send(ServerCommand::Text(frame.to_string())));
    }

    /// Close every live connection.
    fn close_all(&self) {
        drop(self.command_tx.send(ServerCommand::Close));
    }

    /// Receive the next client frame.
    async fn recv(&mut self) -> Option<Inbound> {
        timeout(Duration::from_secs(2), self.inbound_rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Assert that no client frame arrives within `window`.
    async fn expect_silence(&mut self, window: Duration) {
        if let Ok(Some(inbound)) = timeout(window, self.inbound_rx.recv()).await {
            panic!("unexpected client frame: {inbound:?}");
        }
    }

    fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

fn test_config() -> Config {
    Config::default()
        .without_heartbeat()
        .with_reconnect(ReconnectConfig::fixed(RECONNECT_DELAY))
}

fn client_for(server: &MockChatServer) -> Client {
    Client::new(&server.ws_url(), test_config())
        .unwrap()
        .with_token("secret-token")
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    timeout(Duration::from_secs(3), async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

/// Example payloads in the server's wire format.
pub mod payloads {
    use serde_json::{Value, json};

    #[must_use]
    pub fn message(id: &str, content: &str) -> Value {
        json!({
            "id": id,
            "teamId": "team-a",
            "senderId": "user-1",
            "senderName": "Dana Reyes",
            "content": content,
            "createdAt": "2025-03-01T09:00:00Z"
        })
    }

    #[must_use]
    pub fn connected(user_id: &str) -> Value {
        json!({ "type": "connected", "userId": user_id })
    }

    #[must_use]
    pub fn team_joined() -> Value {
        json!({
            "type": "team_joined",
            "team": { "id": "team-a", "name": "Front desk" },
            "recentMessages": [message("m1", "first"), message("m2", "second")]
        })
    }

    #[must_use]
    pub fn new_message(id: &str, content: &str) -> Value {
        json!({ "type": "new_message", "data": message(id, content) })
    }
}

mod handshake {
    use super::*;

    #[tokio::test]
    async fn join_team_follows_open_and_token_is_in_query() {
        let mut server = MockChatServer::start().await;
        let client = client_for(&server);
        let connects = Arc::new(Mutex::new(Vec::new()));

        let c = Arc::clone(&connects);
        let _sub = client
            .dispatcher()
            .on_connect(move |event: &ConnectEvent| c.lock().unwrap().push(event.clone()));

        client.connect("team-a").unwrap();

        let join = server.recv().await.unwrap();
        assert_eq!(join.frame, json!({ "type": "join_team", "teamId": "team-a" }));
        assert_eq!(*server.queries.lock().unwrap(), vec!["token=secret-token"]);

        wait_until(|| client.state().is_connected()).await;
        let events = connects.lock().unwrap().clone();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].team_id, "team-a");
        assert_eq!(events[0].attempt, 0);
    }

    #[tokio::test]
    async fn connected_and_team_joined_in_either_order() {
        let mut server = MockChatServer::start().await;
        let client = client_for(&server);
        let batches = Arc::new(Mutex::new(Vec::new()));

        let b = Arc::clone(&batches);
        let _sub = client.dispatcher().on_team_joined(move |joined| {
            let ids: Vec<String> = joined.recent_messages.iter().map(|m| m.id.clone()).collect();
            b.lock().unwrap().push(ids);
        });

        client.connect("team-a").unwrap();
        let _join = server.recv().await.unwrap();

        // History first, identity second.
        server.send(&payloads::team_joined());
        server.send(&payloads::connected("user-1"));

        wait_until(|| {
            client
                .session()
                .is_some_and(|session| session.user_id.is_some())
        })
        .await;
        let session = client.session().unwrap();
        assert_eq!(session.team_id, "team-a");
        assert_eq!(session.user_id.as_deref(), Some("user-1"));

        wait_until(|| !batches.lock().unwrap().is_empty()).await;
        assert_eq!(
            *batches.lock().unwrap(),
            vec![vec!["m1".to_owned(), "m2".to_owned()]]
        );
    }

    #[tokio::test]
    async fn error_frame_is_reported_without_closing() {
        let mut server = MockChatServer::start().await;
        let client = client_for(&server);
        let errors = Arc::new(Mutex::new(Vec::new()));

        let e = Arc::clone(&errors);
        let _sub = client
            .dispatcher()
            .on_error(move |event: &ErrorEvent| e.lock().unwrap().push(event.clone()));

        client.connect("team-a").unwrap();
        let _join = server.recv().await.unwrap();

        server.send(&json!({ "type": "error", "error": "Invalid token" }));

        wait_until(|| !errors.lock().unwrap().is_empty()).await;
        assert_eq!(
            *errors.lock().unwrap(),
            vec![ErrorEvent::Server("Invalid token".to_owned())]
        );

        sleep(Duration::from_millis(100)).await;
        assert!(client.state().is_connected());
        assert_eq!(server.live(), 1);
        assert_eq!(server.accepted(), 1);
    }

    #[tokio::test]
    async fn exactly_one_join_per_open() {
        let mut server = MockChatServer::start().await;
        let client = client_for(&server);

        client.connect("team-a").unwrap();
        let first = server.recv().await.unwrap();
        assert_eq!(first.frame["type"], "join_team");
        assert_eq!(first.connection, 0);
        server.expect_silence(Duration::from_millis(150)).await;

        server.close_all();

        let second = server.recv().await.unwrap();
        assert_eq!(second.frame["type"], "join_team");
        assert_eq!(second.connection, 1);
        server.expect_silence(Duration::from_millis(150)).await;
    }
}

mod messaging {
    use super::*;

    #[tokio::test]
    async fn send_while_disconnected_fails_without_traffic() {
        let mut server = MockChatServer::start().await;
        let client = client_for(&server);

        let error = client.send("hello").unwrap_err();
        assert_eq!(error.kind(), Kind::InvalidState);

        server.expect_silence(Duration::from_millis(100)).await;
        assert_eq!(server.accepted(), 0);
    }

    #[tokio::test]
    async fn send_goes_out_after_join() {
        let mut server = MockChatServer::start().await;
        let client = client_for(&server);

        client.connect("team-a").unwrap();
        wait_until(|| client.state().is_connected()).await;
        client.send("hello").unwrap();

        let join = server.recv().await.unwrap();
        assert_eq!(join.frame["type"], "join_team");
        let message = server.recv().await.unwrap();
        assert_eq!(
            message.frame,
            json!({ "type": "send_message", "message": "hello" })
        );
    }

    #[tokio::test]
    async fn new_messages_reach_every_subscriber() {
        let mut server = MockChatServer::start().await;
        let client = client_for(&server);
        let first = Arc::new(Mutex::new(Vec::new()));
        let second = Arc::new(AtomicUsize::new(0));

        let f = Arc::clone(&first);
        let _a = client
            .dispatcher()
            .on_message(move |message| f.lock().unwrap().push(message.content.clone()));
        let s = Arc::clone(&second);
        let _b = client.dispatcher().on_message(move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        });

        client.connect("team-a").unwrap();
        let _join = server.recv().await.unwrap();

        server.send(&payloads::new_message("m3", "invoice sent"));

        wait_until(|| second.load(Ordering::SeqCst) == 1).await;
        assert_eq!(*first.lock().unwrap(), vec!["invoice sent".to_owned()]);
    }

    #[tokio::test]
    async fn team_joined_is_not_replayed_as_messages() {
        let mut server = MockChatServer::start().await;
        let client = client_for(&server);
        let messages = Arc::new(AtomicUsize::new(0));
        let batches = Arc::new(AtomicUsize::new(0));

        let m = Arc::clone(&messages);
        let _m = client.dispatcher().on_message(move |_| {
            m.fetch_add(1, Ordering::SeqCst);
        });
        let b = Arc::clone(&batches);
        let _b = client.dispatcher().on_team_joined(move |_| {
            b.fetch_add(1, Ordering::SeqCst);
        });

        client.connect("team-a").unwrap();
        let _join = server.recv().await.unwrap();
        server.send(&payloads::team_joined());

        wait_until(|| batches.load(Ordering::SeqCst) == 1).await;
        sleep(Duration::from_millis(50)).await;
        assert_eq!(messages.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_and_malformed_frames_are_dropped() {
        let mut server = MockChatServer::start().await;
        let client = client_for(&server);
        let calls = Arc::new(AtomicUsize::new(0));
        let delivered = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let c = Arc::clone(&calls);
            let _sub = client.dispatcher().on_error(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        let d = Arc::clone(&delivered);
        let _sub = client.dispatcher().on_message(move |_| {
            d.fetch_add(1, Ordering::SeqCst);
        });

        client.connect("team-a").unwrap();
        let _join = server.recv().await.unwrap();

        server.send(&json!({ "type": "unknown_future_type", "foo": 1 }));
        drop(server.command_tx.send(ServerCommand::Text("{not json".to_owned())));
        server.send(&payloads::new_message("m9", "still here"));

        wait_until(|| delivered.load(Ordering::SeqCst) == 1).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(client.state().is_connected());
        assert_eq!(server.accepted(), 1);
    }

    #[tokio::test]
    async fn presence_and_typing_are_delivered() {
        let mut server = MockChatServer::start().await;
        let client = client_for(&server);
        let joined = Arc::new(Mutex::new(Vec::new()));
        let left = Arc::new(Mutex::new(Vec::new()));
        let typing = Arc::new(AtomicUsize::new(0));

        let j = Arc::clone(&joined);
        let _j = client
            .dispatcher()
            .on_user_joined(move |presence| j.lock().unwrap().push(presence.user_id.clone()));
        let l = Arc::clone(&left);
        let _l = client
            .dispatcher()
            .on_user_left(move |presence| l.lock().unwrap().push(presence.user_id.clone()));
        let t = Arc::clone(&typing);
        let _t = client.dispatcher().on_typing(move |_| {
            t.fetch_add(1, Ordering::SeqCst);
        });

        client.connect("team-a").unwrap();
        let _join = server.recv().await.unwrap();

        server.send(&json!({ "type": "user_joined", "data": { "userId": "user-7" } }));
        server.send(&json!({ "type": "typing_indicator", "data": { "userId": "user-7" } }));
        server.send(&json!({ "type": "user_left", "data": { "userId": "user-7" } }));

        wait_until(|| !left.lock().unwrap().is_empty()).await;
        assert_eq!(*joined.lock().unwrap(), vec!["user-7".to_owned()]);
        assert_eq!(typing.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn revoked_handler_sees_nothing_afterwards() {
        let mut server = MockChatServer::start().await;
        let client = client_for(&server);
        let calls = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&calls);
        let sub = client.dispatcher().on_message(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        sub.unsubscribe();

        let delivered = Arc::new(AtomicUsize::new(0));
        let d = Arc::clone(&delivered);
        let _other = client.dispatcher().on_message(move |_| {
            d.fetch_add(1, Ordering::SeqCst);
        });

        client.connect("team-a").unwrap();
        let _join = server.recv().await.unwrap();
        server.send(&payloads::new_message("m1", "hi"));

        wait_until(|| delivered.load(Ordering::SeqCst) == 1).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}

mod lifecycle {
    use super::*;

    #[tokio::test]
    async fn reconnects_after_fixed_delay_not_before() {
        let mut server = MockChatServer::start().await;
        let client = client_for(&server);
        let disconnects = Arc::new(Mutex::new(Vec::new()));

        let d = Arc::clone(&disconnects);
        let _sub = client
            .dispatcher()
            .on_disconnect(move |event: &DisconnectEvent| d.lock().unwrap().push(event.clone()));

        client.connect("team-a").unwrap();
        let _join = server.recv().await.unwrap();
        wait_until(|| client.state().is_connected()).await;

        let closed_at = Instant::now();
        server.close_all();

        wait_until(|| {
            matches!(
                client.state(),
                ConnectionState::ClosedPendingReconnect { attempt: 1 }
            )
        })
        .await;
        assert!(client.reconnect_pending());
        assert!(client.session().is_none());
        client.send("lost").unwrap_err();

        let rejoin = server.recv().await.unwrap();
        assert!(closed_at.elapsed() >= RECONNECT_DELAY);
        assert_eq!(rejoin.connection, 1);
        assert_eq!(rejoin.frame["teamId"], "team-a");

        let events = disconnects.lock().unwrap().clone();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].reason, DisconnectReason::Closed);

        wait_until(|| client.state().is_connected()).await;
        assert!(!client.reconnect_pending());
    }

    #[tokio::test]
    async fn disconnect_prevents_reconnection() {
        let mut server = MockChatServer::start().await;
        let client = client_for(&server);

        client.connect("team-a").unwrap();
        let _join = server.recv().await.unwrap();
        wait_until(|| client.state().is_connected()).await;

        server.close_all();
        wait_until(|| client.reconnect_pending()).await;

        client.disconnect();
        assert!(!client.reconnect_pending());
        assert_eq!(client.state(), ConnectionState::Disconnected);

        sleep(RECONNECT_DELAY * 3).await;
        assert_eq!(server.accepted(), 1);
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn explicit_disconnect_closes_socket_and_notifies() {
        let mut server = MockChatServer::start().await;
        let client = client_for(&server);
        let disconnects = Arc::new(Mutex::new(Vec::new()));

        let d = Arc::clone(&disconnects);
        let _sub = client.dispatcher().on_disconnect(move |event: &DisconnectEvent| {
            d.lock().unwrap().push(event.reason);
        });

        client.connect("team-a").unwrap();
        let _join = server.recv().await.unwrap();
        wait_until(|| client.state().is_connected()).await;

        client.disconnect();

        assert_eq!(*disconnects.lock().unwrap(), vec![DisconnectReason::Requested]);
        wait_until(|| server.live() == 0).await;
        sleep(RECONNECT_DELAY * 2).await;
        assert_eq!(server.accepted(), 1);
        assert!(client.team_id().is_none());
    }

    #[tokio::test]
    async fn rapid_reconnect_keeps_only_the_latest_team() {
        let mut server = MockChatServer::start().await;
        let client = client_for(&server);
        let delivered = Arc::new(AtomicUsize::new(0));

        let d = Arc::clone(&delivered);
        let _sub = client.dispatcher().on_message(move |_| {
            d.fetch_add(1, Ordering::SeqCst);
        });

        client.connect("team-a").unwrap();
        client.connect("team-b").unwrap();

        wait_until(|| client.state().is_connected()).await;
        assert_eq!(client.team_id().as_deref(), Some("team-b"));

        // Whatever team-a got as far as sending, the last join is team-b's.
        let mut last_join = None;
        while let Ok(Some(inbound)) =
            timeout(Duration::from_millis(200), server.inbound_rx.recv()).await
        {
            last_join = Some(inbound.frame);
        }
        assert_eq!(last_join.unwrap()["teamId"], "team-b");

        wait_until(|| server.live() == 1).await;
        sleep(Duration::from_millis(100)).await;
        assert_eq!(server.live(), 1);

        server.send(&payloads::new_message("m1", "only once"));
        wait_until(|| delivered.load(Ordering::SeqCst) >= 1).await;
        sleep(Duration::from_millis(100)).await;
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_open_reports_transport_error_and_retries() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = Client::new(&format!("ws://{addr}"), test_config())
            .unwrap()
            .with_token("secret-token");
        let errors = Arc::new(Mutex::new(Vec::new()));
        let disconnects = Arc::new(AtomicUsize::new(0));

        let e = Arc::clone(&errors);
        let _e = client
            .dispatcher()
            .on_error(move |event: &ErrorEvent| e.lock().unwrap().push(event.clone()));
        let d = Arc::clone(&disconnects);
        let _d = client.dispatcher().on_disconnect(move |_| {
            d.fetch_add(1, Ordering::SeqCst);
        });

        client.connect("team-a").unwrap();

        wait_until(|| !errors.lock().unwrap().is_empty()).await;
        assert!(matches!(errors.lock().unwrap()[0], ErrorEvent::Transport(_)));
        wait_until(|| client.reconnect_pending()).await;
        assert_eq!(disconnects.load(Ordering::SeqCst), 0);

        client.disconnect();
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn bounded_backoff_gives_up() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = Config::default().without_heartbeat().with_reconnect(
            ReconnectConfig::exponential(Duration::from_millis(20), Duration::from_millis(40))
                .with_max_attempts(2),
        );
        let client = Client::new(&format!("ws://{addr}"), config)
            .unwrap()
            .with_token("secret-token");
        let reasons = Arc::new(Mutex::new(Vec::new()));

        let r = Arc::clone(&reasons);
        let _sub = client
            .dispatcher()
            .on_disconnect(move |event: &DisconnectEvent| r.lock().unwrap().push(event.reason));

        client.connect("team-a").unwrap();

        wait_until(|| !reasons.lock().unwrap().is_empty()).await;
        assert_eq!(
            *reasons.lock().unwrap(),
            vec![DisconnectReason::RetriesExhausted]
        );
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(!client.reconnect_pending());
    }

    #[tokio::test]
    async fn missed_heartbeat_triggers_reconnect() {
        let mut server = MockChatServer::start().await;
        let config =
            test_config().with_heartbeat(Duration::from_millis(100), Duration::from_millis(100));
        let client = Client::new(&server.ws_url(), config)
            .unwrap()
            .with_token("secret-token");

        client.connect("team-a").unwrap();
        let join = server.recv().await.unwrap();
        assert_eq!(join.frame["type"], "join_team");

        // The mock never answers with `pong`.
        let ping = server.recv().await.unwrap();
        assert_eq!(ping.frame, json!({ "type": "ping" }));

        loop {
            let inbound = server.recv().await.unwrap();
            if inbound.frame["type"] == "join_team" {
                assert_eq!(inbound.connection, 1);
                break;
            }
        }
    }

    #[tokio::test]
    async fn dropping_the_last_handle_closes_the_connection() {
        let mut server = MockChatServer::start().await;
        let client = client_for(&server);
        let clone = client.clone();

        client.connect("team-a").unwrap();
        let _join = server.recv().await.unwrap();
        wait_until(|| server.live() == 1).await;

        drop(client);
        sleep(Duration::from_millis(100)).await;
        assert_eq!(server.live(), 1);

        drop(clone);
        wait_until(|| server.live() == 0).await;
    }

    #[tokio::test]
    async fn independent_clients_do_not_interfere() {
        let mut server = MockChatServer::start().await;
        let first = client_for(&server);
        let second = client_for(&server);

        first.connect("team-a").unwrap();
        second.connect("team-b").unwrap();
        wait_until(|| first.state().is_connected() && second.state().is_connected()).await;

        first.disconnect();
        sleep(Duration::from_millis(100)).await;
        assert!(second.state().is_connected());
        assert_eq!(server.live(), 1);

        let mut teams = Vec::new();
        while let Ok(Some(inbound)) =
            timeout(Duration::from_millis(100), server.inbound_rx.recv()).await
        {
            teams.push(inbound.frame["teamId"].as_str().unwrap().to_owned());
        }
        teams.sort();
        assert_eq!(teams, ["team-a", "team-b"]);
    }

    #[tokio::test]
    async fn clearing_the_token_stops_pending_reconnection() {
        let mut server = MockChatServer::start().await;
        let client = client_for(&server);

        client.connect("team-a").unwrap();
        let _join = server.recv().await.unwrap();
        wait_until(|| client.state().is_connected()).await;

        server.close_all();
        wait_until(|| client.reconnect_pending()).await;
        client.clear_token();

        sleep(RECONNECT_DELAY * 3).await;
        assert_eq!(server.accepted(), 1);
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(!client.reconnect_pending());
        assert!(client.team_id().is_none());
    }

    #[tokio::test]
    async fn connect_from_a_disconnect_handler_replaces_the_retry() {
        let mut server = MockChatServer::start().await;
        let client = client_for(&server);
        let handle = Arc::new(Mutex::new(Some(client.clone())));

        let h = Arc::clone(&handle);
        let _sub = client
            .dispatcher()
            .on_disconnect(move |event: &DisconnectEvent| {
                if event.reason != DisconnectReason::Closed {
                    return;
                }
                // One-shot, so the handler does not keep the session alive.
                let taken = h.lock().unwrap().take();
                if let Some(client) = taken {
                    client.connect("team-b").unwrap();
                }
            });

        client.connect("team-a").unwrap();
        let _join = server.recv().await.unwrap();
        wait_until(|| client.state().is_connected()).await;

        server.close_all();

        let rejoin = server.recv().await.unwrap();
        assert_eq!(rejoin.connection, 1);
        assert_eq!(rejoin.frame["teamId"], "team-b");
        wait_until(|| client.state().is_connected()).await;

        // The retry for team-a must not fire or open another socket.
        server.expect_silence(RECONNECT_DELAY * 3).await;
        assert_eq!(server.accepted(), 2);
        assert!(client.state().is_connected());
        assert!(!client.reconnect_pending());
        assert_eq!(client.team_id().as_deref(), Some("team-b"));
    }

    #[tokio::test]
    async fn replaced_socket_is_dropped_before_the_next_one_opens() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = Client::new(&format!("ws://{addr}"), test_config())
            .unwrap()
            .with_token("secret-token");

        client.connect("team-a").unwrap();
        let (stream, _) = timeout(Duration::from_secs(2), listener.accept())
            .await
            .unwrap()
            .unwrap();
        // Never read from team-a's socket, so a large write stalls on it.
        let mut stalled = tokio_tungstenite::accept_async(stream).await.unwrap();
        wait_until(|| client.state().is_connected()).await;

        client.send("x".repeat(12 * 1024 * 1024)).unwrap();
        sleep(Duration::from_millis(100)).await;
        client.connect("team-b").unwrap();

        let (stream, _) = timeout(Duration::from_secs(2), listener.accept())
            .await
            .unwrap()
            .unwrap();
        let mut current = tokio_tungstenite::accept_async(stream).await.unwrap();
        let Some(Ok(Message::Text(join))) = timeout(Duration::from_secs(2), current.next())
            .await
            .unwrap()
        else {
            panic!("expected join_team on the new socket");
        };
        let join: Value = serde_json::from_str(&join).unwrap();
        assert_eq!(join, json!({ "type": "join_team", "teamId": "team-b" }));

        // Only what was fully written before team-a's socket was dropped can come out of it.
        let delivered = timeout(Duration::from_secs(5), async {
            let mut lengths = Vec::new();
            while let Some(Ok(message)) = stalled.next().await {
                if let Message::Text(text) = message {
                    lengths.push(text.len());
                }
            }
            lengths
        })
        .await
        .unwrap();
        assert!(
            delivered.iter().all(|len| *len < 1024),
            "old socket kept writing after replacement: {delivered:?}"
        );
    }
}
