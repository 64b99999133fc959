//! End-to-end gateway scenarios against an in-process voice server: a
//! WebSocket acceptor scripted per test plus a UDP stub answering IP
//! discovery probes.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

use voicelink::common::logger;
use voicelink::config::LoggingConfig;
use voicelink::gateway::tasks::{
    AudioProvider, AudioReceiver, DefaultReceiveTaskFactory, DefaultSendTaskFactory,
    NoOpAudioProvider, NoOpAudioReceiver, VoiceChannelRetrieveTask, VoiceDisconnectTask,
    VoiceServerUpdateTask, VoiceStateUpdateTask,
};
use voicelink::gateway::VoiceGatewayClient;
use voicelink::{
    IpDiscoveryOptions, ReconnectOptions, State, VoiceGatewayError, VoiceGatewayOptions,
    VoicePayload, VoiceServerOptions,
};

const GUILD_ID: u64 = 41771983423143937;
const SELF_ID: u64 = 1234;
const SSRC: u32 = 12_345;
const TOKEN: &str = "my-secret-voice-token";
const SESSION_ID: &str = "beyond-canal-session";

struct MockServer {
    listener: TcpListener,
    addr: SocketAddr,
}

impl MockServer {
    async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        Self { listener, addr }
    }

    fn endpoint(&self) -> String {
        format!("ws://{}", self.addr)
    }

    async fn accept(&self) -> ServerSession {
        let (stream, _) = self.listener.accept().await.unwrap();
        ServerSession {
            ws: accept_async(stream).await.unwrap(),
        }
    }

    /// Asserts that nobody dials this server within the given window.
    async fn expect_no_connection(&self, window: Duration) {
        assert!(
            timeout(window, self.listener.accept()).await.is_err(),
            "unexpected reconnect attempt"
        );
    }
}

struct ServerSession {
    ws: WebSocketStream<TcpStream>,
}

impl ServerSession {
    async fn send_op(&mut self, op: u8, d: Value) {
        let frame = json!({ "op": op, "d": d }).to_string();
        self.ws.send(Message::Text(frame.into())).await.unwrap();
    }

    async fn next_payload(&mut self) -> (u8, Value) {
        loop {
            match timeout(Duration::from_secs(5), self.ws.next())
                .await
                .expect("timed out waiting for a client payload")
                .expect("client hung up")
                .expect("websocket error")
            {
                Message::Text(text) => {
                    let value: Value = serde_json::from_str(text.as_str()).unwrap();
                    return (value["op"].as_u64().unwrap() as u8, value["d"].clone());
                }
                _ => continue,
            }
        }
    }

    async fn close(mut self, code: u16, reason: &str) {
        let _ = self
            .ws
            .send(Message::Close(Some(CloseFrame {
                code: CloseCode::from(code),
                reason: reason.into(),
            })))
            .await;
    }
}

/// Answers every well-formed discovery probe with the given external
/// address. Returns the UDP port to advertise in Ready.
async fn spawn_discovery_stub(external_ip: &'static str, external_port: u16) -> u16 {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = socket.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let mut buf = [0u8; 74];
            let Ok((n, from)) = socket.recv_from(&mut buf).await else {
                break;
            };
            if n != 74 {
                continue;
            }
            let mut response = [0u8; 74];
            response[0..2].copy_from_slice(&2u16.to_be_bytes());
            response[2..4].copy_from_slice(&70u16.to_be_bytes());
            response[4..8].copy_from_slice(&buf[4..8]);
            response[8..8 + external_ip.len()].copy_from_slice(external_ip.as_bytes());
            response[72..74].copy_from_slice(&external_port.to_be_bytes());
            let _ = socket.send_to(&response, from).await;
        }
    });
    port
}

/// A UDP peer that never answers, for the discovery-timeout scenario.
async fn spawn_silent_udp() -> u16 {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = socket.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut buf = [0u8; 74];
        while socket.recv_from(&mut buf).await.is_ok() {}
    });
    port
}

/// Runs the CONNECTING handshake server-side: Hello, expect Identify, Ready,
/// expect SelectProtocol, SessionDescription. Returns the Identify data.
async fn run_handshake(session: &mut ServerSession, udp_port: u16) -> Value {
    session
        .send_op(8, json!({ "heartbeat_interval": 600000.0 }))
        .await;
    let (op, identify) = session.next_payload().await;
    assert_eq!(op, 0, "expected identify, got op {}", op);

    session
        .send_op(
            2,
            json!({
                "ssrc": SSRC,
                "ip": "127.0.0.1",
                "port": udp_port,
                "modes": ["xsalsa20_poly1305", "aead_aes256_gcm_rtpsize"],
            }),
        )
        .await;
    let (op, select) = session.next_payload().await;
    assert_eq!(op, 1, "expected select protocol, got op {}", op);
    assert_eq!(select["protocol"], "udp");
    assert_eq!(select["data"]["address"], "9.9.9.9");
    assert_eq!(select["data"]["port"], 6000);
    assert_eq!(select["data"]["mode"], "xsalsa20_poly1305");

    session
        .send_op(
            4,
            json!({
                "mode": "xsalsa20_poly1305",
                "secret_key": vec![0u8; 32],
            }),
        )
        .await;
    identify
}

struct DisconnectProbe {
    fired: mpsc::UnboundedSender<u64>,
}

#[async_trait]
impl VoiceDisconnectTask for DisconnectProbe {
    async fn on_disconnect(&self, guild_id: u64) {
        let _ = self.fired.send(guild_id);
    }
}

/// Hands out each scripted receiver once, then receivers that never fire.
struct ScriptedServerUpdates {
    receivers: std::sync::Mutex<VecDeque<mpsc::UnboundedReceiver<VoiceServerOptions>>>,
}

impl VoiceServerUpdateTask for ScriptedServerUpdates {
    fn on_voice_server_update(&self, _guild_id: u64) -> mpsc::UnboundedReceiver<VoiceServerOptions> {
        self.receivers.lock().unwrap().pop_front().unwrap_or_else(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            std::mem::forget(tx);
            rx
        })
    }
}

struct SilentStateUpdates;

impl VoiceStateUpdateTask for SilentStateUpdates {
    fn on_voice_state_update(&self, _guild_id: u64) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        std::mem::forget(tx);
        rx
    }
}

struct FixedChannel(u64);

#[async_trait]
impl VoiceChannelRetrieveTask for FixedChannel {
    async fn on_request(&self) -> Option<u64> {
        Some(self.0)
    }
}

struct Probes {
    disconnects: mpsc::UnboundedReceiver<u64>,
    server_updates: mpsc::UnboundedSender<VoiceServerOptions>,
}

fn quick_reconnect() -> ReconnectOptions {
    ReconnectOptions {
        first_backoff_ms: 200,
        max_backoff_ms: 800,
        factor: 2.0,
        jitter: 0.0,
        max_attempts: 3,
    }
}

fn test_options(reconnect: ReconnectOptions, ip_discovery: IpDiscoveryOptions) -> (VoiceGatewayOptions, Probes) {
    logger::init(&LoggingConfig {
        level: "warn".to_string(),
        filters: String::new(),
    });

    let (disconnect_tx, disconnects) = mpsc::unbounded_channel();
    let (server_update_tx, server_update_rx) = mpsc::unbounded_channel();

    let audio_provider: Arc<Mutex<dyn AudioProvider + Send>> =
        Arc::new(Mutex::new(NoOpAudioProvider));
    let audio_receiver: Arc<Mutex<dyn AudioReceiver + Send>> =
        Arc::new(Mutex::new(NoOpAudioReceiver));

    let options = VoiceGatewayOptions {
        guild_id: GUILD_ID,
        self_id: SELF_ID,
        reconnect,
        ip_discovery,
        audio_provider,
        audio_receiver,
        send_task_factory: Arc::new(DefaultSendTaskFactory),
        receive_task_factory: Arc::new(DefaultReceiveTaskFactory),
        disconnect_task: Arc::new(DisconnectProbe {
            fired: disconnect_tx,
        }),
        server_update_task: Arc::new(ScriptedServerUpdates {
            receivers: std::sync::Mutex::new(VecDeque::from([server_update_rx])),
        }),
        state_update_task: Arc::new(SilentStateUpdates),
        channel_retrieve_task: Arc::new(FixedChannel(4242)),
    };
    (
        options,
        Probes {
            disconnects,
            server_updates: server_update_tx,
        },
    )
}

async fn wait_for_state(states: &mut watch::Receiver<State>, wanted: State) {
    timeout(Duration::from_secs(5), states.wait_for(|s| *s == wanted))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {:?}", wanted))
        .unwrap();
}

#[tokio::test]
async fn test_happy_path_connects_and_surfaces_events_in_order() {
    let server = MockServer::bind().await;
    let endpoint = server.endpoint();
    let udp_port = spawn_discovery_stub("9.9.9.9", 6000).await;
    let (options, _probes) = test_options(quick_reconnect(), IpDiscoveryOptions::default());

    let client = VoiceGatewayClient::new(options);
    let mut events = client.events();
    let mut states = client.state_events();
    assert_eq!(*states.borrow(), State::Connecting);

    let server_task = tokio::spawn(async move {
        let mut session = server.accept().await;
        let identify = run_handshake(&mut session, udp_port).await;
        assert_eq!(identify["server_id"], GUILD_ID.to_string());
        assert_eq!(identify["user_id"], SELF_ID.to_string());
        assert_eq!(identify["session_id"], SESSION_ID);
        assert_eq!(identify["token"], TOKEN);
        session
    });

    let connection = timeout(
        Duration::from_secs(5),
        client.start(
            VoiceServerOptions::new(endpoint, TOKEN, GUILD_ID),
            SESSION_ID.to_string(),
        ),
    )
    .await
    .unwrap()
    .unwrap();
    let _session = server_task.await.unwrap();

    wait_for_state(&mut states, State::Connected).await;
    assert_eq!(connection.state(), State::Connected);
    assert_eq!(connection.guild_id(), GUILD_ID);
    assert_eq!(connection.ssrc(), Some(SSRC));
    assert_eq!(connection.channel_id().await, Some(4242));

    assert!(matches!(events.recv().await.unwrap(), VoicePayload::Hello(_)));
    match events.recv().await.unwrap() {
        VoicePayload::Ready(ready) => {
            assert_eq!(ready.ssrc, SSRC);
            assert_eq!(ready.ip, "127.0.0.1");
        }
        other => panic!("expected ready, got {:?}", other),
    }
    assert!(matches!(
        events.recv().await.unwrap(),
        VoicePayload::SessionDescription(_)
    ));
}

#[tokio::test]
async fn test_clean_disconnect_on_4014_does_not_retry() {
    let server = MockServer::bind().await;
    let endpoint = server.endpoint();
    let udp_port = spawn_discovery_stub("9.9.9.9", 6000).await;
    let (options, mut probes) = test_options(quick_reconnect(), IpDiscoveryOptions::default());

    let client = VoiceGatewayClient::new(options);
    let mut states = client.state_events();

    let server_task = tokio::spawn(async move {
        let mut session = server.accept().await;
        run_handshake(&mut session, udp_port).await;
        session.close(4014, "disconnected").await;
        server
    });

    let connection = client
        .start(
            VoiceServerOptions::new(endpoint, TOKEN, GUILD_ID),
            SESSION_ID.to_string(),
        )
        .await
        .unwrap();

    wait_for_state(&mut states, State::Disconnected).await;
    assert_eq!(
        timeout(Duration::from_secs(5), probes.disconnects.recv())
            .await
            .unwrap(),
        Some(GUILD_ID)
    );

    let server = server_task.await.unwrap();
    server.expect_no_connection(Duration::from_millis(400)).await;

    // Terminal session: disconnect is a no-op, reconnect an error.
    assert!(connection.disconnect().await.is_ok());
    assert!(matches!(
        connection.reconnect().await,
        Err(VoiceGatewayError::NotActive)
    ));
}

#[tokio::test]
async fn test_transient_close_4015_resumes_the_session() {
    let server = MockServer::bind().await;
    let endpoint = server.endpoint();
    let udp_port = spawn_discovery_stub("9.9.9.9", 6000).await;
    let (options, _probes) = test_options(quick_reconnect(), IpDiscoveryOptions::default());

    let client = VoiceGatewayClient::new(options);
    let mut states = client.state_events();

    let server_task = tokio::spawn(async move {
        let mut session = server.accept().await;
        run_handshake(&mut session, udp_port).await;
        session.close(4015, "voice server crashed").await;

        // The client must come back leading with a resume, not an identify.
        let mut session = server.accept().await;
        let (op, resume) = session.next_payload().await;
        assert_eq!(op, 7, "expected resume as the first frame, got op {}", op);
        assert_eq!(resume["server_id"], GUILD_ID.to_string());
        assert_eq!(resume["session_id"], SESSION_ID);
        session
            .send_op(8, json!({ "heartbeat_interval": 600000.0 }))
            .await;
        session.send_op(9, Value::Null).await;
        session
    });

    let _connection = client
        .start(
            VoiceServerOptions::new(endpoint, TOKEN, GUILD_ID),
            SESSION_ID.to_string(),
        )
        .await
        .unwrap();

    wait_for_state(&mut states, State::Resuming).await;
    wait_for_state(&mut states, State::Connected).await;
    let _session = server_task.await.unwrap();
}

#[tokio::test]
async fn test_server_migration_rebuilds_against_the_new_endpoint() {
    let first = MockServer::bind().await;
    let second = MockServer::bind().await;
    let first_endpoint = first.endpoint();
    let second_endpoint = second.endpoint();
    let udp_port = spawn_discovery_stub("9.9.9.9", 6000).await;
    let (options, probes) = test_options(quick_reconnect(), IpDiscoveryOptions::default());

    let client = VoiceGatewayClient::new(options);
    let mut states = client.state_events();

    let first_task = tokio::spawn(async move {
        let mut session = first.accept().await;
        run_handshake(&mut session, udp_port).await;
        session
    });
    // The second server runs the full identify cycle: migration never resumes.
    let second_task = tokio::spawn(async move {
        let mut session = second.accept().await;
        run_handshake(&mut session, udp_port).await;
        session
    });

    let _connection = client
        .start(
            VoiceServerOptions::new(first_endpoint, TOKEN, GUILD_ID),
            SESSION_ID.to_string(),
        )
        .await
        .unwrap();
    let _first_session = first_task.await.unwrap();

    probes
        .server_updates
        .send(VoiceServerOptions::new(
            second_endpoint,
            "migrated-token",
            GUILD_ID,
        ))
        .unwrap();

    wait_for_state(&mut states, State::Connecting).await;
    wait_for_state(&mut states, State::Connected).await;
    let _second_session = second_task.await.unwrap();
}

#[tokio::test]
async fn test_migration_during_resume_backoff_forces_fresh_handshake() {
    let first = MockServer::bind().await;
    let second = MockServer::bind().await;
    let first_endpoint = first.endpoint();
    let second_endpoint = second.endpoint();
    let udp_port = spawn_discovery_stub("9.9.9.9", 6000).await;
    let (options, probes) = test_options(quick_reconnect(), IpDiscoveryOptions::default());

    let client = VoiceGatewayClient::new(options);
    let mut states = client.state_events();

    let first_task = tokio::spawn(async move {
        let mut session = first.accept().await;
        run_handshake(&mut session, udp_port).await;
        session.close(4015, "voice server crashed").await;
    });
    // The rebuilt session must identify from scratch on the new endpoint,
    // not resume the one that just died.
    let second_task = tokio::spawn(async move {
        let mut session = second.accept().await;
        run_handshake(&mut session, udp_port).await;
        session
    });

    let _connection = client
        .start(
            VoiceServerOptions::new(first_endpoint, TOKEN, GUILD_ID),
            SESSION_ID.to_string(),
        )
        .await
        .unwrap();
    first_task.await.unwrap();

    // The endpoint moves while the client is backing off toward a resume.
    wait_for_state(&mut states, State::Resuming).await;
    probes
        .server_updates
        .send(VoiceServerOptions::new(
            second_endpoint,
            "migrated-token",
            GUILD_ID,
        ))
        .unwrap();

    wait_for_state(&mut states, State::Connected).await;
    let _second_session = second_task.await.unwrap();
}

#[tokio::test]
async fn test_ip_discovery_exhaustion_rejects_start() {
    let server = MockServer::bind().await;
    let endpoint = server.endpoint();
    let silent_port = spawn_silent_udp().await;
    let (options, _probes) = test_options(
        ReconnectOptions {
            first_backoff_ms: 50,
            max_backoff_ms: 100,
            factor: 2.0,
            jitter: 0.0,
            max_attempts: 1,
        },
        IpDiscoveryOptions {
            timeout_ms: 50,
            max_retries: 0,
        },
    );

    let client = VoiceGatewayClient::new(options);
    let mut states = client.state_events();

    tokio::spawn(async move {
        // One initial attempt plus one retry, both stalling in discovery.
        for _ in 0..2 {
            let mut session = server.accept().await;
            session
                .send_op(8, json!({ "heartbeat_interval": 600000.0 }))
                .await;
            let (op, _) = session.next_payload().await;
            assert_eq!(op, 0);
            session
                .send_op(
                    2,
                    json!({
                        "ssrc": SSRC,
                        "ip": "127.0.0.1",
                        "port": silent_port,
                        "modes": ["xsalsa20_poly1305"],
                    }),
                )
                .await;
            // The client tears the connection down once discovery times out.
            while let Some(Ok(_)) = session.ws.next().await {}
        }
    });

    let result = client
        .start(
            VoiceServerOptions::new(endpoint, TOKEN, GUILD_ID),
            SESSION_ID.to_string(),
        )
        .await;
    assert!(matches!(result, Err(VoiceGatewayError::SocketSetup(_))));
    wait_for_state(&mut states, State::Disconnected).await;
}

#[tokio::test]
async fn test_second_start_fails_deterministically() {
    let server = MockServer::bind().await;
    let endpoint = server.endpoint();
    let udp_port = spawn_discovery_stub("9.9.9.9", 6000).await;
    let (options, _probes) = test_options(quick_reconnect(), IpDiscoveryOptions::default());

    let client = VoiceGatewayClient::new(options);
    let server_task = tokio::spawn(async move {
        let mut session = server.accept().await;
        run_handshake(&mut session, udp_port).await;
        session
    });

    let _connection = client
        .start(
            VoiceServerOptions::new(endpoint.clone(), TOKEN, GUILD_ID),
            SESSION_ID.to_string(),
        )
        .await
        .unwrap();
    let _session = server_task.await.unwrap();

    let second = client
        .start(
            VoiceServerOptions::new(endpoint, TOKEN, GUILD_ID),
            SESSION_ID.to_string(),
        )
        .await;
    assert!(matches!(second, Err(VoiceGatewayError::AlreadyActive)));
}

#[tokio::test]
async fn test_caller_reconnect_resumes_and_returns_once_connected() {
    let server = MockServer::bind().await;
    let endpoint = server.endpoint();
    let udp_port = spawn_discovery_stub("9.9.9.9", 6000).await;
    let (options, _probes) = test_options(quick_reconnect(), IpDiscoveryOptions::default());

    let client = VoiceGatewayClient::new(options);

    let server_task = tokio::spawn(async move {
        let mut session = server.accept().await;
        run_handshake(&mut session, udp_port).await;

        // The caller-initiated reconnect drops the transport abruptly and
        // comes back on the resume path.
        let mut session = server.accept().await;
        let (op, _) = session.next_payload().await;
        assert_eq!(op, 7);
        session
            .send_op(8, json!({ "heartbeat_interval": 600000.0 }))
            .await;
        session.send_op(9, Value::Null).await;
        session
    });

    let connection = client
        .start(
            VoiceServerOptions::new(endpoint, TOKEN, GUILD_ID),
            SESSION_ID.to_string(),
        )
        .await
        .unwrap();

    timeout(Duration::from_secs(5), connection.reconnect())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(connection.state(), State::Connected);
    let _session = server_task.await.unwrap();
}

#[tokio::test]
async fn test_caller_disconnect_stops_cleanly() {
    let server = MockServer::bind().await;
    let endpoint = server.endpoint();
    let udp_port = spawn_discovery_stub("9.9.9.9", 6000).await;
    let (options, mut probes) = test_options(quick_reconnect(), IpDiscoveryOptions::default());

    let client = VoiceGatewayClient::new(options);
    let server_task = tokio::spawn(async move {
        let mut session = server.accept().await;
        run_handshake(&mut session, udp_port).await;
        session
    });

    let connection = client
        .start(
            VoiceServerOptions::new(endpoint, TOKEN, GUILD_ID),
            SESSION_ID.to_string(),
        )
        .await
        .unwrap();
    let _session = server_task.await.unwrap();

    timeout(Duration::from_secs(5), connection.disconnect())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(connection.state(), State::Disconnected);
    assert_eq!(
        timeout(Duration::from_secs(5), probes.disconnects.recv())
            .await
            .unwrap(),
        Some(GUILD_ID)
    );
    assert_eq!(connection.channel_id().await, None);
}
