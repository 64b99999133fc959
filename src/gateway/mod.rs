//! The gateway driver: composes WebSocket I/O, the receiver pipeline, the
//! heartbeat and the retry loop into one long-lived session per client.

pub mod connection;
pub mod constants;
pub mod crypto;
pub mod heartbeat;
pub mod retry;
pub mod session;
pub mod tasks;
pub mod udp;

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::USER_AGENT;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn, Instrument};

use crate::common::types::{GuildId, SessionId, UserId};
use crate::common::utils::redact_tokens;
use crate::config::{VoiceGatewayOptions, VoiceServerOptions};
use crate::error::{CloseStatus, VoiceGatewayError};
use crate::gateway::connection::{State, VoiceConnection};
use crate::gateway::constants::{
    CLOSE_GRACE_MS, EVENTS_BUFFER_LEN, OUTBOUND_QUEUE_CAPACITY, VOICE_GATEWAY_VERSION,
};
use crate::gateway::crypto::PacketTransformer;
use crate::gateway::retry::{classify, Action, ReconnectContext};
use crate::gateway::session::Session;
use crate::gateway::udp::VoiceSocket;
use crate::payload::{self, Resume, VoicePayload};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// How an attempt should be wound down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseAction {
    Stop,
    StopAbruptly,
    Retry,
    RetryAbruptly,
}

/// A close decision plus the error that motivated it, if any.
#[derive(Debug)]
pub(crate) struct DisconnectBehavior {
    pub(crate) action: CloseAction,
    pub(crate) cause: Option<VoiceGatewayError>,
}

impl DisconnectBehavior {
    pub(crate) fn stop() -> Self {
        Self {
            action: CloseAction::Stop,
            cause: None,
        }
    }

    pub(crate) fn stop_with(cause: VoiceGatewayError) -> Self {
        Self {
            action: CloseAction::StopAbruptly,
            cause: Some(cause),
        }
    }

    pub(crate) fn retry() -> Self {
        Self {
            action: CloseAction::Retry,
            cause: None,
        }
    }

    pub(crate) fn retry_abruptly(cause: VoiceGatewayError) -> Self {
        Self {
            action: CloseAction::RetryAbruptly,
            cause: Some(cause),
        }
    }

    /// Maps a receiver-pipeline failure to its close decision: transport and
    /// socket-setup problems are worth another attempt, protocol violations
    /// are not.
    fn for_error(error: VoiceGatewayError) -> Self {
        match error {
            VoiceGatewayError::SocketSetup(_)
            | VoiceGatewayError::Timeout(_)
            | VoiceGatewayError::Transport(_) => Self::retry_abruptly(error),
            other => Self::stop_with(other),
        }
    }

    fn is_abrupt(&self) -> bool {
        matches!(self.action, CloseAction::StopAbruptly | CloseAction::RetryAbruptly)
    }

    fn is_stop(&self) -> bool {
        matches!(self.action, CloseAction::Stop | CloseAction::StopAbruptly)
    }
}

/// Everything one connected span owns, released LIFO on drop: the audio and
/// watcher tasks first, then the packet transformer (and with it the secret
/// key), then the UDP socket.
pub(crate) struct AttemptResources {
    pub(crate) cancel: CancellationToken,
    pub(crate) tasks: Vec<JoinHandle<()>>,
    pub(crate) transformer: Option<Arc<PacketTransformer>>,
    pub(crate) socket: Option<Arc<VoiceSocket>>,
}

impl Drop for AttemptResources {
    fn drop(&mut self) {
        self.cancel.cancel();
        for task in self.tasks.drain(..).rev() {
            task.abort();
        }
    }
}

/// State shared between the driver task, the session handler and the
/// caller-facing handles. Mutable protocol state is written by the receiver
/// task only; the cells exist so the façade can read it.
pub(crate) struct GatewayShared {
    pub(crate) guild_id: GuildId,
    pub(crate) self_id: UserId,
    pub(crate) server_options: parking_lot::Mutex<Option<VoiceServerOptions>>,
    pub(crate) session_id: parking_lot::Mutex<SessionId>,
    pub(crate) ssrc: AtomicU32,
    pub(crate) state_tx: watch::Sender<State>,
    pub(crate) events_tx: broadcast::Sender<VoicePayload>,
    pub(crate) close_tx: parking_lot::Mutex<Option<mpsc::UnboundedSender<DisconnectBehavior>>>,
    pub(crate) resources: parking_lot::Mutex<Option<AttemptResources>>,
    pub(crate) connected_tx:
        parking_lot::Mutex<Option<oneshot::Sender<Result<(), VoiceGatewayError>>>>,
    pub(crate) reconnect_ctx: parking_lot::Mutex<ReconnectContext>,
    pub(crate) ever_connected: AtomicBool,
    pub(crate) last_heartbeat_ms: AtomicU64,
    pub(crate) latency_ms: AtomicU64,
}

impl GatewayShared {
    pub(crate) fn set_state(&self, next: State) {
        self.state_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                debug!(from = ?current, to = ?next, "voice state change");
                *current = next;
                true
            }
        });
    }

    pub(crate) fn request_close(&self, behavior: DisconnectBehavior) -> bool {
        match self.close_tx.lock().as_ref() {
            Some(tx) => tx.send(behavior).is_ok(),
            None => false,
        }
    }

    pub(crate) fn install_resources(&self, resources: AttemptResources) {
        // Replacing the slot disposes whatever the previous span owned.
        *self.resources.lock() = Some(resources);
    }

    pub(crate) fn take_resources(&self) {
        self.resources.lock().take();
    }
}

/// Client for one guild's voice gateway session.
///
/// `start` may be called once per instance; the returned
/// [`VoiceConnection`] and the retry loop live until a non-retryable close,
/// the attempt budget runs out, or the caller disconnects.
pub struct VoiceGatewayClient {
    options: Arc<VoiceGatewayOptions>,
    shared: Arc<GatewayShared>,
    started: AtomicBool,
}

impl VoiceGatewayClient {
    pub fn new(options: VoiceGatewayOptions) -> Self {
        let (state_tx, _) = watch::channel(State::Connecting);
        let (events_tx, _) = broadcast::channel(EVENTS_BUFFER_LEN);
        let shared = Arc::new(GatewayShared {
            guild_id: options.guild_id,
            self_id: options.self_id,
            server_options: parking_lot::Mutex::new(None),
            session_id: parking_lot::Mutex::new(String::new()),
            ssrc: AtomicU32::new(0),
            state_tx,
            events_tx,
            close_tx: parking_lot::Mutex::new(None),
            resources: parking_lot::Mutex::new(None),
            connected_tx: parking_lot::Mutex::new(None),
            reconnect_ctx: parking_lot::Mutex::new(ReconnectContext::new()),
            ever_connected: AtomicBool::new(false),
            last_heartbeat_ms: AtomicU64::new(0),
            latency_ms: AtomicU64::new(u64::MAX),
        });
        Self {
            options: Arc::new(options),
            shared,
            started: AtomicBool::new(false),
        }
    }

    /// Hot stream of decoded gateway payloads, available before `start` so
    /// subscribers can observe the handshake itself.
    pub fn events(&self) -> broadcast::Receiver<VoicePayload> {
        self.shared.events_tx.subscribe()
    }

    /// Replay-last stream of [`State`] transitions.
    pub fn state_events(&self) -> watch::Receiver<State> {
        self.shared.state_tx.subscribe()
    }

    /// Connects to the voice gateway and drives the session until it ends.
    /// Resolves with the caller façade once the first attempt reaches
    /// CONNECTED; rejects with the underlying failure if the attempt budget
    /// is spent or a non-retryable close arrives first.
    pub async fn start(
        &self,
        server_options: VoiceServerOptions,
        session_id: SessionId,
    ) -> Result<VoiceConnection, VoiceGatewayError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(VoiceGatewayError::AlreadyActive);
        }

        *self.shared.server_options.lock() = Some(server_options);
        *self.shared.session_id.lock() = session_id;

        let (connected_tx, connected_rx) = oneshot::channel();
        *self.shared.connected_tx.lock() = Some(connected_tx);
        let (close_tx, close_rx) = mpsc::unbounded_channel();
        *self.shared.close_tx.lock() = Some(close_tx.clone());

        let span = tracing::info_span!("voice", guild_id = self.shared.guild_id);
        tokio::spawn(
            run(self.shared.clone(), self.options.clone(), close_rx, close_tx).instrument(span),
        );

        match connected_rx.await {
            Ok(Ok(())) => Ok(VoiceConnection {
                shared: self.shared.clone(),
                channel_retrieve_task: self.options.channel_retrieve_task.clone(),
            }),
            Ok(Err(error)) => Err(error),
            Err(_) => Err(VoiceGatewayError::NotActive),
        }
    }

    /// Requests a stop and waits for the driver to wind down. Errors if the
    /// client was never started.
    pub async fn stop(&self) -> Result<(), VoiceGatewayError> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(VoiceGatewayError::NotActive);
        }
        if self.shared.request_close(DisconnectBehavior::stop()) {
            let mut states = self.shared.state_tx.subscribe();
            let _ = states.wait_for(|s| *s == State::Disconnected).await;
        }
        Ok(())
    }
}

/// What one WebSocket attempt ended with.
struct AttemptClose {
    status: CloseStatus,
    behavior: DisconnectBehavior,
}

/// The outer retry loop: connect, classify the close, back off, repeat.
///
/// The outbound control channel lives here, not per attempt, so the handles
/// the audio tasks hold across a resume (the speaking sender in particular)
/// stay valid for the whole run.
async fn run(
    shared: Arc<GatewayShared>,
    options: Arc<VoiceGatewayOptions>,
    mut close_rx: mpsc::UnboundedReceiver<DisconnectBehavior>,
    close_tx: mpsc::UnboundedSender<DisconnectBehavior>,
) {
    let (outbound_tx, mut outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
    loop {
        let resuming = *shared.state_tx.borrow() == State::Resuming;
        let AttemptClose { status, behavior } = connect_once(
            &shared,
            &options,
            &mut close_rx,
            &close_tx,
            &mut outbound_rx,
            &outbound_tx,
            resuming,
        )
        .await;
        debug!(action = ?behavior.action, %status, "closing");

        if behavior.is_stop() {
            finalize(&shared, &options, status, behavior.cause).await;
            return;
        }

        let connected_once = shared.ever_connected.load(Ordering::Relaxed);
        match classify(&status, behavior.cause.as_ref(), connected_once) {
            Action::Stop => {
                // Non-retryable close code: stopping is the only choice.
                let cause = behavior
                    .cause
                    .or_else(|| (status.code != 4014).then(|| VoiceGatewayError::Close(status.clone())));
                finalize(&shared, &options, status, cause).await;
                return;
            }
            Action::Retry(next_state) => {
                let backoff = shared.reconnect_ctx.lock().next_backoff(&options.reconnect);
                let Some(backoff) = backoff else {
                    warn!("reconnect attempts exhausted");
                    let cause = behavior
                        .cause
                        .unwrap_or_else(|| VoiceGatewayError::Close(status.clone()));
                    finalize(&shared, &options, status, Some(cause)).await;
                    return;
                };
                shared.set_state(next_state);
                if next_state == State::Connecting {
                    // Key material and the old media channel must be gone
                    // before a fresh identify.
                    shared.take_resources();
                }
                let attempt = shared.reconnect_ctx.lock().attempts();
                debug!(?next_state, ?backoff, attempt, "retrying");
                tokio::select! {
                    _ = sleep(backoff) => {}
                    requested = close_rx.recv() => {
                        let requested = requested.unwrap_or_else(DisconnectBehavior::stop);
                        if requested.is_stop() {
                            finalize(
                                &shared,
                                &options,
                                CloseStatus::local("stopped while reconnecting"),
                                requested.cause,
                            )
                            .await;
                            return;
                        }
                        // A retry requested mid-backoff still runs through
                        // classification: a server migration (whose watcher
                        // survives a resuming retry) must force a fresh
                        // handshake, not resume against the new endpoint.
                        if let Action::Retry(state) =
                            classify(&status, requested.cause.as_ref(), connected_once)
                        {
                            shared.set_state(state);
                            if state == State::Connecting {
                                shared.take_resources();
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Terminal teardown: releases the span's resources, flips the state to
/// DISCONNECTED, settles a still-pending `start` and notifies the host.
async fn finalize(
    shared: &Arc<GatewayShared>,
    options: &Arc<VoiceGatewayOptions>,
    status: CloseStatus,
    cause: Option<VoiceGatewayError>,
) {
    shared.take_resources();
    *shared.close_tx.lock() = None;
    shared.set_state(State::Disconnected);
    if let Some(notifier) = shared.connected_tx.lock().take() {
        let error = cause.unwrap_or_else(|| VoiceGatewayError::Close(status.clone()));
        let _ = notifier.send(Err(error));
    } else if let Some(error) = cause {
        warn!("voice session ended with {}", error);
    }
    options.disconnect_task.on_disconnect(shared.guild_id).await;
    info!(%status, "voice session disconnected");
}

/// One WebSocket attempt, from dial to close.
#[allow(clippy::too_many_arguments)]
async fn connect_once(
    shared: &Arc<GatewayShared>,
    options: &Arc<VoiceGatewayOptions>,
    close_rx: &mut mpsc::UnboundedReceiver<DisconnectBehavior>,
    close_tx: &mpsc::UnboundedSender<DisconnectBehavior>,
    outbound_rx: &mut mpsc::Receiver<VoicePayload>,
    outbound_tx: &mpsc::Sender<VoicePayload>,
    resuming: bool,
) -> AttemptClose {
    // Control frames queued while no socket existed are stale; shed them
    // before dialing so nothing from a dead attempt leaks onto a new wire.
    while outbound_rx.try_recv().is_ok() {}

    let endpoint = match shared.server_options.lock().as_ref() {
        Some(server_options) => server_options.endpoint.clone(),
        None => {
            return AttemptClose {
                status: CloseStatus::local("no voice server options"),
                behavior: DisconnectBehavior::stop_with(VoiceGatewayError::Protocol(
                    "no voice server options".to_string(),
                )),
            }
        }
    };
    let url = format!("{}?v={}", endpoint, VOICE_GATEWAY_VERSION);
    debug!(%url, "connecting to voice gateway");

    let mut request = match url.into_client_request() {
        Ok(request) => request,
        Err(e) => {
            return AttemptClose {
                status: CloseStatus::local("bad endpoint"),
                behavior: DisconnectBehavior::stop_with(VoiceGatewayError::Protocol(format!(
                    "bad voice endpoint: {}",
                    e
                ))),
            }
        }
    };
    request
        .headers_mut()
        .insert(USER_AGENT, HeaderValue::from_static(constants::USER_AGENT));

    let websocket = match connect_async(request).await {
        Ok((websocket, _)) => websocket,
        Err(e) => {
            warn!("voice gateway connect failed: {}", e);
            return AttemptClose {
                status: CloseStatus::abnormal(),
                behavior: DisconnectBehavior {
                    action: CloseAction::Retry,
                    cause: Some(VoiceGatewayError::Transport(e.to_string())),
                },
            };
        }
    };
    let (mut sink, mut stream) = websocket.split();

    let mut session = Session::new(
        shared.clone(),
        options.clone(),
        outbound_tx.clone(),
        close_tx.clone(),
        resuming,
    );

    // A resume goes on the wire before any frame is decoded for the attempt.
    if resuming {
        info!("attempting to resume");
        let resume = VoicePayload::Resume(Resume {
            server_id: shared.guild_id.to_string(),
            user_id: shared.self_id.to_string(),
            session_id: shared.session_id.lock().clone(),
        });
        if let Err(behavior) = write_frame(&mut sink, &resume).await {
            return AttemptClose {
                status: CloseStatus::abnormal(),
                behavior,
            };
        }
    }

    let mut requested: Option<DisconnectBehavior> = None;
    let mut awaiting_close_echo = false;

    let status = loop {
        tokio::select! {
            biased;
            behavior = close_rx.recv() => {
                let behavior = behavior.unwrap_or_else(DisconnectBehavior::stop);
                let abrupt = behavior.is_abrupt();
                requested = Some(behavior);
                if abrupt {
                    break CloseStatus::local("abrupt close");
                }
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code: CloseCode::Normal,
                        reason: "".into(),
                    })))
                    .await;
                awaiting_close_echo = true;
                break CloseStatus::local("closed by request");
            }
            payload = outbound_rx.recv() => {
                // All producers hold clones owned by this run, so the
                // channel cannot be closed here.
                let Some(payload) = payload else { break CloseStatus::abnormal() };
                if let Err(behavior) = write_frame(&mut sink, &payload).await {
                    requested = Some(behavior);
                    break CloseStatus::local("write error");
                }
            }
            frame = stream.next() => {
                match frame {
                    None => break CloseStatus::abnormal(),
                    Some(Err(e)) => {
                        warn!("websocket read failed: {}", e);
                        break CloseStatus::abnormal();
                    }
                    Some(Ok(Message::Text(text))) => {
                        trace!(
                            target: "voicelink::protocol::receiver",
                            "{}",
                            redact_tokens(text.as_str())
                        );
                        match payload::decode(text.as_bytes()) {
                            Ok(decoded) => {
                                let _ = shared.events_tx.send(decoded.clone());
                                if let Err(e) = session.handle(&decoded).await {
                                    requested = Some(DisconnectBehavior::for_error(e));
                                    break CloseStatus::local("session error");
                                }
                            }
                            Err(e) => {
                                error!("failed to decode voice payload: {}", e);
                                requested = Some(DisconnectBehavior::stop_with(e));
                                break CloseStatus::local("protocol error");
                            }
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break frame
                            .map(|f| CloseStatus::new(f.code.into(), f.reason.to_string()))
                            .unwrap_or_else(CloseStatus::abnormal);
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    };

    // A requested close sent our close frame; wait briefly for the server
    // to echo it so the real status wins over the local placeholder.
    let status = if awaiting_close_echo {
        match timeout(Duration::from_millis(CLOSE_GRACE_MS), wait_for_close(&mut stream)).await {
            Ok(Some(echoed)) => echoed,
            _ => status,
        }
    } else {
        status
    };

    // Dropping the session stops the heartbeat before any backoff begins.
    drop(session);

    AttemptClose {
        status,
        behavior: requested.unwrap_or_else(DisconnectBehavior::retry),
    }
}

/// Encodes one control payload, logs it redacted and writes it out. An
/// encoding failure is fatal to the whole session; a transport failure is
/// worth another attempt.
async fn write_frame(
    sink: &mut WsSink,
    payload: &VoicePayload,
) -> Result<(), DisconnectBehavior> {
    let frame = payload::encode(payload).map_err(|e| {
        error!("failed to encode voice payload: {}", e);
        DisconnectBehavior::stop_with(e)
    })?;
    trace!(
        target: "voicelink::protocol::sender",
        "{}",
        redact_tokens(&frame)
    );
    sink.send(Message::Text(frame.into())).await.map_err(|e| {
        warn!("websocket write failed: {}", e);
        DisconnectBehavior::retry_abruptly(VoiceGatewayError::Transport(e.to_string()))
    })
}

/// Drains the stream until the server's close frame (or EOF) arrives.
async fn wait_for_close(stream: &mut WsStream) -> Option<CloseStatus> {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Close(frame)) => {
                return Some(
                    frame
                        .map(|f| CloseStatus::new(f.code.into(), f.reason.to_string()))
                        .unwrap_or_else(CloseStatus::abnormal),
                )
            }
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
    None
}
