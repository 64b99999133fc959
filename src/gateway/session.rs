use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, Instrument};

use crate::common::utils::now_ms;
use crate::config::VoiceGatewayOptions;
use crate::error::VoiceGatewayError;
use crate::gateway::connection::State;
use crate::gateway::crypto::PacketTransformer;
use crate::gateway::heartbeat::ResettableInterval;
use crate::gateway::tasks::SpeakingSender;
use crate::gateway::udp::VoiceSocket;
use crate::gateway::{AttemptResources, DisconnectBehavior, GatewayShared};
use crate::payload::{Hello, Identify, Ready, SessionDescription, VoicePayload};

/// Protocol handler for one WebSocket attempt.
///
/// Owns the attempt's heartbeat and the half-built media channel between
/// Ready and SessionDescription. Dropping it stops the heartbeat, so every
/// close, successful or not, also silences the keepalive.
pub(crate) struct Session {
    shared: Arc<GatewayShared>,
    options: Arc<VoiceGatewayOptions>,
    outbound: mpsc::Sender<VoicePayload>,
    close_tx: mpsc::UnboundedSender<DisconnectBehavior>,
    heartbeat: ResettableInterval,
    heartbeat_pump: JoinHandle<()>,
    resuming: bool,
    ssrc: u32,
    socket: Option<Arc<VoiceSocket>>,
}

impl Session {
    pub(crate) fn new(
        shared: Arc<GatewayShared>,
        options: Arc<VoiceGatewayOptions>,
        outbound: mpsc::Sender<VoicePayload>,
        close_tx: mpsc::UnboundedSender<DisconnectBehavior>,
        resuming: bool,
    ) -> Self {
        let (heartbeat, mut ticks) = ResettableInterval::new();
        let pump_outbound = outbound.clone();
        let pump_shared = shared.clone();
        let heartbeat_pump = tokio::spawn(
            async move {
                while let Some(nonce) = ticks.recv().await {
                    pump_shared.last_heartbeat_ms.store(now_ms(), Ordering::Relaxed);
                    if pump_outbound.send(VoicePayload::Heartbeat(nonce)).await.is_err() {
                        break;
                    }
                }
            }
            .in_current_span(),
        );

        Self {
            shared,
            options,
            outbound,
            close_tx,
            heartbeat,
            heartbeat_pump,
            resuming,
            ssrc: 0,
            socket: None,
        }
    }

    /// Advances the session with one decoded payload.
    pub(crate) async fn handle(&mut self, payload: &VoicePayload) -> Result<(), VoiceGatewayError> {
        match payload {
            VoicePayload::Hello(hello) => self.on_hello(hello),
            VoicePayload::Ready(ready) => self.on_ready(ready).await,
            VoicePayload::SessionDescription(description) => {
                self.on_session_description(description)
            }
            VoicePayload::Resumed => self.on_resumed(),
            VoicePayload::HeartbeatAck(_) => self.on_heartbeat_ack(),
            // Opaque events and client-bound echoes carry no state.
            _ => Ok(()),
        }
    }

    fn on_hello(&mut self, hello: &Hello) -> Result<(), VoiceGatewayError> {
        self.heartbeat
            .start(Duration::from_millis(hello.heartbeat_interval));
        if self.resuming {
            debug!("heartbeat restarted while awaiting resume");
            return Ok(());
        }
        self.shared.set_state(State::Connecting);
        info!("identifying");
        let identify = {
            let server_options = self.shared.server_options.lock();
            let token = server_options
                .as_ref()
                .map(|o| o.token.clone())
                .ok_or_else(|| VoiceGatewayError::Protocol("no voice server options".to_string()))?;
            Identify {
                server_id: self.shared.guild_id.to_string(),
                user_id: self.shared.self_id.to_string(),
                session_id: self.shared.session_id.lock().clone(),
                token,
            }
        };
        self.send(VoicePayload::Identify(identify))
    }

    async fn on_ready(&mut self, ready: &Ready) -> Result<(), VoiceGatewayError> {
        info!("waiting for session description");
        self.ssrc = ready.ssrc;
        self.shared.ssrc.store(ready.ssrc, Ordering::Relaxed);

        let socket = VoiceSocket::setup(&ready.ip, ready.port).await?;
        let (address, port) = socket
            .perform_ip_discovery(ready.ssrc, &self.options.ip_discovery)
            .await?;
        debug!(%address, port, "voice socket setup complete");
        self.socket = Some(Arc::new(socket));

        self.send(VoicePayload::SelectProtocol(
            crate::payload::SelectProtocol::udp(address, port),
        ))
    }

    fn on_session_description(
        &mut self,
        description: &SessionDescription,
    ) -> Result<(), VoiceGatewayError> {
        let socket = self.socket.take().ok_or_else(|| {
            VoiceGatewayError::Protocol("session description before ready".to_string())
        })?;

        let transformer = Arc::new(PacketTransformer::new(self.ssrc, &description.secret_key));
        let cancel = CancellationToken::new();
        let speaking = SpeakingSender::new(self.outbound.clone(), self.ssrc);

        let send_task = self.options.send_task_factory.create(
            cancel.clone(),
            speaking,
            socket.clone(),
            self.options.audio_provider.clone(),
            transformer.clone(),
        );
        let receive_task = self.options.receive_task_factory.create(
            cancel.clone(),
            socket.inbound(),
            transformer.clone(),
            self.options.audio_receiver.clone(),
        );
        let server_watcher = self.spawn_server_update_watcher();
        let state_watcher = self.spawn_state_update_watcher();

        self.shared.install_resources(AttemptResources {
            cancel,
            tasks: vec![send_task, receive_task, server_watcher, state_watcher],
            transformer: Some(transformer),
            socket: Some(socket),
        });

        info!("receiving events");
        self.mark_connected();
        Ok(())
    }

    fn on_resumed(&mut self) -> Result<(), VoiceGatewayError> {
        if !self.resuming {
            debug!("ignoring resumed outside a resume attempt");
            return Ok(());
        }
        info!("resumed");
        self.mark_connected();
        Ok(())
    }

    fn on_heartbeat_ack(&self) -> Result<(), VoiceGatewayError> {
        let sent = self.shared.last_heartbeat_ms.load(Ordering::Relaxed);
        if sent > 0 {
            self.shared
                .latency_ms
                .store(now_ms().saturating_sub(sent), Ordering::Relaxed);
        }
        Ok(())
    }

    fn mark_connected(&self) {
        self.shared.ever_connected.store(true, Ordering::Relaxed);
        self.shared.reconnect_ctx.lock().reset();
        self.shared.set_state(State::Connected);
        if let Some(notifier) = self.shared.connected_tx.lock().take() {
            let _ = notifier.send(Ok(()));
        }
    }

    /// The session runs on the same task that drains the outbound queue, so
    /// it must never wait for capacity; a full queue is an overflow error.
    fn send(&self, payload: VoicePayload) -> Result<(), VoiceGatewayError> {
        self.outbound.try_send(payload).map_err(|e| match e {
            TrySendError::Full(_) => {
                VoiceGatewayError::Protocol("outbound control queue overflow".to_string())
            }
            TrySendError::Closed(_) => {
                VoiceGatewayError::Transport("outbound channel closed".to_string())
            }
        })
    }

    /// Watches for the upstream re-homing the session. An endpoint change
    /// swaps the stored server options and aborts the attempt so the retry
    /// loop rebuilds against the new server.
    fn spawn_server_update_watcher(&self) -> JoinHandle<()> {
        let mut updates = self
            .options
            .server_update_task
            .on_voice_server_update(self.shared.guild_id);
        let shared = self.shared.clone();
        let close_tx = self.close_tx.clone();
        tokio::spawn(
            async move {
                while let Some(new_options) = updates.recv().await {
                    let changed = {
                        let current = shared.server_options.lock();
                        current
                            .as_ref()
                            .map(|o| o.endpoint != new_options.endpoint)
                            .unwrap_or(true)
                    };
                    if changed {
                        debug!(endpoint = %new_options.endpoint, "voice server endpoint changed");
                        *shared.server_options.lock() = Some(new_options);
                        let _ = close_tx.send(DisconnectBehavior::retry_abruptly(
                            VoiceGatewayError::ServerMigration,
                        ));
                        break;
                    }
                }
            }
            .in_current_span(),
        )
    }

    fn spawn_state_update_watcher(&self) -> JoinHandle<()> {
        let mut updates = self
            .options
            .state_update_task
            .on_voice_state_update(self.shared.guild_id);
        let shared = self.shared.clone();
        tokio::spawn(
            async move {
                while let Some(session_id) = updates.recv().await {
                    if *shared.session_id.lock() != session_id {
                        info!("voice session updated");
                        *shared.session_id.lock() = session_id;
                    }
                }
            }
            .in_current_span(),
        )
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.heartbeat.stop();
        self.heartbeat_pump.abort();
    }
}
