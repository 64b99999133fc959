//! Seams between the gateway core and its host: audio producers/consumers,
//! the task factories that pump them, and the host-supplied callbacks.
//!
//! The core never touches a codec. Providers hand it opaque opus frames and
//! receivers get opened opus frames back; pacing lives in the send task.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::common::types::{ChannelId, GuildId, SessionId};
use crate::config::VoiceServerOptions;
use crate::error::VoiceGatewayError;
use crate::gateway::constants::{
    FRAME_INTERVAL_MS, SILENT_FRAMES_BEFORE_QUIET, SPEAKING_MICROPHONE,
};
use crate::gateway::crypto::PacketTransformer;
use crate::gateway::udp::{UdpInbound, VoiceSocket};
use crate::payload::{Speaking, VoicePayload};

/// Source of outgoing opus frames.
pub trait AudioProvider: Send {
    /// The next frame to transmit, or `None` when there is nothing to say.
    fn provide(&mut self) -> Option<Vec<u8>>;
}

/// Sink for opened incoming opus frames.
pub trait AudioReceiver: Send {
    fn receive(&mut self, ssrc: u32, frame: &[u8]);
}

/// Provider that never speaks.
pub struct NoOpAudioProvider;

impl AudioProvider for NoOpAudioProvider {
    fn provide(&mut self) -> Option<Vec<u8>> {
        None
    }
}

/// Receiver that drops everything.
pub struct NoOpAudioReceiver;

impl AudioReceiver for NoOpAudioReceiver {
    fn receive(&mut self, _ssrc: u32, _frame: &[u8]) {}
}

/// Raises and drops the speaking flag on the control plane. Handed to the
/// send task so the core decides neither when nor what to say.
#[derive(Clone)]
pub struct SpeakingSender {
    outbound: mpsc::Sender<VoicePayload>,
    ssrc: u32,
}

impl SpeakingSender {
    pub(crate) fn new(outbound: mpsc::Sender<VoicePayload>, ssrc: u32) -> Self {
        Self { outbound, ssrc }
    }

    pub async fn set_speaking(&self, speaking: bool) -> Result<(), VoiceGatewayError> {
        let flags = if speaking { SPEAKING_MICROPHONE } else { 0 };
        self.outbound
            .send(VoicePayload::Speaking(Speaking {
                speaking: flags,
                delay: 0,
                ssrc: self.ssrc,
            }))
            .await
            .map_err(|_| VoiceGatewayError::NotActive)
    }
}

/// Builds the task that drains the audio provider into sealed datagrams.
pub trait VoiceSendTaskFactory: Send + Sync {
    fn create(
        &self,
        cancel: CancellationToken,
        speaking: SpeakingSender,
        socket: Arc<VoiceSocket>,
        provider: Arc<Mutex<dyn AudioProvider + Send>>,
        transformer: Arc<PacketTransformer>,
    ) -> JoinHandle<()>;
}

/// Builds the task that opens inbound datagrams into the audio receiver.
pub trait VoiceReceiveTaskFactory: Send + Sync {
    fn create(
        &self,
        cancel: CancellationToken,
        inbound: UdpInbound,
        transformer: Arc<PacketTransformer>,
        receiver: Arc<Mutex<dyn AudioReceiver + Send>>,
    ) -> JoinHandle<()>;
}

/// Frame-interval paced sender. Polls the provider every 20 ms, raises the
/// speaking flag ahead of a burst and drops it after a run of silence.
pub struct DefaultSendTaskFactory;

impl VoiceSendTaskFactory for DefaultSendTaskFactory {
    fn create(
        &self,
        cancel: CancellationToken,
        speaking: SpeakingSender,
        socket: Arc<VoiceSocket>,
        provider: Arc<Mutex<dyn AudioProvider + Send>>,
        transformer: Arc<PacketTransformer>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_millis(FRAME_INTERVAL_MS));
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut speaking_now = false;
            let mut silent_frames = 0u32;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let frame = provider.lock().await.provide();
                        let Some(frame) = frame else {
                            silent_frames += 1;
                            if speaking_now && silent_frames >= SILENT_FRAMES_BEFORE_QUIET {
                                if speaking.set_speaking(false).await.is_err() {
                                    break;
                                }
                                speaking_now = false;
                            }
                            continue;
                        };

                        silent_frames = 0;
                        if !speaking_now {
                            if speaking.set_speaking(true).await.is_err() {
                                break;
                            }
                            speaking_now = true;
                        }
                        match transformer.seal(&frame) {
                            Ok(packet) => {
                                if let Err(e) = socket.send(&packet).await {
                                    warn!("failed to send voice packet: {}", e);
                                }
                            }
                            Err(e) => error!("sealing voice packet failed: {}", e),
                        }
                    }
                }
            }
        })
    }
}

/// Opens every inbound datagram and forwards the ones that authenticate.
pub struct DefaultReceiveTaskFactory;

impl VoiceReceiveTaskFactory for DefaultReceiveTaskFactory {
    fn create(
        &self,
        cancel: CancellationToken,
        mut inbound: UdpInbound,
        transformer: Arc<PacketTransformer>,
        receiver: Arc<Mutex<dyn AudioReceiver + Send>>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    datagram = inbound.next() => {
                        let Some(datagram) = datagram else { break };
                        if let Some(frame) = transformer.open(&datagram) {
                            receiver.lock().await.receive(transformer.ssrc(), &frame);
                        }
                    }
                }
            }
        })
    }
}

/// Invoked once the session has fully stopped and resources are released.
#[async_trait]
pub trait VoiceDisconnectTask: Send + Sync {
    async fn on_disconnect(&self, guild_id: GuildId);
}

/// Stream of VOICE_SERVER_UPDATE dispatches for this guild. A change of
/// endpoint tears the session down and rebuilds it against the new server.
pub trait VoiceServerUpdateTask: Send + Sync {
    fn on_voice_server_update(&self, guild_id: GuildId) -> mpsc::UnboundedReceiver<VoiceServerOptions>;
}

/// Stream of session-id changes signalled by the host's voice state.
pub trait VoiceStateUpdateTask: Send + Sync {
    fn on_voice_state_update(&self, guild_id: GuildId) -> mpsc::UnboundedReceiver<SessionId>;
}

/// Resolves the voice channel the client currently sits in.
#[async_trait]
pub trait VoiceChannelRetrieveTask: Send + Sync {
    async fn on_request(&self) -> Option<ChannelId>;
}
