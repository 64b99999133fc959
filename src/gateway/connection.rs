use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};

use crate::common::types::{ChannelId, GuildId, Ssrc};
use crate::error::VoiceGatewayError;
use crate::gateway::tasks::VoiceChannelRetrieveTask;
use crate::gateway::{DisconnectBehavior, GatewayShared};
use crate::payload::VoicePayload;

/// Externally observable lifecycle of a voice session.
///
/// Within one attempt the states are monotonic: `Connecting` to `Connected`
/// to either `Disconnected` or `Resuming`. `Resuming` only ever follows a
/// session that was connected at least once; `Disconnected` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Connecting,
    Resuming,
    Connected,
    Disconnected,
}

/// Caller façade over a live voice session.
///
/// Handed out by [`crate::gateway::VoiceGatewayClient::start`] once the
/// first connect completes.
pub struct VoiceConnection {
    pub(crate) shared: Arc<GatewayShared>,
    pub(crate) channel_retrieve_task: Arc<dyn VoiceChannelRetrieveTask>,
}

impl VoiceConnection {
    pub fn guild_id(&self) -> GuildId {
        self.shared.guild_id
    }

    /// Live stream of decoded gateway payloads. Latest-wins: a subscriber
    /// that lags far enough behind skips the oldest events.
    pub fn events(&self) -> broadcast::Receiver<VoicePayload> {
        self.shared.events_tx.subscribe()
    }

    /// Replay-last stream of [`State`] transitions.
    pub fn state_events(&self) -> watch::Receiver<State> {
        self.shared.state_tx.subscribe()
    }

    pub fn state(&self) -> State {
        *self.shared.state_tx.borrow()
    }

    /// Synchronization source assigned by the server in Ready, once known.
    pub fn ssrc(&self) -> Option<Ssrc> {
        match self.shared.ssrc.load(Ordering::Relaxed) {
            0 => None,
            ssrc => Some(ssrc),
        }
    }

    /// Round trip of the most recent acknowledged heartbeat, if any.
    pub fn latency(&self) -> Option<Duration> {
        match self.shared.latency_ms.load(Ordering::Relaxed) {
            u64::MAX => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    /// Stops the session if it is currently connected, waiting for teardown
    /// to finish; a no-op on a session that is already on its way down.
    pub async fn disconnect(&self) -> Result<(), VoiceGatewayError> {
        if self.on_connect_or_disconnect().await != State::Connected {
            return Ok(());
        }
        self.shared.request_close(DisconnectBehavior::stop());
        let mut states = self.shared.state_tx.subscribe();
        let _ = states.wait_for(|s| *s == State::Disconnected).await;
        Ok(())
    }

    /// Abruptly tears the transport down and waits until the session is
    /// connected again. Fails on a session that already disconnected.
    pub async fn reconnect(&self) -> Result<(), VoiceGatewayError> {
        if self.on_connect_or_disconnect().await != State::Connected {
            return Err(VoiceGatewayError::NotActive);
        }
        let mut states = self.shared.state_tx.subscribe();
        self.shared
            .request_close(DisconnectBehavior::retry_abruptly(VoiceGatewayError::Reconnect));

        // Watch the session leave CONNECTED, then come back.
        if states.wait_for(|s| *s != State::Connected).await.is_err() {
            return Err(VoiceGatewayError::NotActive);
        }
        let result = match states
            .wait_for(|s| matches!(s, State::Connected | State::Disconnected))
            .await
        {
            Ok(state) if *state == State::Connected => Ok(()),
            _ => Err(VoiceGatewayError::NotActive),
        };
        result
    }

    /// The channel this session currently sits in, resolved through the
    /// host. `None` unless the session is connected.
    pub async fn channel_id(&self) -> Option<ChannelId> {
        if self.on_connect_or_disconnect().await != State::Connected {
            return None;
        }
        self.channel_retrieve_task.on_request().await
    }

    /// Waits until the session has settled into either CONNECTED or
    /// DISCONNECTED; the in-between states are transient.
    async fn on_connect_or_disconnect(&self) -> State {
        let mut states = self.shared.state_tx.subscribe();
        let result = match states
            .wait_for(|s| matches!(s, State::Connected | State::Disconnected))
            .await
        {
            Ok(state) => *state,
            Err(_) => State::Disconnected,
        };
        result
    }
}
