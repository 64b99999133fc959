use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::Mutex;

use crate::common::types::{GuildId, UserId};
use crate::gateway::tasks::{
    AudioProvider, AudioReceiver, VoiceChannelRetrieveTask, VoiceDisconnectTask,
    VoiceReceiveTaskFactory, VoiceSendTaskFactory, VoiceServerUpdateTask, VoiceStateUpdateTask,
};

/// Backoff policy for the outer reconnect loop.
#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectOptions {
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_first_backoff_ms")]
    pub first_backoff_ms: u64,
    /// Ceiling for the grown backoff, in milliseconds.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Growth factor applied to the previous backoff.
    #[serde(default = "default_backoff_factor")]
    pub factor: f64,
    /// Fraction of the computed backoff added as random jitter (0.0..=1.0).
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    /// Retries allowed without an intervening successful connect.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_first_backoff_ms() -> u64 {
    1_000
}

fn default_max_backoff_ms() -> u64 {
    8_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.5
}

fn default_max_attempts() -> u32 {
    5
}

impl Default for ReconnectOptions {
    fn default() -> Self {
        Self {
            first_backoff_ms: default_first_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            factor: default_backoff_factor(),
            jitter: default_jitter(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl ReconnectOptions {
    pub fn first_backoff(&self) -> Duration {
        Duration::from_millis(self.first_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

/// Bounds for the NAT traversal probe on the freshly bound UDP socket.
#[derive(Debug, Clone, Deserialize)]
pub struct IpDiscoveryOptions {
    /// Budget for a single discovery round trip, in milliseconds.
    #[serde(default = "default_discovery_timeout_ms")]
    pub timeout_ms: u64,
    /// Additional attempts after the first before giving up.
    #[serde(default = "default_discovery_retries")]
    pub max_retries: u32,
}

fn default_discovery_timeout_ms() -> u64 {
    5_000
}

fn default_discovery_retries() -> u32 {
    3
}

impl Default for IpDiscoveryOptions {
    fn default() -> Self {
        Self {
            timeout_ms: default_discovery_timeout_ms(),
            max_retries: default_discovery_retries(),
        }
    }
}

impl IpDiscoveryOptions {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Filter configuration for [`crate::common::logger::init`].
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Extra per-target directives, comma separated.
    #[serde(default)]
    pub filters: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            filters: String::new(),
        }
    }
}

/// Where and how to reach the voice server for one session.
///
/// Delivered by the host from its VOICE_SERVER_UPDATE dispatch and replaced
/// atomically when the upstream re-homes the session. `endpoint` carries the
/// scheme (`wss://...`); the gateway version query is appended by the driver.
#[derive(Clone, Deserialize)]
pub struct VoiceServerOptions {
    pub endpoint: String,
    pub token: String,
    pub guild_id: GuildId,
}

impl VoiceServerOptions {
    pub fn new(endpoint: impl Into<String>, token: impl Into<String>, guild_id: GuildId) -> Self {
        Self {
            endpoint: endpoint.into(),
            token: token.into(),
            guild_id,
        }
    }
}

// The token must never reach a log sink through a derived Debug.
impl fmt::Debug for VoiceServerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VoiceServerOptions")
            .field("endpoint", &self.endpoint)
            .field("token", &"<redacted>")
            .field("guild_id", &self.guild_id)
            .finish()
    }
}

/// Everything a [`crate::gateway::VoiceGatewayClient`] needs from its host.
#[derive(Clone)]
pub struct VoiceGatewayOptions {
    pub guild_id: GuildId,
    pub self_id: UserId,
    pub reconnect: ReconnectOptions,
    pub ip_discovery: IpDiscoveryOptions,
    pub audio_provider: Arc<Mutex<dyn AudioProvider + Send>>,
    pub audio_receiver: Arc<Mutex<dyn AudioReceiver + Send>>,
    pub send_task_factory: Arc<dyn VoiceSendTaskFactory>,
    pub receive_task_factory: Arc<dyn VoiceReceiveTaskFactory>,
    pub disconnect_task: Arc<dyn VoiceDisconnectTask>,
    pub server_update_task: Arc<dyn VoiceServerUpdateTask>,
    pub state_update_task: Arc<dyn VoiceStateUpdateTask>,
    pub channel_retrieve_task: Arc<dyn VoiceChannelRetrieveTask>,
}
