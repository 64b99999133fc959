//! Discord voice gateway client.
//!
//! A [`VoiceGatewayClient`] negotiates a voice session over a WebSocket,
//! opens the companion UDP audio channel to the server-assigned endpoint,
//! performs IP discovery, installs an authenticated-encryption transformer
//! for RTP packets and then pumps audio in both directions until the session
//! ends. Around that it runs a reconnect/resume loop with bounded backoff, a
//! resettable heartbeat and a server-migration handler.
//!
//! The client stays codec-agnostic: audio enters and leaves through the
//! [`gateway::tasks::AudioProvider`] / [`gateway::tasks::AudioReceiver`]
//! seams as opaque opus frames.

pub mod common;
pub mod config;
pub mod error;
pub mod gateway;
pub mod payload;

pub use config::{IpDiscoveryOptions, ReconnectOptions, VoiceGatewayOptions, VoiceServerOptions};
pub use error::{CloseStatus, VoiceGatewayError};
pub use gateway::connection::{State, VoiceConnection};
pub use gateway::VoiceGatewayClient;
pub use payload::VoicePayload;
