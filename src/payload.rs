//! Wire types for the voice control plane and their `{"op": u8, "d": ...}`
//! envelope codec.
//!
//! Decoding is lenient at the envelope level: a frame with an opcode this
//! crate does not know becomes [`VoicePayload::Unknown`] so newer servers do
//! not break the session. A known opcode with data that fails to
//! deserialize is a protocol error and is never retried.

use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::VoiceGatewayError;
use crate::gateway::constants::*;

/// Symmetric key delivered in SessionDescription, consumed by the packet
/// transformer. Zeroized on drop; its `Debug` never prints key material.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey([u8; SECRET_KEY_LEN]);

impl SecretKey {
    pub fn new(bytes: [u8; SECRET_KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn expose(&self) -> &[u8; SECRET_KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey(<{} bytes>)", SECRET_KEY_LEN)
    }
}

impl Serialize for SecretKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.0.iter())
    }
}

impl<'de> Deserialize<'de> for SecretKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes = Vec::<u8>::deserialize(deserializer)?;
        let bytes: [u8; SECRET_KEY_LEN] = bytes
            .try_into()
            .map_err(|v: Vec<u8>| D::Error::custom(format!("secret_key must be {} bytes, got {}", SECRET_KEY_LEN, v.len())))?;
        Ok(Self(bytes))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    /// The v4 gateway reports this as a float; round toward zero.
    #[serde(deserialize_with = "interval_ms")]
    pub heartbeat_interval: u64,
}

fn interval_ms<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    Ok(f64::deserialize(deserializer)? as u64)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ready {
    pub ssrc: u32,
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub modes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub mode: String,
    pub secret_key: SecretKey,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identify {
    pub server_id: String,
    pub user_id: String,
    pub session_id: String,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resume {
    pub server_id: String,
    pub user_id: String,
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectProtocol {
    pub protocol: String,
    pub data: SelectProtocolData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectProtocolData {
    pub address: String,
    pub port: u16,
    pub mode: String,
}

impl SelectProtocol {
    /// The one shape this client ever sends: UDP with the fixed cipher mode.
    pub fn udp(address: impl Into<String>, port: u16) -> Self {
        Self {
            protocol: PROTOCOL.to_string(),
            data: SelectProtocolData {
                address: address.into(),
                port,
                mode: ENCRYPTION_MODE.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Speaking {
    pub speaking: u32,
    pub delay: u32,
    pub ssrc: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientDisconnect {
    pub user_id: String,
}

/// Closed union of every control payload this client reads or writes.
#[derive(Debug, Clone, PartialEq)]
pub enum VoicePayload {
    Identify(Identify),
    SelectProtocol(SelectProtocol),
    Ready(Ready),
    Heartbeat(u64),
    SessionDescription(SessionDescription),
    Speaking(Speaking),
    HeartbeatAck(u64),
    Resume(Resume),
    Hello(Hello),
    Resumed,
    ClientDisconnect(ClientDisconnect),
    /// Opcode this client does not know; carried through to event
    /// subscribers without advancing the session.
    Unknown { op: u8, data: Value },
}

impl VoicePayload {
    pub fn op(&self) -> u8 {
        match self {
            Self::Identify(_) => OP_IDENTIFY,
            Self::SelectProtocol(_) => OP_SELECT_PROTOCOL,
            Self::Ready(_) => OP_READY,
            Self::Heartbeat(_) => OP_HEARTBEAT,
            Self::SessionDescription(_) => OP_SESSION_DESCRIPTION,
            Self::Speaking(_) => OP_SPEAKING,
            Self::HeartbeatAck(_) => OP_HEARTBEAT_ACK,
            Self::Resume(_) => OP_RESUME,
            Self::Hello(_) => OP_HELLO,
            Self::Resumed => OP_RESUMED,
            Self::ClientDisconnect(_) => OP_CLIENT_DISCONNECT,
            Self::Unknown { op, .. } => *op,
        }
    }
}

#[derive(Serialize)]
struct OutboundEnvelope<'a, T> {
    op: u8,
    d: &'a T,
}

#[derive(Deserialize)]
struct InboundEnvelope {
    op: u8,
    #[serde(default)]
    d: Value,
}

fn to_frame<T: Serialize>(op: u8, d: &T) -> Result<String, VoiceGatewayError> {
    serde_json::to_string(&OutboundEnvelope { op, d })
        .map_err(|e| VoiceGatewayError::Protocol(format!("encoding op {} failed: {}", op, e)))
}

/// Serializes a payload into its JSON text frame. Failures are fatal.
pub fn encode(payload: &VoicePayload) -> Result<String, VoiceGatewayError> {
    match payload {
        VoicePayload::Identify(d) => to_frame(OP_IDENTIFY, d),
        VoicePayload::SelectProtocol(d) => to_frame(OP_SELECT_PROTOCOL, d),
        VoicePayload::Ready(d) => to_frame(OP_READY, d),
        VoicePayload::Heartbeat(nonce) => to_frame(OP_HEARTBEAT, nonce),
        VoicePayload::SessionDescription(d) => to_frame(OP_SESSION_DESCRIPTION, d),
        VoicePayload::Speaking(d) => to_frame(OP_SPEAKING, d),
        VoicePayload::HeartbeatAck(nonce) => to_frame(OP_HEARTBEAT_ACK, nonce),
        VoicePayload::Resume(d) => to_frame(OP_RESUME, d),
        VoicePayload::Hello(d) => to_frame(OP_HELLO, d),
        VoicePayload::Resumed => to_frame(OP_RESUMED, &Value::Null),
        VoicePayload::ClientDisconnect(d) => to_frame(OP_CLIENT_DISCONNECT, d),
        VoicePayload::Unknown { op, data } => to_frame(*op, data),
    }
}

fn data<T: for<'de> Deserialize<'de>>(op: u8, d: Value) -> Result<T, VoiceGatewayError> {
    serde_json::from_value(d)
        .map_err(|e| VoiceGatewayError::Protocol(format!("bad data for op {}: {}", op, e)))
}

/// Parses a JSON text frame into a payload.
pub fn decode(bytes: &[u8]) -> Result<VoicePayload, VoiceGatewayError> {
    let envelope: InboundEnvelope = serde_json::from_slice(bytes)
        .map_err(|e| VoiceGatewayError::Protocol(format!("bad envelope: {}", e)))?;
    let op = envelope.op;
    let d = envelope.d;
    Ok(match op {
        OP_IDENTIFY => VoicePayload::Identify(data(op, d)?),
        OP_SELECT_PROTOCOL => VoicePayload::SelectProtocol(data(op, d)?),
        OP_READY => VoicePayload::Ready(data(op, d)?),
        OP_HEARTBEAT => VoicePayload::Heartbeat(data(op, d)?),
        OP_SESSION_DESCRIPTION => VoicePayload::SessionDescription(data(op, d)?),
        OP_SPEAKING => VoicePayload::Speaking(data(op, d)?),
        OP_HEARTBEAT_ACK => VoicePayload::HeartbeatAck(data(op, d)?),
        OP_RESUME => VoicePayload::Resume(data(op, d)?),
        OP_HELLO => VoicePayload::Hello(data(op, d)?),
        OP_RESUMED => VoicePayload::Resumed,
        OP_CLIENT_DISCONNECT => VoicePayload::ClientDisconnect(data(op, d)?),
        _ => VoicePayload::Unknown { op, data: d },
    })
}
