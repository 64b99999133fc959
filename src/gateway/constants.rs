/// Discord voice gateway version appended to the WebSocket URL.
pub const VOICE_GATEWAY_VERSION: u8 = 4;

/// User-Agent header sent with the WebSocket upgrade request.
pub const USER_AGENT: &str = "DiscordBot(https://discord4j.com, 3)";

/// Transport protocol announced in SelectProtocol.
pub const PROTOCOL: &str = "udp";

/// Encryption mode announced in SelectProtocol.
pub const ENCRYPTION_MODE: &str = "xsalsa20_poly1305";

// Control plane opcodes.
pub const OP_IDENTIFY: u8 = 0;
pub const OP_SELECT_PROTOCOL: u8 = 1;
pub const OP_READY: u8 = 2;
pub const OP_HEARTBEAT: u8 = 3;
pub const OP_SESSION_DESCRIPTION: u8 = 4;
pub const OP_SPEAKING: u8 = 5;
pub const OP_HEARTBEAT_ACK: u8 = 6;
pub const OP_RESUME: u8 = 7;
pub const OP_HELLO: u8 = 8;
pub const OP_RESUMED: u8 = 9;
pub const OP_CLIENT_DISCONNECT: u8 = 13;

/// Speaking flag raised while the microphone stream is live.
pub const SPEAKING_MICROPHONE: u32 = 1;

/// Length of the symmetric key delivered in SessionDescription.
pub const SECRET_KEY_LEN: usize = 32;

// RTP framing for the audio data plane.
pub const RTP_HEADER_LEN: usize = 12;
pub const RTP_VERSION: u8 = 0x80;
pub const RTP_PAYLOAD_TYPE: u8 = 0x78;
pub const NONCE_LEN: usize = 24;

/// 48 kHz * 20 ms frame: how far the RTP timestamp advances per packet.
pub const SAMPLES_PER_FRAME: u32 = 960;

/// Opus frame cadence used by the default send task.
pub const FRAME_INTERVAL_MS: u64 = 20;

/// Consecutive empty provider polls before the speaking flag is dropped.
pub const SILENT_FRAMES_BEFORE_QUIET: u32 = 5;

// IP discovery packet layout.
pub const DISCOVERY_PACKET_LEN: usize = 74;
pub const DISCOVERY_REQUEST_TYPE: u16 = 0x0001;
pub const DISCOVERY_BODY_LEN: u16 = 70;

/// Largest datagram we expect from the voice server.
pub const DATAGRAM_BUFFER_LEN: usize = 1536;

/// Capacity of the bounded outbound control queue. External producers
/// suspend when it is full, the receiver-side session treats overflow as
/// fatal; control traffic is never silently dropped.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 64;

/// Ring size of the hot event stream; laggards skip the oldest events.
pub const EVENTS_BUFFER_LEN: usize = 64;

/// How long a requested close waits for the server to echo the close frame.
pub const CLOSE_GRACE_MS: u64 = 500;
