/// Strongly typed identifiers (Discord snowflakes).
pub type GuildId = u64;
pub type UserId = u64;
pub type ChannelId = u64;

/// Opaque voice session identifier handed out by the main gateway.
pub type SessionId = String;

/// 32-bit RTP synchronization source id assigned by the voice server.
pub type Ssrc = u32;
