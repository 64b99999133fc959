use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};

use xsalsa20poly1305::aead::{Aead, KeyInit};
use xsalsa20poly1305::XSalsa20Poly1305;

use crate::error::VoiceGatewayError;
use crate::gateway::constants::{
    NONCE_LEN, RTP_HEADER_LEN, RTP_PAYLOAD_TYPE, RTP_VERSION, SAMPLES_PER_FRAME,
};
use crate::payload::SecretKey;

/// Seals outgoing opus frames into RTP datagrams and opens incoming ones.
///
/// Owns the session's cipher and the RTP sequence/timestamp counters. The
/// 24-byte nonce is the 12-byte RTP header right-padded with zeros, so the
/// header itself authenticates the packet it fronts. Key material lives only
/// here for the duration of one connected span.
pub struct PacketTransformer {
    ssrc: u32,
    cipher: XSalsa20Poly1305,
    sequence: AtomicU16,
    timestamp: AtomicU32,
}

impl PacketTransformer {
    pub fn new(ssrc: u32, secret_key: &SecretKey) -> Self {
        Self {
            ssrc,
            cipher: XSalsa20Poly1305::new(secret_key.expose().into()),
            sequence: AtomicU16::new(0),
            timestamp: AtomicU32::new(0),
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    fn header(&self, sequence: u16, timestamp: u32) -> [u8; RTP_HEADER_LEN] {
        let mut header = [0u8; RTP_HEADER_LEN];
        header[0] = RTP_VERSION;
        header[1] = RTP_PAYLOAD_TYPE;
        header[2..4].copy_from_slice(&sequence.to_be_bytes());
        header[4..8].copy_from_slice(&timestamp.to_be_bytes());
        header[8..12].copy_from_slice(&self.ssrc.to_be_bytes());
        header
    }

    /// Seals one opus frame, advancing sequence by 1 and timestamp by one
    /// frame worth of samples.
    pub fn seal(&self, frame: &[u8]) -> Result<Vec<u8>, VoiceGatewayError> {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let timestamp = self.timestamp.fetch_add(SAMPLES_PER_FRAME, Ordering::SeqCst);
        let header = self.header(sequence, timestamp);

        let mut nonce = [0u8; NONCE_LEN];
        nonce[..RTP_HEADER_LEN].copy_from_slice(&header);

        let sealed = self
            .cipher
            .encrypt(&nonce.into(), frame)
            .map_err(|e| VoiceGatewayError::Protocol(format!("packet seal failed: {:?}", e)))?;

        let mut packet = Vec::with_capacity(RTP_HEADER_LEN + sealed.len());
        packet.extend_from_slice(&header);
        packet.extend_from_slice(&sealed);
        Ok(packet)
    }

    /// Opens one received datagram. Packets that are too short or fail
    /// authentication are discarded (`None`), never surfaced as errors.
    pub fn open(&self, packet: &[u8]) -> Option<Vec<u8>> {
        if packet.len() <= RTP_HEADER_LEN {
            return None;
        }
        let mut nonce = [0u8; NONCE_LEN];
        nonce[..RTP_HEADER_LEN].copy_from_slice(&packet[..RTP_HEADER_LEN]);
        self.cipher
            .decrypt(&nonce.into(), &packet[RTP_HEADER_LEN..])
            .ok()
    }
}
