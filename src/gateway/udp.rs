use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::IpDiscoveryOptions;
use crate::error::VoiceGatewayError;
use crate::gateway::constants::{
    DATAGRAM_BUFFER_LEN, DISCOVERY_BODY_LEN, DISCOVERY_PACKET_LEN, DISCOVERY_REQUEST_TYPE,
};

/// The UDP media channel for one connected span.
///
/// Bound to an ephemeral local port and connected to the server address
/// announced in Ready. Shared by reference between the send task (write
/// only) and the receive task (read only); dropped with the span.
pub struct VoiceSocket {
    socket: Arc<UdpSocket>,
}

impl VoiceSocket {
    /// Binds an ephemeral local port and fixes the remote endpoint.
    pub async fn setup(ip: &str, port: u16) -> Result<Self, VoiceGatewayError> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| VoiceGatewayError::SocketSetup(format!("bind failed: {}", e)))?;
        socket
            .connect((ip, port))
            .await
            .map_err(|e| VoiceGatewayError::SocketSetup(format!("connect {}:{} failed: {}", ip, port, e)))?;
        Ok(Self {
            socket: Arc::new(socket),
        })
    }

    /// NAT traversal probe: asks the voice server for the externally visible
    /// address of this socket. Each round trip is bounded by the configured
    /// timeout and the whole operation by the configured retry budget;
    /// exhaustion surfaces as a retryable socket setup error.
    pub async fn perform_ip_discovery(
        &self,
        ssrc: u32,
        options: &IpDiscoveryOptions,
    ) -> Result<(String, u16), VoiceGatewayError> {
        let request = discovery_request(ssrc);
        let mut last_error = None;

        for attempt in 0..=options.max_retries {
            if attempt > 0 {
                debug!("retrying IP discovery (attempt {})", attempt + 1);
            }
            self.socket
                .send(&request)
                .await
                .map_err(|e| VoiceGatewayError::SocketSetup(format!("discovery send failed: {}", e)))?;

            let mut buf = [0u8; DISCOVERY_PACKET_LEN];
            match timeout(options.timeout(), self.socket.recv(&mut buf)).await {
                Ok(Ok(n)) => match parse_discovery_response(&buf[..n]) {
                    Ok(address) => return Ok(address),
                    Err(e) => last_error = Some(e),
                },
                Ok(Err(e)) => {
                    last_error = Some(VoiceGatewayError::SocketSetup(format!(
                        "discovery recv failed: {}",
                        e
                    )))
                }
                Err(_) => last_error = Some(VoiceGatewayError::Timeout("IP discovery reply")),
            }
        }

        Err(VoiceGatewayError::SocketSetup(format!(
            "IP discovery failed: {}",
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no response".to_string())
        )))
    }

    pub async fn send(&self, datagram: &[u8]) -> std::io::Result<usize> {
        self.socket.send(datagram).await
    }

    /// Read half of the channel, handed to the receive task.
    pub fn inbound(&self) -> UdpInbound {
        UdpInbound {
            socket: self.socket.clone(),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.socket.local_addr()
    }
}

/// Unreliable inbound datagram stream; no back-pressure is applied to media.
pub struct UdpInbound {
    socket: Arc<UdpSocket>,
}

impl UdpInbound {
    /// Next datagram, or `None` once the socket is gone.
    pub async fn next(&mut self) -> Option<Vec<u8>> {
        let mut buf = [0u8; DATAGRAM_BUFFER_LEN];
        match self.socket.recv(&mut buf).await {
            Ok(n) => Some(buf[..n].to_vec()),
            Err(e) => {
                warn!("voice UDP receive failed: {}", e);
                None
            }
        }
    }
}

fn discovery_request(ssrc: u32) -> [u8; DISCOVERY_PACKET_LEN] {
    let mut packet = [0u8; DISCOVERY_PACKET_LEN];
    packet[0..2].copy_from_slice(&DISCOVERY_REQUEST_TYPE.to_be_bytes());
    packet[2..4].copy_from_slice(&DISCOVERY_BODY_LEN.to_be_bytes());
    packet[4..8].copy_from_slice(&ssrc.to_be_bytes());
    packet
}

fn parse_discovery_response(response: &[u8]) -> Result<(String, u16), VoiceGatewayError> {
    if response.len() != DISCOVERY_PACKET_LEN {
        return Err(VoiceGatewayError::SocketSetup(format!(
            "discovery response has {} bytes, expected {}",
            response.len(),
            DISCOVERY_PACKET_LEN
        )));
    }
    let ip = std::str::from_utf8(&response[8..72])
        .map_err(|_| VoiceGatewayError::SocketSetup("discovery response ip is not ASCII".to_string()))?
        .trim_end_matches('\0')
        .to_string();
    if ip.is_empty() {
        return Err(VoiceGatewayError::SocketSetup(
            "discovery response carries no ip".to_string(),
        ));
    }
    let port = u16::from_be_bytes([response[72], response[73]]);
    Ok((ip, port))
}
