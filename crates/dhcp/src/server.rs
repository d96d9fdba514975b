//! DHCP responder loop
//!
//! [`DhcpServer`] reads one frame at a time from its [`LinkLayer`], runs it
//! through decode → decide → encode and transmits the reply. Frames are handled
//! strictly in sequence; a bad frame or a failed send only costs that frame.

use std::net::Ipv4Addr;

use anyhow::Result;

use crate::engine::{Decision, ProtocolEngine, ReplyBuilder};
use crate::error::{DecodeError, EncodeError, TransmitError};
use crate::frame::{FrameEncoder, Request, decode};
use crate::link::{LinkLayer, LinkMetadata, PacketSocket};
use crate::resolver::{PoolConfig, PoolResolver, Resolver};
use crate::MacAddr;

/// Large enough for any untruncated DHCP frame on a standard MTU link
const RECV_BUFFER_LEN: usize = 1600;

/// Who the responder answers as. Resolved once at start-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerIdentity {
    /// Interface name, for logs
    pub interface: String,

    /// Interface index the raw socket is bound to
    pub ifindex: u32,

    /// Source MAC of every reply
    pub mac: MacAddr,

    /// Source IP of every reply, also sent as the server identifier
    pub ip: Ipv4Addr,
}

/// What happened to one inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    /// The frame could not be decoded
    Dropped(DecodeError),
    /// Decoded, but nothing to send back
    Ignored,
    /// A reply was decided on but could not be put into a frame
    EncodeFailed(EncodeError),
    /// A reply was encoded and sent
    Replied(Decision),
}

/// Main DHCP responder
pub struct DhcpServer<L, R> {
    identity: ServerIdentity,
    link: L,
    resolver: R,
    engine: ProtocolEngine,
    encoder: FrameEncoder,
}

impl<L: LinkLayer, R: Resolver> DhcpServer<L, R> {
    pub fn new(identity: ServerIdentity, link: L, resolver: R) -> Self {
        let engine = ProtocolEngine::new(ReplyBuilder::new(identity.ip));
        let encoder = FrameEncoder::new(identity.mac, identity.ip);
        Self {
            identity,
            link,
            resolver,
            engine,
            encoder,
        }
    }

    pub fn identity(&self) -> &ServerIdentity {
        &self.identity
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    /// Run the responder until the task is cancelled
    pub async fn run(&mut self) -> Result<()> {
        tracing::info!(
            "Starting DHCP responder on {} (index {}) as {} / {}",
            self.identity.interface,
            self.identity.ifindex,
            self.identity.ip,
            self.identity.mac
        );

        let mut buffer = vec![0u8; RECV_BUFFER_LEN];

        loop {
            match self.link.recv_frame(&mut buffer).await {
                Ok(meta) => {
                    let raw = &buffer[..meta.captured_len];
                    if let Err(e) = self.handle_frame(raw, &meta).await {
                        tracing::error!("Error sending DHCP reply: {}", e);
                    }
                }
                Err(e) => {
                    tracing::error!("Error receiving frame: {}", e);
                }
            }
        }
    }

    /// Decode, decide, encode and transmit one captured frame
    pub async fn handle_frame(&mut self, raw: &[u8], meta: &LinkMetadata) -> Result<FrameOutcome, TransmitError> {
        let request = match decode(raw, meta) {
            Ok(request) => request,
            Err(e) => {
                tracing::debug!("Error parsing incoming frame ({} bytes): {}", raw.len(), e);
                return Ok(FrameOutcome::Dropped(e));
            }
        };

        log_request(&request);

        let Some(decision) = self.engine.decide(&request, &self.resolver) else {
            tracing::info!(
                "Not responding to {} (vlan {})",
                request.src_mac,
                request.vlan_list()
            );
            return Ok(FrameOutcome::Ignored);
        };

        tracing::info!(
            "{} to {} (vlan {}): {}",
            decision.kind.message_type(),
            decision.dst_mac,
            request.vlan_list(),
            decision.offered_ip
        );

        let frame = match self.encoder.encode(&decision) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!("Failed to encode reply to {}: {}", decision.dst_mac, e);
                return Ok(FrameOutcome::EncodeFailed(e));
            }
        };
        self.link
            .send_frame(decision.dst_mac, &frame)
            .await
            .map_err(|source| TransmitError {
                destination: decision.dst_mac,
                len: frame.len(),
                source,
            })?;

        Ok(FrameOutcome::Replied(decision))
    }
}

fn log_request(request: &Request) {
    let kind = request
        .message_type
        .map_or_else(|| "untyped message".to_string(), |kind| kind.to_string());
    tracing::info!(
        "{} from mac {}, ip {}, host {}, vlan {}",
        kind,
        request.src_mac,
        request.src_ip,
        request.host_name.as_deref().unwrap_or("-"),
        request.vlan_list()
    );
}

/// Open a raw socket on the identity's interface and serve leases from `pool`
pub async fn spawn_dhcp_server(identity: ServerIdentity, pool: PoolConfig) -> Result<()> {
    let link = PacketSocket::open(identity.ifindex)?;
    let resolver = PoolResolver::new(pool);
    let mut server = DhcpServer::new(identity, link, resolver);
    server.run().await
}
