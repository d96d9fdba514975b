//! DISCOVER/REQUEST decision logic
//!
//! [`ProtocolEngine::decide`] looks at one decoded [`Request`], asks the
//! [`Resolver`] for a lease exactly once, and says what (if anything) to send
//! back. It does no I/O of its own.

use std::net::Ipv4Addr;

use crate::frame::{Request, VlanTag};
use crate::packet::DhcpPacket;
use crate::resolver::{Lease, Resolver};
use crate::{DhcpOption, InboundKind, MacAddr, MessageType};

/// The reply message types the responder can produce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    Offer,
    Ack,
    Nak,
}

impl ReplyKind {
    pub fn message_type(self) -> MessageType {
        match self {
            ReplyKind::Offer => MessageType::Offer,
            ReplyKind::Ack => MessageType::Ack,
            ReplyKind::Nak => MessageType::Nak,
        }
    }
}

/// Why a REQUEST was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseConflict {
    pub client_ip: Ipv4Addr,
    pub requested_ip: Option<Ipv4Addr>,
    pub assigned_ip: Ipv4Addr,
}

/// What to send in response to one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub kind: ReplyKind,
    pub offered_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub dst_mac: MacAddr,
    /// Copied from the request so the reply goes back down the same trunk
    pub vlans: Vec<VlanTag>,
    /// Complete DHCP message, sent as-is
    pub payload: Vec<u8>,
    /// Set on NAKs
    pub conflict: Option<LeaseConflict>,
}

/// Builds the DHCP message body of a reply
#[derive(Debug, Clone)]
pub struct ReplyBuilder {
    server_ip: Ipv4Addr,
}

impl ReplyBuilder {
    pub fn new(server_ip: Ipv4Addr) -> Self {
        Self { server_ip }
    }

    pub fn build(&self, kind: ReplyKind, request: &Request, lease: &Lease) -> Vec<u8> {
        let mut reply = request.message.create_response(kind.message_type());
        reply.add_ip_option(DhcpOption::ServerIdentifier as u8, self.server_ip);

        if kind != ReplyKind::Nak {
            self.add_lease_options(&mut reply, request, lease);
        }

        reply.to_bytes()
    }

    fn add_lease_options(&self, reply: &mut DhcpPacket, request: &Request, lease: &Lease) {
        let params = &lease.params;
        reply.yiaddr = lease.ip;
        reply.siaddr = self.server_ip;

        reply.add_u32_option(DhcpOption::IpAddressLeaseTime as u8, params.lease_time);

        // T1 = 50% and T2 = 87.5% of the lease time
        reply.add_u32_option(DhcpOption::RenewalTime as u8, params.lease_time / 2);
        reply.add_u32_option(
            DhcpOption::RebindingTime as u8,
            (u64::from(params.lease_time) * 7 / 8) as u32,
        );

        reply.add_ip_option(DhcpOption::SubnetMask as u8, params.subnet_mask);
        if let Some(router) = params.router {
            reply.add_ip_option(DhcpOption::Router as u8, router);
        }
        if !params.dns_servers.is_empty() {
            reply.add_ip_list_option(DhcpOption::DomainNameServer as u8, &params.dns_servers);
        }
        if let Some(domain) = &params.domain_name {
            reply.add_string_option(DhcpOption::DomainName as u8, domain);
        }
        if let Some(host_name) = &request.host_name {
            reply.add_string_option(DhcpOption::HostName as u8, host_name);
        }
    }
}

/// The DHCP state logic of the responder
#[derive(Debug, Clone)]
pub struct ProtocolEngine {
    replies: ReplyBuilder,
}

impl ProtocolEngine {
    pub fn new(replies: ReplyBuilder) -> Self {
        Self { replies }
    }

    /// Decide the reply to `request`, if any
    pub fn decide<R: Resolver + ?Sized>(&self, request: &Request, resolver: &R) -> Option<Decision> {
        match request.message_type {
            Some(InboundKind::Discover) => self.process_discover(request, resolver),
            Some(InboundKind::Request) => self.process_request(request, resolver),
            Some(other @ InboundKind::Other(_)) => {
                tracing::info!("Request {} not yet implemented", other);
                None
            }
            None => {
                tracing::info!("Message from {} carries no DHCP message type", request.src_mac);
                None
            }
        }
    }

    fn process_discover<R: Resolver + ?Sized>(&self, request: &Request, resolver: &R) -> Option<Decision> {
        let lease = resolver.resolve(request)?;
        Some(self.prepare(ReplyKind::Offer, request, &lease, request.src_ip))
    }

    fn process_request<R: Resolver + ?Sized>(&self, request: &Request, resolver: &R) -> Option<Decision> {
        let lease = resolver.resolve(request)?;
        let client_ip = request.client_ip();

        // A REQUEST without ciaddr is answered with an OFFER, not an ACK/NAK.
        // This mirrors the existing responder and is pending product review.
        if client_ip.is_unspecified() {
            return Some(self.prepare(ReplyKind::Offer, request, &lease, request.src_ip));
        }
        if lease.ip == client_ip {
            return Some(self.prepare(ReplyKind::Ack, request, &lease, client_ip));
        }
        if Some(lease.ip) == request.requested_ip {
            return Some(self.prepare(ReplyKind::Ack, request, &lease, request.src_ip));
        }

        let conflict = LeaseConflict {
            client_ip,
            requested_ip: request.requested_ip,
            assigned_ip: lease.ip,
        };
        tracing::warn!(
            client_ip = %conflict.client_ip,
            requested_ip = ?conflict.requested_ip,
            assigned_ip = %conflict.assigned_ip,
            "NAK: client {} wants {}, got {}",
            request.src_mac,
            conflict
                .requested_ip
                .map_or_else(|| conflict.client_ip.to_string(), |ip| ip.to_string()),
            conflict.assigned_ip,
        );

        let mut decision = self.prepare(ReplyKind::Nak, request, &lease, request.src_ip);
        decision.conflict = Some(conflict);
        Some(decision)
    }

    fn prepare(&self, kind: ReplyKind, request: &Request, lease: &Lease, dst_ip: Ipv4Addr) -> Decision {
        Decision {
            kind,
            offered_ip: lease.ip,
            dst_ip,
            dst_mac: request.src_mac,
            vlans: request.vlans.clone(),
            payload: self.replies.build(kind, request, lease),
            conflict: None,
        }
    }
}
