use std::cell::Cell;
use std::collections::VecDeque;
use std::io;
use std::net::Ipv4Addr;
use std::time::Duration;

use tokio::time::timeout;

use crate::engine::{LeaseConflict, ProtocolEngine, ReplyBuilder, ReplyKind};
use crate::frame::{FrameEncoder, Request, UdpFrame, VlanTag, build_udp_frame, decode};
use crate::link::{LinkLayer, LinkMetadata};
use crate::packet::DhcpPacket;
use crate::resolver::{Lease, LeaseParams, PoolConfig, PoolResolver, Resolver};
use crate::server::{DhcpServer, FrameOutcome, ServerIdentity};
use crate::{DhcpOption, InboundKind, IpPool, MacAddr, MessageType, OpCode};

const CLIENT_MAC: MacAddr = MacAddr::new(0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff);
const SERVER_MAC: MacAddr = MacAddr::new(0x02, 0x42, 0x0a, 0x00, 0x00, 0x01);
const SERVER_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
const LEASE_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 50);

/// Hands out one fixed lease and counts how often it was asked
struct FixedResolver {
    lease: Option<Lease>,
    calls: Cell<usize>,
}

impl FixedResolver {
    fn with_lease(ip: Ipv4Addr) -> Self {
        Self {
            lease: Some(Lease {
                ip,
                params: LeaseParams {
                    router: Some(SERVER_IP),
                    dns_servers: vec![Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(10, 0, 0, 3)],
                    domain_name: Some("lab.local".to_string()),
                    ..Default::default()
                },
            }),
            calls: Cell::new(0),
        }
    }

    fn empty() -> Self {
        Self {
            lease: None,
            calls: Cell::new(0),
        }
    }
}

impl Resolver for FixedResolver {
    fn resolve(&self, _request: &Request) -> Option<Lease> {
        self.calls.set(self.calls.get() + 1);
        self.lease.clone()
    }
}

/// In-memory link: frames queued in `inbound` are received in order, then
/// `recv_frame` waits forever
#[derive(Default)]
struct MockLink {
    inbound: VecDeque<Vec<u8>>,
    sent: Vec<(MacAddr, Vec<u8>)>,
    failing_sends: usize,
}

impl LinkLayer for MockLink {
    async fn recv_frame(&mut self, buf: &mut [u8]) -> io::Result<LinkMetadata> {
        match self.inbound.pop_front() {
            Some(frame) => {
                buf[..frame.len()].copy_from_slice(&frame);
                Ok(LinkMetadata::new(1, frame.len()))
            }
            None => std::future::pending().await,
        }
    }

    async fn send_frame(&mut self, dst_mac: MacAddr, frame: &[u8]) -> io::Result<()> {
        if self.failing_sends > 0 {
            self.failing_sends -= 1;
            return Err(io::Error::other("link down"));
        }
        self.sent.push((dst_mac, frame.to_vec()));
        Ok(())
    }
}

struct ClientMessage {
    message_type: Option<u8>,
    vlans: Vec<VlanTag>,
    src_ip: Ipv4Addr,
    ciaddr: Ipv4Addr,
    requested_ip: Option<Ipv4Addr>,
    host_name: Option<&'static str>,
}

impl ClientMessage {
    fn new(message_type: MessageType) -> Self {
        Self {
            message_type: Some(message_type as u8),
            vlans: Vec::new(),
            src_ip: Ipv4Addr::UNSPECIFIED,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            requested_ip: None,
            host_name: None,
        }
    }

    fn frame(&self) -> Vec<u8> {
        let mut message = DhcpPacket::new();
        message.xid = 0x3903f326;
        message.flags = 0x8000;
        message.ciaddr = self.ciaddr;
        message.set_mac_address(CLIENT_MAC);
        if let Some(code) = self.message_type {
            message.add_option(DhcpOption::MessageType as u8, &[code]);
        }
        if let Some(ip) = self.requested_ip {
            message.add_ip_option(DhcpOption::RequestedIpAddress as u8, ip);
        }
        if let Some(host_name) = self.host_name {
            message.add_string_option(DhcpOption::HostName as u8, host_name);
        }

        build_udp_frame(
            &UdpFrame {
                dst_mac: MacAddr::BROADCAST,
                src_mac: CLIENT_MAC,
                vlans: &self.vlans,
                src_ip: self.src_ip,
                dst_ip: Ipv4Addr::BROADCAST,
                src_port: 68,
                dst_port: 67,
            },
            &message.to_bytes(),
        )
        .unwrap()
    }

    fn request(&self) -> Request {
        let raw = self.frame();
        decode(&raw, &LinkMetadata::new(1, raw.len())).unwrap()
    }
}

fn engine() -> ProtocolEngine {
    ProtocolEngine::new(ReplyBuilder::new(SERVER_IP))
}

fn identity() -> ServerIdentity {
    ServerIdentity {
        interface: "trunk0".to_string(),
        ifindex: 1,
        mac: SERVER_MAC,
        ip: SERVER_IP,
    }
}

fn decode_reply(frame: &[u8]) -> Request {
    decode(frame, &LinkMetadata::new(1, frame.len())).unwrap()
}

#[test]
fn test_discover_with_lease_is_offered() {
    let mut discover = ClientMessage::new(MessageType::Discover);
    discover.src_ip = Ipv4Addr::new(10, 0, 0, 77);
    let request = discover.request();
    let resolver = FixedResolver::with_lease(LEASE_IP);

    let decision = engine().decide(&request, &resolver).unwrap();

    assert_eq!(resolver.calls.get(), 1);
    assert_eq!(decision.kind, ReplyKind::Offer);
    assert_eq!(decision.offered_ip, LEASE_IP);
    assert_eq!(decision.dst_ip, Ipv4Addr::new(10, 0, 0, 77));
    assert_eq!(decision.dst_mac, CLIENT_MAC);
    assert_eq!(decision.conflict, None);
}

#[test]
fn test_discover_without_lease_is_silent() {
    let request = ClientMessage::new(MessageType::Discover).request();
    let resolver = FixedResolver::empty();

    assert_eq!(engine().decide(&request, &resolver), None);
    assert_eq!(resolver.calls.get(), 1);
}

#[test]
fn test_request_without_client_ip_is_offered() {
    let mut message = ClientMessage::new(MessageType::Request);
    message.requested_ip = Some(Ipv4Addr::new(10, 0, 0, 99));
    let request = message.request();
    let resolver = FixedResolver::with_lease(LEASE_IP);

    let decision = engine().decide(&request, &resolver).unwrap();

    assert_eq!(resolver.calls.get(), 1);
    assert_eq!(decision.kind, ReplyKind::Offer);
    assert_eq!(decision.offered_ip, LEASE_IP);
    assert_eq!(decision.dst_ip, Ipv4Addr::UNSPECIFIED);
}

#[test]
fn test_request_for_held_address_is_acked_to_client_ip() {
    let mut message = ClientMessage::new(MessageType::Request);
    message.ciaddr = LEASE_IP;
    message.src_ip = Ipv4Addr::new(10, 9, 9, 9);
    let request = message.request();

    let decision = engine()
        .decide(&request, &FixedResolver::with_lease(LEASE_IP))
        .unwrap();

    assert_eq!(decision.kind, ReplyKind::Ack);
    assert_eq!(decision.dst_ip, LEASE_IP);
    assert_eq!(decision.offered_ip, LEASE_IP);
}

#[test]
fn test_request_matching_requested_option_is_acked_to_source() {
    let mut message = ClientMessage::new(MessageType::Request);
    message.ciaddr = Ipv4Addr::new(10, 0, 0, 60);
    message.src_ip = Ipv4Addr::new(10, 0, 0, 60);
    message.requested_ip = Some(LEASE_IP);
    let request = message.request();

    let decision = engine()
        .decide(&request, &FixedResolver::with_lease(LEASE_IP))
        .unwrap();

    assert_eq!(decision.kind, ReplyKind::Ack);
    assert_eq!(decision.dst_ip, Ipv4Addr::new(10, 0, 0, 60));
}

#[test]
fn test_request_for_other_address_is_naked() {
    let mut message = ClientMessage::new(MessageType::Request);
    message.ciaddr = Ipv4Addr::new(10, 0, 0, 60);
    message.src_ip = Ipv4Addr::new(10, 0, 0, 60);
    message.requested_ip = Some(Ipv4Addr::new(10, 0, 0, 61));
    let request = message.request();
    let resolver = FixedResolver::with_lease(LEASE_IP);

    let decision = engine().decide(&request, &resolver).unwrap();

    assert_eq!(resolver.calls.get(), 1);
    assert_eq!(decision.kind, ReplyKind::Nak);
    assert_eq!(decision.dst_ip, Ipv4Addr::new(10, 0, 0, 60));
    assert_eq!(
        decision.conflict,
        Some(LeaseConflict {
            client_ip: Ipv4Addr::new(10, 0, 0, 60),
            requested_ip: Some(Ipv4Addr::new(10, 0, 0, 61)),
            assigned_ip: LEASE_IP,
        })
    );

    let nak = DhcpPacket::from_bytes(&decision.payload).unwrap();
    assert_eq!(nak.get_message_type(), Some(MessageType::Nak));
    assert_eq!(nak.yiaddr, Ipv4Addr::UNSPECIFIED);
    assert_eq!(nak.get_server_identifier(), Some(SERVER_IP));
    assert_eq!(nak.get_option(DhcpOption::IpAddressLeaseTime as u8), None);
}

#[test]
fn test_request_without_lease_is_silent() {
    let mut message = ClientMessage::new(MessageType::Request);
    message.ciaddr = LEASE_IP;

    assert_eq!(engine().decide(&message.request(), &FixedResolver::empty()), None);
}

#[test]
fn test_other_message_types_are_ignored() {
    for kind in [MessageType::Release, MessageType::Decline, MessageType::Inform] {
        let request = ClientMessage::new(kind).request();
        assert_eq!(request.message_type, Some(InboundKind::Other(kind as u8)));

        let resolver = FixedResolver::with_lease(LEASE_IP);
        assert_eq!(engine().decide(&request, &resolver), None);
        assert_eq!(resolver.calls.get(), 0);
    }

    let mut untyped = ClientMessage::new(MessageType::Discover);
    untyped.message_type = None;
    assert_eq!(
        engine().decide(&untyped.request(), &FixedResolver::with_lease(LEASE_IP)),
        None
    );
}

#[test]
fn test_offer_payload_carries_lease() {
    let mut discover = ClientMessage::new(MessageType::Discover);
    discover.host_name = Some("laptop1");
    let request = discover.request();

    let decision = engine()
        .decide(&request, &FixedResolver::with_lease(LEASE_IP))
        .unwrap();
    let offer = DhcpPacket::from_bytes(&decision.payload).unwrap();

    assert_eq!(offer.op, OpCode::BootReply as u8);
    assert_eq!(offer.xid, 0x3903f326);
    assert_eq!(offer.flags, 0x8000);
    assert_eq!(offer.get_mac_address(), CLIENT_MAC);
    assert_eq!(offer.yiaddr, LEASE_IP);
    assert_eq!(offer.siaddr, SERVER_IP);
    assert_eq!(offer.get_message_type(), Some(MessageType::Offer));
    assert_eq!(offer.get_server_identifier(), Some(SERVER_IP));

    let u32_option = |code: DhcpOption| {
        let bytes = offer.get_option(code as u8).unwrap();
        u32::from_be_bytes(bytes.try_into().unwrap())
    };
    assert_eq!(u32_option(DhcpOption::IpAddressLeaseTime), 3600);
    assert_eq!(u32_option(DhcpOption::RenewalTime), 1800);
    assert_eq!(u32_option(DhcpOption::RebindingTime), 3150);

    assert_eq!(
        offer.get_option(DhcpOption::SubnetMask as u8),
        Some(vec![255, 255, 255, 0])
    );
    assert_eq!(offer.get_option(DhcpOption::Router as u8), Some(vec![10, 0, 0, 1]));
    assert_eq!(
        offer.get_option(DhcpOption::DomainNameServer as u8),
        Some(vec![10, 0, 0, 2, 10, 0, 0, 3])
    );
    assert_eq!(
        offer.get_option(DhcpOption::DomainName as u8),
        Some(b"lab.local".to_vec())
    );
    assert_eq!(offer.get_option(DhcpOption::HostName as u8), Some(b"laptop1".to_vec()));
}

#[test]
fn test_reply_keeps_vlan_stack_and_swaps_macs() {
    let mut message = ClientMessage::new(MessageType::Discover);
    message.vlans = vec![
        VlanTag {
            id: 300,
            priority: 4,
            drop_eligible: false,
        },
        VlanTag::new(12),
    ];
    let request = message.request();
    let decision = engine()
        .decide(&request, &FixedResolver::with_lease(LEASE_IP))
        .unwrap();
    assert_eq!(decision.vlans, request.vlans);

    let frame = FrameEncoder::new(SERVER_MAC, SERVER_IP).encode(&decision).unwrap();
    let reply = decode_reply(&frame);

    assert_eq!(reply.vlans, request.vlans);
    assert_eq!(reply.dst_mac, request.src_mac);
    assert_eq!(reply.src_mac, SERVER_MAC);
    assert_eq!(reply.src_ip, SERVER_IP);
    assert_eq!((reply.src_port, reply.dst_port), (67, 68));
}

#[tokio::test]
async fn test_untagged_discover_end_to_end() {
    let mut discover = ClientMessage::new(MessageType::Discover);
    discover.host_name = Some("laptop1");
    let raw = discover.frame();

    let mut server = DhcpServer::new(identity(), MockLink::default(), FixedResolver::with_lease(LEASE_IP));
    let outcome = server
        .handle_frame(&raw, &LinkMetadata::new(1, raw.len()))
        .await
        .unwrap();
    assert!(matches!(outcome, FrameOutcome::Replied(ref d) if d.kind == ReplyKind::Offer));

    let sent = &server.link().sent;
    assert_eq!(sent.len(), 1);
    let (dst_mac, frame) = &sent[0];
    assert_eq!(*dst_mac, CLIENT_MAC);

    let reply = decode_reply(frame);
    assert_eq!(reply.dst_mac, CLIENT_MAC);
    assert!(reply.vlans.is_empty());
    assert_eq!(reply.message.yiaddr, LEASE_IP);
    assert_eq!(reply.message_type, Some(InboundKind::Other(MessageType::Offer as u8)));
}

#[tokio::test]
async fn test_tagged_request_end_to_end() {
    let mut request = ClientMessage::new(MessageType::Request);
    request.vlans = vec![VlanTag::new(100)];
    request.ciaddr = LEASE_IP;
    request.src_ip = LEASE_IP;
    let raw = request.frame();

    let mut server = DhcpServer::new(identity(), MockLink::default(), FixedResolver::with_lease(LEASE_IP));
    server
        .handle_frame(&raw, &LinkMetadata::new(1, raw.len()))
        .await
        .unwrap();

    let (_, frame) = &server.link().sent[0];
    let reply = decode_reply(frame);
    assert_eq!(reply.vlan_ids(), vec![100]);
    assert_eq!(reply.dst_ip, LEASE_IP);
    assert_eq!(reply.message.yiaddr, LEASE_IP);
    assert_eq!(reply.message_type, Some(InboundKind::Other(MessageType::Ack as u8)));
}

#[tokio::test]
async fn test_decode_errors_are_dropped() {
    let mut server = DhcpServer::new(identity(), MockLink::default(), FixedResolver::with_lease(LEASE_IP));
    let garbage = [0u8; 20];

    let outcome = server
        .handle_frame(&garbage, &LinkMetadata::new(1, garbage.len()))
        .await
        .unwrap();

    assert!(matches!(outcome, FrameOutcome::Dropped(_)));
    assert!(server.link().sent.is_empty());
}

#[tokio::test]
async fn test_transmit_failure_is_reported() {
    let link = MockLink {
        failing_sends: 1,
        ..Default::default()
    };
    let mut server = DhcpServer::new(identity(), link, FixedResolver::with_lease(LEASE_IP));
    let raw = ClientMessage::new(MessageType::Discover).frame();

    let err = server
        .handle_frame(&raw, &LinkMetadata::new(1, raw.len()))
        .await
        .unwrap_err();

    assert_eq!(err.destination, CLIENT_MAC);
    assert_eq!(err.source.kind(), io::ErrorKind::Other);
    assert!(server.link().sent.is_empty());
}

#[tokio::test]
async fn test_run_survives_bad_frames_and_failed_sends() {
    let mut link = MockLink {
        failing_sends: 1,
        ..Default::default()
    };
    link.inbound.push_back(vec![0u8; 8]);
    link.inbound.push_back(ClientMessage::new(MessageType::Discover).frame());
    link.inbound.push_back(ClientMessage::new(MessageType::Release).frame());
    link.inbound.push_back(ClientMessage::new(MessageType::Discover).frame());

    let mut server = DhcpServer::new(identity(), link, FixedResolver::with_lease(LEASE_IP));
    let result = timeout(Duration::from_millis(100), server.run()).await;

    assert!(result.is_err());
    assert!(server.link().inbound.is_empty());
    assert_eq!(server.link().sent.len(), 1);
}

#[tokio::test]
async fn test_pool_resolver_behind_server() {
    let pool = PoolConfig {
        pool_start: Ipv4Addr::new(10, 0, 0, 100),
        pool_end: Ipv4Addr::new(10, 0, 0, 110),
        reservations: vec!["laptop1=10.0.0.50".parse().unwrap()],
        ..Default::default()
    };
    let mut server = DhcpServer::new(identity(), MockLink::default(), PoolResolver::new(pool));

    let mut reserved = ClientMessage::new(MessageType::Discover);
    reserved.host_name = Some("laptop1");
    let raw = reserved.frame();
    let outcome = server
        .handle_frame(&raw, &LinkMetadata::new(1, raw.len()))
        .await
        .unwrap();
    match outcome {
        FrameOutcome::Replied(decision) => assert_eq!(decision.offered_ip, LEASE_IP),
        other => panic!("unexpected outcome {other:?}"),
    }

    let raw = ClientMessage::new(MessageType::Discover).frame();
    let outcome = server
        .handle_frame(&raw, &LinkMetadata::new(1, raw.len()))
        .await
        .unwrap();
    match outcome {
        FrameOutcome::Replied(decision) => assert_eq!(decision.offered_ip, Ipv4Addr::new(10, 0, 0, 100)),
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[test]
fn test_ip_pool_allocation() {
    let mut pool = IpPool::new(Ipv4Addr::new(10, 0, 1, 100), Ipv4Addr::new(10, 0, 1, 102));
    let mac1 = MacAddr::new(0x00, 0x01, 0x02, 0x03, 0x04, 0x05);
    let mac2 = MacAddr::new(0x00, 0x01, 0x02, 0x03, 0x04, 0x06);
    let mac3 = MacAddr::new(0x00, 0x01, 0x02, 0x03, 0x04, 0x07);
    let reserved = |ip: Ipv4Addr| ip == Ipv4Addr::new(10, 0, 1, 101);

    assert_eq!(pool.allocate(mac1, reserved), Some(Ipv4Addr::new(10, 0, 1, 100)));
    // Same MAC should get same IP
    assert_eq!(pool.allocate(mac1, reserved), Some(Ipv4Addr::new(10, 0, 1, 100)));
    assert_eq!(pool.allocate(mac2, reserved), Some(Ipv4Addr::new(10, 0, 1, 102)));
    assert_eq!(pool.allocate(mac3, reserved), None);

    // Release and reallocate
    pool.release(mac1);
    assert_eq!(pool.get_allocation(mac1), None);
    assert_eq!(pool.allocate(mac3, reserved), Some(Ipv4Addr::new(10, 0, 1, 100)));
}

#[test]
fn test_mac_address_parsing() {
    let mac: MacAddr = "52:54:00:AB:cd:ef".parse().unwrap();
    assert_eq!(mac, MacAddr::new(0x52, 0x54, 0x00, 0xab, 0xcd, 0xef));
    assert_eq!(mac.to_string(), "52:54:00:ab:cd:ef");
    assert_eq!("52-54-00-ab-cd-ef".parse::<MacAddr>().unwrap(), mac);

    assert!("52:54:00:ab:cd".parse::<MacAddr>().is_err());
    assert!("52:54:00:ab:cd:ef:01".parse::<MacAddr>().is_err());
    assert!("52:54:00:ab:cd:zz".parse::<MacAddr>().is_err());
    assert!("5:54:00:ab:cd:ef".parse::<MacAddr>().is_err());
}

#[test]
fn test_message_type_conversion() {
    assert_eq!(MessageType::try_from(1).unwrap(), MessageType::Discover);
    assert_eq!(MessageType::try_from(3).unwrap(), MessageType::Request);
    assert_eq!(MessageType::try_from(8).unwrap(), MessageType::Inform);
    assert!(MessageType::try_from(99).is_err());

    assert_eq!(InboundKind::from(1), InboundKind::Discover);
    assert_eq!(InboundKind::from(3), InboundKind::Request);
    assert_eq!(InboundKind::from(7), InboundKind::Other(7));

    assert_eq!(InboundKind::Discover.to_string(), "DHCPDISCOVER");
    assert_eq!(InboundKind::Other(7).to_string(), "DHCPRELEASE (7)");
    assert_eq!(InboundKind::Other(42).to_string(), "unknown (42)");
}
