//! Link-layer framing
//!
//! Ethernet II / 802.1Q / IPv4 / UDP framing on top of `etherparse`. Inbound
//! frames are decoded into a [`Request`]; replies are written back out by
//! [`FrameEncoder`], carrying the same VLAN tag stack the request arrived with.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use etherparse::err::ipv4::HeaderSliceError;
use etherparse::{
    DoubleVlanHeader, EtherType, Ethernet2HeaderSlice, IpNumber, Ipv4HeaderSlice, PacketBuilder, SingleVlanHeader,
    SingleVlanHeaderSlice, UdpHeaderSlice, VlanHeader, VlanId, VlanPcp,
};

use crate::engine::Decision;
use crate::error::{DecodeError, EncodeError};
use crate::link::LinkMetadata;
use crate::packet::DhcpPacket;
use crate::{CLIENT_PORT, DhcpOption, InboundKind, MacAddr, SERVER_PORT};

pub const ETHERTYPE_IPV4: u16 = EtherType::IPV4.0;
pub const ETHERTYPE_VLAN: u16 = EtherType::VLAN_TAGGED_FRAME.0;

pub const ETHERNET_HEADER_LEN: usize = 14;
pub const VLAN_TAG_LEN: usize = 4;
pub const IPV4_HEADER_LEN: usize = 20;
pub const UDP_HEADER_LEN: usize = 8;

/// Deepest tag stack accepted on input (QinQ)
pub const MAX_VLAN_TAGS: usize = 2;

const DEFAULT_TTL: u8 = 64;

/// One 802.1Q tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VlanTag {
    /// 12-bit VLAN identifier
    pub id: u16,
    /// 3-bit priority code point
    pub priority: u8,
    /// Drop eligible indicator
    pub drop_eligible: bool,
}

impl VlanTag {
    pub const fn new(id: u16) -> Self {
        Self {
            id: id & 0x0fff,
            priority: 0,
            drop_eligible: false,
        }
    }

    /// Unpack a tag control information field
    pub const fn from_tci(tci: u16) -> Self {
        Self {
            id: tci & 0x0fff,
            priority: (tci >> 13) as u8,
            drop_eligible: tci & 0x1000 != 0,
        }
    }

    /// Pack into a tag control information field
    pub const fn tci(&self) -> u16 {
        ((self.priority as u16 & 0x7) << 13) | ((self.drop_eligible as u16) << 12) | (self.id & 0x0fff)
    }
}

/// A DHCP message received from the wire, with the addressing it arrived with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub src_mac: MacAddr,
    pub dst_mac: MacAddr,
    /// EtherType of the Ethernet header itself (0x8100 for tagged frames)
    pub outer_ethertype: u16,
    /// EtherType after the last VLAN tag
    pub ethertype: u16,
    /// Tags outer to inner, as encountered
    pub vlans: Vec<VlanTag>,
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub opcode: u8,
    /// Only set when option 53 was present
    pub message_type: Option<InboundKind>,
    pub host_name: Option<String>,
    pub parameter_request_list: Option<Vec<u8>>,
    /// Only set when option 50 held exactly four bytes
    pub requested_ip: Option<Ipv4Addr>,
    pub options: HashMap<u8, Vec<u8>>,
    /// The full DHCP message, kept to build the reply
    pub message: DhcpPacket,
}

impl Request {
    /// The address the client believes it holds (`ciaddr`)
    pub fn client_ip(&self) -> Ipv4Addr {
        self.message.ciaddr
    }

    pub fn vlan_ids(&self) -> Vec<u16> {
        self.vlans.iter().map(|tag| tag.id).collect()
    }

    /// Human readable tag stack for logs, e.g. `[100,200]`
    pub fn vlan_list(&self) -> String {
        let ids: Vec<String> = self.vlans.iter().map(|tag| tag.id.to_string()).collect();
        format!("[{}]", ids.join(","))
    }
}

/// Decode a captured link-layer frame into a [`Request`]
pub fn decode(raw: &[u8], meta: &LinkMetadata) -> Result<Request, DecodeError> {
    if meta.wire_len > raw.len() {
        return Err(DecodeError::truncated("link", meta.wire_len, raw.len()));
    }

    let eth = Ethernet2HeaderSlice::from_slice(raw)
        .map_err(|_| DecodeError::truncated("ethernet", ETHERNET_HEADER_LEN, raw.len()))?;
    let dst_mac = MacAddr(eth.destination());
    let src_mac = MacAddr(eth.source());
    let outer_ethertype = eth.ether_type().0;

    let mut ethertype = eth.ether_type();
    let mut offset = eth.slice().len();
    let mut vlans = Vec::new();
    while ethertype == EtherType::VLAN_TAGGED_FRAME {
        if vlans.len() == MAX_VLAN_TAGS {
            return Err(DecodeError::TooManyVlanTags { max: MAX_VLAN_TAGS });
        }
        let tag = SingleVlanHeaderSlice::from_slice(&raw[offset..])
            .map_err(|_| DecodeError::truncated("802.1q", offset + VLAN_TAG_LEN, raw.len()))?;
        vlans.push(VlanTag {
            id: tag.vlan_identifier().value(),
            priority: tag.priority_code_point().value(),
            drop_eligible: tag.drop_eligible_indicator(),
        });
        ethertype = tag.ether_type();
        offset += tag.slice().len();
    }

    if ethertype != EtherType::IPV4 {
        return Err(DecodeError::UnsupportedNetworkLayer(ethertype.0));
    }

    // options, if any, are skipped over
    let ip = Ipv4HeaderSlice::from_slice(&raw[offset..]).map_err(|e| {
        let version_ihl = raw.get(offset).copied().unwrap_or_default();
        match e {
            HeaderSliceError::Len(_) => {
                let header_len = usize::from(version_ihl & 0x0f) * 4;
                DecodeError::truncated("ipv4", offset + header_len.max(IPV4_HEADER_LEN), raw.len())
            }
            HeaderSliceError::Content(_) => DecodeError::InvalidIpv4Header {
                version: version_ihl >> 4,
                ihl: version_ihl & 0x0f,
            },
        }
    })?;
    if ip.protocol() != IpNumber::UDP {
        return Err(DecodeError::UnsupportedTransport(ip.protocol().0));
    }
    let src_ip = ip.source_addr();
    let dst_ip = ip.destination_addr();
    offset += ip.slice().len();

    let udp = UdpHeaderSlice::from_slice(&raw[offset..])
        .map_err(|_| DecodeError::truncated("udp", offset + UDP_HEADER_LEN, raw.len()))?;
    let udp_len = usize::from(udp.length());
    let payload_end = if udp_len >= UDP_HEADER_LEN && offset + udp_len <= raw.len() {
        offset + udp_len
    } else {
        raw.len()
    };

    let message = DhcpPacket::from_bytes(&raw[offset + UDP_HEADER_LEN..payload_end])?;
    let options = message.parse_options();

    let message_type = match options.get(&(DhcpOption::MessageType as u8)) {
        Some(value) if value.len() == 1 => Some(InboundKind::from(value[0])),
        Some(value) => {
            return Err(DecodeError::MalformedOption {
                code: DhcpOption::MessageType as u8,
                len: value.len(),
            });
        }
        None => None,
    };
    let host_name = options
        .get(&(DhcpOption::HostName as u8))
        .map(|value| String::from_utf8_lossy(value).into_owned());
    let parameter_request_list = options.get(&(DhcpOption::ParameterRequestList as u8)).cloned();
    let requested_ip = options
        .get(&(DhcpOption::RequestedIpAddress as u8))
        .and_then(|value| <[u8; 4]>::try_from(value.as_slice()).ok())
        .map(Ipv4Addr::from);

    Ok(Request {
        src_mac,
        dst_mac,
        outer_ethertype,
        ethertype: ethertype.0,
        vlans,
        src_ip,
        dst_ip,
        src_port: udp.source_port(),
        dst_port: udp.destination_port(),
        opcode: message.op,
        message_type,
        host_name,
        parameter_request_list,
        requested_ip,
        options,
        message,
    })
}

/// Addressing for one UDP/IPv4 datagram in an Ethernet frame
#[derive(Debug, Clone, Copy)]
pub struct UdpFrame<'a> {
    pub dst_mac: MacAddr,
    pub src_mac: MacAddr,
    pub vlans: &'a [VlanTag],
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
}

fn vlan_header(tag: &VlanTag, ether_type: EtherType) -> Result<SingleVlanHeader, EncodeError> {
    Ok(SingleVlanHeader {
        pcp: VlanPcp::try_new(tag.priority).map_err(|e| EncodeError::Build(e.to_string()))?,
        drop_eligible_indicator: tag.drop_eligible,
        vlan_id: VlanId::try_new(tag.id).map_err(|e| EncodeError::Build(e.to_string()))?,
        ether_type,
    })
}

/// Write a complete Ethernet frame around `payload`.
///
/// At most [`MAX_VLAN_TAGS`] tags are written, and the IPv4 total length has to
/// fit in 16 bits.
pub fn build_udp_frame(frame: &UdpFrame<'_>, payload: &[u8]) -> Result<Vec<u8>, EncodeError> {
    let ip_total_len = IPV4_HEADER_LEN + UDP_HEADER_LEN + payload.len();
    if u16::try_from(ip_total_len).is_err() {
        return Err(EncodeError::PayloadTooLarge { len: payload.len() });
    }

    let eth = PacketBuilder::ethernet2(frame.src_mac.octets(), frame.dst_mac.octets());
    let vlan = match frame.vlans {
        [] => None,
        [tag] => Some(VlanHeader::Single(vlan_header(tag, EtherType::IPV4)?)),
        [outer, inner] => Some(VlanHeader::Double(DoubleVlanHeader {
            outer: vlan_header(outer, EtherType::VLAN_TAGGED_FRAME)?,
            inner: vlan_header(inner, EtherType::IPV4)?,
        })),
        _ => return Err(EncodeError::TooManyVlanTags { max: MAX_VLAN_TAGS }),
    };
    let builder = match vlan {
        None => eth.ipv4(frame.src_ip.octets(), frame.dst_ip.octets(), DEFAULT_TTL),
        Some(vlan) => eth
            .vlan(vlan)
            .ipv4(frame.src_ip.octets(), frame.dst_ip.octets(), DEFAULT_TTL),
    }
    .udp(frame.src_port, frame.dst_port);

    let mut out = Vec::with_capacity(builder.size(payload.len()));
    builder
        .write(&mut out, payload)
        .map_err(|e| EncodeError::Build(e.to_string()))?;
    Ok(out)
}

/// Serializes decisions into frames sent from the server's own addresses
#[derive(Debug, Clone)]
pub struct FrameEncoder {
    server_mac: MacAddr,
    server_ip: Ipv4Addr,
}

impl FrameEncoder {
    pub fn new(server_mac: MacAddr, server_ip: Ipv4Addr) -> Self {
        Self { server_mac, server_ip }
    }

    pub fn encode(&self, decision: &Decision) -> Result<Vec<u8>, EncodeError> {
        let frame = UdpFrame {
            dst_mac: decision.dst_mac,
            src_mac: self.server_mac,
            vlans: &decision.vlans,
            src_ip: self.server_ip,
            dst_ip: decision.dst_ip,
            src_port: SERVER_PORT,
            dst_port: CLIENT_PORT,
        };
        build_udp_frame(&frame, &decision.payload)
    }
}
