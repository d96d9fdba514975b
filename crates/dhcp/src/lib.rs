//! DHCPv4 over raw Ethernet frames
//!
//! Implements a DHCPv4 responder that reads and writes whole link-layer frames,
//! so it can answer clients that hold no IP address yet and that arrive over
//! 802.1Q-tagged trunk ports. The pipeline is decode → decide → encode:
//!
//! - [`frame`] turns a captured frame into a [`frame::Request`] and a
//!   [`engine::Decision`] back into an outbound frame
//! - [`engine`] implements the DISCOVER/REQUEST state logic
//! - [`server`] drives the pipeline over a [`link::LinkLayer`]

pub mod engine;
pub mod error;
pub mod frame;
pub mod link;
pub mod packet;
pub mod resolver;
pub mod server;

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

pub use engine::{Decision, LeaseConflict, ProtocolEngine, ReplyBuilder, ReplyKind};
pub use error::{DecodeError, EncodeError, TransmitError};
pub use frame::{FrameEncoder, Request, VlanTag, decode};
pub use link::{LinkLayer, LinkMetadata, PacketSocket};
pub use resolver::{Lease, LeaseParams, PoolConfig, PoolResolver, Reservation, Resolver};
pub use server::{DhcpServer, FrameOutcome, ServerIdentity, spawn_dhcp_server};

/// DHCP server port (BOOTP server)
pub const SERVER_PORT: u16 = 67;

/// DHCP client port (BOOTP client)
pub const CLIENT_PORT: u16 = 68;

/// DHCP message types as defined in RFC 2131
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Decline = 4,
    Ack = 5,
    Nak = 6,
    Release = 7,
    Inform = 8,
}

impl TryFrom<u8> for MessageType {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageType::Discover),
            2 => Ok(MessageType::Offer),
            3 => Ok(MessageType::Request),
            4 => Ok(MessageType::Decline),
            5 => Ok(MessageType::Ack),
            6 => Ok(MessageType::Nak),
            7 => Ok(MessageType::Release),
            8 => Ok(MessageType::Inform),
            _ => Err(anyhow::anyhow!("Unknown DHCP message type: {}", value)),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Discover => "DHCPDISCOVER",
            MessageType::Offer => "DHCPOFFER",
            MessageType::Request => "DHCPREQUEST",
            MessageType::Decline => "DHCPDECLINE",
            MessageType::Ack => "DHCPACK",
            MessageType::Nak => "DHCPNAK",
            MessageType::Release => "DHCPRELEASE",
            MessageType::Inform => "DHCPINFORM",
        };
        f.write_str(name)
    }
}

/// Inbound message types the responder distinguishes. Everything that is not a
/// DISCOVER or a REQUEST keeps its raw code in `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundKind {
    Discover,
    Request,
    Other(u8),
}

impl From<u8> for InboundKind {
    fn from(code: u8) -> Self {
        match code {
            c if c == MessageType::Discover as u8 => InboundKind::Discover,
            c if c == MessageType::Request as u8 => InboundKind::Request,
            c => InboundKind::Other(c),
        }
    }
}

impl fmt::Display for InboundKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InboundKind::Discover => write!(f, "{}", MessageType::Discover),
            InboundKind::Request => write!(f, "{}", MessageType::Request),
            InboundKind::Other(code) => match MessageType::try_from(*code) {
                Ok(known) => write!(f, "{} ({})", known, code),
                Err(_) => write!(f, "unknown ({})", code),
            },
        }
    }
}

/// DHCP options as defined in RFC 2132
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhcpOption {
    Pad = 0,
    SubnetMask = 1,
    Router = 3,
    DomainNameServer = 6,
    HostName = 12,
    DomainName = 15,
    RequestedIpAddress = 50,
    IpAddressLeaseTime = 51,
    MessageType = 53,
    ServerIdentifier = 54,
    ParameterRequestList = 55,
    RenewalTime = 58,
    RebindingTime = 59,
    ClientIdentifier = 61,
    End = 255,
}

/// Hardware address types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardwareType {
    Ethernet = 1,
}

/// DHCP packet operation codes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    BootRequest = 1,
    BootReply = 2,
}

/// An IEEE 802 MAC address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr([0xff; 6]);

    pub const fn new(a: u8, b: u8, c: u8, d: u8, e: u8, f: u8) -> Self {
        MacAddr([a, b, c, d, e, f])
    }

    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl From<[u8; 6]> for MacAddr {
    fn from(octets: [u8; 6]) -> Self {
        MacAddr(octets)
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

impl FromStr for MacAddr {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let mut parts = s.split([':', '-']);
        for octet in octets.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| anyhow::anyhow!("MAC address too short: {}", s))?;
            if part.len() != 2 {
                return Err(anyhow::anyhow!("Invalid MAC address octet '{}' in {}", part, s));
            }
            *octet = u8::from_str_radix(part, 16)
                .map_err(|_| anyhow::anyhow!("Invalid MAC address octet '{}' in {}", part, s))?;
        }
        if parts.next().is_some() {
            return Err(anyhow::anyhow!("MAC address too long: {}", s));
        }
        Ok(MacAddr(octets))
    }
}

/// A simple IP address pool for DHCP allocation
#[derive(Debug, Clone)]
pub struct IpPool {
    start: Ipv4Addr,
    end: Ipv4Addr,
    allocated: HashMap<MacAddr, Ipv4Addr>,
}

impl IpPool {
    /// Create a new IP pool with the given range
    pub fn new(start: Ipv4Addr, end: Ipv4Addr) -> Self {
        Self {
            start,
            end,
            allocated: HashMap::new(),
        }
    }

    /// Allocate an IP address for the given MAC address, skipping addresses
    /// for which `excluded` returns true
    pub fn allocate(&mut self, mac: MacAddr, excluded: impl Fn(Ipv4Addr) -> bool) -> Option<Ipv4Addr> {
        if let Some(&ip) = self.allocated.get(&mac) {
            return Some(ip);
        }

        let start_u32 = u32::from(self.start);
        let end_u32 = u32::from(self.end);

        for ip_u32 in start_u32..=end_u32 {
            let ip = Ipv4Addr::from(ip_u32);
            if excluded(ip) {
                continue;
            }
            if !self.allocated.values().any(|&allocated_ip| allocated_ip == ip) {
                self.allocated.insert(mac, ip);
                return Some(ip);
            }
        }

        None
    }

    /// Release an IP address allocation
    pub fn release(&mut self, mac: MacAddr) {
        self.allocated.remove(&mac);
    }

    /// Get the current allocation for a MAC address
    pub fn get_allocation(&self, mac: MacAddr) -> Option<Ipv4Addr> {
        self.allocated.get(&mac).copied()
    }
}
