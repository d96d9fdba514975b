//! DHCP message handling
//!
//! This module provides parsing and building of the DHCP message carried in
//! the UDP payload, according to RFC 2131 and RFC 2132.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use crate::error::DecodeError;
use crate::{DhcpOption, HardwareType, MacAddr, MessageType, OpCode};

/// Length of the fixed BOOTP header (op .. file)
pub const BOOTP_HEADER_LEN: usize = 236;

/// Offset of the first option, right after the magic cookie
pub const OPTIONS_OFFSET: usize = 240;

/// Replies are padded up to the BOOTP minimum message size
pub const MIN_MESSAGE_LEN: usize = 300;

pub const MAGIC_COOKIE: [u8; 4] = [0x63, 0x82, 0x53, 0x63];

/// DHCP message structure as defined in RFC 2131
///
/// `op` and `htype` are kept as raw bytes: inbound frames are described as they
/// were received, not validated against the handful of values we emit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpPacket {
    pub op: u8,
    pub htype: u8,
    pub hlen: u8,
    pub hops: u8,
    pub xid: u32,
    pub secs: u16,
    pub flags: u16,
    pub ciaddr: Ipv4Addr, // client IP address from client
    pub yiaddr: Ipv4Addr, // client IP address from server
    pub siaddr: Ipv4Addr, // server IP address
    pub giaddr: Ipv4Addr, // gateway IP address
    pub chaddr: [u8; 16], // client hardware address
    pub sname: [u8; 64],  // server host name
    pub file: [u8; 128],  // boot file name
    pub options: Vec<u8>,
}

impl DhcpPacket {
    /// Create a new, empty BOOTREQUEST
    pub fn new() -> Self {
        Self {
            op: OpCode::BootRequest as u8,
            htype: HardwareType::Ethernet as u8,
            hlen: 6,
            hops: 0,
            xid: 0,
            secs: 0,
            flags: 0,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr: [0; 16],
            sname: [0; 64],
            file: [0; 128],
            options: Vec::new(),
        }
    }

    /// Parse a DHCP message from the UDP payload.
    ///
    /// The options area always starts at [`OPTIONS_OFFSET`]; the cookie bytes
    /// are not checked.
    pub fn from_bytes(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < OPTIONS_OFFSET {
            return Err(DecodeError::truncated("dhcp", OPTIONS_OFFSET, data.len()));
        }

        let ip_at = |offset: usize| Ipv4Addr::new(data[offset], data[offset + 1], data[offset + 2], data[offset + 3]);

        let mut chaddr = [0; 16];
        chaddr.copy_from_slice(&data[28..44]);

        let mut sname = [0; 64];
        sname.copy_from_slice(&data[44..108]);

        let mut file = [0; 128];
        file.copy_from_slice(&data[108..BOOTP_HEADER_LEN]);

        Ok(DhcpPacket {
            op: data[0],
            htype: data[1],
            hlen: data[2],
            hops: data[3],
            xid: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            secs: u16::from_be_bytes([data[8], data[9]]),
            flags: u16::from_be_bytes([data[10], data[11]]),
            ciaddr: ip_at(12),
            yiaddr: ip_at(16),
            siaddr: ip_at(20),
            giaddr: ip_at(24),
            chaddr,
            sname,
            file,
            options: data[OPTIONS_OFFSET..].to_vec(),
        })
    }

    /// Convert the message to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(576);

        packet.push(self.op);
        packet.push(self.htype);
        packet.push(self.hlen);
        packet.push(self.hops);
        packet.extend_from_slice(&self.xid.to_be_bytes());
        packet.extend_from_slice(&self.secs.to_be_bytes());
        packet.extend_from_slice(&self.flags.to_be_bytes());
        packet.extend_from_slice(&self.ciaddr.octets());
        packet.extend_from_slice(&self.yiaddr.octets());
        packet.extend_from_slice(&self.siaddr.octets());
        packet.extend_from_slice(&self.giaddr.octets());
        packet.extend_from_slice(&self.chaddr);
        packet.extend_from_slice(&self.sname);
        packet.extend_from_slice(&self.file);
        packet.extend_from_slice(&MAGIC_COOKIE);
        packet.extend_from_slice(&self.options);

        if packet.len() < MIN_MESSAGE_LEN {
            packet.resize(MIN_MESSAGE_LEN, 0);
        }

        packet
    }

    /// Get the client's MAC address from `chaddr`
    pub fn get_mac_address(&self) -> MacAddr {
        let mut mac = [0; 6];
        mac.copy_from_slice(&self.chaddr[..6]);
        MacAddr(mac)
    }

    /// Set the client's MAC address in `chaddr`
    pub fn set_mac_address(&mut self, mac: MacAddr) {
        self.chaddr[..6].copy_from_slice(&mac.0);
    }

    /// Walk the option TLVs.
    ///
    /// Pad is skipped; the walk stops at End, at the end of the buffer, or at an
    /// option whose declared length runs past the buffer.
    fn walk_options(&self) -> OptionWalk<'_> {
        OptionWalk {
            options: &self.options,
            pos: 0,
        }
    }

    /// Collect all options into a map. A repeated code keeps its last value.
    pub fn parse_options(&self) -> HashMap<u8, Vec<u8>> {
        self.walk_options()
            .map(|(code, value)| (code, value.to_vec()))
            .collect()
    }

    /// Get an option from the message
    pub fn get_option(&self, option_code: u8) -> Option<Vec<u8>> {
        self.walk_options()
            .filter(|&(code, _)| code == option_code)
            .last()
            .map(|(_, value)| value.to_vec())
    }

    /// Get the DHCP message type
    pub fn get_message_type(&self) -> Option<MessageType> {
        self.get_option(DhcpOption::MessageType as u8)
            .filter(|data| data.len() == 1)
            .and_then(|data| MessageType::try_from(data[0]).ok())
    }

    /// Get the server identifier
    pub fn get_server_identifier(&self) -> Option<Ipv4Addr> {
        self.get_option(DhcpOption::ServerIdentifier as u8)
            .and_then(|data| <[u8; 4]>::try_from(data.as_slice()).ok())
            .map(Ipv4Addr::from)
    }

    /// Offset of the End option, if the options area has one
    fn end_offset(&self) -> Option<usize> {
        let mut walk = self.walk_options();
        for _ in walk.by_ref() {}
        (walk.pos < self.options.len() && self.options[walk.pos] == DhcpOption::End as u8).then_some(walk.pos)
    }

    /// Add an option to the message, keeping a single End option last.
    /// Values longer than 255 bytes are cut to fit the length byte.
    pub fn add_option(&mut self, code: u8, data: &[u8]) {
        if let Some(end) = self.end_offset() {
            self.options.truncate(end);
        }

        let len = u8::try_from(data.len()).unwrap_or(u8::MAX);
        self.options.push(code);
        self.options.push(len);
        self.options.extend_from_slice(&data[..usize::from(len)]);
        self.options.push(DhcpOption::End as u8);
    }

    /// Add a u32 option
    pub fn add_u32_option(&mut self, code: u8, value: u32) {
        self.add_option(code, &value.to_be_bytes());
    }

    /// Add an IP address option
    pub fn add_ip_option(&mut self, code: u8, ip: Ipv4Addr) {
        self.add_option(code, &ip.octets());
    }

    /// Add an option holding a list of IP addresses
    pub fn add_ip_list_option(&mut self, code: u8, ips: &[Ipv4Addr]) {
        let data: Vec<u8> = ips.iter().flat_map(|ip| ip.octets()).collect();
        self.add_option(code, &data);
    }

    /// Add a string option
    pub fn add_string_option(&mut self, code: u8, value: &str) {
        self.add_option(code, value.as_bytes());
    }

    /// Create a reply skeleton for this request
    pub fn create_response(&self, message_type: MessageType) -> DhcpPacket {
        let mut response = DhcpPacket::new();
        response.op = OpCode::BootReply as u8;
        response.htype = self.htype;
        response.hlen = self.hlen;
        response.xid = self.xid;
        response.flags = self.flags;
        response.giaddr = self.giaddr;
        response.chaddr = self.chaddr;

        response.add_option(DhcpOption::MessageType as u8, &[message_type as u8]);

        response
    }
}

impl Default for DhcpPacket {
    fn default() -> Self {
        Self::new()
    }
}

struct OptionWalk<'a> {
    options: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for OptionWalk<'a> {
    type Item = (u8, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let code = *self.options.get(self.pos)?;
            if code == DhcpOption::End as u8 {
                return None;
            }
            if code == DhcpOption::Pad as u8 {
                self.pos += 1;
                continue;
            }

            let length = *self.options.get(self.pos + 1)? as usize;
            let start = self.pos + 2;
            let value = self.options.get(start..start + length)?;
            self.pos = start + length;
            return Some((code, value));
        }
    }
}
