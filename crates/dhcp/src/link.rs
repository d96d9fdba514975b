//! Raw link-layer I/O
//!
//! The dispatcher talks to the wire through [`LinkLayer`]. On Linux the
//! implementation is [`PacketSocket`], an `AF_PACKET` raw socket bound to one
//! interface and driven by tokio's [`AsyncFd`].

use std::io;
use std::mem::{self, MaybeUninit};
use std::os::fd::AsRawFd;
use std::ptr;

use anyhow::{Context, Result};
use etherparse::{EtherType, Ethernet2HeaderSlice, IpNumber, Ipv4HeaderSlice, SingleVlanHeaderSlice, UdpHeaderSlice};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::io::unix::AsyncFd;

use crate::frame::{ETHERTYPE_VLAN, MAX_VLAN_TAGS, VLAN_TAG_LEN};
use crate::{MacAddr, SERVER_PORT};

/// Offset of the outer ethertype / TPID in an Ethernet II header
const TPID_OFFSET: usize = 12;

/// What the link layer knows about a captured frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkMetadata {
    /// Index of the interface the frame arrived on
    pub interface_index: u32,
    /// Bytes written into the receive buffer
    pub captured_len: usize,
    /// Length of the frame on the wire; larger than `captured_len` when the
    /// buffer was too small
    pub wire_len: usize,
}

impl LinkMetadata {
    /// Metadata for a frame captured in full
    pub fn new(interface_index: u32, len: usize) -> Self {
        Self {
            interface_index,
            captured_len: len,
            wire_len: len,
        }
    }
}

/// Frame-level receive and transmit
#[allow(async_fn_in_trait)]
pub trait LinkLayer {
    /// Wait for the next frame the link is listening for and copy it into
    /// `buf`
    async fn recv_frame(&mut self, buf: &mut [u8]) -> io::Result<LinkMetadata>;

    /// Send a complete Ethernet frame as a layer-2 unicast to `dst_mac`
    async fn send_frame(&mut self, dst_mac: MacAddr, frame: &[u8]) -> io::Result<()>;
}

/// Userspace capture filter: IPv4/UDP to `port`, untagged or tagged.
///
/// Stacks deeper than [`MAX_VLAN_TAGS`] are let through so the decoder can
/// report them.
pub fn is_udp_frame_to(raw: &[u8], port: u16) -> bool {
    let Ok(eth) = Ethernet2HeaderSlice::from_slice(raw) else {
        return false;
    };
    let mut ethertype = eth.ether_type();
    let mut rest = &raw[eth.slice().len()..];

    for _ in 0..=MAX_VLAN_TAGS {
        if ethertype == EtherType::VLAN_TAGGED_FRAME {
            let Ok(tag) = SingleVlanHeaderSlice::from_slice(rest) else {
                return false;
            };
            ethertype = tag.ether_type();
            rest = &rest[tag.slice().len()..];
        } else if ethertype == EtherType::IPV4 {
            let Ok(ip) = Ipv4HeaderSlice::from_slice(rest) else {
                return false;
            };
            return ip.protocol() == IpNumber::UDP
                && UdpHeaderSlice::from_slice(&rest[ip.slice().len()..]).is_ok_and(|udp| udp.destination_port() == port);
        } else {
            return false;
        }
    }
    true
}

/// TPID and TCI of the outer tag the kernel took off the frame, if it did
fn stripped_vlan_tag(aux: &libc::tpacket_auxdata) -> Option<(u16, u16)> {
    if aux.tp_status & libc::TP_STATUS_VLAN_VALID == 0 {
        return None;
    }
    let tpid = if aux.tp_status & libc::TP_STATUS_VLAN_TPID_VALID != 0 {
        aux.tp_vlan_tpid
    } else {
        ETHERTYPE_VLAN
    };
    Some((tpid, aux.tp_vlan_tci))
}

/// Put a stripped tag back between the MAC addresses and the ethertype.
///
/// `len` bytes of `buf` hold the frame; returns the new captured length, which
/// is cut to the buffer size.
fn reinsert_vlan_tag(buf: &mut [u8], len: usize, tpid: u16, tci: u16) -> usize {
    if len < TPID_OFFSET || buf.len() < TPID_OFFSET + VLAN_TAG_LEN {
        return len;
    }
    let end = (len + VLAN_TAG_LEN).min(buf.len());
    buf.copy_within(TPID_OFFSET..end - VLAN_TAG_LEN, TPID_OFFSET + VLAN_TAG_LEN);
    buf[TPID_OFFSET..TPID_OFFSET + 2].copy_from_slice(&tpid.to_be_bytes());
    buf[TPID_OFFSET + 2..TPID_OFFSET + VLAN_TAG_LEN].copy_from_slice(&tci.to_be_bytes());
    end
}

/// One `recvmsg` on a packet socket
struct Received {
    /// Frame length before any truncation, without a stripped tag
    wire_len: usize,
    /// Frame was sent by this host
    outgoing: bool,
    /// Outer tag moved out of band by VLAN offload
    stripped_tag: Option<(u16, u16)>,
}

/// Ask the kernel to report tags it strips from received frames
fn enable_packet_auxdata(socket: &Socket) -> io::Result<()> {
    let on: libc::c_int = 1;
    // SAFETY: the option value points to a live c_int and the length matches.
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_PACKET,
            libc::PACKET_AUXDATA,
            (&on as *const libc::c_int).cast(),
            mem::size_of_val(&on) as libc::socklen_t,
        )
    };
    if rc < 0 { Err(io::Error::last_os_error()) } else { Ok(()) }
}

fn recv_with_auxdata(socket: &Socket, buf: &mut [u8]) -> io::Result<Received> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };
    // u64 backing keeps the control buffer aligned for cmsghdr
    let mut control = [0u64; 8];
    let mut from = MaybeUninit::<libc::sockaddr_ll>::zeroed();

    // SAFETY: msghdr is plain old data, valid when zeroed.
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_name = from.as_mut_ptr().cast();
    msg.msg_namelen = mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast();
    msg.msg_controllen = mem::size_of_val(&control) as _;

    // SAFETY: every pointer in msg refers to a live buffer of the stated size.
    let received = unsafe { libc::recvmsg(socket.as_raw_fd(), &mut msg, libc::MSG_TRUNC) };
    let wire_len = usize::try_from(received).map_err(|_| io::Error::last_os_error())?;

    // SAFETY: recvmsg filled the address, zeroed beforehand, and the control
    // messages; the CMSG_* walk stays within msg_controllen.
    let (from, stripped_tag) = unsafe {
        let mut stripped_tag = None;
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_PACKET && (*cmsg).cmsg_type == libc::PACKET_AUXDATA {
                let aux = ptr::read_unaligned(libc::CMSG_DATA(cmsg).cast::<libc::tpacket_auxdata>());
                stripped_tag = stripped_vlan_tag(&aux);
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
        (from.assume_init(), stripped_tag)
    };

    Ok(Received {
        wire_len,
        outgoing: from.sll_pkttype == libc::PACKET_OUTGOING as u8,
        stripped_tag,
    })
}

/// `sockaddr_ll` for the interface, optionally addressed to a peer MAC
fn link_sockaddr(ifindex: u32, dst_mac: Option<MacAddr>) -> SockAddr {
    // SAFETY: sockaddr_storage is plain old data, valid when zeroed, and is
    // large enough and suitably aligned to hold a sockaddr_ll.
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let sll = &mut *(&mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_ll);
        sll.sll_family = libc::AF_PACKET as libc::c_ushort;
        sll.sll_protocol = (libc::ETH_P_ALL as u16).to_be();
        sll.sll_ifindex = ifindex as libc::c_int;
        if let Some(mac) = dst_mac {
            sll.sll_halen = 6;
            sll.sll_addr[..6].copy_from_slice(&mac.octets());
        }
        SockAddr::new(storage, mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t)
    }
}

/// `AF_PACKET` raw socket bound to one interface
pub struct PacketSocket {
    fd: AsyncFd<Socket>,
    ifindex: u32,
    port: u16,
}

impl PacketSocket {
    /// Open a raw socket on the interface with index `ifindex`, receiving
    /// frames for the DHCP server port.
    ///
    /// Needs `CAP_NET_RAW`.
    pub fn open(ifindex: u32) -> Result<Self> {
        Self::open_for_port(ifindex, SERVER_PORT)
    }

    /// Like [`PacketSocket::open`], receiving frames for UDP port `port`
    pub fn open_for_port(ifindex: u32, port: u16) -> Result<Self> {
        let protocol = Protocol::from(i32::from((libc::ETH_P_ALL as u16).to_be()));
        let socket = Socket::new(Domain::PACKET, Type::RAW, Some(protocol))
            .context("Failed to create AF_PACKET socket (CAP_NET_RAW required)")?;

        socket
            .bind(&link_sockaddr(ifindex, None))
            .with_context(|| format!("Failed to bind raw socket to interface index {}", ifindex))?;

        enable_packet_auxdata(&socket).context("Failed to enable PACKET_AUXDATA on raw socket")?;

        socket
            .set_nonblocking(true)
            .context("Failed to set raw socket to non-blocking mode")?;

        let fd = AsyncFd::new(socket).context("Failed to register raw socket with tokio")?;

        tracing::info!("Opened raw packet socket on interface index {} (udp port {})", ifindex, port);
        Ok(Self { fd, ifindex, port })
    }
}

impl LinkLayer for PacketSocket {
    async fn recv_frame(&mut self, buf: &mut [u8]) -> io::Result<LinkMetadata> {
        loop {
            let mut guard = self.fd.readable().await?;
            let received = match guard.try_io(|fd| recv_with_auxdata(fd.get_ref(), buf)) {
                Ok(result) => result?,
                Err(_would_block) => continue,
            };
            if received.outgoing {
                continue;
            }

            let mut wire_len = received.wire_len;
            let mut captured_len = wire_len.min(buf.len());
            if let Some((tpid, tci)) = received.stripped_tag {
                captured_len = reinsert_vlan_tag(buf, captured_len, tpid, tci);
                wire_len += VLAN_TAG_LEN;
            }
            if !is_udp_frame_to(&buf[..captured_len], self.port) {
                continue;
            }

            return Ok(LinkMetadata {
                interface_index: self.ifindex,
                captured_len,
                wire_len,
            });
        }
    }

    async fn send_frame(&mut self, dst_mac: MacAddr, frame: &[u8]) -> io::Result<()> {
        let addr = link_sockaddr(self.ifindex, Some(dst_mac));
        loop {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|fd| fd.get_ref().send_to(frame, &addr)) {
                Ok(result) => {
                    let sent = result?;
                    if sent != frame.len() {
                        return Err(io::Error::new(
                            io::ErrorKind::WriteZero,
                            format!("short write: {} of {} bytes", sent, frame.len()),
                        ));
                    }
                    return Ok(());
                }
                Err(_would_block) => continue,
            }
        }
    }
}
