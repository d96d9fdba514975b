//! DHCP test client: sends a DISCOVER as a raw frame, optionally VLAN tagged, and
//! prints whatever the responder answers.
//!
//! Needs `CAP_NET_RAW`. Run it on a host that sees the responder's trunk, e.g.
//! `dhcp_test_client --interface eth1 --vlan 100 --vlan 200`.

use std::net::Ipv4Addr;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use argh::FromArgs;
use trunk_dhcp::dhcp::frame::{UdpFrame, build_udp_frame};
use trunk_dhcp::dhcp::packet::DhcpPacket;
use trunk_dhcp::dhcp::{
    CLIENT_PORT, DhcpOption, LinkLayer, LinkMetadata, MacAddr, MessageType, PacketSocket, SERVER_PORT, VlanTag,
    decode,
};
use trunk_dhcp::util::{get_interface_mac, interface_index};

#[derive(FromArgs, Debug)]
/// Send a DHCPDISCOVER and wait for the reply
struct ClientArgs {
    /// network interface to send on
    #[argh(option, short = 'i')]
    interface: String,

    /// VLAN id to tag the frame with, outermost first (repeatable)
    #[argh(option)]
    vlan: Vec<u16>,

    /// client MAC address to put in the request (defaults to the interface MAC)
    #[argh(option)]
    mac: Option<MacAddr>,

    /// host name to send in option 12
    #[argh(option)]
    host_name: Option<String>,

    /// seconds to wait for a reply
    #[argh(option, default = "5")]
    timeout: u64,
}

fn transaction_id() -> u32 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or_default();
    nanos ^ std::process::id()
}

fn discover(mac: MacAddr, xid: u32, host_name: Option<&str>) -> Vec<u8> {
    let mut packet = DhcpPacket::new();
    packet.xid = xid;
    packet.flags = 0x8000; // ask for a broadcast reply
    packet.set_mac_address(mac);

    packet.add_option(DhcpOption::MessageType as u8, &[MessageType::Discover as u8]);
    if let Some(host_name) = host_name {
        packet.add_string_option(DhcpOption::HostName as u8, host_name);
    }
    packet.add_option(
        DhcpOption::ParameterRequestList as u8,
        &[
            DhcpOption::SubnetMask as u8,
            DhcpOption::Router as u8,
            DhcpOption::DomainNameServer as u8,
            DhcpOption::DomainName as u8,
        ],
    );
    packet.to_bytes()
}

fn print_reply(raw: &[u8], meta: &LinkMetadata) {
    let reply = match decode(raw, meta) {
        Ok(reply) => reply,
        Err(e) => {
            println!("✗ Could not decode reply ({} bytes): {}", raw.len(), e);
            return;
        }
    };

    let kind = reply
        .message
        .get_message_type()
        .map_or_else(|| "unknown".to_string(), |kind| kind.to_string());
    println!("✓ {} from {} / {} (vlan {})", kind, reply.src_mac, reply.src_ip, reply.vlan_list());
    println!("  Offered address: {}", reply.message.yiaddr);
    if let Some(server) = reply.message.get_server_identifier() {
        println!("  Server identifier: {}", server);
    }

    let mut codes: Vec<_> = reply.options.keys().copied().collect();
    codes.sort_unstable();
    for code in codes {
        println!("  option {:3}: {:02x?}", code, reply.options[&code]);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: ClientArgs = argh::from_env();

    let ifindex = interface_index(&args.interface)
        .with_context(|| format!("Interface '{}' not found", args.interface))?;
    let interface_mac = get_interface_mac(&args.interface)
        .with_context(|| format!("Failed to get MAC address for interface '{}'", args.interface))?;
    let client_mac = args.mac.unwrap_or(interface_mac);
    let vlans: Vec<VlanTag> = args.vlan.iter().map(|&id| VlanTag::new(id)).collect();

    let xid = transaction_id();
    let payload = discover(client_mac, xid, args.host_name.as_deref());
    let frame = build_udp_frame(
        &UdpFrame {
            dst_mac: MacAddr::BROADCAST,
            src_mac: interface_mac,
            vlans: &vlans,
            src_ip: Ipv4Addr::UNSPECIFIED,
            dst_ip: Ipv4Addr::BROADCAST,
            src_port: CLIENT_PORT,
            dst_port: SERVER_PORT,
        },
        &payload,
    )?;

    println!("DHCP test client on {} (index {})", args.interface, ifindex);
    println!("XID: 0x{:08x}", xid);
    println!("Client MAC: {}", client_mac);

    let mut socket = PacketSocket::open_for_port(ifindex, CLIENT_PORT)?;
    socket
        .send_frame(MacAddr::BROADCAST, &frame)
        .await
        .context("Failed to send DISCOVER")?;
    println!("Sent DHCPDISCOVER ({} bytes, vlan {:?})", frame.len(), args.vlan);

    let deadline = Instant::now() + Duration::from_secs(args.timeout);
    let mut buffer = vec![0u8; 1600];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let meta = match tokio::time::timeout(remaining, socket.recv_frame(&mut buffer)).await {
            Ok(meta) => meta.context("Failed to receive reply")?,
            Err(_) => {
                println!("✗ No reply within {} seconds", args.timeout);
                return Ok(());
            }
        };

        let raw = &buffer[..meta.captured_len];
        // replies to other clients on the same segment
        if decode(raw, &meta).is_ok_and(|reply| reply.message.xid != xid) {
            continue;
        }

        print_reply(raw, &meta);
        return Ok(());
    }
}
