use std::io::{Error, ErrorKind, Result};
use std::net::Ipv4Addr;

use dhcp::MacAddr;
use nix::ifaddrs::getifaddrs;
use nix::net::if_::if_nametoindex;

/// First IPv4 address configured on the interface
pub fn get_interface_ip(name: &str) -> Result<Ipv4Addr> {
    getifaddrs()?
        .find_map(|ifa| {
            if ifa.interface_name != name {
                return None;
            }
            ifa.address.and_then(|addr| addr.as_sockaddr_in().map(|sin| sin.ip()))
        })
        .ok_or_else(|| Error::from(ErrorKind::NotFound))
}

/// Hardware address of the interface
pub fn get_interface_mac(name: &str) -> Result<MacAddr> {
    getifaddrs()?
        .find_map(|ifa| {
            if ifa.interface_name != name {
                return None;
            }
            ifa.address
                .and_then(|addr| addr.as_link_addr().and_then(|link| link.addr()))
                .filter(|mac| *mac != [0u8; 6])
        })
        .map(MacAddr::from)
        .ok_or_else(|| Error::from(ErrorKind::NotFound))
}

/// Kernel index of the interface
pub fn interface_index(name: &str) -> Result<u32> {
    Ok(if_nametoindex(name)?)
}
