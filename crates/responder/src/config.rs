use std::net::Ipv4Addr;

use anyhow::{Context, Result};
use argh::FromArgs;
use dhcp::{LeaseParams, MacAddr, PoolConfig, Reservation, ServerIdentity};
use trunk_dhcp::util::{get_interface_ip, get_interface_mac, interface_index};

#[derive(FromArgs, Debug)]
#[argh(
    description = "trunk-dhcpd - DHCPv4 responder for 802.1Q trunk ports",
    example = "Serve a /24 on a trunk:\n  {command_name} --interface eth1 --pool-start 10.0.1.100 --pool-end 10.0.1.200 --router 10.0.1.1",
    example = "Answer as a fixed identity:\n  {command_name} --interface eth1 --ip 10.0.1.2 --mac 02:00:00:00:00:02",
    example = "Reserve addresses:\n  {command_name} --interface eth1 --reserve 52:54:00:12:34:56=10.0.1.10 --reserve printer=10.0.1.11"
)]
pub struct CliConfig {
    #[argh(option, short = 'I', description = "network interface to listen on (required)")]
    pub interface: String,

    #[argh(option, short = 'i', description = "server IP address (defaults to the interface address)")]
    pub ip: Option<String>,

    #[argh(option, short = 'm', description = "server MAC address (defaults to the interface address)")]
    pub mac: Option<String>,

    //
    // Pool
    //
    #[argh(
        option,
        description = "dhcp pool start IP",
        default = "\"192.168.1.100\".to_string()"
    )]
    pub pool_start: String,

    #[argh(option, description = "dhcp pool end IP", default = "\"192.168.1.200\".to_string()")]
    pub pool_end: String,

    #[argh(
        option,
        short = 'r',
        description = "fixed address as MAC=IP or HOSTNAME=IP (repeatable)"
    )]
    pub reserve: Vec<String>,

    //
    // Lease parameters
    //
    #[argh(option, description = "subnet mask", default = "\"255.255.255.0\".to_string()")]
    pub subnet_mask: String,

    #[argh(option, description = "default gateway")]
    pub router: Option<String>,

    #[argh(option, description = "dns server (repeatable)")]
    pub dns: Vec<String>,

    #[argh(option, description = "domain name")]
    pub domain: Option<String>,

    #[argh(option, description = "lease time in seconds", default = "3600")]
    pub lease_time: u32,
}

/// Validated daemon configuration. The identity overrides are still optional
/// here; [`ResponderConfig::resolve_identity`] fills them in from the host.
#[derive(Debug, Clone)]
pub struct ResponderConfig {
    pub interface: String,
    pub ip: Option<Ipv4Addr>,
    pub mac: Option<MacAddr>,
    pub pool: PoolConfig,
}

/// Every option value has to fit a single one-byte length field
const MAX_OPTION_LEN: usize = u8::MAX as usize;

fn parse_ip(value: &str, what: &str) -> Result<Ipv4Addr> {
    value.parse().with_context(|| format!("Invalid {}: {}", what, value))
}

impl CliConfig {
    pub fn into_responder_config(self) -> Result<ResponderConfig> {
        let ip = self.ip.as_deref().map(|ip| parse_ip(ip, "server IP")).transpose()?;
        let mac = self
            .mac
            .as_deref()
            .map(|mac| mac.parse::<MacAddr>().with_context(|| format!("Invalid server MAC: {}", mac)))
            .transpose()?;

        let pool_start = parse_ip(&self.pool_start, "DHCP pool start IP")?;
        let pool_end = parse_ip(&self.pool_end, "DHCP pool end IP")?;
        if u32::from(pool_start) > u32::from(pool_end) {
            return Err(anyhow::anyhow!(
                "DHCP pool start {} is after pool end {}",
                pool_start,
                pool_end
            ));
        }
        if self.lease_time == 0 {
            return Err(anyhow::anyhow!("Lease time must be at least one second"));
        }

        if let Some(domain) = &self.domain
            && domain.len() > MAX_OPTION_LEN
        {
            return Err(anyhow::anyhow!(
                "Domain name is {} bytes; at most {} are allowed",
                domain.len(),
                MAX_OPTION_LEN
            ));
        }
        if self.dns.len() > MAX_OPTION_LEN / 4 {
            return Err(anyhow::anyhow!(
                "{} DNS servers given; at most {} are allowed",
                self.dns.len(),
                MAX_OPTION_LEN / 4
            ));
        }

        let params = LeaseParams {
            subnet_mask: parse_ip(&self.subnet_mask, "subnet mask")?,
            router: self.router.as_deref().map(|ip| parse_ip(ip, "router IP")).transpose()?,
            dns_servers: self
                .dns
                .iter()
                .map(|ip| parse_ip(ip, "DNS server IP"))
                .collect::<Result<_>>()?,
            domain_name: self.domain,
            lease_time: self.lease_time,
        };

        let reservations = self
            .reserve
            .iter()
            .map(|r| r.parse::<Reservation>())
            .collect::<Result<Vec<_>>>()?;

        Ok(ResponderConfig {
            interface: self.interface,
            ip,
            mac,
            pool: PoolConfig {
                pool_start,
                pool_end,
                params,
                reservations,
            },
        })
    }
}

impl ResponderConfig {
    /// Look up the interface and fill in whatever addresses were not given
    pub fn resolve_identity(&self) -> Result<ServerIdentity> {
        let ifindex = interface_index(&self.interface).with_context(|| {
            format!(
                "Network interface '{}' not found. Please specify a valid network interface with --interface.",
                self.interface
            )
        })?;

        let ip = match self.ip {
            Some(ip) => ip,
            None => get_interface_ip(&self.interface).with_context(|| {
                format!("No IPv4 address on '{}'; pass one with --ip", self.interface)
            })?,
        };
        let mac = match self.mac {
            Some(mac) => mac,
            None => get_interface_mac(&self.interface).with_context(|| {
                format!("No MAC address on '{}'; pass one with --mac", self.interface)
            })?,
        };

        Ok(ServerIdentity {
            interface: self.interface.clone(),
            ifindex,
            mac,
            ip,
        })
    }
}
