//! Lease resolution
//!
//! The engine only needs the [`Resolver`] capability. [`PoolResolver`] is the
//! in-memory implementation the daemon ships with: static reservations first,
//! then a dynamic range with expiring bindings.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::frame::Request;
use crate::{IpPool, MacAddr};

/// Maps a request to the lease it should get, if any.
///
/// Called at most once per decision. Implementations may block.
pub trait Resolver {
    fn resolve(&self, request: &Request) -> Option<Lease>;
}

impl<R: Resolver + ?Sized> Resolver for &R {
    fn resolve(&self, request: &Request) -> Option<Lease> {
        (**self).resolve(request)
    }
}

impl<R: Resolver + ?Sized> Resolver for Arc<R> {
    fn resolve(&self, request: &Request) -> Option<Lease> {
        (**self).resolve(request)
    }
}

/// Network parameters handed out with a lease
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseParams {
    pub subnet_mask: Ipv4Addr,
    pub router: Option<Ipv4Addr>,
    pub dns_servers: Vec<Ipv4Addr>,
    pub domain_name: Option<String>,
    /// Lease time in seconds
    pub lease_time: u32,
}

impl Default for LeaseParams {
    fn default() -> Self {
        Self {
            subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
            router: None,
            dns_servers: Vec::new(),
            domain_name: None,
            lease_time: 3600, // 1 hour
        }
    }
}

/// An address assignment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub ip: Ipv4Addr,
    pub params: LeaseParams,
}

/// What a reservation is keyed on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReservationKey {
    Mac(MacAddr),
    HostName(String),
}

/// A fixed address for one client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub key: ReservationKey,
    pub ip: Ipv4Addr,
}

impl FromStr for Reservation {
    type Err = anyhow::Error;

    /// Parses `KEY=IP` where KEY is a MAC address or a host name
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (key, ip) = s
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("Reservation must look like KEY=IP: {}", s))?;
        let ip = ip
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid reservation address in {}: {}", s, e))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(anyhow::anyhow!("Reservation key is empty: {}", s));
        }
        let key = match key.parse::<MacAddr>() {
            Ok(mac) => ReservationKey::Mac(mac),
            Err(_) => ReservationKey::HostName(key.to_string()),
        };
        Ok(Reservation { key, ip })
    }
}

/// Configuration for [`PoolResolver`]
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// IP address pool start
    pub pool_start: Ipv4Addr,

    /// IP address pool end
    pub pool_end: Ipv4Addr,

    /// Parameters sent with every lease
    pub params: LeaseParams,

    /// Fixed assignments, never handed out dynamically
    pub reservations: Vec<Reservation>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_start: Ipv4Addr::new(192, 168, 1, 100),
            pool_end: Ipv4Addr::new(192, 168, 1, 200),
            params: LeaseParams::default(),
            reservations: Vec::new(),
        }
    }
}

/// Information about a dynamic binding
struct LeaseInfo {
    ip: Ipv4Addr,
    expires_at: Instant,
}

/// The client currently holding a host name reservation
struct HostClaim {
    mac: MacAddr,
    expires_at: Instant,
}

struct PoolState {
    config: PoolConfig,
    ip_pool: IpPool,
    leases: HashMap<MacAddr, LeaseInfo>,
    /// Keyed by lowercased host name
    host_claims: HashMap<String, HostClaim>,
}

impl PoolState {
    fn new(config: PoolConfig) -> Self {
        let ip_pool = IpPool::new(config.pool_start, config.pool_end);
        Self {
            config,
            ip_pool,
            leases: HashMap::new(),
            host_claims: HashMap::new(),
        }
    }

    fn lease_duration(&self) -> Duration {
        Duration::from_secs(u64::from(self.config.params.lease_time))
    }

    fn cleanup_expired_leases(&mut self, now: Instant) {
        let expired_macs: Vec<MacAddr> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.expires_at <= now)
            .map(|(&mac, _)| mac)
            .collect();

        for mac in expired_macs {
            tracing::debug!("Lease for {} expired", mac);
            self.leases.remove(&mac);
            self.ip_pool.release(mac);
        }
    }

    /// A MAC reservation always applies. A host name reservation goes to the
    /// first MAC that asks for it and stays with that MAC until it has been
    /// silent for a whole lease time.
    fn reserved(&mut self, mac: MacAddr, host_name: Option<&str>, now: Instant) -> Option<Ipv4Addr> {
        let reservations = &self.config.reservations;
        if let Some(r) = reservations.iter().find(|r| r.key == ReservationKey::Mac(mac)) {
            return Some(r.ip);
        }

        let host_name = host_name?;
        let ip = reservations
            .iter()
            .find(|r| matches!(&r.key, ReservationKey::HostName(name) if name.eq_ignore_ascii_case(host_name)))?
            .ip;

        let expires_at = now + self.lease_duration();
        let key = host_name.to_ascii_lowercase();
        match self.host_claims.get_mut(&key) {
            Some(claim) if claim.mac != mac && claim.expires_at > now => {
                tracing::warn!(
                    "Host name '{}' is held by {}; {} gets a pool address",
                    host_name,
                    claim.mac,
                    mac
                );
                None
            }
            Some(claim) => {
                claim.mac = mac;
                claim.expires_at = expires_at;
                Some(ip)
            }
            None => {
                self.host_claims.insert(key, HostClaim { mac, expires_at });
                Some(ip)
            }
        }
    }

    /// Resolve an address for a MAC address, allocating from the pool if needed
    fn allocate_ip(&mut self, mac: MacAddr, host_name: Option<&str>, now: Instant) -> Option<Ipv4Addr> {
        if let Some(ip) = self.reserved(mac, host_name, now) {
            return Some(ip);
        }

        self.cleanup_expired_leases(now);
        let expires_at = now + self.lease_duration();

        if let Some(lease) = self.leases.get_mut(&mac) {
            lease.expires_at = expires_at;
            return Some(lease.ip);
        }

        let reservations = &self.config.reservations;
        let ip = self
            .ip_pool
            .allocate(mac, |ip| reservations.iter().any(|r| r.ip == ip))?;
        self.leases.insert(mac, LeaseInfo { ip, expires_at });
        Some(ip)
    }
}

/// In-memory resolver backed by an address pool and a reservation table
pub struct PoolResolver {
    state: Mutex<PoolState>,
}

impl PoolResolver {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            state: Mutex::new(PoolState::new(config)),
        }
    }

    fn resolve_at(&self, request: &Request, now: Instant) -> Option<Lease> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match state.allocate_ip(request.src_mac, request.host_name.as_deref(), now) {
            Some(ip) => Some(Lease {
                ip,
                params: state.config.params.clone(),
            }),
            None => {
                tracing::warn!("No IP addresses available for MAC {}", request.src_mac);
                None
            }
        }
    }
}

impl Resolver for PoolResolver {
    fn resolve(&self, request: &Request) -> Option<Lease> {
        self.resolve_at(request, Instant::now())
    }
}
