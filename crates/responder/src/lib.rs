//! trunk-dhcpd
//!
//! Daemon wrapper around the `dhcp` crate: turns command line flags into a
//! [`ServerIdentity`] and a [`PoolConfig`], then runs the responder until it
//! fails or the process is interrupted.

pub mod config;

use anyhow::Result;
use dhcp::{PoolConfig, ServerIdentity, spawn_dhcp_server};

pub use config::{CliConfig, ResponderConfig};

/// Owns the resolved configuration and the responder task
pub struct Responder {
    identity: ServerIdentity,
    pool: PoolConfig,
}

impl Responder {
    pub fn new(config: ResponderConfig) -> Result<Self> {
        let identity = config.resolve_identity()?;
        Ok(Self {
            identity,
            pool: config.pool,
        })
    }

    pub fn identity(&self) -> &ServerIdentity {
        &self.identity
    }

    pub async fn run(self) -> Result<()> {
        tracing::info!(
            "Starting DHCP responder on '{}' (pool: {} - {}, {} reservations)",
            self.identity.interface,
            self.pool.pool_start,
            self.pool.pool_end,
            self.pool.reservations.len()
        );

        let mut handle = tokio::spawn(spawn_dhcp_server(self.identity, self.pool));

        tokio::select! {
            res = &mut handle => match res {
                Ok(Ok(())) => {
                    tracing::info!("DHCP service completed successfully");
                    Ok(())
                }
                Ok(Err(e)) => {
                    tracing::error!("DHCP service failed: {}", e);
                    Err(e)
                }
                Err(e) => {
                    tracing::error!("DHCP task panicked: {}", e);
                    Err(anyhow::anyhow!("DHCP task panicked: {}", e))
                }
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, shutting down");
                handle.abort();
                Ok(())
            }
        }
    }
}
