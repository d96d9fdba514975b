//! Trunk DHCP
//!
//! A DHCPv4 responder that answers on raw Ethernet frames, so clients without
//! an address can be served across 802.1Q trunk ports, including stacked
//! (QinQ) tags.
//!
//! # Features
//!
//! - **Frame codec**: hand-rolled Ethernet / 802.1Q / IPv4 / UDP parsing and
//!   serialization
//!   - Up to two stacked VLAN tags, echoed back verbatim in replies
//!   - IPv4 header checksums
//! - **Decision engine**: DISCOVER/REQUEST handling with the ACK-vs-NAK
//!   tie-break on `ciaddr` and the requested address option
//! - **Pool resolver**: dynamic range with expiring bindings, plus static
//!   reservations by MAC address or host name
//!

pub mod util;

// Re-export the core crate for easier access
pub use dhcp;
