//! Host interface discovery

mod interface;

pub use interface::{get_interface_ip, get_interface_mac, interface_index};
