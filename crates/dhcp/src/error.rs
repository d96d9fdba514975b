//! Per-frame errors
//!
//! Nothing in here is fatal to the responder: the dispatcher logs the error,
//! drops the frame and moves on to the next one.

use std::io;

use thiserror::Error;

use crate::MacAddr;

/// Reasons an inbound frame could not be turned into a [`crate::Request`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("truncated frame: {layer} needs {needed} bytes, {available} available")]
    TruncatedFrame {
        layer: &'static str,
        needed: usize,
        available: usize,
    },

    #[error("more than {max} stacked 802.1Q tags")]
    TooManyVlanTags { max: usize },

    #[error("unsupported network layer (ethertype 0x{0:04x})")]
    UnsupportedNetworkLayer(u16),

    #[error("invalid IPv4 header (version {version}, ihl {ihl})")]
    InvalidIpv4Header { version: u8, ihl: u8 },

    #[error("unsupported transport protocol {0}")]
    UnsupportedTransport(u8),

    #[error("malformed option {code}: unexpected length {len}")]
    MalformedOption { code: u8, len: usize },
}

impl DecodeError {
    pub(crate) fn truncated(layer: &'static str, needed: usize, available: usize) -> Self {
        DecodeError::TruncatedFrame {
            layer,
            needed,
            available,
        }
    }
}

/// Reasons a reply could not be written as a frame
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("cannot write more than {max} 802.1Q tags")]
    TooManyVlanTags { max: usize },

    #[error("{len}-byte payload does not fit in one IPv4 datagram")]
    PayloadTooLarge { len: usize },

    #[error("failed to build frame: {0}")]
    Build(String),
}

/// A reply frame could not be handed to the link layer
#[derive(Debug, Error)]
#[error("failed to send {len}-byte frame to {destination}: {source}")]
pub struct TransmitError {
    pub destination: MacAddr,
    pub len: usize,
    pub source: io::Error,
}
