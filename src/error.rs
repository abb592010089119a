//! Error types for the PSM throttling monitor

use thiserror::Error;

use crate::packet::PacketError;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, MonitorError>;

/// Everything that can go wrong outside the per-packet fast path
///
/// The packet hooks never surface these to their caller: a failure there is
/// logged and the packet is accepted unchanged.
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("connection {id} is already tracked")]
    DuplicateConnection { id: u32 },

    #[error("connection {id} is not tracked")]
    UnknownConnection { id: u32 },

    #[error("connection id {id} is reserved (must be above {min})")]
    InvalidConnectionId { id: u32, min: u32 },

    #[error("packet error: {0}")]
    Packet(#[from] PacketError),

    #[error("invalid control request: {payload:?}")]
    InvalidControlRequest { payload: String },

    #[error("invalid configuration: {message}")]
    Config { message: String },

    #[error("netlink error: {message}")]
    Netlink { message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MonitorError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn netlink(message: impl Into<String>) -> Self {
        Self::Netlink {
            message: message.into(),
        }
    }
}
