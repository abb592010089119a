//! Control channel to the external controller
//!
//! The controller registers itself, toggles global choking, and receives one
//! event per burst packet. Messages are netlink-framed datagrams on a Unix
//! socket; events use `NLMSG_DONE` as their type.

use std::fmt;
use std::io;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::connection::Direction;
use crate::error::{MonitorError, Result};
use crate::netlink::message::{build_message, parse_header};
use crate::netlink::structures::{NLMSG_DONE, NLMSG_HDR_LEN};

/// Event type code for "packet event"
pub const PACKET_EVENT: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRequest {
    /// Remember the sender as the destination for burst events
    Register,
    ChokeOn,
    ChokeOff,
}

impl ControlRequest {
    /// Decode a request, with or without its netlink header
    pub fn parse(data: &[u8]) -> Result<Self> {
        let body = strip_header(data);
        let text = String::from_utf8_lossy(body);
        let trimmed = text.trim_matches(|c: char| c == '\0' || c.is_whitespace());

        match trimmed {
            "0" => Ok(Self::Register),
            "1" => Ok(Self::ChokeOn),
            "2" => Ok(Self::ChokeOff),
            _ => Err(MonitorError::InvalidControlRequest {
                payload: trimmed.to_owned(),
            }),
        }
    }
}

fn strip_header(data: &[u8]) -> &[u8] {
    match parse_header(data) {
        Some(header) => {
            let len = header.nlmsg_len as usize;
            if (NLMSG_HDR_LEN..=data.len()).contains(&len) {
                &data[NLMSG_HDR_LEN..len]
            } else {
                data
            }
        }
        None => data,
    }
}

/// One "new burst packet" report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BurstEvent {
    /// Microseconds since the previous burst packet on this connection
    pub interval_micros: u64,
    pub is_new: bool,
    pub direction: Direction,
    pub connection_id: u32,
    pub size: u32,
}

impl fmt::Display for BurstEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{},{},{}",
            PACKET_EVENT,
            self.interval_micros,
            u8::from(self.is_new),
            self.direction.wire_value(),
            self.connection_id,
            self.size
        )
    }
}

/// Receiver of burst events
///
/// Called from the packet path after all locks are released; must not block.
pub trait BurstNotifier: Send + Sync {
    fn notify(&self, event: &BurstEvent);
}

// ============================================================================
// UNIX DATAGRAM CHANNEL
// ============================================================================

/// Unix datagram endpoint shared with the userspace controller
///
/// The controller registers by sending a `Register` request; burst notices
/// go to the last address that registered.
pub struct ControlChannel {
    socket: UnixDatagram,
    path: PathBuf,
    controller: Mutex<Option<PathBuf>>,
    sequence: AtomicU32,
}

impl ControlChannel {
    /// Bind at `path`, replacing a stale socket file
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "removed stale control socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let socket = UnixDatagram::bind(&path)?;
        // Lets the receive loop notice shutdown
        socket.set_read_timeout(Some(Duration::from_millis(200)))?;
        info!(path = %path.display(), "control channel listening");

        Ok(Self {
            socket,
            path,
            controller: Mutex::new(None),
            sequence: AtomicU32::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn controller(&self) -> Option<PathBuf> {
        self.controller.lock().clone()
    }

    /// Wait for the next request
    ///
    /// `Register` is handled here; the caller acts on the choke requests.
    /// Times out with an `Io` error of kind `WouldBlock` or `TimedOut`.
    pub fn recv(&self) -> Result<ControlRequest> {
        let mut buffer = [0u8; 256];
        let (len, from) = self.socket.recv_from(&mut buffer)?;
        let request = ControlRequest::parse(&buffer[..len])?;

        if request == ControlRequest::Register {
            match from.as_pathname() {
                Some(addr) => {
                    info!(controller = %addr.display(), "controller registered");
                    *self.controller.lock() = Some(addr.to_path_buf());
                }
                None => warn!("registration from an unbound socket ignored"),
            }
        }
        Ok(request)
    }
}

impl BurstNotifier for ControlChannel {
    fn notify(&self, event: &BurstEvent) {
        let Some(controller) = self.controller() else {
            trace!(connection_id = event.connection_id, "no controller registered, event dropped");
            return;
        };

        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let text = event.to_string();
        let message = build_message(NLMSG_DONE, 0, seq, std::process::id(), text.as_bytes());
        if let Err(e) = self.socket.send_to(&message, &controller) {
            warn!(connection_id = event.connection_id, error = %e, "failed to send burst event");
        }
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Notifier that keeps every event in memory
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct RecordingNotifier {
    events: Mutex<Vec<BurstEvent>>,
}

#[cfg(test)]
impl RecordingNotifier {
    pub(crate) fn events(&self) -> Vec<BurstEvent> {
        self.events.lock().clone()
    }
}

#[cfg(test)]
impl BurstNotifier for RecordingNotifier {
    fn notify(&self, event: &BurstEvent) {
        self.events.lock().push(*event);
    }
}
