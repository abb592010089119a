//! `NETLINK_SOCK_DIAG` socket
//!
//! RAII wrapper over the raw libc socket: opened and bound in `new`, closed
//! on drop. Receives time out after one second so a silent kernel cannot
//! stall the packet path.

use std::io;
use std::os::unix::io::RawFd;

use crate::netlink::message::{RawMessage, split_messages};
use crate::netlink::structures::{NLMSG_DONE, NLMSG_ERROR};

const RECV_BUFFER_SIZE: usize = 32 * 1024;

fn os_error(context: &str) -> io::Error {
    let err = io::Error::last_os_error();
    io::Error::new(err.kind(), format!("{context}: {err}"))
}

fn kernel_addr() -> libc::sockaddr_nl {
    // SAFETY: sockaddr_nl is plain data; all-zero is a valid value.
    let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
    addr.nl_family = libc::AF_NETLINK as u16;
    addr
}

fn set_option<T>(fd: RawFd, option: libc::c_int, value: &T, name: &str) -> io::Result<()> {
    // SAFETY: `value` is valid for size_of::<T>() bytes for the duration of the call.
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            option,
            (value as *const T).cast::<libc::c_void>(),
            std::mem::size_of::<T>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(os_error(name));
    }
    Ok(())
}

/// RAII `NETLINK_SOCK_DIAG` socket; the descriptor is closed on drop
pub struct NetlinkSocket {
    fd: RawFd,
}

impl NetlinkSocket {
    /// Open a socket bound to the kernel's sock_diag family
    pub fn new() -> io::Result<Self> {
        // SAFETY: plain syscall; the result is checked before use.
        let fd = unsafe { libc::socket(libc::AF_NETLINK, libc::SOCK_RAW, libc::NETLINK_SOCK_DIAG) };
        if fd < 0 {
            return Err(os_error("socket(NETLINK_SOCK_DIAG)"));
        }
        // From here on Drop closes the descriptor on every error path
        let socket = Self { fd };

        let addr = kernel_addr();
        // SAFETY: addr outlives the call and the length matches its type.
        let ret = unsafe {
            libc::bind(
                fd,
                (&addr as *const libc::sockaddr_nl).cast::<libc::sockaddr>(),
                std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(os_error("bind"));
        }

        let rcvbuf = RECV_BUFFER_SIZE as libc::c_int;
        set_option(fd, libc::SO_RCVBUF, &rcvbuf, "setsockopt(SO_RCVBUF)")?;
        let timeout = libc::timeval { tv_sec: 1, tv_usec: 0 };
        set_option(fd, libc::SO_RCVTIMEO, &timeout, "setsockopt(SO_RCVTIMEO)")?;

        Ok(socket)
    }

    pub fn send(&self, data: &[u8]) -> io::Result<()> {
        let addr = kernel_addr();
        // SAFETY: data and addr are valid for the lengths passed.
        let sent = unsafe {
            libc::sendto(
                self.fd,
                data.as_ptr().cast::<libc::c_void>(),
                data.len(),
                0,
                (&addr as *const libc::sockaddr_nl).cast::<libc::sockaddr>(),
                std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if sent < 0 {
            return Err(os_error("sendto"));
        }
        if sent as usize != data.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short netlink send: {sent} of {} bytes", data.len()),
            ));
        }
        Ok(())
    }

    pub fn recv(&self, buffer: &mut [u8]) -> io::Result<usize> {
        // SAFETY: buffer is valid for writes of buffer.len() bytes.
        let received = unsafe {
            libc::recv(self.fd, buffer.as_mut_ptr().cast::<libc::c_void>(), buffer.len(), 0)
        };
        if received < 0 {
            return Err(os_error("recv"));
        }
        Ok(received as usize)
    }

    /// Read datagrams until the kernel ends the reply
    ///
    /// A reply ends with `NLMSG_DONE`, an `NLMSG_ERROR`, or (for single
    /// responses) a datagram without the multipart flag.
    pub fn recv_all(&self) -> io::Result<Vec<u8>> {
        let mut collected = Vec::new();
        let mut buffer = vec![0u8; RECV_BUFFER_SIZE];

        loop {
            let len = self.recv(&mut buffer)?;
            if len == 0 {
                break;
            }
            let chunk = &buffer[..len];
            collected.extend_from_slice(chunk);

            let messages = split_messages(chunk)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
            if ends_reply(&messages) {
                break;
            }
        }

        Ok(collected)
    }
}

fn ends_reply(messages: &[RawMessage<'_>]) -> bool {
    const NLM_F_MULTI: u16 = 2;
    messages.iter().any(|m| {
        matches!(m.header.nlmsg_type, NLMSG_DONE | NLMSG_ERROR)
            || m.header.nlmsg_flags & NLM_F_MULTI == 0
    })
}

impl Drop for NetlinkSocket {
    fn drop(&mut self) {
        // SAFETY: fd is owned by this struct and closed exactly once.
        unsafe {
            libc::close(self.fd);
        }
    }
}
