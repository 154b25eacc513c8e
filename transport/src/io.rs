//! Whole-buffer send/recv over a connected stream socket.
//!
//! Both loops absorb `EINTR`. A fault after some bytes have moved is
//! reported as a short count rather than an error, so callers that frame
//! fixed-size records can tell a partial record from a dead socket.

use nix::errno::Errno;
use nix::sys::socket::{recv, send, MsgFlags};
use std::os::fd::RawFd;
use tracing::debug;

pub(crate) fn send_all(fd: RawFd, buf: &[u8]) -> nix::Result<usize> {
    let mut sent = 0;
    while sent < buf.len() {
        match send(fd, &buf[sent..], MsgFlags::MSG_NOSIGNAL) {
            Ok(0) => break,
            Ok(n) => sent += n,
            Err(Errno::EINTR) => continue,
            Err(e) if sent == 0 => return Err(e),
            Err(e) => {
                debug!(fd, sent, error = %e, "send failed after partial write");
                break;
            }
        }
    }
    Ok(sent)
}

pub(crate) fn recv_all(fd: RawFd, buf: &mut [u8]) -> nix::Result<usize> {
    let mut received = 0;
    while received < buf.len() {
        match recv(fd, &mut buf[received..], MsgFlags::empty()) {
            Ok(0) => break,
            Ok(n) => received += n,
            Err(Errno::EINTR) => continue,
            Err(e) if received == 0 => return Err(e),
            Err(e) => {
                debug!(fd, received, error = %e, "recv failed after partial read");
                break;
            }
        }
    }
    Ok(received)
}
