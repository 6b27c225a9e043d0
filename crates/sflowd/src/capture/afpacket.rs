//! AF_PACKET raw socket capture.
//!
//! One non-blocking `SOCK_RAW` socket bound to the device, polled through
//! tokio's `AsyncFd`. Frames the host itself transmits are skipped so only
//! ingress traffic is sampled.

use async_trait::async_trait;
use std::ffi::CString;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use tokio::io::unix::AsyncFd;
use tracing::debug;

use super::{CaptureBackend, CapturedFrame, PacketSource};
use crate::error::{SflowError, SflowResult};

/// Receive buffer size. Longer frames are copied up to this length; the
/// wire length is still reported through `MSG_TRUNC`.
const CAPTURE_BUFFER_SIZE: usize = 2048;

#[derive(Debug, Default)]
pub struct AfPacketCapture;

impl AfPacketCapture {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CaptureBackend for AfPacketCapture {
    fn name(&self) -> &'static str {
        "afpacket"
    }

    async fn open(&self, device: &str) -> SflowResult<Box<dyn PacketSource>> {
        let fd = open_socket(device).map_err(|e| SflowError::capture(device, e.to_string()))?;
        let fd = AsyncFd::new(fd).map_err(|e| SflowError::capture(device, e.to_string()))?;
        debug!(device, "Opened AF_PACKET capture");
        Ok(Box::new(AfPacketSource {
            device: device.to_string(),
            fd,
            buf: vec![0u8; CAPTURE_BUFFER_SIZE],
        }))
    }
}

fn eth_p_all() -> u16 {
    (libc::ETH_P_ALL as u16).to_be()
}

fn open_socket(device: &str) -> io::Result<OwnedFd> {
    let name = CString::new(device).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    // SAFETY: `name` is a valid NUL-terminated string for the duration of the call.
    let ifindex = unsafe { libc::if_nametoindex(name.as_ptr()) };
    if ifindex == 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: plain socket(2) call, the result is checked before use.
    let raw = unsafe {
        libc::socket(
            libc::AF_PACKET,
            libc::SOCK_RAW | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            i32::from(eth_p_all()),
        )
    };
    if raw < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `raw` is a freshly created descriptor owned by nobody else.
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    // SAFETY: sockaddr_ll is plain old data, all-zero is a valid value.
    let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
    addr.sll_family = libc::AF_PACKET as u16;
    addr.sll_protocol = eth_p_all();
    addr.sll_ifindex = ifindex as i32;

    // SAFETY: `addr` outlives the call and the length matches its type.
    let ret = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(fd)
}

struct AfPacketSource {
    device: String,
    fd: AsyncFd<OwnedFd>,
    buf: Vec<u8>,
}

/// Receives one frame, returning its wire length and packet type. The wire
/// length may exceed `buf.len()`.
fn recv_frame(fd: &OwnedFd, buf: &mut [u8]) -> io::Result<(usize, u8)> {
    // SAFETY: sockaddr_ll is plain old data, all-zero is a valid value.
    let mut from: libc::sockaddr_ll = unsafe { mem::zeroed() };
    let mut from_len = mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t;

    // SAFETY: `buf` and `from` are valid for writes of the lengths passed.
    let n = unsafe {
        libc::recvfrom(
            fd.as_raw_fd(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            libc::MSG_TRUNC,
            &mut from as *mut libc::sockaddr_ll as *mut libc::sockaddr,
            &mut from_len,
        )
    };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((n as usize, from.sll_pkttype))
}

/// Builds the frame from what `recvfrom` copied into `buf`.
fn copied_frame(buf: &[u8], wire_len: usize) -> CapturedFrame {
    let copied = wire_len.min(buf.len());
    let frame_length = u32::try_from(wire_len).unwrap_or(u32::MAX);
    CapturedFrame::truncated(buf[..copied].to_vec(), frame_length)
}

#[async_trait]
impl PacketSource for AfPacketSource {
    async fn next_packet(&mut self) -> SflowResult<Option<CapturedFrame>> {
        loop {
            let mut guard = self
                .fd
                .readable()
                .await
                .map_err(|e| SflowError::capture(&self.device, e.to_string()))?;

            let buf = &mut self.buf;
            match guard.try_io(|inner| recv_frame(inner.get_ref(), buf)) {
                Ok(Ok((_, pkttype))) if pkttype == libc::PACKET_OUTGOING => continue,
                Ok(Ok((wire_len, _))) => return Ok(Some(copied_frame(buf, wire_len))),
                Ok(Err(e)) => return Err(SflowError::capture(&self.device, e.to_string())),
                Err(_would_block) => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jumbo_frame_keeps_wire_length() {
        let buf = vec![0x5a; CAPTURE_BUFFER_SIZE];
        let frame = copied_frame(&buf, 9000);
        assert_eq!(frame.data.len(), CAPTURE_BUFFER_SIZE);
        assert_eq!(frame.frame_length, 9000);
    }

    #[test]
    fn test_short_frame_copied_whole() {
        let mut buf = vec![0u8; CAPTURE_BUFFER_SIZE];
        buf[..3].copy_from_slice(&[1, 2, 3]);
        let frame = copied_frame(&buf, 3);
        assert_eq!(frame, CapturedFrame::new(vec![1, 2, 3]));
    }
}
