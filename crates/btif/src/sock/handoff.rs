//! Kernel socket plumbing for socket slots.
//!
//! Everything that touches raw socket syscalls lives here: socket pair creation,
//! non-blocking send/recv, pending byte counts, and handing a connected fd to another
//! endpoint through SCM_RIGHTS. Slot logic only sees `io::Result` and `OwnedFd`.
//!
//! ## Safety contracts
//!
//! The `unsafe` blocks call libc with fds borrowed from live `OwnedFd`s (the `BorrowedFd`
//! lifetime guarantees they stay open for the call) and with buffers whose lengths are
//! passed alongside their pointers. Control buffers are 8-byte aligned for `cmsghdr`.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;

use nix::sys::socket::{AddressFamily, SockFlag, SockType, socketpair};

use crate::types::RawAddress;

/// Size of the encoded [`ConnectSignal`].
pub const CONNECT_SIGNAL_SIZE: usize = 20;

const CMSG_BUF_LEN: usize = 64;

#[repr(C, align(8))]
struct Aligned<T>(T);

/// Create the connected pair backing one socket slot. Message boundaries are preserved.
pub fn slot_socket_pair() -> io::Result<(OwnedFd, OwnedFd)> {
    socketpair(
        AddressFamily::Unix,
        SockType::SeqPacket,
        None,
        SockFlag::SOCK_CLOEXEC,
    )
    .map_err(io::Error::from)
}

/// Send without blocking. `WouldBlock` and `Interrupted` come back as errors for the caller
/// to treat as "nothing sent".
pub fn send_nonblocking(fd: BorrowedFd<'_>, buf: &[u8]) -> io::Result<usize> {
    let n = unsafe {
        libc::send(
            fd.as_raw_fd(),
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL,
        )
    };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

pub fn recv_nonblocking(fd: BorrowedFd<'_>, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe {
        libc::recv(
            fd.as_raw_fd(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            libc::MSG_DONTWAIT,
        )
    };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Send the whole buffer, blocking as needed.
pub fn send_all(fd: BorrowedFd<'_>, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        let n = unsafe {
            libc::send(
                fd.as_raw_fd(),
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                libc::MSG_NOSIGNAL,
            )
        };
        if n < 0 {
            let e = io::Error::last_os_error();
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(e);
        }
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "socket send returned 0"));
        }
        buf = &buf[n as usize..];
    }
    Ok(())
}

/// Bytes waiting to be read on `fd` (FIONREAD). For a seqpacket socket this is the size of
/// the next message.
pub fn pending_bytes(fd: BorrowedFd<'_>) -> io::Result<usize> {
    let mut size: libc::c_int = 0;
    let ret = unsafe { libc::ioctl(fd.as_raw_fd(), libc::FIONREAD, &mut size as *mut libc::c_int) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(size.max(0) as usize)
}

/// Write the 4-byte little-endian channel number an application expects first on a socket.
pub fn send_channel(fd: BorrowedFd<'_>, channel: i32) -> io::Result<()> {
    send_all(fd, &channel.to_le_bytes())
}

/// Send `payload` over `sock` with `passed` attached as SCM_RIGHTS.
///
/// The receiver gets its own descriptor for the same channel; the caller still owns (and
/// should close) `passed`.
pub fn send_fd(sock: BorrowedFd<'_>, payload: &[u8], passed: BorrowedFd<'_>) -> io::Result<usize> {
    let mut ctrl = Aligned([0u8; CMSG_BUF_LEN]);
    let mut iov = libc::iovec {
        iov_base: payload.as_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };

    let space = unsafe { libc::CMSG_SPACE(mem::size_of::<RawFd>() as u32) } as usize;
    let mut hdr: libc::msghdr = unsafe { mem::zeroed() };
    hdr.msg_iov = &mut iov;
    hdr.msg_iovlen = 1;
    hdr.msg_control = ctrl.0.as_mut_ptr() as *mut libc::c_void;
    hdr.msg_controllen = space as _;

    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&hdr);
        if cmsg.is_null() {
            return Err(io::Error::other("control buffer too small for SCM_RIGHTS"));
        }
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<RawFd>() as u32) as _;
        ptr::write_unaligned(libc::CMSG_DATA(cmsg) as *mut RawFd, passed.as_raw_fd());
    }

    loop {
        let n = unsafe { libc::sendmsg(sock.as_raw_fd(), &hdr, libc::MSG_NOSIGNAL) };
        if n < 0 {
            let e = io::Error::last_os_error();
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(e);
        }
        return Ok(n as usize);
    }
}

/// Receive one message from `sock`, collecting an fd passed alongside it if any.
pub fn recv_fd(sock: BorrowedFd<'_>, buf: &mut [u8]) -> io::Result<(usize, Option<OwnedFd>)> {
    let mut ctrl = Aligned([0u8; CMSG_BUF_LEN]);
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };

    let mut hdr: libc::msghdr = unsafe { mem::zeroed() };
    hdr.msg_iov = &mut iov;
    hdr.msg_iovlen = 1;
    hdr.msg_control = ctrl.0.as_mut_ptr() as *mut libc::c_void;
    hdr.msg_controllen = CMSG_BUF_LEN as _;

    let n = loop {
        let n = unsafe { libc::recvmsg(sock.as_raw_fd(), &mut hdr, libc::MSG_CMSG_CLOEXEC) };
        if n < 0 {
            let e = io::Error::last_os_error();
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(e);
        }
        break n as usize;
    };

    let mut received = None;
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&hdr);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let raw = ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const RawFd);
                received = Some(OwnedFd::from_raw_fd(raw));
            }
            cmsg = libc::CMSG_NXTHDR(&hdr, cmsg);
        }
    }

    Ok((n, received))
}

/// Notification written to a listening socket when a connection is accepted. The accepted
/// connection's fd travels with it as SCM_RIGHTS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectSignal {
    pub addr: RawAddress,
    pub channel: i32,
    pub status: i32,
    pub max_tx_packet_size: u16,
    pub max_rx_packet_size: u16,
}

impl ConnectSignal {
    pub fn to_bytes(&self) -> [u8; CONNECT_SIGNAL_SIZE] {
        let mut out = [0u8; CONNECT_SIGNAL_SIZE];
        out[0..2].copy_from_slice(&(CONNECT_SIGNAL_SIZE as u16).to_le_bytes());
        out[2..8].copy_from_slice(&self.addr.address);
        out[8..12].copy_from_slice(&self.channel.to_le_bytes());
        out[12..16].copy_from_slice(&self.status.to_le_bytes());
        out[16..18].copy_from_slice(&self.max_tx_packet_size.to_le_bytes());
        out[18..20].copy_from_slice(&self.max_rx_packet_size.to_le_bytes());
        out
    }
}

impl TryFrom<&[u8]> for ConnectSignal {
    type Error = String;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        if bytes.len() != CONNECT_SIGNAL_SIZE {
            return Err(format!("Wrong number of bytes for connect signal: {}", bytes.len()));
        }

        let size = u16::from_le_bytes([bytes[0], bytes[1]]);
        if size as usize != CONNECT_SIGNAL_SIZE {
            return Err(format!("Wrong size in connect signal: {}", size));
        }

        let addr = RawAddress::from_bytes(&bytes[2..8])
            .ok_or_else(|| "Invalid address in connect signal".to_string())?;
        let le_i32 = |at: usize| i32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        let le_u16 = |at: usize| u16::from_le_bytes([bytes[at], bytes[at + 1]]);

        Ok(ConnectSignal {
            addr,
            channel: le_i32(8),
            status: le_i32(12),
            max_tx_packet_size: le_u16(16),
            max_rx_packet_size: le_u16(18),
        })
    }
}
