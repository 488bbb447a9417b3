//! libc wrappers for the socket calls `socket2` and `std` do not expose:
//! integer socket options by raw level/name, and `sendmsg`/`recvmsg` with
//! ancillary data.

use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::{AsRawFd, BorrowedFd};

use libc::{c_int, c_void, socklen_t};

/// Outcome of one `recvmsg` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawRecv {
    /// Payload bytes written into the receive buffer
    pub len: usize,
    /// Sender address
    pub source: SocketAddr,
    /// Ancillary bytes written into the control buffer
    pub control_len: usize,
    /// `MSG_TRUNC`: the payload did not fit
    pub truncated: bool,
    /// `MSG_CTRUNC`: some control messages were dropped
    pub control_truncated: bool,
}

fn cvt(rc: c_int) -> io::Result<c_int> {
    if rc == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc)
    }
}

/// `setsockopt` with an `int` value.
pub(crate) fn set_int_option(
    fd: BorrowedFd<'_>,
    level: c_int,
    name: c_int,
    value: c_int,
) -> io::Result<()> {
    // SAFETY: the option value points at a live c_int of the advertised size.
    cvt(unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            level,
            name,
            (&value as *const c_int).cast::<c_void>(),
            mem::size_of::<c_int>() as socklen_t,
        )
    })
    .map(drop)
}

/// `getsockopt` for an `int` value.
pub(crate) fn get_int_option(fd: BorrowedFd<'_>, level: c_int, name: c_int) -> io::Result<c_int> {
    let mut value: c_int = 0;
    let mut len = mem::size_of::<c_int>() as socklen_t;
    // SAFETY: value and len are valid for writes of the advertised size.
    cvt(unsafe {
        libc::getsockopt(
            fd.as_raw_fd(),
            level,
            name,
            (&mut value as *mut c_int).cast::<c_void>(),
            &mut len,
        )
    })?;
    Ok(value)
}

fn to_raw(addr: &SocketAddr) -> (libc::sockaddr_storage, socklen_t) {
    // SAFETY: all-zero is a valid sockaddr_storage.
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            // SAFETY: sockaddr_storage is large enough and suitably aligned for sockaddr_in.
            let sin = unsafe { &mut *(&mut storage as *mut libc::sockaddr_storage).cast::<libc::sockaddr_in>() };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = v4.port().to_be();
            sin.sin_addr = libc::in_addr {
                s_addr: u32::from_ne_bytes(v4.ip().octets()),
            };
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            // SAFETY: sockaddr_storage is large enough and suitably aligned for sockaddr_in6.
            let sin6 = unsafe { &mut *(&mut storage as *mut libc::sockaddr_storage).cast::<libc::sockaddr_in6>() };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = v6.port().to_be();
            sin6.sin6_flowinfo = v6.flowinfo().to_be();
            sin6.sin6_addr = libc::in6_addr {
                s6_addr: v6.ip().octets(),
            };
            sin6.sin6_scope_id = v6.scope_id();
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as socklen_t)
}

fn from_raw(storage: &libc::sockaddr_storage, len: socklen_t) -> io::Result<SocketAddr> {
    let len = len as usize;
    match c_int::from(storage.ss_family) {
        libc::AF_INET if len >= mem::size_of::<libc::sockaddr_in>() => {
            // SAFETY: family and length say the storage holds a sockaddr_in.
            let sin = unsafe { &*(storage as *const libc::sockaddr_storage).cast::<libc::sockaddr_in>() };
            Ok(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes()),
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 if len >= mem::size_of::<libc::sockaddr_in6>() => {
            // SAFETY: family and length say the storage holds a sockaddr_in6.
            let sin6 = unsafe { &*(storage as *const libc::sockaddr_storage).cast::<libc::sockaddr_in6>() };
            Ok(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                u32::from_be(sin6.sin6_flowinfo),
                sin6.sin6_scope_id,
            )))
        }
        family => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported source address family {family} ({len} bytes)"),
        )),
    }
}

/// One `sendmsg` carrying `payload` to `dst`, with optional ancillary data.
///
/// `control` must be aligned for `cmsghdr` when non-empty. Interrupted calls
/// are restarted.
pub(crate) fn send_msg(
    fd: BorrowedFd<'_>,
    dst: &SocketAddr,
    payload: &[u8],
    control: &[u8],
) -> io::Result<usize> {
    let (mut name, name_len) = to_raw(dst);
    let mut iov = libc::iovec {
        iov_base: payload.as_ptr() as *mut c_void,
        iov_len: payload.len(),
    };
    // SAFETY: all-zero is a valid msghdr.
    let mut hdr: libc::msghdr = unsafe { mem::zeroed() };
    hdr.msg_name = (&mut name as *mut libc::sockaddr_storage).cast::<c_void>();
    hdr.msg_namelen = name_len;
    hdr.msg_iov = &mut iov;
    hdr.msg_iovlen = 1;
    if !control.is_empty() {
        hdr.msg_control = control.as_ptr() as *mut c_void;
        hdr.msg_controllen = control.len() as _;
    }

    loop {
        // SAFETY: every pointer in hdr refers to a live buffer of the stated length.
        let n = unsafe { libc::sendmsg(fd.as_raw_fd(), &hdr, 0) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// One `recvmsg` into `payload`, collecting ancillary data into `control`.
///
/// `control` must be aligned for `cmsghdr`. Interrupted calls are restarted.
pub(crate) fn recv_msg(
    fd: BorrowedFd<'_>,
    payload: &mut [u8],
    control: &mut [u8],
) -> io::Result<RawRecv> {
    // SAFETY: all-zero is a valid sockaddr_storage and msghdr.
    let mut name: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut iov = libc::iovec {
        iov_base: payload.as_mut_ptr().cast::<c_void>(),
        iov_len: payload.len(),
    };
    let mut hdr: libc::msghdr = unsafe { mem::zeroed() };

    let n = loop {
        hdr.msg_name = (&mut name as *mut libc::sockaddr_storage).cast::<c_void>();
        hdr.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
        hdr.msg_iov = &mut iov;
        hdr.msg_iovlen = 1;
        hdr.msg_control = control.as_mut_ptr().cast::<c_void>();
        hdr.msg_controllen = control.len() as _;
        hdr.msg_flags = 0;

        // SAFETY: every pointer in hdr refers to a live, writable buffer of the stated length.
        let n = unsafe { libc::recvmsg(fd.as_raw_fd(), &mut hdr, 0) };
        if n >= 0 {
            break n as usize;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    };

    Ok(RawRecv {
        len: n,
        source: from_raw(&name, hdr.msg_namelen)?,
        control_len: (hdr.msg_controllen as usize).min(control.len()),
        truncated: hdr.msg_flags & libc::MSG_TRUNC != 0,
        control_truncated: hdr.msg_flags & libc::MSG_CTRUNC != 0,
    })
}
