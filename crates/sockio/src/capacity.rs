//! Kernel socket-buffer capacity control.
//!
//! Linux doubles every accepted `SO_RCVBUF`/`SO_SNDBUF` value to reserve
//! bookkeeping space, so a successful request for `b` bytes reads back as
//! `2 * b`. Unprivileged requests are clamped to `net.core.rmem_max` /
//! `net.core.wmem_max`; the `*FORCE` options bypass that ceiling but need
//! `CAP_NET_ADMIN`.

use std::io;
use std::os::fd::AsFd;

use socket2::SockRef;
use tracing::{debug, warn};

use crate::error::{Operation, SocketError, SocketResult};
use crate::sys;

/// Largest request accepted. The kernel stores the doubled value in an `int`.
pub const MAX_CAPACITY: usize = (libc::c_int::MAX / 2) as usize;

/// Which kernel buffer to size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// `SO_RCVBUF`
    Receive,
    /// `SO_SNDBUF`
    Send,
}

impl Direction {
    fn set_op(self) -> Operation {
        match self {
            Self::Receive => Operation::SetReceiveCapacity,
            Self::Send => Operation::SetSendCapacity,
        }
    }

    fn read_op(self) -> Operation {
        match self {
            Self::Receive => Operation::ReadReceiveCapacity,
            Self::Send => Operation::ReadSendCapacity,
        }
    }

    fn force_option(self) -> libc::c_int {
        match self {
            Self::Receive => libc::SO_RCVBUFFORCE,
            Self::Send => libc::SO_SNDBUFFORCE,
        }
    }
}

/// Buffer-size socket options.
pub trait BufferControl {
    /// Unprivileged set (`SO_RCVBUF` / `SO_SNDBUF`).
    fn set_buffer_size(&self, direction: Direction, bytes: usize) -> io::Result<()>;

    /// Privileged set (`SO_RCVBUFFORCE` / `SO_SNDBUFFORCE`).
    fn force_buffer_size(&self, direction: Direction, bytes: usize) -> io::Result<()>;

    /// The size the kernel reports, already doubled.
    fn buffer_size(&self, direction: Direction) -> io::Result<usize>;
}

impl BufferControl for SockRef<'_> {
    fn set_buffer_size(&self, direction: Direction, bytes: usize) -> io::Result<()> {
        match direction {
            Direction::Receive => self.set_recv_buffer_size(bytes),
            Direction::Send => self.set_send_buffer_size(bytes),
        }
    }

    fn force_buffer_size(&self, direction: Direction, bytes: usize) -> io::Result<()> {
        let value = libc::c_int::try_from(bytes)
            .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
        sys::set_int_option(self.as_fd(), libc::SOL_SOCKET, direction.force_option(), value)
    }

    fn buffer_size(&self, direction: Direction) -> io::Result<usize> {
        match direction {
            Direction::Receive => self.recv_buffer_size(),
            Direction::Send => self.send_buffer_size(),
        }
    }
}

fn check_request(direction: Direction, bytes: usize) -> SocketResult<()> {
    if bytes == 0 {
        return Err(SocketError::invalid(direction.set_op(), "capacity must be positive"));
    }
    if bytes > MAX_CAPACITY {
        return Err(SocketError::invalid(
            direction.set_op(),
            format!("capacity {bytes} exceeds {MAX_CAPACITY}"),
        ));
    }
    Ok(())
}

/// Read the kernel-reported capacity.
pub fn effective_capacity<C: BufferControl + ?Sized>(
    control: &C,
    direction: Direction,
) -> SocketResult<usize> {
    control
        .buffer_size(direction)
        .map_err(|e| SocketError::from_io(direction.read_op(), e))
}

/// Apply `bytes` through the privileged option and verify it took effect.
///
/// Returns the effective capacity. `EPERM` from the kernel maps to
/// [`SocketError::Permission`].
pub fn force_capacity<C: BufferControl + ?Sized>(
    control: &C,
    direction: Direction,
    bytes: usize,
) -> SocketResult<usize> {
    check_request(direction, bytes)?;
    control
        .force_buffer_size(direction, bytes)
        .map_err(|e| SocketError::from_io(direction.set_op(), e))?;

    let effective = effective_capacity(control, direction)?;
    if effective < bytes.saturating_mul(2) {
        return Err(SocketError::CapacityClamped {
            op: direction.set_op(),
            requested: bytes,
            effective,
        });
    }
    debug!(?direction, requested = bytes, effective, "forced socket buffer size");
    Ok(effective)
}

/// Apply `bytes`, falling back to the privileged option when the kernel
/// clamps an unprivileged request and `allow_force` is set.
///
/// Returns the effective capacity, which is at least `2 * bytes`.
pub fn set_capacity<C: BufferControl + ?Sized>(
    control: &C,
    direction: Direction,
    bytes: usize,
    allow_force: bool,
) -> SocketResult<usize> {
    check_request(direction, bytes)?;
    control
        .set_buffer_size(direction, bytes)
        .map_err(|e| SocketError::from_io(direction.set_op(), e))?;

    let effective = effective_capacity(control, direction)?;
    let wanted = bytes.saturating_mul(2);
    if effective >= wanted {
        debug!(?direction, requested = bytes, effective, "set socket buffer size");
        return Ok(effective);
    }

    if !allow_force {
        warn!(?direction, requested = bytes, effective, "socket buffer size clamped by kernel");
        return Err(SocketError::CapacityClamped {
            op: direction.set_op(),
            requested: bytes,
            effective,
        });
    }

    warn!(
        ?direction,
        requested = bytes,
        effective,
        "socket buffer size clamped by kernel, retrying with privileged override"
    );
    force_capacity(control, direction, bytes)
}

/// Set the receive buffer of `socket`, forcing it if clamped.
///
/// # Examples
///
/// ```no_run
/// let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
/// let effective = sockio::capacity::set_receive_capacity(&socket, 256 * 1024).unwrap();
/// assert_eq!(effective, 512 * 1024);
/// ```
pub fn set_receive_capacity<S: AsFd>(socket: &S, bytes: usize) -> SocketResult<usize> {
    set_capacity(&SockRef::from(socket), Direction::Receive, bytes, true)
}

/// Set the send buffer of `socket`, forcing it if clamped.
pub fn set_send_capacity<S: AsFd>(socket: &S, bytes: usize) -> SocketResult<usize> {
    set_capacity(&SockRef::from(socket), Direction::Send, bytes, true)
}

/// Set the receive buffer of `socket` through the privileged option only.
pub fn force_receive_capacity<S: AsFd>(socket: &S, bytes: usize) -> SocketResult<usize> {
    force_capacity(&SockRef::from(socket), Direction::Receive, bytes)
}

/// Set the send buffer of `socket` through the privileged option only.
pub fn force_send_capacity<S: AsFd>(socket: &S, bytes: usize) -> SocketResult<usize> {
    force_capacity(&SockRef::from(socket), Direction::Send, bytes)
}

/// Kernel-reported receive buffer of `socket`.
pub fn effective_receive_capacity<S: AsFd>(socket: &S) -> SocketResult<usize> {
    effective_capacity(&SockRef::from(socket), Direction::Receive)
}

/// Kernel-reported send buffer of `socket`.
pub fn effective_send_capacity<S: AsFd>(socket: &S) -> SocketResult<usize> {
    effective_capacity(&SockRef::from(socket), Direction::Send)
}
