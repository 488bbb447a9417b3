//! Segmentation offload support: error classification, the sticky per-socket
//! enable flag, and kernel capability probes.

use std::io;
use std::net::{Ipv4Addr, UdpSocket};
use std::os::fd::AsFd;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use crate::sys;

/// Most segments the kernel accepts in one `UDP_SEGMENT` send.
pub const UDP_MAX_SEGMENTS: usize = 64;

/// Most segments the kernel coalesces into one GRO receive.
pub const UDP_GRO_CNT_MAX: usize = 64;

/// Whether a failed send means segmentation offload is unsupported on this
/// path.
///
/// Only `EIO` qualifies: the kernel returns it when the egress device cannot
/// checksum-offload a segmented send, and some firewalls surface the same
/// code. `EPERM`, `EMSGSIZE`, `EINVAL` and every other code are ordinary
/// failures.
#[must_use]
pub fn is_offload_unsupported(err: Option<&io::Error>) -> bool {
    matches!(err.and_then(io::Error::raw_os_error), Some(libc::EIO))
}

/// Per-socket offload state.
///
/// `enabled` starts true when the ceiling allows coalescing and only ever
/// goes from true to false.
#[derive(Debug)]
pub struct OffloadState {
    enabled: AtomicBool,
    max_segments: usize,
}

impl OffloadState {
    /// State for a socket that may coalesce up to `max_segments` payloads.
    ///
    /// A ceiling of 0 or 1 starts disabled.
    #[must_use]
    pub fn new(max_segments: usize) -> Self {
        let max_segments = max_segments.clamp(1, UDP_MAX_SEGMENTS);
        Self {
            enabled: AtomicBool::new(max_segments > 1),
            max_segments,
        }
    }

    /// State for a socket that never coalesces.
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(1)
    }

    /// Whether coalesced sends may be attempted.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Payloads per send call: the ceiling while enabled, otherwise 1.
    #[must_use]
    pub fn max_segments(&self) -> usize {
        if self.is_enabled() {
            self.max_segments
        } else {
            1
        }
    }

    /// Disable offload for the rest of the socket's lifetime.
    ///
    /// Returns `true` if this call performed the transition.
    pub fn disable(&self) -> bool {
        self.enabled.swap(false, Ordering::Relaxed)
    }
}

fn scratch_socket() -> io::Result<UdpSocket> {
    UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))
}

/// Probe how many segments this kernel accepts per send.
///
/// Returns [`UDP_MAX_SEGMENTS`] if `UDP_SEGMENT` is supported (Linux 4.18+),
/// otherwise 1.
#[must_use]
pub fn max_gso_segments() -> usize {
    let socket = match scratch_socket() {
        Ok(socket) => socket,
        Err(e) => {
            debug!(error = %e, "cannot create probe socket, assuming no segmentation offload");
            return 1;
        }
    };
    match sys::get_int_option(socket.as_fd(), libc::SOL_UDP, libc::UDP_SEGMENT) {
        Ok(_) => UDP_MAX_SEGMENTS,
        Err(e) => {
            debug!(error = %e, "UDP_SEGMENT unsupported");
            1
        }
    }
}

/// Probe how many datagrams one GRO receive may coalesce.
///
/// Returns [`UDP_GRO_CNT_MAX`] if `UDP_GRO` can be enabled (Linux 5.0+),
/// otherwise 1.
#[must_use]
pub fn gro_segments() -> usize {
    let socket = match scratch_socket() {
        Ok(socket) => socket,
        Err(e) => {
            debug!(error = %e, "cannot create probe socket, assuming no receive offload");
            return 1;
        }
    };
    match sys::set_int_option(socket.as_fd(), libc::SOL_UDP, libc::UDP_GRO, 1) {
        Ok(()) => UDP_GRO_CNT_MAX,
        Err(e) => {
            debug!(error = %e, "UDP_GRO unsupported");
            1
        }
    }
}
