//! Blocking UDP socket handle with batched, offloaded I/O.
//!
//! Setup applies the configured buffer capacities (best effort), enables the
//! control messages the receive path decodes, turns on GRO when the kernel
//! supports it and probes segmentation offload for the send path.

use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsFd, BorrowedFd};
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tracing::{debug, warn};

use crate::capacity::{self, Direction};
use crate::config::SocketConfig;
use crate::error::{Operation, SocketError, SocketResult};
use crate::offload::{self, OffloadState, UDP_MAX_SEGMENTS};
use crate::recv::{self, ReceivedDatagrams, RecvBuffer};
use crate::send::{self, BatchLimits, OutgoingBatch, SendProgress, SendReport};
use crate::stats::{SocketStats, StatsSnapshot};
use crate::sys;

/// A configured socket, ready to be wrapped by a blocking or async handle.
#[derive(Debug)]
pub(crate) struct Prepared {
    pub(crate) socket: std::net::UdpSocket,
    pub(crate) local_addr: SocketAddr,
    pub(crate) offload: OffloadState,
    pub(crate) limits: BatchLimits,
    pub(crate) gro: bool,
    pub(crate) force_buffer_size: bool,
}

/// Create a UDP socket bound to `addr`. IPv6 sockets accept IPv4 too.
pub(crate) fn open(addr: SocketAddr) -> SocketResult<std::net::UdpSocket> {
    let bind_failed = |e: io::Error| SocketError::from_io(Operation::Bind, e);

    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .map_err(bind_failed)?;
    if addr.is_ipv6() {
        socket.set_only_v6(false).map_err(bind_failed)?;
    }
    socket.bind(&addr.into()).map_err(bind_failed)?;
    Ok(socket.into())
}

fn enable(fd: BorrowedFd<'_>, level: libc::c_int, name: libc::c_int) -> io::Result<()> {
    sys::set_int_option(fd, level, name, 1)
}

fn configure_failed(e: io::Error) -> SocketError {
    SocketError::from_io(Operation::Configure, e)
}

/// Apply `config` to an already bound socket.
pub(crate) fn prepare(socket: std::net::UdpSocket, config: &SocketConfig) -> SocketResult<Prepared> {
    config.validate()?;
    let local_addr = socket.local_addr().map_err(configure_failed)?;
    let sock = SockRef::from(&socket);

    for (direction, bytes) in [
        (Direction::Receive, config.recv_buffer_size),
        (Direction::Send, config.send_buffer_size),
    ] {
        let Some(bytes) = bytes else { continue };
        if let Err(e) = capacity::set_capacity(&sock, direction, bytes, config.force_buffer_size) {
            warn!(local = %local_addr, ?direction, requested = bytes, error = %e, "socket buffer request not honoured");
        }
    }

    let fd = socket.as_fd();
    let dual_stack = local_addr.is_ipv6() && !sock.only_v6().unwrap_or(true);
    if config.pktinfo {
        if local_addr.is_ipv4() {
            enable(fd, libc::IPPROTO_IP, libc::IP_PKTINFO).map_err(configure_failed)?;
        } else {
            enable(fd, libc::IPPROTO_IPV6, libc::IPV6_RECVPKTINFO).map_err(configure_failed)?;
            if dual_stack {
                enable(fd, libc::IPPROTO_IP, libc::IP_PKTINFO).map_err(configure_failed)?;
            }
        }
    }
    if config.ecn {
        if local_addr.is_ipv4() {
            enable(fd, libc::IPPROTO_IP, libc::IP_RECVTOS).map_err(configure_failed)?;
        } else {
            enable(fd, libc::IPPROTO_IPV6, libc::IPV6_RECVTCLASS).map_err(configure_failed)?;
            if dual_stack {
                enable(fd, libc::IPPROTO_IP, libc::IP_RECVTOS).map_err(configure_failed)?;
            }
        }
    }

    let gro = config.gro
        && match enable(fd, libc::SOL_UDP, libc::UDP_GRO) {
            Ok(()) => true,
            Err(e) => {
                debug!(local = %local_addr, error = %e, "UDP_GRO unavailable");
                false
            }
        };

    let offload = if config.gso {
        let wanted = config.max_gso_segments.unwrap_or(UDP_MAX_SEGMENTS);
        OffloadState::new(wanted.min(offload::max_gso_segments()))
    } else {
        OffloadState::disabled()
    };

    debug!(
        local = %local_addr,
        gso = offload.is_enabled(),
        max_segments = offload.max_segments(),
        gro,
        pktinfo = config.pktinfo,
        ecn = config.ecn,
        "socket configured"
    );

    Ok(Prepared {
        socket,
        local_addr,
        offload,
        limits: config.batch_limits(),
        gro,
        force_buffer_size: config.force_buffer_size,
    })
}

/// Blocking UDP socket with batched sends and receives.
///
/// One thread may send while another receives; concurrent senders (or
/// concurrent receivers) must be serialized by the caller.
///
/// # Examples
///
/// ```no_run
/// use sockio::config::SocketConfig;
/// use sockio::socket::UdpSocket;
///
/// let config = SocketConfig::default();
/// let socket = UdpSocket::bind("127.0.0.1:0".parse().unwrap(), &config).unwrap();
/// let peer = "127.0.0.1:4433".parse().unwrap();
///
/// let packets = vec![vec![0u8; 1200]; 10];
/// let report = socket.send_batch(peer, &packets).unwrap();
/// println!("{} datagrams in {} syscalls", report.datagrams, report.syscalls);
///
/// let mut buf = socket.recv_buffer();
/// for datagram in socket.receive_batch(&mut buf, 64).unwrap() {
///     println!("{} bytes from {}", datagram.payload.len(), datagram.source);
/// }
/// ```
#[derive(Debug)]
pub struct UdpSocket {
    inner: std::net::UdpSocket,
    local_addr: SocketAddr,
    offload: OffloadState,
    limits: BatchLimits,
    gro: bool,
    force_buffer_size: bool,
    max_recv_datagrams: usize,
    max_udp_payload: usize,
    stats: SocketStats,
}

impl UdpSocket {
    /// Bind to `addr` and apply `config`.
    ///
    /// # Errors
    ///
    /// Fails if the config is invalid, the bind fails or a control message
    /// cannot be enabled. Buffer capacities that cannot be applied are logged,
    /// not returned.
    pub fn bind(addr: SocketAddr, config: &SocketConfig) -> SocketResult<Self> {
        config.validate()?;
        Self::from_std(open(addr)?, config)
    }

    /// Apply `config` to an existing bound socket.
    pub fn from_std(socket: std::net::UdpSocket, config: &SocketConfig) -> SocketResult<Self> {
        let prepared = prepare(socket, config)?;
        prepared
            .socket
            .set_read_timeout(config.read_timeout())
            .map_err(configure_failed)?;
        prepared
            .socket
            .set_write_timeout(config.write_timeout())
            .map_err(configure_failed)?;

        Ok(Self {
            inner: prepared.socket,
            local_addr: prepared.local_addr,
            offload: prepared.offload,
            limits: prepared.limits,
            gro: prepared.gro,
            force_buffer_size: prepared.force_buffer_size,
            max_recv_datagrams: config.max_recv_datagrams,
            max_udp_payload: config.max_udp_payload,
            stats: SocketStats::new(),
        })
    }

    /// Local address the socket is bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Send `payloads` to `dst` as one batch.
    ///
    /// # Errors
    ///
    /// [`SocketError::InvalidArgument`] if the payloads do not form a valid
    /// batch; otherwise the first send failure that is not an offload
    /// rejection.
    pub fn send_batch<P: AsRef<[u8]>>(&self, dst: SocketAddr, payloads: &[P]) -> SocketResult<SendReport> {
        let batch = OutgoingBatch::new(dst, payloads, &self.limits)?;
        let mut progress = SendProgress::new();
        self.resume_batch(&batch, &mut progress)
    }

    /// Continue sending `batch` from `progress`, e.g. after a write timeout.
    pub fn resume_batch<P: AsRef<[u8]>>(
        &self,
        batch: &OutgoingBatch<'_, P>,
        progress: &mut SendProgress,
    ) -> SocketResult<SendReport> {
        let result = send::send_batch(&self.inner, &self.offload, batch, progress);
        match &result {
            Ok(report) => self.stats.record_send(report),
            Err(e) => {
                self.stats.record_send_error();
                debug!(local = %self.local_addr, dst = %batch.destination(), error = %e, "batch send failed");
            }
        }
        result
    }

    /// A receive buffer sized for this socket's configuration.
    ///
    /// With GRO enabled it holds one full aggregate.
    #[must_use]
    pub fn recv_buffer(&self) -> RecvBuffer {
        if self.gro {
            RecvBuffer::coalescing()
        } else {
            RecvBuffer::new(self.max_recv_datagrams, self.max_udp_payload)
        }
    }

    /// Return up to `max_datagrams` datagrams, receiving once if `buf` has
    /// nothing pending from an earlier call.
    pub fn receive_batch<'b>(
        &self,
        buf: &'b mut RecvBuffer,
        max_datagrams: usize,
    ) -> SocketResult<ReceivedDatagrams<'b>> {
        recv::check_max_datagrams(max_datagrams)?;
        if buf.pending() == 0 {
            let raw = recv::receive_raw(&self.inner, buf).inspect_err(|_| {
                self.stats.record_recv_error();
            })?;
            self.stats.record_receive(raw.len, buf.pending());
        }
        Ok(buf.drain(max_datagrams))
    }

    /// Batch limits applied to outgoing sends.
    #[must_use]
    pub fn batch_limits(&self) -> BatchLimits {
        self.limits
    }

    /// Whether coalesced sends are still attempted.
    #[must_use]
    pub fn offload_enabled(&self) -> bool {
        self.offload.is_enabled()
    }

    /// Payloads per send call.
    #[must_use]
    pub fn max_gso_segments(&self) -> usize {
        self.offload.max_segments()
    }

    /// Whether the kernel may coalesce inbound datagrams.
    #[must_use]
    pub fn gro_enabled(&self) -> bool {
        self.gro
    }

    /// Set the receive buffer, forcing it if clamped and the config allows.
    /// Returns the effective size.
    pub fn set_receive_capacity(&self, bytes: usize) -> SocketResult<usize> {
        capacity::set_capacity(
            &SockRef::from(&self.inner),
            Direction::Receive,
            bytes,
            self.force_buffer_size,
        )
    }

    /// Set the send buffer, forcing it if clamped and the config allows.
    /// Returns the effective size.
    pub fn set_send_capacity(&self, bytes: usize) -> SocketResult<usize> {
        capacity::set_capacity(
            &SockRef::from(&self.inner),
            Direction::Send,
            bytes,
            self.force_buffer_size,
        )
    }

    /// Set the receive buffer through the privileged option.
    pub fn force_receive_capacity(&self, bytes: usize) -> SocketResult<usize> {
        capacity::force_receive_capacity(&self.inner, bytes)
    }

    /// Set the send buffer through the privileged option.
    pub fn force_send_capacity(&self, bytes: usize) -> SocketResult<usize> {
        capacity::force_send_capacity(&self.inner, bytes)
    }

    /// Kernel-reported receive buffer size.
    pub fn effective_receive_capacity(&self) -> SocketResult<usize> {
        capacity::effective_receive_capacity(&self.inner)
    }

    /// Kernel-reported send buffer size.
    pub fn effective_send_capacity(&self) -> SocketResult<usize> {
        capacity::effective_send_capacity(&self.inner)
    }

    /// Receive deadline. `None` blocks indefinitely.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> SocketResult<()> {
        self.inner.set_read_timeout(timeout).map_err(configure_failed)
    }

    /// Send deadline. `None` blocks indefinitely.
    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> SocketResult<()> {
        self.inner.set_write_timeout(timeout).map_err(configure_failed)
    }

    /// Counter snapshot
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// The underlying socket.
    #[must_use]
    pub fn as_std(&self) -> &std::net::UdpSocket {
        &self.inner
    }
}

impl AsFd for UdpSocket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inner.as_fd()
    }
}
