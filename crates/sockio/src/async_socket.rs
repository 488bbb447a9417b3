//! Async UDP socket using Tokio.
//!
//! Drives the same batched send and receive paths as the blocking handle,
//! issuing the syscalls inside `try_io` so readiness is cleared on
//! would-block and the task parks until the socket is ready again.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use socket2::SockRef;
use tokio::io::Interest;
use tokio::net::UdpSocket;
use tracing::debug;

use crate::capacity::{self, Direction};
use crate::config::SocketConfig;
use crate::error::{Operation, SocketError, SocketResult};
use crate::offload::OffloadState;
use crate::recv::{self, ReceivedDatagrams, RecvBuffer};
use crate::send::{self, BatchLimits, OutgoingBatch, SendProgress, SendReport};
use crate::socket;
use crate::stats::{SocketStats, StatsSnapshot};

/// Hand a would-block back to tokio as an `io::Error`; keep everything else.
fn split_would_block<T>(result: SocketResult<T>) -> io::Result<SocketResult<T>> {
    match result {
        Err(SocketError::Timeout { source, .. }) if source.kind() == io::ErrorKind::WouldBlock => {
            Err(source)
        }
        other => Ok(other),
    }
}

/// Async UDP socket with batched, offloaded I/O.
///
/// Cloning shares the socket, its offload state and its counters. Run at
/// most one sending task and one receiving task per socket.
///
/// # Examples
///
/// ```no_run
/// use sockio::async_socket::AsyncUdpSocket;
/// use sockio::config::SocketConfig;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let socket = AsyncUdpSocket::bind("127.0.0.1:0".parse()?, &SocketConfig::default()).await?;
/// let mut buf = socket.recv_buffer();
///
/// loop {
///     let datagrams: Vec<_> = socket
///         .receive_batch(&mut buf, 64)
///         .await?
///         .map(|d| (d.source, d.payload.to_vec()))
///         .collect();
///     for (source, payload) in datagrams {
///         socket.send_batch(source, &[payload]).await?;
///     }
/// }
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct AsyncUdpSocket {
    inner: Arc<UdpSocket>,
    local_addr: SocketAddr,
    offload: Arc<OffloadState>,
    limits: BatchLimits,
    gro: bool,
    force_buffer_size: bool,
    max_recv_datagrams: usize,
    max_udp_payload: usize,
    stats: Arc<SocketStats>,
}

impl AsyncUdpSocket {
    /// Bind to `addr` and apply `config`.
    ///
    /// Deadlines in `config` are ignored; wrap calls in `tokio::time::timeout`.
    pub async fn bind(addr: SocketAddr, config: &SocketConfig) -> SocketResult<Self> {
        config.validate()?;
        Self::from_std(socket::open(addr)?, config)
    }

    /// Apply `config` to a bound socket and register it with the runtime.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn from_std(socket: std::net::UdpSocket, config: &SocketConfig) -> SocketResult<Self> {
        let prepared = socket::prepare(socket, config)?;
        let configure_failed = |e: io::Error| SocketError::from_io(Operation::Configure, e);
        prepared.socket.set_nonblocking(true).map_err(configure_failed)?;
        let inner = UdpSocket::from_std(prepared.socket).map_err(configure_failed)?;

        Ok(Self {
            inner: Arc::new(inner),
            local_addr: prepared.local_addr,
            offload: Arc::new(prepared.offload),
            limits: prepared.limits,
            gro: prepared.gro,
            force_buffer_size: prepared.force_buffer_size,
            max_recv_datagrams: config.max_recv_datagrams,
            max_udp_payload: config.max_udp_payload,
            stats: Arc::new(SocketStats::new()),
        })
    }

    /// Local address the socket is bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Send `payloads` to `dst` as one batch, waiting for writability as needed.
    ///
    /// The returned report covers the whole batch.
    pub async fn send_batch<P: AsRef<[u8]>>(
        &self,
        dst: SocketAddr,
        payloads: &[P],
    ) -> SocketResult<SendReport> {
        let batch = OutgoingBatch::new(dst, payloads, &self.limits)?;
        let mut progress = SendProgress::new();

        loop {
            self.inner
                .writable()
                .await
                .map_err(|e| SocketError::from_io(Operation::Send, e))?;

            let attempt = self.inner.try_io(Interest::WRITABLE, || {
                split_would_block(send::send_batch(
                    &*self.inner,
                    &self.offload,
                    &batch,
                    &mut progress,
                ))
            });

            match attempt {
                Ok(Ok(_)) => {
                    let total = progress.total();
                    self.stats.record_send(&total);
                    return Ok(total);
                }
                Ok(Err(e)) => {
                    self.stats.record_send(&progress.total());
                    self.stats.record_send_error();
                    debug!(local = %self.local_addr, %dst, error = %e, "batch send failed");
                    return Err(e);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => {
                    self.stats.record_send_error();
                    return Err(SocketError::from_io(Operation::Send, e));
                }
            }
        }
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

    /// Return up to `max_datagrams` datagrams, waiting for data only if `buf`
    /// has nothing pending from an earlier call.
    pub async fn receive_batch<'b>(
        &self,
        buf: &'b mut RecvBuffer,
        max_datagrams: usize,
    ) -> SocketResult<ReceivedDatagrams<'b>> {
        recv::check_max_datagrams(max_datagrams)?;

        if buf.pending() == 0 {
            loop {
                self.inner
                    .readable()
                    .await
                    .map_err(|e| SocketError::from_io(Operation::Receive, e))?;

                let attempt = self.inner.try_io(Interest::READABLE, || {
                    split_would_block(recv::receive_raw(&*self.inner, &mut *buf))
                });

                match attempt {
                    Ok(Ok(raw)) => {
                        self.stats.record_receive(raw.len, buf.pending());
                        break;
                    }
                    Ok(Err(e)) => {
                        self.stats.record_recv_error();
                        return Err(e);
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                    Err(e) => {
                        self.stats.record_recv_error();
                        return Err(SocketError::from_io(Operation::Receive, e));
                    }
                }
            }
        }

        Ok(buf.drain(max_datagrams))
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
    pub fn set_receive_capacity(&self, bytes: usize) -> SocketResult<usize> {
        capacity::set_capacity(
            &SockRef::from(&*self.inner),
            Direction::Receive,
            bytes,
            self.force_buffer_size,
        )
    }

    /// Set the send buffer, forcing it if clamped and the config allows.
    pub fn set_send_capacity(&self, bytes: usize) -> SocketResult<usize> {
        capacity::set_capacity(
            &SockRef::from(&*self.inner),
            Direction::Send,
            bytes,
            self.force_buffer_size,
        )
    }

    /// Kernel-reported receive buffer size.
    pub fn effective_receive_capacity(&self) -> SocketResult<usize> {
        capacity::effective_receive_capacity(&*self.inner)
    }

    /// Kernel-reported send buffer size.
    pub fn effective_send_capacity(&self) -> SocketResult<usize> {
        capacity::effective_send_capacity(&*self.inner)
    }

    /// Counter snapshot
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}
