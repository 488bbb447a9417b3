//! Per-socket I/O counters.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::send::SendReport;

/// Live counters, updated by the send and receive paths.
#[derive(Debug, Default)]
pub struct SocketStats {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    datagrams_sent: AtomicU64,
    datagrams_received: AtomicU64,
    send_syscalls: AtomicU64,
    receive_syscalls: AtomicU64,
    offloaded_sends: AtomicU64,
    offload_fallbacks: AtomicU64,
    gro_splits: AtomicU64,
    send_errors: AtomicU64,
    recv_errors: AtomicU64,
}

/// Point-in-time copy of [`SocketStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Total payload bytes sent
    pub bytes_sent: u64,
    /// Total payload bytes received
    pub bytes_received: u64,
    /// Datagrams handed to the kernel
    pub datagrams_sent: u64,
    /// Datagrams delivered to the caller, after GRO splitting
    pub datagrams_received: u64,
    /// `sendmsg` calls
    pub send_syscalls: u64,
    /// `recvmsg` calls that returned data
    pub receive_syscalls: u64,
    /// Coalesced sends accepted by the kernel
    pub offloaded_sends: u64,
    /// Batches that fell back after an offload rejection
    pub offload_fallbacks: u64,
    /// Receives that carried more than one datagram
    pub gro_splits: u64,
    /// Send errors surfaced to the caller
    pub send_errors: u64,
    /// Receive errors surfaced to the caller
    pub recv_errors: u64,
}

fn add(counter: &AtomicU64, n: usize) {
    counter.fetch_add(n as u64, Ordering::Relaxed);
}

impl SocketStats {
    /// Zeroed counters
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of one send call.
    pub fn record_send(&self, report: &SendReport) {
        add(&self.bytes_sent, report.bytes);
        add(&self.datagrams_sent, report.datagrams);
        add(&self.send_syscalls, report.syscalls);
        add(&self.offloaded_sends, report.offloaded);
        if report.fell_back {
            add(&self.offload_fallbacks, 1);
        }
    }

    /// Record one receive call that produced `datagrams` datagrams.
    pub fn record_receive(&self, bytes: usize, datagrams: usize) {
        add(&self.bytes_received, bytes);
        add(&self.datagrams_received, datagrams);
        add(&self.receive_syscalls, 1);
        if datagrams > 1 {
            add(&self.gro_splits, 1);
        }
    }

    /// Record a send error
    pub fn record_send_error(&self) {
        add(&self.send_errors, 1);
    }

    /// Record a receive error
    pub fn record_recv_error(&self) {
        add(&self.recv_errors, 1);
    }

    /// Copy the current values.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StatsSnapshot {
            bytes_sent: load(&self.bytes_sent),
            bytes_received: load(&self.bytes_received),
            datagrams_sent: load(&self.datagrams_sent),
            datagrams_received: load(&self.datagrams_received),
            send_syscalls: load(&self.send_syscalls),
            receive_syscalls: load(&self.receive_syscalls),
            offloaded_sends: load(&self.offloaded_sends),
            offload_fallbacks: load(&self.offload_fallbacks),
            gro_splits: load(&self.gro_splits),
            send_errors: load(&self.send_errors),
            recv_errors: load(&self.recv_errors),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_stats() {
        let stats = SocketStats::new();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());

        stats.record_send(&SendReport {
            datagrams: 4,
            bytes: 4800,
            syscalls: 1,
            offloaded: 1,
            fell_back: false,
        });
        stats.record_receive(300, 3);
        stats.record_receive(100, 1);
        stats.record_send_error();
        stats.record_recv_error();

        let snap = stats.snapshot();
        assert_eq!(snap.datagrams_sent, 4);
        assert_eq!(snap.bytes_sent, 4800);
        assert_eq!(snap.send_syscalls, 1);
        assert_eq!(snap.offloaded_sends, 1);
        assert_eq!(snap.offload_fallbacks, 0);
        assert_eq!(snap.bytes_received, 400);
        assert_eq!(snap.datagrams_received, 4);
        assert_eq!(snap.receive_syscalls, 2);
        assert_eq!(snap.gro_splits, 1);
        assert_eq!(snap.send_errors, 1);
        assert_eq!(snap.recv_errors, 1);
    }

    #[test]
    fn test_fallback_is_counted() {
        let stats = SocketStats::new();
        for _ in 1..=3 {
            stats.record_send(&SendReport {
                datagrams: 2,
                bytes: 200,
                syscalls: 3,
                offloaded: 0,
                fell_back: true,
            });
        }
        let snap = stats.snapshot();
        assert_eq!(snap.offload_fallbacks, 3);
        assert_eq!(snap.send_syscalls, 9);
        assert_eq!(snap.datagrams_sent, 6);
    }
}
