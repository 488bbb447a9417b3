//! Batched receive path.
//!
//! One `recvmsg` may return several wire datagrams coalesced by GRO. The
//! `UDP_GRO` control message gives the stride; every chunk of that size (the
//! last may be shorter) is surfaced as its own datagram carrying the parent's
//! source, destination info and ECN codepoint.
//!
//! The kernel hands over a coalesced aggregate as one unit, so the whole
//! buffer is always offered to `recvmsg`. Datagrams beyond the caller's
//! `max_datagrams` stay in the [`RecvBuffer`] and are returned by the next
//! receive call without another syscall.

use std::net::{Ipv4Addr, SocketAddr};

use tracing::{trace, warn};

use crate::cmsg::{Aligned, ControlSummary, DestinationInfo, EcnCodepoint, RECV_CONTROL_CAPACITY};
use crate::error::{Operation, SocketError, SocketResult};
use crate::offload::UDP_GRO_CNT_MAX;
use crate::raw::{DatagramIo, RawRecv};

/// Largest payload a single `recvmsg` can return.
pub const MAX_RECV_BYTES: usize = u16::MAX as usize;

/// Typical path MTU used to size receive buffers.
pub const DEFAULT_MAX_UDP_PAYLOAD: usize = 1500;

/// Datagrams of the last receive not yet handed to the caller.
#[derive(Debug, Clone, Copy)]
struct Backlog {
    start: usize,
    end: usize,
    stride: usize,
    remaining: usize,
    source: SocketAddr,
    destination: Option<DestinationInfo>,
    ecn: Option<EcnCodepoint>,
}

/// Reusable payload and ancillary storage for one receiver.
#[derive(Debug)]
pub struct RecvBuffer {
    payload: Vec<u8>,
    control: Aligned<[u8; RECV_CONTROL_CAPACITY]>,
    backlog: Option<Backlog>,
}

impl RecvBuffer {
    /// Room for `max_datagrams` datagrams of up to `max_udp_payload` bytes,
    /// capped at the largest single receive.
    ///
    /// A socket with GRO enabled needs [`RecvBuffer::coalescing`]: a smaller
    /// buffer truncates aggregates and loses their tail.
    #[must_use]
    pub fn new(max_datagrams: usize, max_udp_payload: usize) -> Self {
        let len = max_datagrams
            .max(1)
            .saturating_mul(max_udp_payload.max(1))
            .min(MAX_RECV_BYTES);
        Self::with_len(len)
    }

    /// Room for one full GRO aggregate.
    #[must_use]
    pub fn coalescing() -> Self {
        Self::with_len(MAX_RECV_BYTES)
    }

    fn with_len(len: usize) -> Self {
        Self {
            payload: vec![0; len],
            control: Aligned([0; RECV_CONTROL_CAPACITY]),
            backlog: None,
        }
    }

    /// Payload capacity in bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.payload.len()
    }

    /// Datagrams from an earlier receive still waiting to be returned.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.backlog.map_or(0, |b| b.remaining)
    }

    /// Interpret a completed `recvmsg` whose bytes sit in this buffer,
    /// replacing any backlog.
    ///
    /// Truncated bytes never become a datagram: with a GRO stride only the
    /// whole segments before the cut are kept, without one the datagram is
    /// dropped.
    fn load(&mut self, raw: RawRecv) {
        let control = &self.control.0[..raw.control_len.min(RECV_CONTROL_CAPACITY)];
        if raw.control_truncated {
            trace!(source = %raw.source, "ancillary data truncated by kernel");
        }
        let summary = ControlSummary::decode(control);
        let segment_size = summary.segment_size.map(usize::from);
        let received = raw.len.min(self.payload.len());

        let (len, stride) = if raw.truncated {
            let kept = match segment_size {
                Some(size) => received - received % size,
                None => 0,
            };
            warn!(
                source = %raw.source,
                capacity = self.capacity(),
                kept,
                dropped = received - kept,
                "receive truncated, partial datagram dropped"
            );
            (kept, segment_size.unwrap_or(kept))
        } else {
            match segment_size {
                Some(size) if size < received => {
                    trace!(
                        source = %raw.source,
                        bytes = received,
                        segment_size = size,
                        "splitting coalesced receive"
                    );
                    (received, size)
                }
                _ => (received, received),
            }
        };

        let remaining = match (raw.truncated, len) {
            (true, 0) => 0,
            // A zero-length datagram is still a datagram
            (false, 0) => 1,
            _ => len.div_ceil(stride),
        };
        self.backlog = Some(Backlog {
            start: 0,
            end: len,
            stride,
            remaining,
            source: raw.source,
            destination: summary.destination,
            ecn: summary.ecn,
        });
    }

    /// Hand out up to `max_datagrams` pending datagrams.
    ///
    /// Yields nothing when no receive is pending.
    pub fn drain(&mut self, max_datagrams: usize) -> ReceivedDatagrams<'_> {
        let Some(backlog) = self.backlog.as_mut() else {
            return ReceivedDatagrams {
                payload: &[],
                stride: 0,
                count: 0,
                source: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
                destination: None,
                ecn: None,
            };
        };

        let count = max_datagrams.min(backlog.remaining);
        let start = backlog.start;
        let end = if count == backlog.remaining {
            backlog.end
        } else {
            start + count * backlog.stride
        };
        backlog.start = end;
        backlog.remaining -= count;
        let snapshot = *backlog;
        if snapshot.remaining == 0 {
            self.backlog = None;
        }

        ReceivedDatagrams {
            payload: &self.payload[start..end],
            stride: snapshot.stride,
            count,
            source: snapshot.source,
            destination: snapshot.destination,
            ecn: snapshot.ecn,
        }
    }
}

impl Default for RecvBuffer {
    fn default() -> Self {
        Self::new(UDP_GRO_CNT_MAX, DEFAULT_MAX_UDP_PAYLOAD)
    }
}

/// One application-visible datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceivedDatagram<'b> {
    /// Datagram bytes
    pub payload: &'b [u8],
    /// Sender
    pub source: SocketAddr,
    /// Local destination and receiving interface, if `PKTINFO` is enabled
    pub destination: Option<DestinationInfo>,
    /// ECN codepoint, if the traffic class was delivered and ECN-capable
    pub ecn: Option<EcnCodepoint>,
}

/// Datagrams produced by one receive call, in kernel order.
///
/// Lazy and consumed once; borrows the [`RecvBuffer`] until dropped.
#[derive(Debug)]
pub struct ReceivedDatagrams<'b> {
    payload: &'b [u8],
    stride: usize,
    count: usize,
    source: SocketAddr,
    destination: Option<DestinationInfo>,
    ecn: Option<EcnCodepoint>,
}

impl ReceivedDatagrams<'_> {
    /// Sender shared by every datagram of this receive.
    #[must_use]
    pub fn source(&self) -> SocketAddr {
        self.source
    }

    /// Segment stride; equals the whole payload when nothing was coalesced.
    #[must_use]
    pub fn stride(&self) -> usize {
        self.stride
    }
}

impl<'b> Iterator for ReceivedDatagrams<'b> {
    type Item = ReceivedDatagram<'b>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.count == 0 {
            return None;
        }
        self.count -= 1;
        let payload = if self.count == 0 {
            std::mem::take(&mut self.payload)
        } else {
            let (head, tail) = self.payload.split_at(self.stride.min(self.payload.len()));
            self.payload = tail;
            head
        };
        Some(ReceivedDatagram {
            payload,
            source: self.source,
            destination: self.destination,
            ecn: self.ecn,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.count, Some(self.count))
    }
}

impl ExactSizeIterator for ReceivedDatagrams<'_> {}

pub(crate) fn check_max_datagrams(max_datagrams: usize) -> SocketResult<()> {
    if max_datagrams == 0 {
        return Err(SocketError::invalid(
            Operation::Receive,
            "max_datagrams must be positive",
        ));
    }
    Ok(())
}

/// Issue one receive into the whole of `buf` and load the result, dropping
/// any backlog.
///
/// Hand the datagrams out with [`RecvBuffer::drain`].
pub fn receive_raw<I: DatagramIo + ?Sized>(io: &I, buf: &mut RecvBuffer) -> SocketResult<RawRecv> {
    let raw = io
        .recv_msg(&mut buf.payload, &mut buf.control.0)
        .map_err(|e| SocketError::from_io(Operation::Receive, e))?;
    buf.load(raw);
    Ok(raw)
}

/// Return up to `max_datagrams` datagrams, receiving once if nothing is
/// pending in `buf`.
///
/// # Errors
///
/// [`SocketError::InvalidArgument`] for `max_datagrams == 0`; otherwise the
/// classified OS error. Malformed ancillary data never fails the call.
pub fn receive_batch<'b, I: DatagramIo + ?Sized>(
    io: &I,
    buf: &'b mut RecvBuffer,
    max_datagrams: usize,
) -> SocketResult<ReceivedDatagrams<'b>> {
    check_max_datagrams(max_datagrams)?;
    if buf.pending() == 0 {
        receive_raw(io, buf)?;
    }
    Ok(buf.drain(max_datagrams))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmsg::Encoder;
    use std::cell::{Cell, RefCell};
    use std::io;
    use std::net::{IpAddr, Ipv4Addr};

    /// Returns one scripted receive.
    struct ScriptedIo {
        payload: Vec<u8>,
        control: Vec<u8>,
        error: Option<io::ErrorKind>,
        offered: Cell<usize>,
        calls: RefCell<usize>,
    }

    impl ScriptedIo {
        fn new(payload: Vec<u8>, control: Vec<u8>) -> Self {
            Self {
                payload,
                control,
                error: None,
                offered: Cell::new(0),
                calls: RefCell::new(0),
            }
        }
    }

    impl DatagramIo for ScriptedIo {
        fn send_msg(&self, _dst: SocketAddr, _payload: &[u8], _control: &[u8]) -> io::Result<usize> {
            Err(io::Error::from(io::ErrorKind::Unsupported))
        }

        fn recv_msg(&self, payload: &mut [u8], control: &mut [u8]) -> io::Result<RawRecv> {
            *self.calls.borrow_mut() += 1;
            self.offered.set(payload.len());
            if let Some(kind) = self.error {
                return Err(io::Error::from(kind));
            }
            let len = self.payload.len().min(payload.len());
            payload[..len].copy_from_slice(&self.payload[..len]);
            control[..self.control.len()].copy_from_slice(&self.control);
            Ok(RawRecv {
                len,
                source: "198.51.100.7:9000".parse().unwrap(),
                control_len: self.control.len(),
                truncated: len < self.payload.len(),
                control_truncated: false,
            })
        }
    }

    fn control(gro: Option<i32>, with_pktinfo: bool) -> Vec<u8> {
        let mut buf = vec![0u8; RECV_CONTROL_CAPACITY];
        let mut encoder = Encoder::new(&mut buf);
        if with_pktinfo {
            let mut body = Vec::new();
            body.extend_from_slice(&2u32.to_ne_bytes());
            body.extend_from_slice(&[0, 0, 0, 0]);
            body.extend_from_slice(&[10, 1, 2, 3]);
            encoder.push(libc::IPPROTO_IP, libc::IP_PKTINFO, &body);
        }
        encoder.push(libc::IPPROTO_IP, libc::IP_TOS, &[0b01]);
        if let Some(size) = gro {
            encoder.push(libc::SOL_UDP, libc::UDP_GRO, &size.to_ne_bytes());
        }
        let len = encoder.finish();
        buf.truncate(len);
        buf
    }

    fn lengths(io: &ScriptedIo) -> Vec<usize> {
        let mut buf = RecvBuffer::default();
        receive_batch(io, &mut buf, UDP_GRO_CNT_MAX)
            .unwrap()
            .map(|d| d.payload.len())
            .collect()
    }

    #[test]
    fn test_gro_receive_is_split_with_shared_metadata() {
        let payload: Vec<u8> = (0..300u16).map(|i| (i / 100) as u8).collect();
        let io = ScriptedIo::new(payload, control(Some(100), true));
        let mut buf = RecvBuffer::default();

        let datagrams = receive_batch(&io, &mut buf, UDP_GRO_CNT_MAX).unwrap();
        assert_eq!(datagrams.len(), 3);
        let datagrams: Vec<_> = datagrams.collect();
        for (i, datagram) in datagrams.iter().enumerate() {
            assert_eq!(datagram.payload, &[i as u8; 100][..]);
            assert_eq!(datagram.source, "198.51.100.7:9000".parse::<SocketAddr>().unwrap());
            let destination = datagram.destination.unwrap();
            assert_eq!(destination.interface_index, 2);
            assert_eq!(destination.address, IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3)));
            assert_eq!(datagram.ecn, Some(EcnCodepoint::Ect1));
        }
    }

    #[test]
    fn test_gro_remainder_is_final_datagram() {
        let io = ScriptedIo::new(vec![7; 250], control(Some(100), false));
        assert_eq!(lengths(&io), vec![100, 100, 50]);
    }

    #[test]
    fn test_segment_size_not_smaller_than_payload() {
        let io = ScriptedIo::new(vec![7; 100], control(Some(100), false));
        assert_eq!(lengths(&io), vec![100]);
        let io = ScriptedIo::new(vec![7; 80], control(Some(1200), false));
        assert_eq!(lengths(&io), vec![80]);
    }

    #[test]
    fn test_without_segment_size_one_datagram() {
        let io = ScriptedIo::new(vec![1; 1400], control(None, true));
        assert_eq!(lengths(&io), vec![1400]);
    }

    #[test]
    fn test_empty_datagram_is_delivered() {
        let io = ScriptedIo::new(Vec::new(), Vec::new());
        let mut buf = RecvBuffer::default();
        let datagrams: Vec<_> = receive_batch(&io, &mut buf, 1).unwrap().collect();
        assert_eq!(datagrams.len(), 1);
        assert!(datagrams[0].payload.is_empty());
        assert_eq!(datagrams[0].destination, None);
        assert_eq!(datagrams[0].ecn, None);
    }

    #[test]
    fn test_truncated_control_does_not_fail_receive() {
        let mut ctl = control(Some(100), true);
        ctl.truncate(20);
        let io = ScriptedIo::new(vec![3; 200], ctl);
        let mut buf = RecvBuffer::default();
        let datagrams: Vec<_> = receive_batch(&io, &mut buf, UDP_GRO_CNT_MAX).unwrap().collect();
        assert_eq!(datagrams.len(), 1);
        assert_eq!(datagrams[0].destination, None);
    }

    #[test]
    fn test_zero_max_datagrams_is_invalid() {
        let io = ScriptedIo::new(vec![1], Vec::new());
        let mut buf = RecvBuffer::default();
        let err = receive_batch(&io, &mut buf, 0).unwrap_err();
        assert!(matches!(err, SocketError::InvalidArgument { op: Operation::Receive, .. }));
        assert_eq!(*io.calls.borrow(), 0);
    }

    #[test]
    fn test_would_block_is_timeout() {
        let mut io = ScriptedIo::new(vec![1], Vec::new());
        io.error = Some(io::ErrorKind::WouldBlock);
        let mut buf = RecvBuffer::default();
        let err = receive_batch(&io, &mut buf, 4).unwrap_err();
        assert!(matches!(err, SocketError::Timeout { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_whole_buffer_offered_regardless_of_max() {
        let io = ScriptedIo::new(vec![1; 10], Vec::new());
        let mut buf = RecvBuffer::new(64, 1500);
        assert_eq!(buf.capacity(), MAX_RECV_BYTES);

        receive_batch(&io, &mut buf, 2).unwrap().for_each(drop);
        assert_eq!(io.offered.get(), MAX_RECV_BYTES);
        receive_batch(&io, &mut buf, 64).unwrap().for_each(drop);
        assert_eq!(io.offered.get(), MAX_RECV_BYTES);
        assert_eq!(RecvBuffer::coalescing().capacity(), MAX_RECV_BYTES);
    }

    #[test]
    fn test_aggregate_beyond_max_is_kept_for_next_call() {
        let payload: Vec<u8> = (0..12_000u32).map(|i| (i / 1200) as u8).collect();
        let io = ScriptedIo::new(payload, control(Some(1200), false));
        let mut buf = RecvBuffer::coalescing();

        let mut received = Vec::new();
        for _ in 0..10 {
            let datagrams = receive_batch(&io, &mut buf, 1).unwrap();
            assert_eq!(datagrams.len(), 1);
            received.extend(datagrams.map(|d| d.payload.to_vec()));
        }
        assert_eq!(*io.calls.borrow(), 1);
        assert_eq!(buf.pending(), 0);
        assert_eq!(received.len(), 10);
        for (i, datagram) in received.iter().enumerate() {
            assert_eq!(datagram, &vec![i as u8; 1200]);
        }

        // Backlog drained, so the next call goes to the kernel again
        receive_batch(&io, &mut buf, 1).unwrap().for_each(drop);
        assert_eq!(*io.calls.borrow(), 2);
    }

    #[test]
    fn test_backlog_respects_max_and_keeps_tail() {
        let io = ScriptedIo::new(vec![5; 1000], control(Some(300), true));
        let mut buf = RecvBuffer::coalescing();

        let first: Vec<usize> = receive_batch(&io, &mut buf, 2)
            .unwrap()
            .map(|d| d.payload.len())
            .collect();
        assert_eq!(first, vec![300, 300]);
        assert_eq!(buf.pending(), 2);

        let rest: Vec<_> = receive_batch(&io, &mut buf, 64).unwrap().collect();
        assert_eq!(rest.iter().map(|d| d.payload.len()).collect::<Vec<_>>(), vec![300, 100]);
        assert!(rest.iter().all(|d| d.destination.is_some()));
        assert_eq!(*io.calls.borrow(), 1);
    }

    #[test]
    fn test_truncated_aggregate_keeps_whole_segments() {
        let io = ScriptedIo::new(vec![9; 12_000], control(Some(1200), false));
        let mut buf = RecvBuffer::new(4, 1500);
        assert_eq!(buf.capacity(), 6000);

        let sizes: Vec<usize> = receive_batch(&io, &mut buf, 64)
            .unwrap()
            .map(|d| d.payload.len())
            .collect();
        assert_eq!(sizes, vec![1200; 5]);

        let io = ScriptedIo::new(vec![9; 12_000], control(Some(1400), false));
        let sizes: Vec<usize> = receive_batch(&io, &mut buf, 64)
            .unwrap()
            .map(|d| d.payload.len())
            .collect();
        // 6000 bytes hold four whole segments; the 400-byte cut is dropped
        assert_eq!(sizes, vec![1400; 4]);
    }

    #[test]
    fn test_truncated_single_datagram_is_dropped() {
        let io = ScriptedIo::new(vec![9; 3000], control(None, true));
        let mut buf = RecvBuffer::new(1, 1500);
        let datagrams = receive_batch(&io, &mut buf, 64).unwrap();
        assert_eq!(datagrams.len(), 0);
        assert_eq!(datagrams.count(), 0);
        assert_eq!(buf.pending(), 0);
    }

    #[test]
    fn test_drain_without_receive_is_empty() {
        let mut buf = RecvBuffer::default();
        assert_eq!(buf.drain(8).len(), 0);
    }
}
