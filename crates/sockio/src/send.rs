//! Batched send path with segmentation offload.
//!
//! A batch of equal-size payloads (the final one may be shorter) is
//! concatenated and handed to the kernel in one `sendmsg` carrying a
//! `UDP_SEGMENT` directive. If the kernel rejects offload, the socket's
//! [`OffloadState`] is disabled for good and the batch is resent one payload
//! per call.

use std::net::SocketAddr;

use tracing::{error, trace};

use crate::cmsg::SegmentationDirective;
use crate::error::{Operation, SocketError, SocketResult};
use crate::offload::{self, OffloadState, UDP_MAX_SEGMENTS};
use crate::raw::DatagramIo;

/// Largest UDP payload one IPv4 datagram can carry; also the kernel's cap on
/// a segmented send's total length.
pub const MAX_BATCH_BYTES: usize = 65_507;

/// Upper bounds on one outgoing batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    /// Most payloads per batch
    pub max_segments: usize,
    /// Most bytes across all payloads
    pub max_bytes: usize,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            max_segments: UDP_MAX_SEGMENTS,
            max_bytes: MAX_BATCH_BYTES,
        }
    }
}

/// A validated batch: one destination, non-empty payloads, all but the last
/// of identical length, the last no longer than the rest.
#[derive(Debug)]
pub struct OutgoingBatch<'a, P> {
    destination: SocketAddr,
    payloads: &'a [P],
    segment_size: usize,
    total_bytes: usize,
}

impl<'a, P: AsRef<[u8]>> OutgoingBatch<'a, P> {
    /// Validate `payloads` for sending to `destination`.
    ///
    /// # Errors
    ///
    /// [`SocketError::InvalidArgument`] if the batch is empty, contains an
    /// empty payload, breaks the uniform-length rule or exceeds `limits`.
    pub fn new(
        destination: SocketAddr,
        payloads: &'a [P],
        limits: &BatchLimits,
    ) -> SocketResult<Self> {
        let invalid = |reason: String| Err(SocketError::invalid(Operation::Send, reason));

        let Some(first) = payloads.first() else {
            return invalid("empty batch".to_string());
        };
        if payloads.len() > limits.max_segments {
            return invalid(format!(
                "{} payloads exceed the limit of {}",
                payloads.len(),
                limits.max_segments
            ));
        }

        let segment_size = first.as_ref().len();
        if segment_size > usize::from(u16::MAX) {
            return invalid(format!("payload of {segment_size} bytes exceeds a UDP datagram"));
        }

        let last = payloads.len() - 1;
        let mut total_bytes = 0usize;
        for (index, payload) in payloads.iter().enumerate() {
            let len = payload.as_ref().len();
            if len == 0 {
                return invalid(format!("payload {index} is empty"));
            }
            if index < last && len != segment_size {
                return invalid(format!(
                    "payload {index} is {len} bytes, expected {segment_size}"
                ));
            }
            if index == last && len > segment_size {
                return invalid(format!(
                    "final payload of {len} bytes exceeds segment size {segment_size}"
                ));
            }
            total_bytes += len;
        }

        if total_bytes > limits.max_bytes {
            return invalid(format!(
                "batch of {total_bytes} bytes exceeds the limit of {}",
                limits.max_bytes
            ));
        }

        Ok(Self {
            destination,
            payloads,
            segment_size,
            total_bytes,
        })
    }

    /// Peer address.
    #[must_use]
    pub fn destination(&self) -> SocketAddr {
        self.destination
    }

    /// The payloads, in send order.
    #[must_use]
    pub fn payloads(&self) -> &'a [P] {
        self.payloads
    }

    /// Number of payloads.
    #[must_use]
    pub fn len(&self) -> usize {
        self.payloads.len()
    }

    /// Always false for a validated batch.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }

    /// Length of the first payload.
    #[must_use]
    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    /// Bytes across all payloads.
    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }
}

/// How many payloads of a batch the kernel has already accepted.
///
/// Carry the same cursor across retries of one batch so a would-block or
/// transient failure resumes without duplicating datagrams.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SendProgress {
    sent: usize,
    total: SendReport,
}

impl SendProgress {
    /// Cursor at the start of a batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Payloads accepted so far.
    #[must_use]
    pub fn sent(&self) -> usize {
        self.sent
    }

    /// Everything done for this batch across all calls so far.
    #[must_use]
    pub fn total(&self) -> SendReport {
        self.total
    }

    /// Whether every payload of `batch` has been accepted.
    #[must_use]
    pub fn is_complete<P: AsRef<[u8]>>(&self, batch: &OutgoingBatch<'_, P>) -> bool {
        self.sent >= batch.len()
    }

    /// Rewind for a new batch.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// What one [`send_batch`] call did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SendReport {
    /// Payloads accepted by the kernel during this call
    pub datagrams: usize,
    /// Bytes accepted by the kernel during this call
    pub bytes: usize,
    /// `sendmsg` calls issued, including a rejected coalesced attempt
    pub syscalls: usize,
    /// Coalesced sends the kernel accepted
    pub offloaded: usize,
    /// Whether this call disabled offload and fell back
    pub fell_back: bool,
}

impl SendReport {
    /// Fold `other` into `self`.
    pub fn merge(&mut self, other: &SendReport) {
        self.datagrams += other.datagrams;
        self.bytes += other.bytes;
        self.syscalls += other.syscalls;
        self.offloaded += other.offloaded;
        self.fell_back |= other.fell_back;
    }
}

fn send_failed(err: std::io::Error) -> SocketError {
    SocketError::from_io(Operation::Send, err)
}

/// Send every not-yet-sent payload of `batch`.
///
/// With offload enabled, consecutive runs of up to
/// [`OffloadState::max_segments`] payloads go out as one coalesced send. A
/// run of one payload, or any payload once offload is disabled, goes out on
/// its own without a control message.
///
/// Returns what this call did; [`SendProgress::total`] accumulates across
/// retries of the same batch.
///
/// # Errors
///
/// Any failure other than an offload rejection is returned after
/// classification; `progress` records what was accepted before it.
pub fn send_batch<I, P>(
    io: &I,
    offload: &OffloadState,
    batch: &OutgoingBatch<'_, P>,
    progress: &mut SendProgress,
) -> SocketResult<SendReport>
where
    I: DatagramIo + ?Sized,
    P: AsRef<[u8]>,
{
    let mut report = SendReport::default();
    let result = drive(io, offload, batch, &mut progress.sent, &mut report);
    progress.total.merge(&report);
    result.map(|()| report)
}

fn drive<I, P>(
    io: &I,
    offload: &OffloadState,
    batch: &OutgoingBatch<'_, P>,
    sent: &mut usize,
    report: &mut SendReport,
) -> SocketResult<()>
where
    I: DatagramIo + ?Sized,
    P: AsRef<[u8]>,
{
    let dst = batch.destination();
    let payloads = batch.payloads();
    let mut coalesced = Vec::new();

    while *sent < payloads.len() {
        let remaining = &payloads[*sent..];
        let run = remaining.len().min(offload.max_segments());

        if offload.is_enabled() && run > 1 {
            let chunk = &remaining[..run];
            coalesced.clear();
            for payload in chunk {
                coalesced.extend_from_slice(payload.as_ref());
            }
            // segment_size fits u16, checked when the batch was built
            let directive = SegmentationDirective::new(batch.segment_size() as u16);

            report.syscalls += 1;
            match io.send_msg(dst, &coalesced, directive.as_bytes()) {
                Ok(_) => {
                    trace!(
                        %dst,
                        segments = run,
                        segment_size = batch.segment_size(),
                        bytes = coalesced.len(),
                        "coalesced send"
                    );
                    *sent += run;
                    report.datagrams += run;
                    report.bytes += coalesced.len();
                    report.offloaded += 1;
                    continue;
                }
                Err(e) if offload::is_offload_unsupported(Some(&e)) => {
                    if offload.disable() {
                        error!(%dst, error = %e, "kernel rejected segmentation offload, disabling it for this socket");
                    }
                    report.fell_back = true;
                    continue;
                }
                Err(e) => return Err(send_failed(e)),
            }
        }

        let payload = remaining[0].as_ref();
        report.syscalls += 1;
        io.send_msg(dst, payload, &[]).map_err(send_failed)?;
        *sent += 1;
        report.datagrams += 1;
        report.bytes += payload.len();
    }

    Ok(())
}
