//! Socket configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Operation, SocketError, SocketResult};
use crate::offload::{UDP_GRO_CNT_MAX, UDP_MAX_SEGMENTS};
use crate::recv::{DEFAULT_MAX_UDP_PAYLOAD, MAX_RECV_BYTES};
use crate::send::{BatchLimits, MAX_BATCH_BYTES};

/// Buffer size QUIC stacks commonly request for each direction (7 MiB).
pub const DEFAULT_BUFFER_SIZE: usize = 7 * 1024 * 1024;

/// Options applied when a socket is created
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketConfig {
    /// Receive buffer request; `None` keeps the kernel default
    #[serde(default = "default_buffer_size")]
    pub recv_buffer_size: Option<usize>,
    /// Send buffer request; `None` keeps the kernel default
    #[serde(default = "default_buffer_size")]
    pub send_buffer_size: Option<usize>,
    /// Retry clamped buffer requests with the privileged option
    #[serde(default = "default_true")]
    pub force_buffer_size: bool,
    /// Coalesce outgoing batches with segmentation offload
    #[serde(default = "default_true")]
    pub gso: bool,
    /// Segment ceiling per send; `None` probes the kernel
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_gso_segments: Option<usize>,
    /// Byte budget of one outgoing batch
    #[serde(default = "default_max_batch_bytes")]
    pub max_batch_bytes: usize,
    /// Let the kernel coalesce inbound datagrams
    #[serde(default = "default_true")]
    pub gro: bool,
    /// Datagrams one receive call may return
    #[serde(default = "default_max_recv_datagrams")]
    pub max_recv_datagrams: usize,
    /// Largest single datagram expected on the path
    #[serde(default = "default_max_udp_payload")]
    pub max_udp_payload: usize,
    /// Report destination address and interface per datagram
    #[serde(default = "default_true")]
    pub pktinfo: bool,
    /// Report the ECN codepoint per datagram
    #[serde(default = "default_true")]
    pub ecn: bool,
    /// Receive deadline in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_timeout_ms: Option<u64>,
    /// Send deadline in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_timeout_ms: Option<u64>,
}

#[allow(clippy::unnecessary_wraps)]
fn default_buffer_size() -> Option<usize> {
    Some(DEFAULT_BUFFER_SIZE)
}

fn default_true() -> bool {
    true
}

fn default_max_batch_bytes() -> usize {
    MAX_BATCH_BYTES
}

fn default_max_recv_datagrams() -> usize {
    UDP_GRO_CNT_MAX
}

fn default_max_udp_payload() -> usize {
    DEFAULT_MAX_UDP_PAYLOAD
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            recv_buffer_size: default_buffer_size(),
            send_buffer_size: default_buffer_size(),
            force_buffer_size: true,
            gso: true,
            max_gso_segments: None,
            max_batch_bytes: default_max_batch_bytes(),
            gro: true,
            max_recv_datagrams: default_max_recv_datagrams(),
            max_udp_payload: default_max_udp_payload(),
            pktinfo: true,
            ecn: true,
            read_timeout_ms: None,
            write_timeout_ms: None,
        }
    }
}

impl SocketConfig {
    /// Check every field is within what the kernel accepts.
    ///
    /// # Errors
    ///
    /// [`SocketError::InvalidArgument`] naming the offending field.
    pub fn validate(&self) -> SocketResult<()> {
        let invalid = |reason: String| Err(SocketError::invalid(Operation::Configure, reason));

        if self.recv_buffer_size == Some(0) || self.send_buffer_size == Some(0) {
            return invalid("buffer sizes must be positive".to_string());
        }
        if let Some(segments) = self.max_gso_segments {
            if segments == 0 || segments > UDP_MAX_SEGMENTS {
                return invalid(format!(
                    "max_gso_segments must be between 1 and {UDP_MAX_SEGMENTS}, got {segments}"
                ));
            }
        }
        if self.max_batch_bytes == 0 || self.max_batch_bytes > MAX_BATCH_BYTES {
            return invalid(format!(
                "max_batch_bytes must be between 1 and {MAX_BATCH_BYTES}, got {}",
                self.max_batch_bytes
            ));
        }
        if self.max_recv_datagrams == 0 || self.max_recv_datagrams > UDP_GRO_CNT_MAX {
            return invalid(format!(
                "max_recv_datagrams must be between 1 and {UDP_GRO_CNT_MAX}, got {}",
                self.max_recv_datagrams
            ));
        }
        if self.max_udp_payload == 0 || self.max_udp_payload > MAX_RECV_BYTES {
            return invalid(format!(
                "max_udp_payload must be between 1 and {MAX_RECV_BYTES}, got {}",
                self.max_udp_payload
            ));
        }
        if self.read_timeout_ms == Some(0) || self.write_timeout_ms == Some(0) {
            return invalid("timeouts must be positive".to_string());
        }
        Ok(())
    }

    /// Batch limits for outgoing sends.
    #[must_use]
    pub fn batch_limits(&self) -> BatchLimits {
        BatchLimits {
            max_segments: self.max_gso_segments.unwrap_or(UDP_MAX_SEGMENTS),
            max_bytes: self.max_batch_bytes,
        }
    }

    /// Receive deadline, if any.
    #[must_use]
    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout_ms.map(Duration::from_millis)
    }

    /// Send deadline, if any.
    #[must_use]
    pub fn write_timeout(&self) -> Option<Duration> {
        self.write_timeout_ms.map(Duration::from_millis)
    }
}
