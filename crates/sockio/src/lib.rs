//! # sockio
//!
//! UDP datagram I/O for QUIC endpoints on Linux.
//!
//! This crate provides:
//! - Socket buffer capacity control with a privileged override path
//! - A bounds-checked control-message codec (`UDP_SEGMENT`, `UDP_GRO`,
//!   `IP_PKTINFO`/`IPV6_PKTINFO`, TOS/traffic class)
//! - Batched sends using generic segmentation offload, with a sticky
//!   per-socket fallback when the kernel rejects it
//! - Batched receives that split GRO-coalesced buffers back into datagrams
//! - Blocking and Tokio socket handles built on the above

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;

pub use error::{Operation, SocketError, SocketResult};

// Everything below talks to Linux-specific socket options
#[cfg(target_os = "linux")]
pub mod async_socket;
#[cfg(target_os = "linux")]
pub mod capacity;
#[cfg(target_os = "linux")]
pub mod cmsg;
#[cfg(target_os = "linux")]
pub mod config;
#[cfg(target_os = "linux")]
pub mod offload;
#[cfg(target_os = "linux")]
pub mod raw;
#[cfg(target_os = "linux")]
pub mod recv;
#[cfg(target_os = "linux")]
pub mod send;
#[cfg(target_os = "linux")]
pub mod socket;
#[cfg(target_os = "linux")]
pub mod stats;
#[cfg(target_os = "linux")]
mod sys;

#[cfg(target_os = "linux")]
pub use async_socket::AsyncUdpSocket;
#[cfg(target_os = "linux")]
pub use config::SocketConfig;
#[cfg(target_os = "linux")]
pub use offload::is_offload_unsupported;
#[cfg(target_os = "linux")]
pub use recv::{ReceivedDatagram, ReceivedDatagrams, RecvBuffer};
#[cfg(target_os = "linux")]
pub use send::{OutgoingBatch, SendProgress, SendReport};
#[cfg(target_os = "linux")]
pub use socket::UdpSocket;
