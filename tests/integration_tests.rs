//! Integration tests over real loopback sockets.
//!
//! Exercises the batched send and receive paths against the kernel:
//! segmentation offload on send, GRO splitting and ancillary data on
//! receive, buffer capacity control and the Tokio handle.
//!
//! Capacity tests that need `CAP_NET_ADMIN` return early unless run as root
//! (`cargo xtask privileged`).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::AsRawFd;
use std::time::Duration;

use sockio::cmsg::EcnCodepoint;
use sockio::{AsyncUdpSocket, SocketConfig, SocketError, UdpSocket};
use sockio_integration_tests::test_helpers::{
    ci_timeout, ipv6_available, is_root, loopback_config, loopback_pair, receive_exactly,
    receive_in_batches_of,
};

const KIB: usize = 1024;
const MIB: usize = 1024 * KIB;

fn deadline() -> Duration {
    ci_timeout(Duration::from_secs(2))
}

fn numbered(count: usize, size: usize) -> Vec<Vec<u8>> {
    (0..count).map(|i| vec![i as u8; size]).collect()
}

// ============================================================================
// Batched Send / Receive
// ============================================================================

/// A batch arrives as the same datagrams, in order, whether or not the
/// kernel segmented it.
#[test]
fn test_batch_arrives_as_individual_datagrams() {
    let (sender, receiver) = loopback_pair(&loopback_config());
    let payloads = numbered(8, 1200);

    let report = sender.send_batch(receiver.local_addr(), &payloads).unwrap();
    assert_eq!(report.datagrams, 8);
    assert_eq!(report.bytes, 8 * 1200);
    if sender.offload_enabled() && sender.max_gso_segments() >= 8 {
        assert_eq!(report.syscalls, 1);
        assert_eq!(report.offloaded, 1);
    } else {
        assert_eq!(report.syscalls, 8);
    }

    let (received, calls) = receive_exactly(&receiver, 8, deadline());
    assert_eq!(received.len(), 8);
    assert!((1..=8).contains(&calls));
    for (datagram, expected) in received.iter().zip(&payloads) {
        assert_eq!(&datagram.payload, expected);
        assert_eq!(datagram.source, sender.local_addr());
    }
}

/// The last datagram of a batch may be shorter than the rest.
#[test]
fn test_short_final_datagram() {
    let (sender, receiver) = loopback_pair(&loopback_config());
    let mut payloads = numbered(4, 1000);
    payloads.push(vec![0xAB; 123]);

    sender.send_batch(receiver.local_addr(), &payloads).unwrap();

    let (received, _) = receive_exactly(&receiver, 5, deadline());
    let sizes: Vec<usize> = received.iter().map(|d| d.payload.len()).collect();
    assert_eq!(sizes, vec![1000, 1000, 1000, 1000, 123]);
    assert_eq!(received[4].payload, vec![0xAB; 123]);
}

/// Batches larger than the segment ceiling go out in several runs.
#[test]
fn test_batch_above_segment_ceiling() {
    let config = SocketConfig {
        max_gso_segments: Some(4),
        ..loopback_config()
    };
    let (sender, receiver) = loopback_pair(&config);
    let payloads = numbered(10, 200);

    let report = sender.send_batch(receiver.local_addr(), &payloads).unwrap();
    assert_eq!(report.datagrams, 10);
    if sender.offload_enabled() {
        assert_eq!(sender.max_gso_segments(), 4);
        // 4 + 4 coalesced, then 2 coalesced
        assert_eq!(report.syscalls, 3);
    }

    let (received, _) = receive_exactly(&receiver, 10, deadline());
    let firsts: Vec<u8> = received.iter().map(|d| d.payload[0]).collect();
    assert_eq!(firsts, (0..10).collect::<Vec<u8>>());
}

/// With offload turned off every datagram costs a syscall.
#[test]
fn test_send_without_offload() {
    let config = SocketConfig {
        gso: false,
        gro: false,
        ..loopback_config()
    };
    let (sender, receiver) = loopback_pair(&config);
    assert!(!sender.offload_enabled());
    assert_eq!(sender.max_gso_segments(), 1);

    let report = sender.send_batch(receiver.local_addr(), &numbered(6, 300)).unwrap();
    assert_eq!(report.syscalls, 6);
    assert_eq!(report.offloaded, 0);
    assert!(!report.fell_back);

    let (received, calls) = receive_exactly(&receiver, 6, deadline());
    assert_eq!(received.len(), 6);
    // Without GRO each receive call yields one datagram
    assert_eq!(calls, 6);
}

/// A coalesced aggregate larger than the caller's limit is handed out across
/// several calls without losing or truncating any datagram.
#[test]
fn test_offloaded_batch_received_with_small_limit() {
    let (sender, receiver) = loopback_pair(&loopback_config());
    let payloads = numbered(10, 1200);
    sender.send_batch(receiver.local_addr(), &payloads).unwrap();

    let (received, calls) = receive_in_batches_of(&receiver, 10, 1, deadline());
    assert_eq!(calls, 10);
    let got: Vec<Vec<u8>> = received.into_iter().map(|d| d.payload).collect();
    assert_eq!(got, payloads);

    let stats = receiver.stats();
    assert_eq!(stats.datagrams_received, 10);
    assert_eq!(stats.bytes_received, 12_000);
    assert!(stats.receive_syscalls <= 10);
}

/// Each datagram carries the local destination address and interface.
#[test]
fn test_receive_reports_destination() {
    let (sender, receiver) = loopback_pair(&loopback_config());
    sender.send_batch(receiver.local_addr(), &[b"ping"]).unwrap();

    let (received, _) = receive_exactly(&receiver, 1, deadline());
    let destination = received[0].destination.expect("pktinfo enabled by default");
    assert_eq!(destination.address, IpAddr::V4(Ipv4Addr::LOCALHOST));
    assert_ne!(destination.interface_index, 0);
}

#[test]
fn test_ipv6_destination() {
    if !ipv6_available() {
        return;
    }
    let config = loopback_config();
    let addr: SocketAddr = "[::1]:0".parse().unwrap();
    let sender = UdpSocket::bind(addr, &config).unwrap();
    let receiver = UdpSocket::bind(addr, &config).unwrap();

    let report = sender
        .send_batch(receiver.local_addr(), &numbered(3, 512))
        .unwrap();
    assert_eq!(report.datagrams, 3);

    let (received, _) = receive_exactly(&receiver, 3, deadline());
    assert_eq!(received.len(), 3);
    for datagram in &received {
        assert_eq!(datagram.source, sender.local_addr());
        let destination = datagram.destination.expect("pktinfo enabled by default");
        assert_eq!(destination.address, IpAddr::V6(Ipv6Addr::LOCALHOST));
    }
}

/// A TOS byte set on the sender shows up as the ECN codepoint.
#[test]
fn test_receive_reports_ecn() {
    let (sender, receiver) = loopback_pair(&loopback_config());
    let tos: libc::c_int = 0b10;
    // SAFETY: the option value points at a live c_int of the advertised size.
    let rc = unsafe {
        libc::setsockopt(
            sender.as_std().as_raw_fd(),
            libc::IPPROTO_IP,
            libc::IP_TOS,
            (&tos as *const libc::c_int).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    assert_eq!(rc, 0);

    sender.send_batch(receiver.local_addr(), &[b"marked"]).unwrap();
    let (received, _) = receive_exactly(&receiver, 1, deadline());
    assert_eq!(received[0].ecn, Some(EcnCodepoint::Ect0));
}

#[test]
fn test_unmarked_datagram_has_no_ecn() {
    let (sender, receiver) = loopback_pair(&loopback_config());
    sender.send_batch(receiver.local_addr(), &[b"plain"]).unwrap();

    let (received, _) = receive_exactly(&receiver, 1, deadline());
    assert_eq!(received[0].ecn, None);
}

#[test]
fn test_counters_track_traffic() {
    let (sender, receiver) = loopback_pair(&loopback_config());
    sender
        .send_batch(receiver.local_addr(), &numbered(5, 100))
        .unwrap();
    let (received, calls) = receive_exactly(&receiver, 5, deadline());
    assert_eq!(received.len(), 5);

    let sent = sender.stats();
    assert_eq!(sent.datagrams_sent, 5);
    assert_eq!(sent.bytes_sent, 500);
    assert_eq!(sent.send_errors, 0);

    let got = receiver.stats();
    assert_eq!(got.datagrams_received, 5);
    assert_eq!(got.bytes_received, 500);
    assert_eq!(got.receive_syscalls, calls as u64);
}

#[test]
fn test_invalid_batches_rejected_before_sending() {
    let (sender, receiver) = loopback_pair(&loopback_config());
    let dst = receiver.local_addr();

    let uneven = vec![vec![0u8; 100], vec![0u8; 90], vec![0u8; 100]];
    assert!(matches!(
        sender.send_batch(dst, &uneven),
        Err(SocketError::InvalidArgument { .. })
    ));

    let longer_tail = vec![vec![0u8; 100], vec![0u8; 101]];
    assert!(matches!(
        sender.send_batch(dst, &longer_tail),
        Err(SocketError::InvalidArgument { .. })
    ));

    let too_many = numbered(65, 10);
    assert!(matches!(
        sender.send_batch(dst, &too_many),
        Err(SocketError::InvalidArgument { .. })
    ));

    assert_eq!(sender.stats().datagrams_sent, 0);
}

// ============================================================================
// Buffer Capacity
// ============================================================================

/// Without privileges a large request is either honored or reported.
#[test]
fn test_unprivileged_large_request() {
    let socket = UdpSocket::bind("127.0.0.1:0".parse().unwrap(), &loopback_config()).unwrap();
    match socket.set_send_capacity(32 * MIB) {
        Ok(effective) => assert!(effective >= 64 * MIB),
        Err(e) => assert!(
            matches!(
                e,
                SocketError::Permission { .. } | SocketError::CapacityClamped { .. }
            ),
            "unexpected error: {e}"
        ),
    }
}

#[test]
fn test_small_request_doubles() {
    let socket = UdpSocket::bind("127.0.0.1:0".parse().unwrap(), &loopback_config()).unwrap();
    let effective = socket.set_receive_capacity(64 * KIB).unwrap();
    assert_eq!(effective, 128 * KIB);
    assert_eq!(socket.effective_receive_capacity().unwrap(), 128 * KIB);
}

#[test]
fn test_forced_receive_capacity() {
    if !is_root() {
        return;
    }
    let socket = UdpSocket::bind("127.0.0.1:0".parse().unwrap(), &loopback_config()).unwrap();

    assert_eq!(socket.force_receive_capacity(256 * KIB).unwrap(), 512 * KIB);
    assert_eq!(socket.effective_receive_capacity().unwrap(), 512 * KIB);

    assert_eq!(socket.force_receive_capacity(32 * MIB).unwrap(), 64 * MIB);
    assert_eq!(socket.effective_receive_capacity().unwrap(), 64 * MIB);
}

#[test]
fn test_forced_send_capacity() {
    if !is_root() {
        return;
    }
    let socket = UdpSocket::bind("127.0.0.1:0".parse().unwrap(), &loopback_config()).unwrap();

    assert_eq!(socket.force_send_capacity(256 * KIB).unwrap(), 512 * KIB);
    assert_eq!(socket.effective_send_capacity().unwrap(), 512 * KIB);

    assert_eq!(socket.force_send_capacity(32 * MIB).unwrap(), 64 * MIB);
    assert_eq!(socket.effective_send_capacity().unwrap(), 64 * MIB);
}

/// The fallback path reaches the target when the normal path is clamped.
#[test]
fn test_set_capacity_falls_back_to_force() {
    if !is_root() {
        return;
    }
    let socket = UdpSocket::bind("127.0.0.1:0".parse().unwrap(), &loopback_config()).unwrap();
    assert_eq!(socket.set_receive_capacity(32 * MIB).unwrap(), 64 * MIB);
    assert_eq!(socket.set_send_capacity(32 * MIB).unwrap(), 64 * MIB);
}

#[test]
fn test_forced_capacity_without_privilege() {
    if is_root() {
        return;
    }
    let socket = UdpSocket::bind("127.0.0.1:0".parse().unwrap(), &loopback_config()).unwrap();
    let err = socket.force_receive_capacity(32 * MIB).unwrap_err();
    assert!(matches!(err, SocketError::Permission { .. }), "got {err}");
}

// ============================================================================
// Async Socket
// ============================================================================

#[tokio::test]
async fn test_async_echo_round_trip() {
    let config = loopback_config();
    let server = AsyncUdpSocket::bind("127.0.0.1:0".parse().unwrap(), &config)
        .await
        .unwrap();
    let client = AsyncUdpSocket::bind("127.0.0.1:0".parse().unwrap(), &config)
        .await
        .unwrap();

    let echo = {
        let server = server.clone();
        tokio::spawn(async move {
            let mut buf = server.recv_buffer();
            let mut echoed = 0;
            while echoed < 16 {
                let datagrams = server.receive_batch(&mut buf, 64).await.unwrap();
                let source = datagrams.source();
                let payloads: Vec<Vec<u8>> = datagrams.map(|d| d.payload.to_vec()).collect();
                echoed += payloads.len();
                server.send_batch(source, &payloads).await.unwrap();
            }
        })
    };

    let payloads = numbered(16, 700);
    client.send_batch(server.local_addr(), &payloads).await.unwrap();

    let mut buf = client.recv_buffer();
    let mut replies = Vec::new();
    while replies.len() < payloads.len() {
        let datagrams = tokio::time::timeout(deadline(), client.receive_batch(&mut buf, 64))
            .await
            .expect("timed out waiting for echo")
            .unwrap();
        for datagram in datagrams {
            assert_eq!(datagram.source, server.local_addr());
            replies.push(datagram.payload.to_vec());
        }
    }
    assert_eq!(replies, payloads);

    tokio::time::timeout(deadline(), echo)
        .await
        .expect("echo task did not finish")
        .unwrap();
    assert_eq!(server.stats().datagrams_sent, 16);
}

#[tokio::test]
async fn test_async_capacity() {
    let socket = AsyncUdpSocket::bind("127.0.0.1:0".parse().unwrap(), &loopback_config())
        .await
        .unwrap();
    assert_eq!(socket.set_send_capacity(64 * KIB).unwrap(), 128 * KIB);
    assert_eq!(socket.effective_send_capacity().unwrap(), 128 * KIB);
}
