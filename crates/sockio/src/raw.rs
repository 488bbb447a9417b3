//! The syscall seam beneath the send and receive paths.

use std::io;
use std::net::SocketAddr;
use std::os::fd::AsFd;

pub use crate::sys::RawRecv;
use crate::sys;

/// A datagram socket that can send and receive with ancillary data.
///
/// The batched paths only ever talk to the kernel through this trait, which
/// keeps syscall counts observable in tests.
pub trait DatagramIo {
    /// Send one buffer to `dst`, attaching `control` when non-empty.
    ///
    /// Returns the number of payload bytes accepted.
    fn send_msg(&self, dst: SocketAddr, payload: &[u8], control: &[u8]) -> io::Result<usize>;

    /// Receive one buffer, filling `control` with any ancillary data.
    fn recv_msg(&self, payload: &mut [u8], control: &mut [u8]) -> io::Result<RawRecv>;
}

impl DatagramIo for std::net::UdpSocket {
    fn send_msg(&self, dst: SocketAddr, payload: &[u8], control: &[u8]) -> io::Result<usize> {
        sys::send_msg(self.as_fd(), &dst, payload, control)
    }

    fn recv_msg(&self, payload: &mut [u8], control: &mut [u8]) -> io::Result<RawRecv> {
        sys::recv_msg(self.as_fd(), payload, control)
    }
}

impl DatagramIo for socket2::Socket {
    fn send_msg(&self, dst: SocketAddr, payload: &[u8], control: &[u8]) -> io::Result<usize> {
        sys::send_msg(self.as_fd(), &dst, payload, control)
    }

    fn recv_msg(&self, payload: &mut [u8], control: &mut [u8]) -> io::Result<RawRecv> {
        sys::recv_msg(self.as_fd(), payload, control)
    }
}

/// Direct syscalls on the tokio socket's descriptor. Callers run these inside
/// `try_io` so a would-block result clears readiness.
impl DatagramIo for tokio::net::UdpSocket {
    fn send_msg(&self, dst: SocketAddr, payload: &[u8], control: &[u8]) -> io::Result<usize> {
        sys::send_msg(self.as_fd(), &dst, payload, control)
    }

    fn recv_msg(&self, payload: &mut [u8], control: &mut [u8]) -> io::Result<RawRecv> {
        sys::recv_msg(self.as_fd(), payload, control)
    }
}

impl<T: DatagramIo + ?Sized> DatagramIo for &T {
    fn send_msg(&self, dst: SocketAddr, payload: &[u8], control: &[u8]) -> io::Result<usize> {
        (**self).send_msg(dst, payload, control)
    }

    fn recv_msg(&self, payload: &mut [u8], control: &mut [u8]) -> io::Result<RawRecv> {
        (**self).recv_msg(payload, control)
    }
}
