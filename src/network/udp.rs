//! Timeout-enabled UDP datagram receiver
//!
//! The socket is built with `socket2` so options are applied before bind,
//! then handed to `std::net::UdpSocket` for blocking receives. A receiver is
//! shared between the forwarding thread (which blocks in [`DatagramReceiver::receive`])
//! and the controlling thread (which calls [`DatagramReceiver::close`]).

use bytes::{Bytes, BytesMut};
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io;
use std::net::{IpAddr, Shutdown, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;

use crate::error::NetworkError;

/// Why a receive returned no datagram
#[derive(Error, Debug)]
pub enum ReceiveError {
    /// Nothing arrived within the receive timeout
    #[error("no datagram within {0:?}")]
    Timeout(Duration),

    /// The receiver was closed
    #[error("receiver closed")]
    Closed,

    #[error("receive failed: {0}")]
    Io(#[from] io::Error),
}

/// Create a bound UDP socket with a read timeout
pub fn create_socket(addr: SocketAddr, timeout: Duration) -> Result<UdpSocket, NetworkError> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .map_err(NetworkError::SocketOption)?;

    socket
        .set_read_timeout(Some(timeout))
        .map_err(NetworkError::SocketOption)?;

    socket.bind(&addr.into()).map_err(|source| NetworkError::BindFailed {
        addr: addr.to_string(),
        source,
    })?;

    Ok(socket.into())
}

/// Bound datagram socket producing opaque byte buffers
#[derive(Debug)]
pub struct DatagramReceiver {
    socket: UdpSocket,

    /// Address the socket is bound to
    local_addr: SocketAddr,

    /// Receive timeout applied to the socket
    timeout: Duration,

    /// Size of the buffer each datagram is read into
    buffer_size: usize,

    /// Set once by `close`
    closed: AtomicBool,
}

impl DatagramReceiver {
    /// Bind a receiver on `bind_address:port`
    pub fn open(
        bind_address: &str,
        port: u16,
        timeout: Duration,
        buffer_size: usize,
    ) -> Result<Self, NetworkError> {
        let ip: IpAddr = bind_address
            .parse()
            .map_err(|_| NetworkError::InvalidAddress(bind_address.to_string()))?;

        let socket = create_socket(SocketAddr::new(ip, port), timeout)?;
        let local_addr = socket.local_addr().map_err(NetworkError::SocketOption)?;

        tracing::debug!(%local_addr, ?timeout, "UDP receiver bound");

        Ok(Self {
            socket,
            local_addr,
            timeout,
            buffer_size,
            closed: AtomicBool::new(false),
        })
    }

    /// Block for the next datagram, at most one receive timeout
    pub fn receive(&self) -> Result<Bytes, ReceiveError> {
        if self.is_closed() {
            return Err(ReceiveError::Closed);
        }

        let mut buf = BytesMut::zeroed(self.buffer_size);
        let result = self.socket.recv(&mut buf);

        // Whatever woke us, a close wins
        if self.is_closed() {
            return Err(ReceiveError::Closed);
        }

        match result {
            Ok(len) => {
                buf.truncate(len);
                Ok(buf.freeze())
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Err(ReceiveError::Timeout(self.timeout))
            }
            Err(e) => Err(ReceiveError::Io(e)),
        }
    }

    /// Close the receiver and wake a blocked `receive`.
    ///
    /// Returns `true` for the call that performed the close. Later calls
    /// are no-ops and return `false`.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }

        // Wake the receiving thread with an empty datagram, then shut the
        // socket down. Both are best effort: a blocked receive notices the
        // flag within one timeout regardless.
        if let Err(e) = self.socket.send_to(&[], self.wake_addr()) {
            tracing::debug!(error = %e, "wake datagram not sent");
        }
        if let Err(e) = SockRef::from(&self.socket).shutdown(Shutdown::Both) {
            tracing::debug!(error = %e, "socket shutdown reported an error");
        }

        tracing::debug!(local_addr = %self.local_addr, "UDP receiver closed");
        true
    }

    /// Check if `close` has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Get the bound address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn wake_addr(&self) -> SocketAddr {
        let mut addr = self.local_addr;
        if addr.ip().is_unspecified() {
            let loopback: IpAddr = match addr {
                SocketAddr::V4(_) => std::net::Ipv4Addr::LOCALHOST.into(),
                SocketAddr::V6(_) => std::net::Ipv6Addr::LOCALHOST.into(),
            };
            addr.set_ip(loopback);
        }
        addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    fn open_ephemeral(timeout_ms: u64) -> DatagramReceiver {
        DatagramReceiver::open("127.0.0.1", 0, Duration::from_millis(timeout_ms), 4096).unwrap()
    }

    #[test]
    fn test_receive_datagram() {
        let receiver = open_ephemeral(1000);
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"hello relay", receiver.local_addr()).unwrap();

        let data = receiver.receive().unwrap();
        assert_eq!(&data[..], b"hello relay");
    }

    #[test]
    fn test_timeout_is_not_closed() {
        let receiver = open_ephemeral(50);
        match receiver.receive() {
            Err(ReceiveError::Timeout(timeout)) => assert_eq!(timeout, Duration::from_millis(50)),
            other => panic!("expected timeout, got {:?}", other),
        }
        // Still usable after a timeout
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(&[7u8; 32], receiver.local_addr()).unwrap();
        assert_eq!(receiver.receive().unwrap().len(), 32);
    }

    #[test]
    fn test_close_is_idempotent() {
        let receiver = open_ephemeral(50);
        assert!(receiver.close());
        assert!(!receiver.close());
        assert!(!receiver.close());
        assert!(receiver.is_closed());
        assert!(matches!(receiver.receive(), Err(ReceiveError::Closed)));
    }

    #[test]
    fn test_close_unblocks_receive() {
        let receiver = Arc::new(open_ephemeral(2000));
        let blocked = receiver.clone();

        let handle = thread::spawn(move || {
            let started = Instant::now();
            let result = blocked.receive();
            (result, started.elapsed())
        });

        thread::sleep(Duration::from_millis(100));
        receiver.close();

        let (result, elapsed) = handle.join().unwrap();
        assert!(matches!(result, Err(ReceiveError::Closed)));
        assert!(elapsed <= Duration::from_millis(2000) + Duration::from_millis(500));
    }

    #[test]
    fn test_bind_conflict_reported() {
        let first = open_ephemeral(50);
        let port = first.local_addr().port();
        let second = DatagramReceiver::open("127.0.0.1", port, Duration::from_millis(50), 4096);
        assert!(matches!(second, Err(NetworkError::BindFailed { .. })));
    }

    #[test]
    fn test_invalid_address() {
        let result = DatagramReceiver::open("not-an-ip", 0, Duration::from_millis(50), 4096);
        assert!(matches!(result, Err(NetworkError::InvalidAddress(_))));
    }
}
