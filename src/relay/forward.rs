//! Datagram forwarding loop
//!
//! Drains the receiver into the head of the chain with a persistent write
//! to the decoder's stdin. Each datagram is written whole and flushed.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::network::{DatagramReceiver, ReceiveError};

/// Why the forwarding loop ended
#[derive(Debug)]
pub enum LoopExit {
    /// The running flag was cleared
    Stopped,
    /// The receiver was closed
    Closed,
    /// The socket failed
    ReceiveFailed(io::Error),
    /// The decoder no longer accepts input
    WriteFailed(io::Error),
}

/// Counters updated by the forwarding loop
#[derive(Debug, Default)]
pub struct LoopCounters {
    packets_forwarded: AtomicU64,
    bytes_forwarded: AtomicU64,
    empty_packets: AtomicU64,
    receive_timeouts: AtomicU64,
}

impl LoopCounters {
    pub fn snapshot(&self, started_at: Option<DateTime<Utc>>) -> RelayStats {
        RelayStats {
            packets_forwarded: self.packets_forwarded.load(Ordering::Relaxed),
            bytes_forwarded: self.bytes_forwarded.load(Ordering::Relaxed),
            empty_packets: self.empty_packets.load(Ordering::Relaxed),
            receive_timeouts: self.receive_timeouts.load(Ordering::Relaxed),
            started_at,
        }
    }
}

/// Relay statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct RelayStats {
    pub packets_forwarded: u64,
    pub bytes_forwarded: u64,
    pub empty_packets: u64,
    pub receive_timeouts: u64,
    pub started_at: Option<DateTime<Utc>>,
}

/// Forward datagrams into `sink` until stopped, closed or failed
pub fn forward_loop<W: Write>(
    receiver: &DatagramReceiver,
    sink: &mut W,
    running: &AtomicBool,
    counters: &LoopCounters,
) -> LoopExit {
    while running.load(Ordering::SeqCst) {
        let data = match receiver.receive() {
            Ok(data) => data,
            Err(ReceiveError::Timeout(timeout)) => {
                counters.receive_timeouts.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("No data received for {:?}", timeout);
                continue;
            }
            Err(ReceiveError::Closed) => return LoopExit::Closed,
            Err(ReceiveError::Io(e)) => return LoopExit::ReceiveFailed(e),
        };

        if data.is_empty() {
            counters.empty_packets.fetch_add(1, Ordering::Relaxed);
            continue;
        }

        if let Err(e) = sink.write_all(&data).and_then(|_| sink.flush()) {
            return LoopExit::WriteFailed(e);
        }

        counters.packets_forwarded.fetch_add(1, Ordering::Relaxed);
        counters.bytes_forwarded.fetch_add(data.len() as u64, Ordering::Relaxed);
    }
    LoopExit::Stopped
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::UdpSocket;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    /// Sink that fails every write
    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "decoder gone"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn receiver(timeout_ms: u64) -> Arc<DatagramReceiver> {
        let timeout = Duration::from_millis(timeout_ms);
        Arc::new(DatagramReceiver::open("127.0.0.1", 0, timeout, 4096).unwrap())
    }

    #[test]
    fn test_forwards_until_closed() {
        let receiver = receiver(100);
        let running = Arc::new(AtomicBool::new(true));
        let counters = Arc::new(LoopCounters::default());

        let handle = {
            let (receiver, running, counters) =
                (receiver.clone(), running.clone(), counters.clone());
            thread::spawn(move || {
                let mut sink = Vec::new();
                let exit = forward_loop(&receiver, &mut sink, &running, &counters);
                (exit, sink)
            })
        };

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"abc", receiver.local_addr()).unwrap();
        sender.send_to(b"defg", receiver.local_addr()).unwrap();

        // Let at least one timeout pass; the loop must survive it
        thread::sleep(Duration::from_millis(300));
        receiver.close();

        let (exit, sink) = handle.join().unwrap();
        assert!(matches!(exit, LoopExit::Closed));
        assert_eq!(sink, b"abcdefg");

        let stats = counters.snapshot(None);
        assert_eq!(stats.packets_forwarded, 2);
        assert_eq!(stats.bytes_forwarded, 7);
        assert!(stats.receive_timeouts >= 1);
    }

    #[test]
    fn test_running_flag_stops_loop() {
        let receiver = receiver(50);
        let running = AtomicBool::new(false);
        let counters = LoopCounters::default();
        let mut sink = Vec::new();

        let exit = forward_loop(&receiver, &mut sink, &running, &counters);
        assert!(matches!(exit, LoopExit::Stopped));
        assert!(sink.is_empty());
    }

    #[test]
    fn test_write_failure_ends_loop() {
        let receiver = receiver(1000);
        let running = AtomicBool::new(true);
        let counters = LoopCounters::default();

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"payload", receiver.local_addr()).unwrap();

        let exit = forward_loop(&receiver, &mut BrokenPipe, &running, &counters);
        match exit {
            LoopExit::WriteFailed(e) => assert_eq!(e.kind(), io::ErrorKind::BrokenPipe),
            other => panic!("expected write failure, got {:?}", other),
        }
        assert_eq!(counters.snapshot(None).packets_forwarded, 0);
    }

    #[test]
    fn test_empty_datagrams_skipped() {
        let receiver = receiver(1000);
        let running = Arc::new(AtomicBool::new(true));
        let counters = Arc::new(LoopCounters::default());

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(&[], receiver.local_addr()).unwrap();
        sender.send_to(b"x", receiver.local_addr()).unwrap();

        let handle = {
            let (receiver, running, counters) =
                (receiver.clone(), running.clone(), counters.clone());
            thread::spawn(move || {
                let mut sink = Vec::new();
                forward_loop(&receiver, &mut sink, &running, &counters);
                sink
            })
        };

        thread::sleep(Duration::from_millis(200));
        running.store(false, Ordering::SeqCst);
        receiver.close();

        assert_eq!(handle.join().unwrap(), b"x");
        let stats = counters.snapshot(None);
        assert_eq!(stats.empty_packets, 1);
        assert_eq!(stats.packets_forwarded, 1);
    }
}
