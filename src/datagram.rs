//! Bounded buffers for unreliable QUIC datagrams.

use std::collections::VecDeque;
use std::time::Instant;

use bytes::Bytes;

/// A received datagram with its arrival time.
#[derive(Debug, Clone)]
pub struct ReadDatagram {
    pub receive_time: Instant,
    pub data: Bytes,
}

/// Datagram state on a connection.
///
/// `max_write_frame_size == 0` means the peer has not advertised datagram
/// support; writes are rejected in that state.
#[derive(Debug, Default)]
pub struct DatagramState {
    pub max_read_frame_size: u64,
    pub max_write_frame_size: u64,
    pub max_read_buffer_size: usize,
    pub max_write_buffer_size: usize,
    pub read_buffer: VecDeque<ReadDatagram>,
    pub write_buffer: VecDeque<Bytes>,
}

impl DatagramState {
    /// Buffer a received datagram, dropping it when the read buffer is
    /// full. Returns whether the datagram was kept.
    pub fn enqueue_read(&mut self, datagram: ReadDatagram) -> bool {
        if self.read_buffer.len() >= self.max_read_buffer_size {
            return false;
        }
        self.read_buffer.push_back(datagram);
        true
    }

    pub fn clear(&mut self) {
        self.read_buffer.clear();
        self.write_buffer.clear();
    }
}

#[cfg(test)]
mod datagram_tests {
    use super::*;

    #[test]
    fn test_read_buffer_bounded() {
        let mut state = DatagramState {
            max_read_buffer_size: 2,
            ..Default::default()
        };
        let now = Instant::now();
        assert!(state.enqueue_read(ReadDatagram {
            receive_time: now,
            data: Bytes::from_static(b"a"),
        }));
        assert!(state.enqueue_read(ReadDatagram {
            receive_time: now,
            data: Bytes::from_static(b"b"),
        }));
        assert!(!state.enqueue_read(ReadDatagram {
            receive_time: now,
            data: Bytes::from_static(b"c"),
        }));
        assert_eq!(state.read_buffer.len(), 2);
    }
}
