//! Flow-control accounting and the write-gating arithmetic.
//!
//! Writable bytes on a stream are the minimum of stream flow credit,
//! connection flow credit, buffer headroom, and (when configured) a
//! multiple of the congestion window less what is already buffered.

/// Connection-level flow-control aggregate.
#[derive(Debug, Clone, Default)]
pub struct FlowControlState {
    /// Send limit granted by the peer (MAX_DATA).
    pub peer_advertised_max_offset: u64,
    /// Sum of current write offsets across streams.
    pub sum_cur_write_offset: u64,
    /// Sum of bytes buffered for write across streams.
    pub sum_cur_stream_buffer_len: u64,
    /// Sum of the largest offsets observed on receive across streams.
    pub sum_max_observed_offset: u64,
    /// Receive limit we advertised to the peer.
    pub advertised_max_offset: u64,
    /// Receive window target used when advancing the advertised limit.
    pub window_size: u64,
}

/// Stream-level flow-control fields.
#[derive(Debug, Clone, Default)]
pub struct StreamFlowControlState {
    pub peer_advertised_max_offset: u64,
    pub advertised_max_offset: u64,
    pub window_size: u64,
}

/// Point-in-time flow control snapshot returned by the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowControlInfo {
    /// Bytes we may still send under the peer's limit.
    pub sendable_bytes: u64,
    pub peer_advertised_max_offset: u64,
    /// Bytes the peer may still send under our limit.
    pub receive_window_available: u64,
    pub advertised_max_offset: u64,
}

/// Connection send credit remaining under the peer's limit.
pub fn send_conn_flow_control_bytes(fc: &FlowControlState) -> u64 {
    fc.peer_advertised_max_offset
        .saturating_sub(fc.sum_cur_write_offset)
}

/// Connection receive credit remaining under our advertised limit.
pub fn recv_conn_flow_control_bytes(fc: &FlowControlState) -> u64 {
    fc.advertised_max_offset
        .saturating_sub(fc.sum_max_observed_offset)
}

/// Stream send credit remaining under the peer's limit.
pub fn send_stream_flow_control_bytes(fc: &StreamFlowControlState, current_write_offset: u64) -> u64 {
    fc.peer_advertised_max_offset
        .saturating_sub(current_write_offset)
}

/// Buffer headroom left before the transport stops accepting writes.
pub fn buffer_space_available(sum_buffered: u64, total_buffer_space: u64) -> u64 {
    total_buffer_space.saturating_sub(sum_buffered)
}

/// Connection-scope writable bytes: flow credit bounded by buffer headroom,
/// then by the backpressure headroom when a factor is configured.
pub fn max_writable_on_conn(
    fc: &FlowControlState,
    cc_writable_bytes: Option<u64>,
    total_buffer_space: u64,
    backpressure_headroom_factor: u8,
) -> u64 {
    let flow_credit = send_conn_flow_control_bytes(fc);
    let buffer_headroom = buffer_space_available(fc.sum_cur_stream_buffer_len, total_buffer_space);
    let mut writable = flow_credit.min(buffer_headroom);
    if backpressure_headroom_factor > 0 {
        let cc_headroom = u64::from(backpressure_headroom_factor)
            .saturating_mul(cc_writable_bytes.unwrap_or(u64::MAX));
        let headroom = cc_headroom.saturating_sub(fc.sum_cur_stream_buffer_len);
        writable = writable.min(headroom);
    }
    writable
}

#[cfg(test)]
mod flow_control_tests {
    use super::*;

    fn state(peer_max: u64, written: u64, buffered: u64) -> FlowControlState {
        FlowControlState {
            peer_advertised_max_offset: peer_max,
            sum_cur_write_offset: written,
            sum_cur_stream_buffer_len: buffered,
            ..Default::default()
        }
    }

    #[test]
    fn test_send_credit_saturates() {
        let fc = state(100, 150, 0);
        assert_eq!(send_conn_flow_control_bytes(&fc), 0);
    }

    #[test]
    fn test_writable_bounded_by_buffer_headroom() {
        let fc = state(10_000, 0, 900);
        // 100 bytes of buffer left even though flow credit is large.
        assert_eq!(max_writable_on_conn(&fc, None, 1000, 0), 100);
    }

    #[test]
    fn test_backpressure_headroom_bound() {
        let fc = state(10_000, 0, 300);
        // 2 * 400 cwnd - 300 buffered = 500.
        assert_eq!(max_writable_on_conn(&fc, Some(400), 100_000, 2), 500);
        // Headroom floors at zero when the buffer already exceeds it.
        let fc = state(10_000, 0, 900);
        assert_eq!(max_writable_on_conn(&fc, Some(400), 100_000, 2), 0);
    }

    #[test]
    fn test_buffer_space_invariant() {
        // available + buffered never exceeds the configured total.
        for buffered in [0u64, 500, 1000, 1500] {
            let available = buffer_space_available(buffered, 1000);
            assert_eq!(available, 1000u64.saturating_sub(buffered));
            assert!(available + buffered.min(1000) <= 1000);
        }
    }
}
