//! Loss state, PTO, and the congestion-control/pacing collaborator traits.
//!
//! The algorithms live outside this crate; the transport core only reads
//! their outputs (writable bytes, pacing delay, alarm deadlines) and
//! forwards its events to them.

use std::time::{Duration, Instant};

use crate::settings::TIMER_GRANULARITY;
use crate::types::PacketNumberSpace;

/// Congestion control algorithm family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CongestionControlType {
    None,
    NewReno,
    Cubic,
    Bbr,
    Bbr2,
}

impl CongestionControlType {
    pub fn is_bbr_family(self) -> bool {
        matches!(self, CongestionControlType::Bbr | CongestionControlType::Bbr2)
    }
}

/// Congestion controller interface consumed by the transport core.
pub trait CongestionController {
    fn writable_bytes(&self) -> u64;

    fn congestion_window(&self) -> u64;

    fn is_app_limited(&self) -> bool;

    fn set_app_limited(&mut self);

    fn cc_type(&self) -> CongestionControlType;

    /// Background-mode hook; 1.0 restores full utilization.
    fn set_bandwidth_utilization_factor(&mut self, _factor: f64) {}

    /// L4S response hook: share of echoed marks that were CE, in [0, 1].
    /// Fed on each ECN validation pass once L4S has validated.
    fn on_l4s_mark_fraction(&mut self, _fraction: f64) {}
}

/// Builds congestion controllers on demand.
pub trait CongestionControllerFactory {
    fn make_congestion_controller(
        &self,
        cc_type: CongestionControlType,
    ) -> Box<dyn CongestionController>;
}

/// Pacer interface: spaces bursts on the write path.
pub trait Pacer {
    /// Delay until the next burst may be written. Zero means write now.
    fn time_until_next_write(&self, now: Instant) -> Duration;

    /// Restart rate sampling, e.g. when new data arrives after idling.
    fn reset(&mut self);

    fn set_max_pacing_rate(&mut self, rate_bytes_per_sec: u64);

    fn cached_write_batch_size(&self) -> u64 {
        0
    }
}

/// RTT estimators and send/receive accounting.
#[derive(Debug, Clone)]
pub struct LossState {
    pub srtt: Duration,
    pub rttvar: Duration,
    /// Latest RTT sample.
    pub lrtt: Duration,
    /// Minimum RTT observed.
    pub mrtt: Duration,
    pub max_ack_delay: Duration,

    pub total_bytes_sent: u64,
    pub total_bytes_recvd: u64,
    pub total_bytes_acked: u64,
    pub total_bytes_retransmitted: u64,
    pub total_body_bytes_sent: u64,
    pub total_body_bytes_acked: u64,
    pub total_stream_bytes_sent: u64,
    pub total_new_stream_bytes_sent: u64,
    pub total_stream_bytes_cloned: u64,
    pub total_bytes_cloned: u64,

    pub total_packets_sent: u64,
    pub total_ack_eliciting_packets_sent: u64,
    pub total_packets_marked_lost: u64,
    pub total_packets_marked_lost_by_timeout: u64,
    pub total_packets_marked_lost_by_reordering: u64,
    pub total_packets_spuriously_marked_lost: u64,
    pub rtx_count: u64,
    pub timeout_based_rtx_count: u64,
    pub pto_count: u32,
    pub total_pto_count: u64,
    pub inflight_bytes: u64,
    pub largest_sent: Option<u64>,
    pub reordering_threshold: u64,
    pub last_packet_sent_time: Option<Instant>,
}

impl Default for LossState {
    fn default() -> Self {
        Self {
            srtt: Duration::ZERO,
            rttvar: Duration::ZERO,
            lrtt: Duration::ZERO,
            mrtt: Duration::MAX,
            max_ack_delay: Duration::from_millis(25),
            total_bytes_sent: 0,
            total_bytes_recvd: 0,
            total_bytes_acked: 0,
            total_bytes_retransmitted: 0,
            total_body_bytes_sent: 0,
            total_body_bytes_acked: 0,
            total_stream_bytes_sent: 0,
            total_new_stream_bytes_sent: 0,
            total_stream_bytes_cloned: 0,
            total_bytes_cloned: 0,
            total_packets_sent: 0,
            total_ack_eliciting_packets_sent: 0,
            total_packets_marked_lost: 0,
            total_packets_marked_lost_by_timeout: 0,
            total_packets_marked_lost_by_reordering: 0,
            total_packets_spuriously_marked_lost: 0,
            rtx_count: 0,
            timeout_based_rtx_count: 0,
            pto_count: 0,
            total_pto_count: 0,
            inflight_bytes: 0,
            largest_sent: None,
            reordering_threshold: 3,
            last_packet_sent_time: None,
        }
    }
}

/// Probe timeout: `srtt + max(4 * rttvar, granularity) + max_ack_delay`
/// (RFC 9002 Section 6.2).
pub fn calculate_pto(loss: &LossState) -> Duration {
    loss.srtt + (4 * loss.rttvar).max(TIMER_GRANULARITY) + loss.max_ack_delay
}

/// Tracks transitions in and out of the app-limited regime for observer
/// notification.
#[derive(Debug, Default)]
pub struct AppLimitedTracker {
    app_limited: bool,
}

impl AppLimitedTracker {
    pub fn is_app_limited(&self) -> bool {
        self.app_limited
    }

    pub fn set_app_limited(&mut self) {
        self.app_limited = true;
    }

    pub fn set_not_app_limited(&mut self) {
        self.app_limited = false;
    }
}

/// Counts of packets awaiting acknowledgement, per packet-number space.
#[derive(Debug, Default)]
pub struct OutstandingPackets {
    packet_count: [u64; 3],
}

impl OutstandingPackets {
    pub fn count(&self, space: PacketNumberSpace) -> u64 {
        self.packet_count[space.index()]
    }

    pub fn add(&mut self, space: PacketNumberSpace, count: u64) {
        self.packet_count[space.index()] += count;
    }

    pub fn remove(&mut self, space: PacketNumberSpace, count: u64) {
        let slot = &mut self.packet_count[space.index()];
        *slot = slot.saturating_sub(count);
    }

    pub fn num_outstanding(&self) -> u64 {
        self.packet_count.iter().sum()
    }

    pub fn reset(&mut self) {
        self.packet_count = [0; 3];
    }
}

#[cfg(test)]
mod recovery_tests {
    use super::*;

    #[test]
    fn test_pto_uses_granularity_floor() {
        let mut loss = LossState {
            srtt: Duration::from_millis(20),
            rttvar: Duration::ZERO,
            max_ack_delay: Duration::from_millis(25),
            ..Default::default()
        };
        // 20 + max(0, 1) + 25
        assert_eq!(calculate_pto(&loss), Duration::from_millis(46));

        loss.rttvar = Duration::from_millis(10);
        // 20 + 40 + 25
        assert_eq!(calculate_pto(&loss), Duration::from_millis(85));
    }

    #[test]
    fn test_outstanding_counts() {
        let mut outstanding = OutstandingPackets::default();
        outstanding.add(PacketNumberSpace::Initial, 2);
        outstanding.add(PacketNumberSpace::AppData, 3);
        assert_eq!(outstanding.num_outstanding(), 5);
        outstanding.remove(PacketNumberSpace::Initial, 5);
        assert_eq!(outstanding.count(PacketNumberSpace::Initial), 0);
        outstanding.reset();
        assert_eq!(outstanding.num_outstanding(), 0);
    }
}
