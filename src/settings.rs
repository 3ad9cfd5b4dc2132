//! Transport settings and their defaults.

use std::time::Duration;

use crate::recovery::CongestionControlType;

/// Congestion window floor/ceiling defaults, in packets.
pub const INIT_CWND_IN_MSS: u64 = 10;
pub const MIN_CWND_IN_MSS: u64 = 2;
pub const MIN_CWND_IN_MSS_FOR_BBR: u64 = 4;
pub const MAX_CWND_IN_MSS: u64 = 2000;

/// Drain period is this multiple of the PTO.
pub const DRAIN_FACTOR: u32 = 3;

/// ECN codepoints in the low two TOS bits.
pub const ECN_ECT0: u8 = 0b10;
pub const ECN_ECT1: u8 = 0b01;
pub const ECN_CE: u8 = 0b11;

/// Largest DATAGRAM frame payload we will advertise.
pub const MAX_DATAGRAM_FRAME_SIZE: u64 = 65535;

/// Frame and packet header overhead reserved when sizing datagrams.
pub const MAX_DATAGRAM_PACKET_OVERHEAD: u64 = 10;

/// Timer granularity floor (RFC 9002 kGranularity).
pub const TIMER_GRANULARITY: Duration = Duration::from_millis(1);

/// Knob space reserved for transport-internal knobs.
pub const TRANSPORT_KNOB_SPACE: u64 = 0xfaceb00c;

/// Unreliable datagram configuration.
#[derive(Debug, Clone)]
pub struct DatagramConfig {
    pub enabled: bool,
    /// Bound on buffered received datagrams.
    pub read_buf_size: usize,
    /// Bound on buffered outgoing datagrams.
    pub write_buf_size: usize,
    /// On write-buffer overflow: drop the oldest buffered datagram instead
    /// of rejecting the new one.
    pub send_drop_old_data_first: bool,
}

impl Default for DatagramConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            read_buf_size: 1024,
            write_buf_size: 1024,
            send_drop_old_data_first: false,
        }
    }
}

/// Tunable behavior of a connection.
///
/// Fully replaceable until the transport parameters have been encoded for
/// the handshake; after that only congestion-control fields may change.
#[derive(Debug, Clone)]
pub struct TransportSettings {
    /// Local idle timeout. Zero disables the idle timer.
    pub idle_timeout: Duration,
    /// Send a keepalive ping at 85% of the idle interval.
    pub enable_keepalive: bool,
    /// Ack timer is `ack_timer_factor * SRTT`, capped by the max ack delay.
    pub ack_timer_factor: f64,
    /// Floor for any scheduled timer, mirroring event-loop tick resolution.
    pub timer_tick_interval: Duration,
    /// RTT assumed before any sample.
    pub initial_rtt: Duration,

    /// Deliver read callbacks in ascending stream-id order.
    pub ordered_read_callbacks: bool,
    /// Run the callback fan-out after each packet instead of per batch.
    pub process_callbacks_per_packet: bool,
    /// Caller runs the write looper itself after each socket read batch.
    pub network_data_per_socket_read: bool,
    /// Run the write looper inline at the end of ingress.
    pub inline_write_after_read: bool,
    /// Cross-check the idle timer for missed expiry before writing.
    pub check_idle_timer_on_write: bool,
    /// Gate writes on socket-writable events instead of spinning the looper.
    pub use_sock_writable_events: bool,
    /// Arm a zero-delay timer to resume writing when a burst leaves residue.
    pub schedule_timer_for_excess_writes: bool,

    /// Whether close enters the drain period at all.
    pub should_drain: bool,
    /// When non-zero, bound writable bytes by this multiple of the
    /// congestion window minus what is already buffered.
    pub backpressure_headroom_factor: u8,
    /// Total bytes the transport will buffer across all streams.
    pub total_buffer_space_available: u64,

    pub datagram: DatagramConfig,

    pub enable_ecn_on_egress: bool,
    pub use_l4s_ecn: bool,
    pub dscp_value: u8,

    pub default_congestion_controller: CongestionControlType,
    pub pacing_enabled: bool,
    pub pacing_enabled_first_flight: bool,
    pub init_cwnd_in_mss: u64,
    pub min_cwnd_in_mss: u64,
    pub max_cwnd_in_mss: u64,

    pub advertised_knob_frame_support: bool,
    /// Discard buffered ingress when the app stop-sends a stream.
    pub drop_ingress_on_stop_sending: bool,
    /// Reap a closed stream only once its read callback is unset, even if
    /// EOM was already delivered.
    pub remove_stream_after_eom_callback_unset: bool,
    /// Stream groups advertised to the peer; zero disables group features.
    pub advertised_max_stream_groups: u64,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            enable_keepalive: false,
            ack_timer_factor: 0.25,
            timer_tick_interval: Duration::from_millis(1),
            initial_rtt: Duration::from_millis(50),
            ordered_read_callbacks: false,
            process_callbacks_per_packet: false,
            network_data_per_socket_read: false,
            inline_write_after_read: false,
            check_idle_timer_on_write: false,
            use_sock_writable_events: false,
            schedule_timer_for_excess_writes: false,
            should_drain: true,
            backpressure_headroom_factor: 0,
            total_buffer_space_available: 1024 * 1024,
            datagram: DatagramConfig::default(),
            enable_ecn_on_egress: false,
            use_l4s_ecn: false,
            dscp_value: 0,
            default_congestion_controller: CongestionControlType::Cubic,
            pacing_enabled: false,
            pacing_enabled_first_flight: false,
            init_cwnd_in_mss: INIT_CWND_IN_MSS,
            min_cwnd_in_mss: MIN_CWND_IN_MSS,
            max_cwnd_in_mss: MAX_CWND_IN_MSS,
            advertised_knob_frame_support: false,
            drop_ingress_on_stop_sending: false,
            remove_stream_after_eom_callback_unset: false,
            advertised_max_stream_groups: 0,
        }
    }
}

impl TransportSettings {
    /// Custom retransmission profiles ride on stream-group support.
    pub fn custom_retransmission_profiles_enabled(&self) -> bool {
        self.advertised_max_stream_groups > 0
    }
}
