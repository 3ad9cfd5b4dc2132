//! Connection state aggregate.
//!
//! [`Conn`] is exclusively owned by the transport object. Collaborators
//! receive `&mut Conn` while the transport drives them and must not retain
//! references across calls.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::datagram::DatagramState;
use crate::ecn::{EcnState, L4sTracker};
use crate::error::{ApplicationErrorCode, QuicError};
use crate::flow_control::FlowControlState;
use crate::interfaces::{
    LoopDetectorCallback, NoReadReason, PacketProcessor, QLogger, SocketCmsgMap,
    TransportStatsCallback, WriteDataReason,
};
use crate::recovery::{
    AppLimitedTracker, CongestionController, CongestionControllerFactory, LossState,
    OutstandingPackets, Pacer,
};
use crate::settings::TransportSettings;
use crate::stream::StreamManager;
use crate::types::{ConnectionId, QuicVersion, Side, StreamGroupId, StreamId};

/// Application-visible lifecycle of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseState {
    Open,
    GracefulClosing,
    Closed,
}

/// Per-packet-number-space acknowledgement state.
#[derive(Debug, Clone, Default)]
pub struct AckState {
    /// Bumped by the codec whenever a new packet lands in this space.
    pub version: u64,
    pub largest_acked_by_peer: Option<u64>,
    /// Ranges pending acknowledgement to the peer.
    pub acks: Vec<(u64, u64)>,
    /// Set while ACK_FREQUENCY governs this space.
    pub ack_frequency_sequence_number: Option<u64>,
    /// The ack timer fired; the next write must carry the pending acks.
    pub flush_acks: bool,
    pub ecn_ce_count_echoed: u64,
    pub ecn_ect0_count_echoed: u64,
    pub ecn_ect1_count_echoed: u64,
    /// Marked ack-eliciting packets we expect echoed back at minimum.
    pub minimum_expected_ecn_marks_echoed: u64,
}

/// Acknowledgement state across all packet-number spaces.
#[derive(Debug, Clone)]
pub struct AckStates {
    pub initial: Option<AckState>,
    pub handshake: Option<AckState>,
    pub app_data: AckState,
    pub max_ack_delay: Duration,
}

impl Default for AckStates {
    fn default() -> Self {
        Self {
            initial: Some(AckState::default()),
            handshake: Some(AckState::default()),
            app_data: AckState::default(),
            max_ack_delay: Duration::from_millis(25),
        }
    }
}

impl AckStates {
    /// Monotone counter advanced by any packet received in any space.
    pub fn current_version(&self) -> u64 {
        self.initial.as_ref().map_or(0, |s| s.version)
            + self.handshake.as_ref().map_or(0, |s| s.version)
            + self.app_data.version
    }

    pub fn clear_acks(&mut self) {
        if let Some(state) = self.initial.as_mut() {
            state.acks.clear();
        }
        if let Some(state) = self.handshake.as_mut() {
            state.acks.clear();
        }
        self.app_data.acks.clear();
    }
}

/// Crypto stream offsets per encryption level, for close-time totals and
/// the app-limited check.
#[derive(Debug, Clone, Copy, Default)]
pub struct CryptoStreamState {
    pub current_write_offset: u64,
    pub max_offset_observed: u64,
    pub has_loss_buffered: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CryptoState {
    pub initial: CryptoStreamState,
    pub handshake: CryptoStreamState,
    pub one_rtt: CryptoStreamState,
}

impl CryptoState {
    pub fn total_data_written(&self) -> u64 {
        self.initial.current_write_offset
            + self.handshake.current_write_offset
            + self.one_rtt.current_write_offset
    }

    pub fn total_data_recvd(&self) -> u64 {
        self.initial.max_offset_observed
            + self.handshake.max_offset_observed
            + self.one_rtt.max_offset_observed
    }

    pub fn loss_buffers_empty(&self) -> bool {
        !self.initial.has_loss_buffered
            && !self.handshake.has_loss_buffered
            && !self.one_rtt.has_loss_buffered
    }
}

/// Summary of one processed ACK, retained for observer fan-out.
#[derive(Debug, Clone)]
pub struct AckEvent {
    pub ack_time: Instant,
    pub largest_acked_packet: Option<u64>,
    pub acked_bytes: u64,
}

/// An out-of-band configuration frame.
#[derive(Debug, Clone)]
pub struct KnobFrame {
    pub knob_space: u64,
    pub knob_id: u64,
    pub blob: Bytes,
}

/// Frames queued for the next write that carry no stream data.
#[derive(Debug, Clone)]
pub enum SimpleFrame {
    StopSending {
        id: StreamId,
        error: ApplicationErrorCode,
    },
    Knob(KnobFrame),
}

/// Events accumulated for the next write or fan-out pass.
#[derive(Debug, Default)]
pub struct PendingEvents {
    pub send_ping: bool,
    pub notify_ping_received: bool,
    pub cancel_ping_timeout: bool,
    pub schedule_ack_timeout: bool,
    pub schedule_path_validation_timeout: bool,
    /// Set by the writer when the packet number space is exhausted.
    pub close_transport: bool,
    pub knobs: Vec<KnobFrame>,
    /// Streams with an outgoing RESET_STREAM pending.
    pub resets: BTreeMap<StreamId, ApplicationErrorCode>,
    pub num_probe_packets: [u64; 3],
    pub frames: Vec<SimpleFrame>,
}

/// The TOS byte pushed to the socket: DSCP in the high six bits, ECN in the
/// low two.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SocketTos {
    pub dscp: u8,
    pub ecn: u8,
}

impl SocketTos {
    pub fn value(self) -> u8 {
        (self.dscp << 2) | (self.ecn & 0b11)
    }
}

/// Ancillary cmsgs staged for a specific write iteration.
#[derive(Debug, Default)]
pub struct SocketCmsgsState {
    pub additional_cmsgs: Option<SocketCmsgMap>,
    /// Cmsgs apply only when the write count still matches.
    pub target_write_count: u64,
}

/// Write-path counters for the loop detector.
#[derive(Debug)]
pub struct WriteDebugState {
    pub needs_write_loop_detect: bool,
    pub current_empty_loop_count: u64,
    pub write_data_reason: WriteDataReason,
}

impl Default for WriteDebugState {
    fn default() -> Self {
        Self {
            needs_write_loop_detect: false,
            current_empty_loop_count: 0,
            write_data_reason: WriteDataReason::NoWrite,
        }
    }
}

/// Read-path counters for the loop detector.
#[derive(Debug)]
pub struct ReadDebugState {
    pub no_read_reason: NoReadReason,
    pub loop_count: u64,
}

impl Default for ReadDebugState {
    fn default() -> Self {
        Self {
            no_read_reason: NoReadReason::ReadOk,
            loop_count: 0,
        }
    }
}

/// Retransmission policy for one stream group.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetransmissionPolicy {
    pub disable_retransmission: bool,
    pub time_budget: Option<Duration>,
    pub count_budget: Option<u32>,
}

/// The per-connection state aggregate.
pub struct Conn {
    pub node_type: Side,

    pub client_connection_id: Option<ConnectionId>,
    pub server_connection_id: Option<ConnectionId>,
    pub client_chosen_dest_connection_id: Option<ConnectionId>,

    pub peer_address: SocketAddr,
    pub original_peer_address: SocketAddr,

    pub version: Option<QuicVersion>,
    pub original_version: Option<QuicVersion>,
    pub supported_versions: Vec<QuicVersion>,

    pub loss: LossState,
    pub ack_states: AckStates,
    pub flow_control: FlowControlState,
    pub outstandings: OutstandingPackets,

    pub congestion_controller: Option<Box<dyn CongestionController>>,
    pub congestion_controller_factory: Option<Box<dyn CongestionControllerFactory>>,
    pub pacer: Option<Box<dyn Pacer>>,
    pub can_be_paced: bool,
    pub app_limited_tracker: AppLimitedTracker,

    pub streams: StreamManager,
    pub crypto: CryptoState,
    pub pending_events: PendingEvents,
    pub datagram_state: DatagramState,

    pub ecn_state: EcnState,
    pub socket_tos: SocketTos,

    pub transport_settings: TransportSettings,
    pub transport_parameters_encoded: bool,
    pub peer_idle_timeout: Duration,
    pub peer_advertised_knob_frame_support: bool,

    pub qlogger: Option<Rc<dyn QLogger>>,

    pub local_connection_error: Option<QuicError>,
    pub peer_connection_error: Option<QuicError>,

    /// ACKs processed since the last observer fan-out.
    pub last_processed_ack_events: Vec<AckEvent>,

    pub received_new_packet_before_write: bool,
    pub write_count: u64,
    pub udp_send_packet_len: u64,
    pub connection_time: Instant,
    pub used_zero_rtt: bool,
    pub outstanding_path_validation: bool,

    pub packet_processors: Vec<Box<dyn PacketProcessor>>,
    /// Installed once L4S validates, removed if validation later fails.
    /// Consulted alongside `packet_processors` on each write iteration and
    /// fed the echoed counters on each validation pass.
    pub ecn_l4s_tracker: Option<L4sTracker>,
    pub socket_cmsgs: SocketCmsgsState,

    pub write_debug_state: WriteDebugState,
    pub read_debug_state: ReadDebugState,
    pub loop_detector_callback: Option<Box<dyn LoopDetectorCallback>>,
    pub stats_callback: Option<Box<dyn TransportStatsCallback>>,

    pub retransmission_policies: BTreeMap<StreamGroupId, RetransmissionPolicy>,
}

impl Conn {
    pub fn new(node_type: Side, peer_address: SocketAddr, now: Instant) -> Self {
        Self {
            node_type,
            client_connection_id: None,
            server_connection_id: None,
            client_chosen_dest_connection_id: None,
            peer_address,
            original_peer_address: peer_address,
            version: None,
            original_version: None,
            supported_versions: Vec::new(),
            loss: LossState::default(),
            ack_states: AckStates::default(),
            flow_control: FlowControlState::default(),
            outstandings: OutstandingPackets::default(),
            congestion_controller: None,
            congestion_controller_factory: None,
            pacer: None,
            can_be_paced: false,
            app_limited_tracker: AppLimitedTracker::default(),
            streams: StreamManager::new(node_type),
            crypto: CryptoState::default(),
            pending_events: PendingEvents::default(),
            datagram_state: DatagramState::default(),
            ecn_state: EcnState::NotAttempted,
            socket_tos: SocketTos::default(),
            transport_settings: TransportSettings::default(),
            transport_parameters_encoded: false,
            peer_idle_timeout: Duration::ZERO,
            peer_advertised_knob_frame_support: false,
            qlogger: None,
            local_connection_error: None,
            peer_connection_error: None,
            last_processed_ack_events: Vec::new(),
            received_new_packet_before_write: false,
            write_count: 0,
            udp_send_packet_len: 1252,
            connection_time: now,
            used_zero_rtt: false,
            outstanding_path_validation: false,
            packet_processors: Vec::new(),
            ecn_l4s_tracker: None,
            socket_cmsgs: SocketCmsgsState::default(),
            write_debug_state: WriteDebugState::default(),
            read_debug_state: ReadDebugState::default(),
            loop_detector_callback: None,
            stats_callback: None,
            retransmission_policies: BTreeMap::new(),
        }
    }

    /// Pacing is active only when a pacer is installed and the connection
    /// has been cleared to pace.
    pub fn is_connection_paced(&self) -> bool {
        self.can_be_paced && self.pacer.is_some()
    }

    /// Queue a frame that carries no stream data for the next write.
    pub fn send_simple_frame(&mut self, frame: SimpleFrame) {
        self.pending_events.frames.push(frame);
    }
}

#[cfg(test)]
mod state_tests {
    use super::*;

    #[test]
    fn test_socket_tos_layout() {
        let tos = SocketTos { dscp: 0b101010, ecn: 0b01 };
        assert_eq!(tos.value(), 0b1010_1001);
    }

    #[test]
    fn test_ack_state_version_sums_spaces() {
        let mut states = AckStates::default();
        assert_eq!(states.current_version(), 0);
        states.app_data.version += 1;
        states.initial.as_mut().unwrap().version += 2;
        assert_eq!(states.current_version(), 3);
        // Dropping a space keeps the counter monotone for the remainder.
        states.initial = None;
        assert_eq!(states.current_version(), 1);
    }

    #[test]
    fn test_crypto_totals() {
        let crypto = CryptoState {
            initial: CryptoStreamState {
                current_write_offset: 100,
                max_offset_observed: 50,
                has_loss_buffered: false,
            },
            handshake: CryptoStreamState {
                current_write_offset: 200,
                max_offset_observed: 75,
                has_loss_buffered: false,
            },
            one_rtt: CryptoStreamState::default(),
        };
        assert_eq!(crypto.total_data_written(), 300);
        assert_eq!(crypto.total_data_recvd(), 125);
        assert!(crypto.loss_buffers_empty());
    }
}
