//! Collaborator interfaces.
//!
//! The transport core orchestrates; these traits are where the wire format,
//! recovery algorithm, socket, qlog sink, and observers plug in. Failures
//! cross the boundary as [`QuicError`] values; the orchestrator matches on
//! the error family and drives close with the corresponding code.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Instant;

use bytes::Bytes;

use crate::error::QuicError;
use crate::state::Conn;
use crate::types::{StreamDirectionality, StreamId, StreamInitiator};

/// Why the write path wants to run. `NoWrite` stops the write looper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteDataReason {
    NoWrite,
    ProbeWrite,
    Ack,
    CryptoStream,
    Stream,
    Loss,
    Blocked,
    PathChallenge,
    Ping,
    Datagram,
    BufferedWrite,
}

/// Why the read path made no progress, for the loop detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoReadReason {
    ReadOk,
    StaleData,
}

/// One UDP payload as received from the socket layer.
#[derive(Debug, Clone)]
pub struct ReceivedUdpPacket {
    pub data: Bytes,
    pub receive_time: Instant,
    pub tos: u8,
    /// Raw software receive timestamp, when the socket provides one.
    pub software_rx_timestamp: Option<u64>,
}

/// A batch of packets from one socket read.
#[derive(Debug, Default)]
pub struct NetworkData {
    pub packets: Vec<ReceivedUdpPacket>,
}

impl NetworkData {
    pub fn total_data(&self) -> u64 {
        self.packets.iter().map(|p| p.data.len() as u64).sum()
    }
}

/// Wire codec: parses received packets into connection state mutations and
/// encodes pending state into outgoing packets.
pub trait WireCodec {
    /// Decode one packet and apply it to `conn`. A peer-initiated close is
    /// reported by setting `conn.peer_connection_error`, not by failing.
    fn on_read_data(
        &mut self,
        conn: &mut Conn,
        peer: SocketAddr,
        packet: &ReceivedUdpPacket,
    ) -> Result<(), QuicError>;

    /// Encode and hand pending data to the socket, updating counters and
    /// outstanding-packet state on `conn`.
    fn write_data(&mut self, conn: &mut Conn, socket: &mut dyn UdpSocket)
        -> Result<(), QuicError>;

    /// Predicate the write gate consults before scheduling the looper.
    fn should_write_data(&self, conn: &Conn) -> WriteDataReason;

    /// Scheduler label for loop-detector reports.
    fn scheduler_name(&self) -> &'static str {
        "default"
    }
}

/// Loss-detection algorithm boundary.
pub trait LossRecovery {
    /// Deadline for the loss timer, or `None` to leave it unarmed.
    fn alarm_deadline(&self, conn: &Conn, now: Instant) -> Option<Instant>;

    /// The loss timer fired: detect losses, queue retransmissions.
    fn on_loss_detection_alarm(&mut self, conn: &mut Conn, now: Instant)
        -> Result<(), QuicError>;
}

/// The UDP socket surface the core needs. I/O itself happens elsewhere.
pub trait UdpSocket {
    fn is_bound(&self) -> bool;

    fn local_address(&self) -> Option<SocketAddr>;

    fn set_tos(&mut self, tos: u8);

    fn pause_read(&mut self);

    fn close(&mut self);

    /// Socket-writable event machinery; default for sockets without it.
    fn is_writable_callback_set(&self) -> bool {
        false
    }

    fn resume_write(&mut self) {}

    fn pause_write(&mut self) {}
}

/// Totals snapshot emitted to qlog when the connection closes.
#[derive(Debug, Clone, Default)]
pub struct TransportSummary {
    pub total_bytes_sent: u64,
    pub total_bytes_recvd: u64,
    pub sum_cur_write_offset: u64,
    pub sum_max_observed_offset: u64,
    pub sum_cur_stream_buffer_len: u64,
    pub total_bytes_retransmitted: u64,
    pub total_stream_bytes_cloned: u64,
    pub total_bytes_cloned: u64,
    pub total_crypto_data_written: u64,
    pub total_crypto_data_recvd: u64,
    pub current_writable_bytes: u64,
    pub current_conn_flow_control: u64,
    pub total_packets_spuriously_marked_lost: u64,
    pub used_zero_rtt: bool,
}

/// qlog sink. Owned per connection and reference-counted by the transport.
pub trait QLogger {
    fn add_connection_close(&self, error: &str, reason: &str, drain: bool, send_close_immediately: bool);

    fn add_transport_summary(&self, summary: &TransportSummary);

    fn add_transport_state_update(&self, update: &str);

    fn add_path_validation_event(&self, success: bool);

    fn add_priority_update(&self, id: StreamId, level: u8, incremental: bool);
}

/// Close-started observer payload.
#[derive(Debug, Clone)]
pub struct CloseStartedEvent {
    pub close_reason: Option<QuicError>,
}

/// Packets-received observer payload.
#[derive(Debug, Clone)]
pub struct PacketsReceivedEvent {
    pub receive_loop_time: Instant,
    pub num_packets_received: u64,
    pub num_bytes_received: u64,
    pub packets: Vec<ObservedPacket>,
}

#[derive(Debug, Clone)]
pub struct ObservedPacket {
    pub receive_time: Instant,
    pub num_bytes: u64,
    pub tos: u8,
    pub software_rx_timestamp: Option<u64>,
}

/// Packets-written observer payload.
#[derive(Debug, Clone)]
pub struct PacketsWrittenEvent {
    pub write_count: u64,
    pub num_packets_written: u64,
    pub num_ack_eliciting_packets_written: u64,
    pub num_bytes_written: u64,
    pub cwnd_bytes: Option<u64>,
    pub writable_bytes: Option<u64>,
}

/// Stream open/close observer payload.
#[derive(Debug, Clone)]
pub struct StreamEvent {
    pub id: StreamId,
    pub initiator: StreamInitiator,
    pub directionality: StreamDirectionality,
}

/// Knob-frame observer payload.
#[derive(Debug, Clone)]
pub struct KnobFrameEvent {
    pub receive_time: Instant,
    pub knob_space: u64,
    pub knob_id: u64,
    pub blob: Bytes,
}

/// Lifecycle observer. All methods default to no-ops; observers read, they
/// do not mutate.
pub trait TransportObserver {
    fn close_started(&mut self, _event: &CloseStartedEvent) {}

    /// The UDP socket is about to close.
    fn closing(&mut self) {}

    fn packets_received(&mut self, _event: &PacketsReceivedEvent) {}

    fn packets_written(&mut self, _event: &PacketsWrittenEvent) {}

    fn acks_processed(&mut self, _events: &[crate::state::AckEvent]) {}

    fn start_writing_from_app_limited(&mut self) {}

    fn app_rate_limited(&mut self) {}

    fn stream_opened(&mut self, _event: &StreamEvent) {}

    fn stream_closed(&mut self, _event: &StreamEvent) {}

    fn evb_attach(&mut self) {}

    fn evb_detach(&mut self) {}

    fn knob_frame_received(&mut self, _event: &KnobFrameEvent) {}
}

/// Ancillary socket control messages, keyed by (level, type).
pub type SocketCmsgMap = BTreeMap<(i32, i32), u64>;

/// Request produced by a packet processor before a write iteration.
#[derive(Debug, Clone, Default)]
pub struct PrewriteRequest {
    pub cmsgs: Option<SocketCmsgMap>,
}

/// Per-packet processing hook (e.g. an L4S mark tracker).
pub trait PacketProcessor {
    fn prewrite(&mut self) -> Option<PrewriteRequest> {
        None
    }
}

/// Sink for suspicious read/write loop reports.
pub trait LoopDetectorCallback {
    fn on_suspicious_write_loops(
        &mut self,
        _empty_loop_count: u64,
        _write_reason: WriteDataReason,
        _scheduler: &'static str,
    ) {
    }

    fn on_suspicious_read_loops(&mut self, _loop_count: u64, _reason: NoReadReason) {}
}

/// Transport stats sink (counters only; aggregation is external).
pub trait TransportStatsCallback {
    fn on_connection_close(&mut self, _error: &QuicError) {}

    fn on_stream_reset(&mut self, _error: crate::error::ApplicationErrorCode) {}

    fn on_datagram_dropped_on_write(&mut self) {}

    fn on_datagram_dropped_on_read(&mut self) {}
}
