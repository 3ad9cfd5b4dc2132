//! The per-connection orchestrator.
//!
//! [`QuicTransport`] composes the timer set, the three loopers, the
//! callback registries, and the collaborator seams into one
//! single-threaded object. The host loop drives it through three entry
//! points: [`QuicTransport::on_network_data`] for ingress,
//! [`QuicTransport::handle_timeout`] when [`QuicTransport::next_timeout`]
//! falls due, and [`QuicTransport::run_loop_iteration`] once per loop
//! iteration to service loopers and deferred tasks.

mod api;
mod close;
mod ingress;
#[cfg(test)]
mod tests;
mod write;

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::byte_event::ByteEventMap;
use crate::callbacks::{
    CloseRequest, ConnectionCallbackHandle, ConnectionSetupCallbackHandle, DatagramCallbackHandle,
    PeekCallbackData, PingCallbackHandle, ReadCallbackData, TransportCtx, WriteCallbackHandle,
};
use crate::ecn::EcnState;
use crate::error::{LocalErrorCode, LocalResult, QuicError, QuicErrorCode};
use crate::interfaces::{LossRecovery, QLogger, TransportObserver, UdpSocket, WireCodec};
use crate::looper::{Looper, LooperKind};
use crate::recovery::{calculate_pto, CongestionControlType};
use crate::settings::{
    TransportSettings, ECN_ECT0, ECN_ECT1, MAX_DATAGRAM_FRAME_SIZE, MIN_CWND_IN_MSS_FOR_BBR,
};
use crate::state::{CloseState, Conn, RetransmissionPolicy};
use crate::stream::StreamState;
use crate::timers::{TimerKind, TimerSet};
use crate::types::{ConnectionId, QuicVersion, Side, StreamGroupId, StreamId};

/// Deferred task queued for the next loop iteration.
struct DeferredTask {
    /// Dropped unless the event-base generation still matches.
    generation: u64,
    task: Box<dyn FnOnce(&mut QuicTransport)>,
}

/// Bookkeeping for the idle-timer cross-check.
#[derive(Debug, Default)]
struct IdleTimeoutCheck {
    idle_timeout: Duration,
    last_time_scheduled: Option<Instant>,
    forced_expiry_scheduled: bool,
}

/// Point-in-time diagnostics snapshot.
#[derive(Debug, Clone)]
pub struct TransportInfo {
    pub connection_time: Instant,
    pub srtt: Duration,
    pub rttvar: Duration,
    pub lrtt: Duration,
    pub mrtt: Option<Duration>,
    pub mss: u64,
    pub congestion_control_type: CongestionControlType,
    pub writable_bytes: u64,
    pub congestion_window: u64,
    pub pacing_burst_size: u64,
    pub pacing_interval: Duration,
    pub packets_retransmitted: u64,
    pub total_packets_sent: u64,
    pub total_ack_eliciting_packets_sent: u64,
    pub total_packets_marked_lost: u64,
    pub total_packets_marked_lost_by_timeout: u64,
    pub total_packets_marked_lost_by_reordering: u64,
    pub total_packets_spuriously_marked_lost: u64,
    pub timeout_based_loss: u64,
    pub total_bytes_retransmitted: u64,
    pub pto: Duration,
    pub bytes_sent: u64,
    pub bytes_acked: u64,
    pub bytes_recvd: u64,
    pub bytes_in_flight: u64,
    pub total_stream_bytes_sent: u64,
    pub total_new_stream_bytes_sent: u64,
    pub pto_count: u32,
    pub total_pto_count: u64,
    pub largest_packet_acked_by_peer: Option<u64>,
    pub largest_packet_sent: Option<u64>,
    pub used_zero_rtt: bool,
}

/// Aggregate statistics for external stats sinks.
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    pub peer_address: SocketAddr,
    pub duration: Duration,
    pub cwnd_bytes: Option<u64>,
    pub congestion_control_type: Option<CongestionControlType>,
    pub pto_count: u32,
    pub srtt: Duration,
    pub mrtt: Duration,
    pub rttvar: Duration,
    pub udp_send_packet_len: u64,
    pub num_streams: u64,
    pub client_chosen_dest_connection_id: Option<String>,
    pub client_connection_id: Option<String>,
    pub server_connection_id: Option<String>,
    pub total_bytes_sent: u64,
    pub total_bytes_received: u64,
    pub total_bytes_retransmitted: u64,
    pub version: Option<QuicVersion>,
}

/// Per-stream diagnostics snapshot.
#[derive(Debug, Clone)]
pub struct StreamTransportInfo {
    pub total_head_of_line_blocked_time: Duration,
    pub hol_blocked_count: u32,
    pub is_hol_blocked: bool,
    pub num_packets_tx_with_new_data: u64,
    pub stream_loss_count: u64,
    pub final_write_offset: Option<u64>,
    pub final_read_offset: Option<u64>,
    pub stream_read_error: Option<QuicError>,
    pub stream_write_error: Option<QuicError>,
}

/// The connection-level transport core.
pub struct QuicTransport {
    pub(crate) conn: Conn,
    pub(crate) socket: Option<Box<dyn UdpSocket>>,
    pub(crate) codec: Box<dyn WireCodec>,
    pub(crate) recovery: Box<dyn LossRecovery>,

    pub(crate) close_state: CloseState,
    pub(crate) timers: TimerSet,
    pub(crate) read_looper: Looper,
    pub(crate) peek_looper: Looper,
    pub(crate) write_looper: Looper,

    deferred: VecDeque<DeferredTask>,
    evb_generation: u64,
    evb_attached: bool,
    unbound: bool,

    pub(crate) read_callbacks: HashMap<StreamId, ReadCallbackData>,
    pub(crate) peek_callbacks: HashMap<StreamId, PeekCallbackData>,
    pub(crate) delivery_callbacks: ByteEventMap,
    pub(crate) tx_callbacks: ByteEventMap,
    pub(crate) pending_write_callbacks: HashMap<StreamId, WriteCallbackHandle>,
    pub(crate) conn_write_callback: Option<WriteCallbackHandle>,
    pub(crate) ping_callback: Option<PingCallbackHandle>,
    pub(crate) datagram_callback: Option<DatagramCallbackHandle>,
    pub(crate) conn_setup_callback: Option<ConnectionSetupCallbackHandle>,
    pub(crate) conn_callback: Option<ConnectionCallbackHandle>,

    pub(crate) observers: Vec<Box<dyn TransportObserver>>,
    qlog_refcnt: u32,

    pub(crate) use_connection_end_with_error_callback: bool,
    pub(crate) transport_ready_notified: bool,
    pub(crate) exception_close_message: Option<String>,

    idle_timeout_check: IdleTimeoutCheck,
    background_priority_threshold: Option<u8>,
    background_utilization_factor: Option<f64>,

    pub(crate) now: Instant,
}

impl QuicTransport {
    pub fn new(
        node_type: Side,
        peer_address: SocketAddr,
        socket: Option<Box<dyn UdpSocket>>,
        codec: Box<dyn WireCodec>,
        recovery: Box<dyn LossRecovery>,
        use_connection_end_with_error_callback: bool,
        now: Instant,
    ) -> Self {
        Self {
            conn: Conn::new(node_type, peer_address, now),
            socket,
            codec,
            recovery,
            close_state: CloseState::Open,
            timers: TimerSet::new(),
            read_looper: Looper::new(LooperKind::Read),
            peek_looper: Looper::new(LooperKind::Peek),
            write_looper: Looper::new(LooperKind::Write),
            deferred: VecDeque::new(),
            evb_generation: 0,
            evb_attached: true,
            unbound: false,
            read_callbacks: HashMap::new(),
            peek_callbacks: HashMap::new(),
            delivery_callbacks: ByteEventMap::default(),
            tx_callbacks: ByteEventMap::default(),
            pending_write_callbacks: HashMap::new(),
            conn_write_callback: None,
            ping_callback: None,
            datagram_callback: None,
            conn_setup_callback: None,
            conn_callback: None,
            observers: Vec::new(),
            qlog_refcnt: 0,
            use_connection_end_with_error_callback,
            transport_ready_notified: false,
            exception_close_message: None,
            idle_timeout_check: IdleTimeoutCheck::default(),
            background_priority_threshold: None,
            background_utilization_factor: None,
            now,
        }
    }

    // ---- basic accessors -------------------------------------------------

    pub fn close_state(&self) -> CloseState {
        self.close_state
    }

    /// Open and not in a local error state.
    pub fn good(&self) -> bool {
        self.close_state == CloseState::Open && !self.error()
    }

    pub fn error(&self) -> bool {
        self.conn.local_connection_error.is_some()
    }

    /// The host has been asked to release the connection.
    pub fn is_unbound(&self) -> bool {
        self.unbound
    }

    pub fn conn(&self) -> &Conn {
        &self.conn
    }

    pub fn conn_mut(&mut self) -> &mut Conn {
        &mut self.conn
    }

    pub fn peer_address(&self) -> SocketAddr {
        self.conn.peer_address
    }

    pub fn original_peer_address(&self) -> SocketAddr {
        self.conn.original_peer_address
    }

    pub fn local_address(&self) -> Option<SocketAddr> {
        self.socket
            .as_ref()
            .filter(|s| s.is_bound())
            .and_then(|s| s.local_address())
    }

    pub fn client_connection_id(&self) -> Option<ConnectionId> {
        self.conn.client_connection_id
    }

    pub fn server_connection_id(&self) -> Option<ConnectionId> {
        self.conn.server_connection_id
    }

    pub fn client_chosen_dest_connection_id(&self) -> Option<ConnectionId> {
        self.conn.client_chosen_dest_connection_id
    }

    pub fn transport_settings(&self) -> &TransportSettings {
        &self.conn.transport_settings
    }

    // ---- callback installation ------------------------------------------

    pub fn set_connection_setup_callback(&mut self, cb: Option<ConnectionSetupCallbackHandle>) {
        self.conn_setup_callback = cb;
    }

    pub fn set_connection_callback(&mut self, cb: Option<ConnectionCallbackHandle>) {
        self.conn_callback = cb;
    }

    pub(crate) fn reset_connection_callbacks(&mut self) {
        self.conn_setup_callback = None;
        self.conn_callback = None;
    }

    /// The handshake layer reports the transport usable by the application.
    /// Flips terminal-callback selection from setup-error to end/error.
    pub fn mark_transport_ready(&mut self) {
        if self.transport_ready_notified {
            return;
        }
        self.transport_ready_notified = true;
        if let Some(cb) = self.conn_setup_callback.clone() {
            self.with_ctx(|ctx| cb.borrow_mut().on_transport_ready(ctx));
        }
    }

    pub fn add_observer(&mut self, observer: Box<dyn TransportObserver>) {
        self.observers.push(observer);
    }

    pub fn add_packet_processor(&mut self, processor: Box<dyn crate::interfaces::PacketProcessor>) {
        self.conn.packet_processors.push(processor);
    }

    // ---- qlog ------------------------------------------------------------

    pub fn qlogger(&self) -> Option<Rc<dyn QLogger>> {
        self.conn.qlogger.clone()
    }

    /// Reference-counted: every `Some` increments, every `None` decrements,
    /// and the logger detaches only when the count returns to zero.
    pub fn set_qlogger(&mut self, qlogger: Option<Rc<dyn QLogger>>) {
        if self.conn.qlogger.is_none() {
            debug_assert_eq!(self.qlog_refcnt, 0);
        } else {
            debug_assert!(self.qlog_refcnt > 0);
        }
        match qlogger {
            Some(qlogger) => {
                self.conn.qlogger = Some(qlogger);
                self.qlog_refcnt += 1;
            }
            None => {
                if self.conn.qlogger.is_some() {
                    self.qlog_refcnt -= 1;
                    if self.qlog_refcnt == 0 {
                        self.conn.qlogger = None;
                    }
                }
            }
        }
    }

    // ---- collaborator wiring --------------------------------------------

    pub fn set_congestion_controller_factory(
        &mut self,
        factory: Box<dyn crate::recovery::CongestionControllerFactory>,
    ) {
        self.conn.congestion_controller_factory = Some(factory);
        self.conn.congestion_controller = None;
    }

    /// Install a pacer. Pacing still requires `pacing_enabled` in settings.
    pub fn set_pacer(&mut self, pacer: Box<dyn crate::recovery::Pacer>) {
        self.conn.pacer = Some(pacer);
    }

    pub fn set_supported_versions(&mut self, versions: Vec<QuicVersion>) {
        self.conn.original_version = versions.first().copied();
        self.conn.supported_versions = versions;
    }

    pub fn set_max_pacing_rate(&mut self, rate_bytes_per_sec: u64) -> LocalResult<()> {
        match self.conn.pacer.as_mut() {
            Some(pacer) => {
                pacer.set_max_pacing_rate(rate_bytes_per_sec);
                Ok(())
            }
            None => {
                warn!(
                    pacing_enabled = self.conn.transport_settings.pacing_enabled,
                    "cannot set max pacing rate without a pacer"
                );
                Err(LocalErrorCode::PacerNotAvailable)
            }
        }
    }

    pub fn set_loop_detector_callback(
        &mut self,
        cb: Option<Box<dyn crate::interfaces::LoopDetectorCallback>>,
    ) {
        self.conn.loop_detector_callback = cb;
    }

    pub fn set_stats_callback(
        &mut self,
        cb: Option<Box<dyn crate::interfaces::TransportStatsCallback>>,
    ) {
        self.conn.stats_callback = cb;
    }

    // ---- transport settings ---------------------------------------------

    /// Before the transport parameters are encoded, settings are fully
    /// replaceable; afterwards only congestion-control fields apply.
    pub fn set_transport_settings(&mut self, settings: TransportSettings) {
        if self.conn.transport_parameters_encoded {
            self.update_congestion_control_settings(&settings);
        } else {
            self.conn
                .streams
                .refresh_max_stream_groups(settings.advertised_max_stream_groups);
            self.conn.transport_settings = settings;
        }

        if self.conn.transport_settings.default_congestion_controller
            != CongestionControlType::None
        {
            let ts = &mut self.conn.transport_settings;
            ts.init_cwnd_in_mss = ts.init_cwnd_in_mss.max(crate::settings::INIT_CWND_IN_MSS);
            ts.min_cwnd_in_mss = ts.min_cwnd_in_mss.max(crate::settings::MIN_CWND_IN_MSS);
            ts.init_cwnd_in_mss = ts.init_cwnd_in_mss.max(ts.min_cwnd_in_mss);
        }

        let mut cc_type = self.conn.transport_settings.default_congestion_controller;
        self.validate_congestion_and_pacing(&mut cc_type);
        if self.conn.transport_settings.pacing_enabled {
            if self.conn.pacer.is_some() {
                if cc_type.is_bbr_family() {
                    self.conn.transport_settings.min_cwnd_in_mss = self
                        .conn
                        .transport_settings
                        .min_cwnd_in_mss
                        .max(MIN_CWND_IN_MSS_FOR_BBR);
                }
                self.conn.can_be_paced =
                    self.conn.transport_settings.pacing_enabled_first_flight;
            } else {
                warn!("pacing cannot be enabled without a pacer");
                self.conn.transport_settings.pacing_enabled = false;
            }
        }
        self.set_congestion_control(cc_type);

        if self.conn.transport_settings.datagram.enabled {
            let config = self.conn.transport_settings.datagram.clone();
            self.conn.datagram_state.max_read_frame_size = MAX_DATAGRAM_FRAME_SIZE;
            self.conn.datagram_state.max_read_buffer_size = config.read_buf_size;
            self.conn.datagram_state.max_write_buffer_size = config.write_buf_size;
        }

        self.update_socket_tos_settings(self.conn.transport_settings.dscp_value);
    }

    fn update_congestion_control_settings(&mut self, settings: &TransportSettings) {
        let ts = &mut self.conn.transport_settings;
        ts.default_congestion_controller = settings.default_congestion_controller;
        ts.init_cwnd_in_mss = settings.init_cwnd_in_mss;
        ts.min_cwnd_in_mss = settings.min_cwnd_in_mss;
        ts.max_cwnd_in_mss = settings.max_cwnd_in_mss;
        ts.pacing_enabled = settings.pacing_enabled;
        ts.pacing_enabled_first_flight = settings.pacing_enabled_first_flight;
    }

    /// Unpaced BBR is unsupported; fall back to Cubic.
    fn validate_congestion_and_pacing(&mut self, cc_type: &mut CongestionControlType) {
        if cc_type.is_bbr_family()
            && (!self.conn.transport_settings.pacing_enabled || self.conn.pacer.is_none())
        {
            warn!("unpaced BBR is not supported, falling back to Cubic");
            *cc_type = CongestionControlType::Cubic;
        }
    }

    pub fn set_congestion_control(&mut self, mut cc_type: CongestionControlType) {
        let current = self
            .conn
            .congestion_controller
            .as_ref()
            .map(|cc| cc.cc_type());
        if current == Some(cc_type) {
            return;
        }
        self.validate_congestion_and_pacing(&mut cc_type);
        let Some(factory) = self.conn.congestion_controller_factory.as_ref() else {
            warn!("no congestion controller factory installed");
            return;
        };
        self.conn.congestion_controller = Some(factory.make_congestion_controller(cc_type));
        if let Some(qlogger) = self.conn.qlogger.as_ref() {
            qlogger.add_transport_state_update(&format!("congestion control set to {cc_type:?}"));
        }
    }

    /// Rewrite the socket TOS byte from the DSCP value and ECN config, and
    /// reset the ECN validator accordingly.
    pub(crate) fn update_socket_tos_settings(&mut self, dscp_value: u8) {
        let initial = self.conn.socket_tos;
        self.conn.socket_tos.dscp = dscp_value;
        if self.conn.transport_settings.enable_ecn_on_egress {
            if self.conn.transport_settings.use_l4s_ecn {
                self.conn.socket_tos.ecn = ECN_ECT1;
                self.conn.ecn_state = EcnState::AttemptingL4s;
            } else {
                self.conn.socket_tos.ecn = ECN_ECT0;
                self.conn.ecn_state = EcnState::AttemptingEcn;
            }
        } else {
            self.conn.socket_tos.ecn = 0;
            self.conn.ecn_state = EcnState::NotAttempted;
        }

        if self.conn.socket_tos != initial {
            if let Some(socket) = self.socket.as_mut().filter(|s| s.is_bound()) {
                socket.set_tos(self.conn.socket_tos.value());
            }
        }
    }

    // ---- background mode ------------------------------------------------

    /// While every stream's priority level is at or past the threshold, run
    /// the congestion controller at the reduced utilization factor.
    pub fn set_background_mode_parameters(
        &mut self,
        max_background_priority: u8,
        utilization_factor: f64,
    ) {
        self.background_priority_threshold = Some(max_background_priority);
        self.background_utilization_factor = Some(utilization_factor);
        self.on_stream_priorities_change();
    }

    pub fn clear_background_mode_parameters(&mut self) {
        self.background_priority_threshold = None;
        self.background_utilization_factor = None;
        self.on_stream_priorities_change();
    }

    pub(crate) fn on_stream_priorities_change(&mut self) {
        let Some(cc) = self.conn.congestion_controller.as_mut() else {
            return;
        };
        let (Some(threshold), Some(factor)) = (
            self.background_priority_threshold,
            self.background_utilization_factor,
        ) else {
            cc.set_bandwidth_utilization_factor(1.0);
            return;
        };
        let all_background = self.conn.streams.highest_priority_level() >= threshold;
        let target = if all_background { factor } else { 1.0 };
        trace!(
            highest_priority = self.conn.streams.highest_priority_level(),
            threshold,
            target,
            "updating background mode"
        );
        cc.set_bandwidth_utilization_factor(target);
    }

    // ---- retransmission policies ----------------------------------------

    pub fn set_stream_group_retransmission_policy(
        &mut self,
        group: StreamGroupId,
        policy: Option<RetransmissionPolicy>,
    ) -> LocalResult<()> {
        let Some(policy) = policy else {
            self.conn.retransmission_policies.remove(&group);
            return Ok(());
        };
        if !self
            .conn
            .transport_settings
            .custom_retransmission_profiles_enabled()
        {
            return Err(LocalErrorCode::InvalidOperation);
        }
        if self.conn.retransmission_policies.len() as u64
            >= self.conn.transport_settings.advertised_max_stream_groups
        {
            return Err(LocalErrorCode::RtxPoliciesLimitExceeded);
        }
        self.conn.retransmission_policies.insert(group, policy);
        Ok(())
    }

    // ---- event base ------------------------------------------------------

    /// Only client connections may migrate between event bases.
    pub fn is_detachable(&self) -> bool {
        self.conn.node_type == Side::Client
    }

    pub fn attach_event_base(&mut self, now: Instant) {
        debug_assert!(!self.evb_attached);
        self.now = now;
        self.evb_attached = true;

        self.schedule_ack_timeout();
        self.schedule_path_validation_timeout();
        self.set_idle_timer();

        self.update_read_looper();
        self.update_peek_looper();
        self.update_write_looper(false, false);

        for observer in self.observers.iter_mut() {
            observer.evb_attach();
        }
    }

    pub fn detach_event_base(&mut self) {
        debug_assert!(self.is_detachable());
        debug_assert!(self.evb_attached);
        self.conn_write_callback = None;
        self.pending_write_callbacks.clear();
        self.timers.cancel(TimerKind::Loss);
        self.timers.cancel(TimerKind::Ack);
        self.timers.cancel(TimerKind::PathValidation);
        self.timers.cancel(TimerKind::Idle);
        self.timers.cancel(TimerKind::Keepalive);
        self.timers.cancel(TimerKind::Drain);
        // Tasks queued against the old event base must not run on the new
        // one.
        self.evb_generation += 1;
        self.evb_attached = false;

        for observer in self.observers.iter_mut() {
            observer.evb_detach();
        }
    }

    /// Queue `task` to run at the start of the next loop iteration. The
    /// task is dropped if the connection moves to another event base first.
    pub(crate) fn run_on_evb_async(
        &mut self,
        task: impl FnOnce(&mut QuicTransport) + 'static,
    ) {
        self.deferred.push_back(DeferredTask {
            generation: self.evb_generation,
            task: Box::new(task),
        });
    }

    // ---- host-loop driving ----------------------------------------------

    /// Earliest instant at which [`handle_timeout`](Self::handle_timeout)
    /// must be called.
    pub fn next_timeout(&self) -> Option<Instant> {
        let pacing = self.write_looper.pacing_deadline();
        match (self.timers.next_deadline(), pacing) {
            (Some(t), Some(p)) => Some(t.min(p)),
            (t, p) => t.or(p),
        }
    }

    /// Fire every timer due at or before `now`.
    pub fn handle_timeout(&mut self, now: Instant) {
        self.now = now;
        while let Some(kind) = self.timers.pop_expired(now) {
            trace!(?kind, "timer expired");
            match kind {
                TimerKind::Loss => self.loss_timeout_expired(),
                TimerKind::Ack => self.ack_timeout_expired(),
                TimerKind::PathValidation => self.path_validation_timeout_expired(),
                TimerKind::Idle => self.idle_timeout_expired(true),
                TimerKind::Keepalive => self.keepalive_timeout_expired(),
                TimerKind::Drain => self.drain_timeout_expired(),
                TimerKind::Ping => self.ping_timeout_expired(),
                TimerKind::ExcessWrite => self.excess_write_timeout_expired(),
            }
        }
    }

    /// Service deferred tasks and run each scheduled looper body at most
    /// once. Call once per host-loop iteration.
    pub fn run_loop_iteration(&mut self, now: Instant) {
        self.now = now;

        while let Some(deferred) = self.deferred.pop_front() {
            if deferred.generation == self.evb_generation {
                (deferred.task)(self);
            }
        }

        self.read_looper.begin_iteration();
        self.peek_looper.begin_iteration();
        self.write_looper.begin_iteration();

        if self.read_looper.should_fire(now) {
            self.read_looper.mark_fired();
            self.invoke_read_data_and_callbacks();
        }
        if self.peek_looper.should_fire(now) {
            self.peek_looper.mark_fired();
            self.invoke_peek_data_and_callbacks();
        }
        if self.write_looper.should_fire(now) {
            self.write_looper.mark_fired();
            self.paced_write_data_to_socket();
            self.commit_pacing_deadline();
        }
    }

    /// After a paced burst, ask the pacer when the next burst may go out.
    fn commit_pacing_deadline(&mut self) {
        if !self.write_looper.is_running() || !self.conn.is_connection_paced() {
            return;
        }
        let delay = self
            .conn
            .pacer
            .as_ref()
            .map(|pacer| pacer.time_until_next_write(self.now))
            .unwrap_or(Duration::ZERO);
        if delay.is_zero() {
            self.write_looper.set_pacing_deadline(None);
        } else {
            self.write_looper.set_pacing_deadline(Some(self.now + delay));
        }
    }

    // ---- callback dispatch plumbing -------------------------------------

    /// Run one application callback and apply any close request it made.
    /// Returns the close state after the request was applied, so dispatch
    /// chains can abort once the connection leaves `Open`.
    pub(crate) fn with_ctx(&mut self, f: impl FnOnce(&mut TransportCtx)) -> CloseState {
        let mut ctx = TransportCtx::new(self.close_state);
        f(&mut ctx);
        if let Some(CloseRequest { error, immediate }) = ctx.close_request.take() {
            if immediate {
                self.close_now(error);
            } else {
                self.close(error);
            }
        }
        self.close_state
    }

    /// Map a collaborator failure into a close, preserving the unsanitized
    /// message for the local application, and return the local error the
    /// API surfaces.
    pub(crate) fn close_on_error(&mut self, error: QuicError, context: &str) -> LocalErrorCode {
        debug!(%error, context, "collaborator error closes connection");
        self.exception_close_message = Some(error.message.clone());
        let mapped = match error.code {
            QuicErrorCode::Transport(_) => LocalErrorCode::TransportError,
            QuicErrorCode::Local(code) => code,
            QuicErrorCode::Application(_) => LocalErrorCode::AppError,
        };
        self.close_impl(
            Some(QuicError::new(error.code, format!("{context} error"))),
            true,
            true,
        );
        mapped
    }

    // ---- timers ----------------------------------------------------------

    pub(crate) fn schedule_loss_timeout(&mut self, timeout: Duration) {
        if self.close_state == CloseState::Closed {
            return;
        }
        let timeout = timeout.max(self.conn.transport_settings.timer_tick_interval);
        self.timers.schedule(TimerKind::Loss, self.now + timeout);
    }

    pub(crate) fn cancel_loss_timeout(&mut self) {
        self.timers.cancel(TimerKind::Loss);
    }

    pub fn is_loss_timeout_scheduled(&self) -> bool {
        self.timers.is_scheduled(TimerKind::Loss)
    }

    /// Ask the recovery collaborator for the alarm deadline and arm or
    /// disarm the loss timer to match.
    pub(crate) fn set_loss_detection_alarm(&mut self) {
        match self.recovery.alarm_deadline(&self.conn, self.now) {
            Some(deadline) => {
                let timeout = deadline.saturating_duration_since(self.now);
                self.schedule_loss_timeout(timeout);
            }
            None => self.cancel_loss_timeout(),
        }
    }

    pub(crate) fn schedule_ack_timeout(&mut self) {
        if self.close_state == CloseState::Closed {
            return;
        }
        if self.conn.pending_events.schedule_ack_timeout {
            if !self.timers.is_scheduled(TimerKind::Ack) {
                let mut factored_rtt = self
                    .conn
                    .loss
                    .srtt
                    .mul_f64(self.conn.transport_settings.ack_timer_factor);
                // ACK_FREQUENCY overrides the factored-RTT heuristic.
                if self
                    .conn
                    .ack_states
                    .app_data
                    .ack_frequency_sequence_number
                    .is_some()
                {
                    factored_rtt = self.conn.ack_states.max_ack_delay;
                }
                let timeout = self
                    .conn
                    .transport_settings
                    .timer_tick_interval
                    .max(self.conn.ack_states.max_ack_delay.min(factored_rtt));
                trace!(?timeout, "scheduling ack timeout");
                self.timers.schedule(TimerKind::Ack, self.now + timeout);
            }
        } else if self.timers.is_scheduled(TimerKind::Ack) {
            self.timers.cancel(TimerKind::Ack);
        }
    }

    pub(crate) fn schedule_path_validation_timeout(&mut self) {
        if self.close_state == CloseState::Closed {
            return;
        }
        if !self.conn.pending_events.schedule_path_validation_timeout {
            if self.timers.is_scheduled(TimerKind::PathValidation) {
                // Path validation succeeded in the meantime.
                self.timers.cancel(TimerKind::PathValidation);
            }
        } else if !self.timers.is_scheduled(TimerKind::PathValidation) {
            let pto = calculate_pto(&self.conn.loss);
            let timeout = (3 * pto).max(6 * self.conn.transport_settings.initial_rtt);
            trace!(?timeout, "scheduling path validation timeout");
            self.timers
                .schedule(TimerKind::PathValidation, self.now + timeout);
        }
    }

    pub(crate) fn schedule_ping_timeout(&mut self, timeout: Duration) {
        if self.timers.is_scheduled(TimerKind::Ping) {
            return;
        }
        self.timers.schedule(TimerKind::Ping, self.now + timeout);
    }

    /// Arm the idle timer (and the keepalive timer at 85% of it).
    pub(crate) fn set_idle_timer(&mut self) {
        if self.close_state == CloseState::Closed {
            return;
        }
        self.timers.cancel(TimerKind::Idle);
        self.timers.cancel(TimerKind::Keepalive);
        let local_idle_timeout = self.conn.transport_settings.idle_timeout;
        if local_idle_timeout.is_zero() {
            return;
        }
        let peer_idle_timeout = if self.conn.peer_idle_timeout > Duration::ZERO {
            self.conn.peer_idle_timeout
        } else {
            local_idle_timeout
        };
        let idle_timeout = local_idle_timeout.min(peer_idle_timeout);

        self.idle_timeout_check.idle_timeout = idle_timeout;
        self.idle_timeout_check.last_time_scheduled = Some(self.now);
        self.idle_timeout_check.forced_expiry_scheduled = false;

        self.timers.schedule(TimerKind::Idle, self.now + idle_timeout);
        if self.conn.transport_settings.enable_keepalive {
            let keepalive = idle_timeout.mul_f64(0.85);
            self.timers
                .schedule(TimerKind::Keepalive, self.now + keepalive);
        }
    }

    /// If the armed idle deadline is already in the past (clock skew, long
    /// stall), fire the expiry asynchronously, at most once per arming.
    pub(crate) fn check_idle_timer(&mut self, now: Instant) {
        if self.close_state == CloseState::Closed {
            return;
        }
        if !self.timers.is_scheduled(TimerKind::Idle) {
            return;
        }
        let Some(last_scheduled) = self.idle_timeout_check.last_time_scheduled else {
            return;
        };
        if self.idle_timeout_check.forced_expiry_scheduled {
            return;
        }
        if now.saturating_duration_since(last_scheduled) >= self.idle_timeout_check.idle_timeout {
            self.idle_timeout_check.forced_expiry_scheduled = true;
            self.run_on_evb_async(|transport| {
                if !transport.good() || transport.close_state == CloseState::Closed {
                    return;
                }
                transport.timers.cancel(TimerKind::Idle);
                transport.idle_timeout_expired(true);
            });
        }
    }

    // ---- timer expiry handlers ------------------------------------------

    fn loss_timeout_expired(&mut self) {
        debug_assert_ne!(self.close_state, CloseState::Closed);
        let now = self.now;
        if let Err(error) = self.recovery.on_loss_detection_alarm(&mut self.conn, now) {
            self.exception_close_message = Some(error.message.clone());
            self.close_impl(
                Some(QuicError::new(error.code, "loss timeout error")),
                true,
                true,
            );
            return;
        }
        if let Some(qlogger) = self.conn.qlogger.as_ref() {
            qlogger.add_transport_state_update("loss timeout expired");
        }
        self.paced_write_data_to_socket();
    }

    fn ack_timeout_expired(&mut self) {
        debug_assert_ne!(self.close_state, CloseState::Closed);
        self.conn.ack_states.app_data.flush_acks = true;
        self.conn.pending_events.schedule_ack_timeout = false;
        self.paced_write_data_to_socket();
    }

    fn path_validation_timeout_expired(&mut self) {
        debug_assert!(self.conn.outstanding_path_validation);
        self.conn.pending_events.schedule_path_validation_timeout = false;
        self.conn.outstanding_path_validation = false;
        if let Some(qlogger) = self.conn.qlogger.as_ref() {
            qlogger.add_path_validation_event(false);
        }
        self.close_impl(
            Some(QuicError::new(
                crate::error::TransportErrorCode::InvalidMigration,
                "Path validation timed out",
            )),
            true,
            true,
        );
    }

    pub(crate) fn idle_timeout_expired(&mut self, drain: bool) {
        debug_assert_ne!(self.close_state, CloseState::Closed);
        let num_open_streams = self.conn.streams.stream_count();
        let num_control_streams = self.conn.streams.num_control_streams();
        let local_error = if drain {
            LocalErrorCode::IdleTimeout
        } else {
            LocalErrorCode::ShuttingDown
        };
        self.close_impl(
            Some(QuicError::new(
                local_error,
                format!(
                    "{}, num non control streams: {}",
                    local_error,
                    num_open_streams - num_control_streams
                ),
            )),
            drain,
            !drain,
        );
    }

    fn keepalive_timeout_expired(&mut self) {
        self.conn.pending_events.send_ping = true;
        self.update_write_looper(true, false);
    }

    fn ping_timeout_expired(&mut self) {
        if let Some(cb) = self.ping_callback.clone() {
            self.with_ctx(|ctx| cb.borrow_mut().ping_timeout(ctx));
        }
    }

    fn excess_write_timeout_expired(&mut self) {
        if self.codec.should_write_data(&self.conn)
            != crate::interfaces::WriteDataReason::NoWrite
        {
            self.paced_write_data_to_socket();
        }
    }

    // ---- diagnostics -----------------------------------------------------

    pub fn get_transport_info(&self) -> TransportInfo {
        let mut congestion_control_type = CongestionControlType::None;
        let mut writable_bytes = u64::MAX;
        let mut congestion_window = u64::MAX;
        let mut pacing_burst_size = 0;
        let mut pacing_interval = Duration::ZERO;
        if let Some(cc) = self.conn.congestion_controller.as_ref() {
            congestion_control_type = cc.cc_type();
            writable_bytes = cc.writable_bytes();
            congestion_window = cc.congestion_window();
            if self.conn.is_connection_paced() {
                if let Some(pacer) = self.conn.pacer.as_ref() {
                    pacing_burst_size = pacer.cached_write_batch_size();
                    pacing_interval = pacer.time_until_next_write(self.now);
                }
            }
        }
        let loss = &self.conn.loss;
        TransportInfo {
            connection_time: self.conn.connection_time,
            srtt: loss.srtt,
            rttvar: loss.rttvar,
            lrtt: loss.lrtt,
            mrtt: (loss.mrtt != Duration::MAX).then_some(loss.mrtt),
            mss: self.conn.udp_send_packet_len,
            congestion_control_type,
            writable_bytes,
            congestion_window,
            pacing_burst_size,
            pacing_interval,
            packets_retransmitted: loss.rtx_count,
            total_packets_sent: loss.total_packets_sent,
            total_ack_eliciting_packets_sent: loss.total_ack_eliciting_packets_sent,
            total_packets_marked_lost: loss.total_packets_marked_lost,
            total_packets_marked_lost_by_timeout: loss.total_packets_marked_lost_by_timeout,
            total_packets_marked_lost_by_reordering: loss.total_packets_marked_lost_by_reordering,
            total_packets_spuriously_marked_lost: loss.total_packets_spuriously_marked_lost,
            timeout_based_loss: loss.timeout_based_rtx_count,
            total_bytes_retransmitted: loss.total_bytes_retransmitted,
            pto: calculate_pto(loss),
            bytes_sent: loss.total_bytes_sent,
            bytes_acked: loss.total_bytes_acked,
            bytes_recvd: loss.total_bytes_recvd,
            bytes_in_flight: loss.inflight_bytes,
            total_stream_bytes_sent: loss.total_stream_bytes_sent,
            total_new_stream_bytes_sent: loss.total_new_stream_bytes_sent,
            pto_count: loss.pto_count,
            total_pto_count: loss.total_pto_count,
            largest_packet_acked_by_peer: self.conn.ack_states.app_data.largest_acked_by_peer,
            largest_packet_sent: loss.largest_sent,
            used_zero_rtt: self.conn.used_zero_rtt,
        }
    }

    pub fn get_connections_stats(&self) -> ConnectionStats {
        let conn = &self.conn;
        ConnectionStats {
            peer_address: conn.peer_address,
            duration: self.now.saturating_duration_since(conn.connection_time),
            cwnd_bytes: conn
                .congestion_controller
                .as_ref()
                .map(|cc| cc.congestion_window()),
            congestion_control_type: conn.congestion_controller.as_ref().map(|cc| cc.cc_type()),
            pto_count: conn.loss.pto_count,
            srtt: conn.loss.srtt,
            mrtt: conn.loss.mrtt,
            rttvar: conn.loss.rttvar,
            udp_send_packet_len: conn.udp_send_packet_len,
            num_streams: conn.streams.stream_count(),
            client_chosen_dest_connection_id: conn
                .client_chosen_dest_connection_id
                .map(|cid| cid.hex()),
            client_connection_id: conn.client_connection_id.map(|cid| cid.hex()),
            server_connection_id: conn.server_connection_id.map(|cid| cid.hex()),
            total_bytes_sent: conn.loss.total_bytes_sent,
            total_bytes_received: conn.loss.total_bytes_recvd,
            total_bytes_retransmitted: conn.loss.total_bytes_retransmitted,
            version: conn.version,
        }
    }

    pub fn get_stream_transport_info(&self, id: StreamId) -> LocalResult<StreamTransportInfo> {
        let stream = self
            .conn
            .streams
            .get_stream(id)
            .ok_or(LocalErrorCode::StreamNotExists)?;
        Ok(StreamTransportInfo {
            total_head_of_line_blocked_time: stream.total_holb_time,
            hol_blocked_count: stream.holb_count,
            is_hol_blocked: stream.is_holb,
            num_packets_tx_with_new_data: stream.num_packets_tx_with_new_data,
            stream_loss_count: stream.stream_loss_count,
            final_write_offset: stream.final_write_offset,
            final_read_offset: stream.final_read_offset,
            stream_read_error: stream.stream_read_error.clone(),
            stream_write_error: stream.stream_write_error.clone(),
        })
    }

    // ---- small shared helpers -------------------------------------------

    pub(crate) fn stream_or_err(&self, id: StreamId) -> LocalResult<&StreamState> {
        self.conn
            .streams
            .get_stream(id)
            .ok_or(LocalErrorCode::StreamNotExists)
    }

    pub(crate) fn require_open(&self) -> LocalResult<()> {
        if self.close_state != CloseState::Open {
            return Err(LocalErrorCode::ConnectionClosed);
        }
        Ok(())
    }
}
