//! Close / drain state machine and cancellation fan-out.

use tracing::{debug, error, trace};

use crate::byte_event::{ByteEvent, ByteEventKind, ByteEventMap};
use crate::error::{LocalErrorCode, QuicError, TransportErrorCode, GENERIC_APP_NO_ERROR};
use crate::interfaces::{CloseStartedEvent, TransportSummary};
use crate::recovery::calculate_pto;
use crate::settings::DRAIN_FACTOR;
use crate::state::{CloseState, PendingEvents};
use crate::timers::TimerKind;
use crate::types::StreamId;

use super::QuicTransport;

/// With no caller-supplied error, close as an application no-error so the
/// peer sees an application close rather than a transport close.
fn maybe_set_generic_app_error(error: Option<QuicError>) -> QuicError {
    error.unwrap_or_else(|| QuicError::new(GENERIC_APP_NO_ERROR, "No Error"))
}

impl QuicTransport {
    /// Orderly close: emit a close frame and enter the drain period.
    pub fn close(&mut self, error: Option<QuicError>) {
        // The caller no longer needs connection callbacks; they asked for
        // the close themselves.
        self.reset_connection_callbacks();
        let error = maybe_set_generic_app_error(error);
        self.close_impl(Some(error), true, true);
    }

    /// Immediate close: no drain period, socket torn down synchronously.
    pub fn close_now(&mut self, error: Option<QuicError>) {
        debug!("closing connection immediately");
        let error = maybe_set_generic_app_error(error);
        self.close_impl(Some(error), false, true);
        // A previous close may have armed the drain timer, in which case
        // this close had no effect. Cancel it and expire it now.
        if self.timers.is_scheduled(TimerKind::Drain) {
            self.timers.cancel(TimerKind::Drain);
            self.drain_timeout_expired();
        }
    }

    /// Stop accepting application activity and wait for open streams to
    /// finish; the connection closes once the stream count reaches zero.
    pub fn close_gracefully(&mut self) {
        if matches!(
            self.close_state,
            CloseState::Closed | CloseState::GracefulClosing
        ) {
            return;
        }
        self.reset_connection_callbacks();
        self.close_state = CloseState::GracefulClosing;
        if let Some(qlogger) = self.conn.qlogger.as_ref() {
            qlogger.add_connection_close("no error", "graceful exit", true, false);
        }

        trace!("stopping read and peek loopers for graceful close");
        self.read_looper.stop();
        self.peek_looper.stop();
        self.cancel_all_app_callbacks(&QuicError::new(LocalErrorCode::NoError, "Graceful Close"));
        // All streams already closed: close the transport for real.
        if self.conn.streams.stream_count() == 0 {
            self.close_impl(None, true, true);
        }
    }

    /// The one place the connection enters `Closed`.
    pub(crate) fn close_impl(
        &mut self,
        error: Option<QuicError>,
        drain_connection: bool,
        send_close_immediately: bool,
    ) {
        if self.close_state == CloseState::Closed {
            return;
        }

        let close_event = CloseStartedEvent {
            close_reason: error.clone(),
        };
        for observer in self.observers.iter_mut() {
            observer.close_started(&close_event);
        }

        let drain_connection = drain_connection && self.conn.transport_settings.should_drain;

        if let Some(qlogger) = self.conn.qlogger.as_ref() {
            qlogger.add_transport_summary(&TransportSummary {
                total_bytes_sent: self.conn.loss.total_bytes_sent,
                total_bytes_recvd: self.conn.loss.total_bytes_recvd,
                sum_cur_write_offset: self.conn.flow_control.sum_cur_write_offset,
                sum_max_observed_offset: self.conn.flow_control.sum_max_observed_offset,
                sum_cur_stream_buffer_len: self.conn.flow_control.sum_cur_stream_buffer_len,
                total_bytes_retransmitted: self.conn.loss.total_bytes_retransmitted,
                total_stream_bytes_cloned: self.conn.loss.total_stream_bytes_cloned,
                total_bytes_cloned: self.conn.loss.total_bytes_cloned,
                total_crypto_data_written: self.conn.crypto.total_data_written(),
                total_crypto_data_recvd: self.conn.crypto.total_data_recvd(),
                current_writable_bytes: self
                    .conn
                    .congestion_controller
                    .as_ref()
                    .map_or(u64::MAX, |cc| cc.writable_bytes()),
                current_conn_flow_control: crate::flow_control::send_conn_flow_control_bytes(
                    &self.conn.flow_control,
                ),
                total_packets_spuriously_marked_lost: self
                    .conn
                    .loss
                    .total_packets_spuriously_marked_lost,
                used_zero_rtt: self.conn.used_zero_rtt,
            });
        }

        self.close_state = CloseState::Closed;

        // cancel_code reaches the local app layer; `error` becomes the
        // local connection error and is sent in close frames. Only the
        // cancel code may carry the unsanitized message.
        let mut cancel_code = QuicError::from_code(LocalErrorCode::NoError);
        if let Some(peer_error) = self.conn.peer_connection_error.clone() {
            cancel_code = peer_error;
        } else if let Some(error) = error.clone() {
            cancel_code = error;
        }
        if let Some(message) = self.exception_close_message.clone() {
            cancel_code.message = message;
        }

        let local_code = cancel_code.code.as_local();
        let is_reset = local_code == Some(LocalErrorCode::ConnectionReset);
        let is_abandon = local_code == Some(LocalErrorCode::ConnectionAbandoned);
        let is_invalid_migration =
            cancel_code.code.as_transport() == Some(TransportErrorCode::InvalidMigration);
        if is_reset {
            debug!("closing transport due to stateless reset");
        }
        if is_abandon {
            debug!("closing transport due to abandoned connection");
        }

        match error.clone() {
            Some(error) => {
                if let Some(qlogger) = self.conn.qlogger.as_ref() {
                    qlogger.add_connection_close(
                        &error.message,
                        &error.message,
                        drain_connection,
                        send_close_immediately,
                    );
                }
                self.conn.local_connection_error = Some(error);
            }
            None => {
                if let Some(qlogger) = self.conn.qlogger.as_ref() {
                    let reason =
                        format!("no error, peer: isReset: {is_reset}, isAbandon: {is_abandon}");
                    qlogger.add_connection_close(
                        "no error",
                        &reason,
                        drain_connection,
                        send_close_immediately,
                    );
                }
            }
        }

        self.cancel_loss_timeout();
        self.timers.cancel(TimerKind::Ack);
        self.timers.cancel(TimerKind::PathValidation);
        self.timers.cancel(TimerKind::Idle);
        self.timers.cancel(TimerKind::Keepalive);
        self.timers.cancel(TimerKind::Ping);
        self.timers.cancel(TimerKind::ExcessWrite);

        trace!("stopping loopers due to close");
        self.read_looper.stop();
        self.peek_looper.stop();
        self.write_looper.stop();

        self.cancel_all_app_callbacks(&cancel_code);

        // The peer resets all streams implicitly when it receives the
        // close; drop ours now along with anything else buffered.
        self.conn.streams.clear_open_streams();
        self.conn.datagram_state.clear();
        self.conn.pending_events = PendingEvents::default();
        self.conn.streams.clear_actionable();
        self.conn.streams.clear_writable();
        self.conn.ack_states.clear_acks();

        if self.transport_ready_notified {
            if let Some(stats) = self.conn.stats_callback.as_mut() {
                stats.on_connection_close(&cancel_code);
            }
            self.process_connection_callbacks(cancel_code);
        } else {
            self.process_connection_setup_callbacks(cancel_code);
        }
        // No connection callbacks may fire past this point.
        self.reset_connection_callbacks();

        self.conn.outstandings.reset();
        self.conn.congestion_controller = None;

        let send_close_immediately = send_close_immediately && !is_reset && !is_abandon;
        if send_close_immediately {
            // May be invoked during teardown; write the close frame
            // directly and absorb any write failure.
            if let Err(write_error) = self.write_close_frame() {
                error!(%write_error, "close write threw");
            }
        }

        let drain_connection =
            drain_connection && !is_reset && !is_abandon && !is_invalid_migration;
        if drain_connection {
            // We drain once per lifetime.
            debug_assert!(!self.timers.is_scheduled(TimerKind::Drain));
            let drain = DRAIN_FACTOR * calculate_pto(&self.conn.loss);
            self.timers.schedule(TimerKind::Drain, self.now + drain);
        } else {
            self.drain_timeout_expired();
        }
    }

    fn write_close_frame(&mut self) -> Result<(), QuicError> {
        let Some(socket) = self.socket.as_deref_mut() else {
            return Ok(());
        };
        self.codec.write_data(&mut self.conn, socket)
    }

    /// Late packets are tolerated no further: tear down the socket and
    /// release the connection from its host.
    pub(crate) fn drain_timeout_expired(&mut self) {
        self.close_udp_socket();
        self.unbind_connection();
    }

    fn unbind_connection(&mut self) {
        self.unbound = true;
    }

    pub(crate) fn close_udp_socket(&mut self) {
        let Some(mut socket) = self.socket.take() else {
            return;
        };
        for observer in self.observers.iter_mut() {
            observer.closing();
        }
        socket.pause_read();
        socket.close();
    }

    fn process_connection_setup_callbacks(&mut self, cancel_code: QuicError) {
        // The setup callback may be absent if the app never started the
        // transport or initiated the close itself.
        if let Some(cb) = self.conn_setup_callback.clone() {
            self.with_ctx(|ctx| cb.borrow_mut().on_connection_setup_error(ctx, cancel_code));
        }
    }

    fn process_connection_callbacks(&mut self, cancel_code: QuicError) {
        let Some(cb) = self.conn_callback.clone() else {
            return;
        };
        if self.use_connection_end_with_error_callback {
            self.with_ctx(|ctx| {
                cb.borrow_mut()
                    .on_connection_end_with_error(ctx, cancel_code)
            });
            return;
        }
        if cancel_code.is_benign() {
            self.with_ctx(|ctx| cb.borrow_mut().on_connection_end(ctx));
        } else {
            self.with_ctx(|ctx| cb.borrow_mut().on_connection_error(ctx, cancel_code));
        }
    }

    /// Cancel every pending application callback with `error`. Each
    /// callback sees exactly one cancellation.
    pub(crate) fn cancel_all_app_callbacks(&mut self, error: &QuicError) {
        self.conn.streams.clear_actionable();
        self.cancel_all_byte_event_callbacks();

        let read_callbacks: Vec<_> = self
            .read_callbacks
            .drain()
            .map(|(id, data)| (id, data.callback))
            .collect();
        for (id, callback) in read_callbacks {
            let Some(callback) = callback else { continue };
            let group = self
                .conn
                .streams
                .get_stream(id)
                .and_then(|stream| stream.group_id);
            let err = error.clone();
            self.with_ctx(|ctx| match group {
                Some(group) => callback.borrow_mut().read_error_with_group(ctx, id, group, err),
                None => callback.borrow_mut().read_error(ctx, id, err),
            });
        }

        trace!("clearing datagram and ping callbacks");
        self.datagram_callback = None;
        self.ping_callback = None;

        let peek_callbacks: Vec<_> = self
            .peek_callbacks
            .drain()
            .map(|(id, data)| (id, data.callback))
            .collect();
        for (id, callback) in peek_callbacks {
            let Some(callback) = callback else { continue };
            let err = error.clone();
            self.with_ctx(|ctx| callback.borrow_mut().peek_error(ctx, id, err));
        }

        if let Some(callback) = self.conn_write_callback.take() {
            let err = error.clone();
            self.with_ctx(|ctx| callback.borrow_mut().on_connection_write_error(ctx, err));
        }
        let pending_writes: Vec<_> = self.pending_write_callbacks.drain().collect();
        for (id, callback) in pending_writes {
            let err = error.clone();
            self.with_ctx(|ctx| callback.borrow_mut().on_stream_write_error(ctx, id, err));
        }

        self.check_for_closed_stream();
        self.update_read_looper();
        self.update_peek_looper();
        self.update_write_looper(true, false);
    }

    /// Cancel every byte-event registration of both kinds.
    pub(crate) fn cancel_all_byte_event_callbacks(&mut self) {
        for kind in ByteEventKind::ALL {
            self.cancel_byte_event_callbacks(kind);
        }
    }

    /// Cancel every byte-event registration of one kind. The map is moved
    /// out first so cancel callbacks cannot re-grow it mid-walk.
    pub(crate) fn cancel_byte_event_callbacks(&mut self, kind: ByteEventKind) {
        let drained = self.byte_event_map_mut(kind).take_all();
        for (id, queue) in drained {
            for detail in queue {
                let event = ByteEvent::new(id, detail.offset, kind);
                self.with_ctx(|ctx| detail.callback.borrow_mut().on_byte_event_canceled(ctx, event));
            }
        }
    }

    /// Cancel byte events of one kind on one stream, strictly below
    /// `offset` when given, all of them otherwise.
    pub(crate) fn cancel_byte_event_callbacks_for_stream_impl(
        &mut self,
        kind: ByteEventKind,
        id: StreamId,
        offset: Option<u64>,
    ) {
        if id.is_receiving_stream(self.conn.node_type) {
            return;
        }

        if self.byte_event_map_mut(kind).is_stream_empty(id) {
            self.byte_event_map_mut(kind).remove_stream(id);
            self.remove_byte_event_index(kind, id);
            return;
        }

        // The queue is offset-sorted, so walk the front and cancel entries
        // below the bound.
        while let Some(detail) = self.byte_event_map_mut(kind).pop_front_if_lt(id, offset) {
            let event = ByteEvent::new(id, detail.offset, kind);
            let state = self
                .with_ctx(|ctx| detail.callback.borrow_mut().on_byte_event_canceled(ctx, event));
            if state != CloseState::Open {
                // Close takes over cleaning whatever remains.
                return;
            }
        }

        if self.byte_event_map_mut(kind).is_stream_empty(id) {
            self.remove_byte_event_index(kind, id);
            self.byte_event_map_mut(kind).remove_stream(id);
        }
    }

    pub(crate) fn byte_event_map_mut(&mut self, kind: ByteEventKind) -> &mut ByteEventMap {
        match kind {
            ByteEventKind::Ack => &mut self.delivery_callbacks,
            ByteEventKind::Tx => &mut self.tx_callbacks,
        }
    }

    fn remove_byte_event_index(&mut self, kind: ByteEventKind, id: StreamId) {
        match kind {
            ByteEventKind::Ack => self.conn.streams.remove_deliverable(id),
            ByteEventKind::Tx => self.conn.streams.remove_tx(id),
        }
    }
}
