//! Write-path orchestration: pacing, the socket write, app-limited
//! detection, and the TX byte-event dispatch that follows a write.

use tracing::trace;

use crate::byte_event::ByteEvent;
use crate::error::{QuicError, TransportErrorCode};
use crate::interfaces::{
    PacketProcessor, PacketsWrittenEvent, PrewriteRequest, SocketCmsgMap, WriteDataReason,
};
use crate::state::CloseState;
use crate::timers::TimerKind;

use super::QuicTransport;

/// Earlier processors win on key conflicts.
fn merge_prewrite_cmsgs(cmsgs: &mut SocketCmsgMap, request: PrewriteRequest) {
    if let Some(request_cmsgs) = request.cmsgs {
        for (key, value) in request_cmsgs {
            cmsgs.entry(key).or_insert(value);
        }
    }
}

impl QuicTransport {
    /// The single entry to the wire writer.
    pub(crate) fn paced_write_data_to_socket(&mut self) {
        if !self.conn.is_connection_paced() {
            // Not paced: normal write. Even if pacing was enabled earlier
            // and then got disabled, flush the residue from pacing writes.
            self.write_socket_data_and_catch();

            if self.conn.transport_settings.schedule_timer_for_excess_writes {
                // Data still buffered: yield the loop but come back as soon
                // as possible.
                if self.codec.should_write_data(&self.conn) != WriteDataReason::NoWrite
                    && !self.timers.is_scheduled(TimerKind::ExcessWrite)
                {
                    self.timers.schedule(TimerKind::ExcessWrite, self.now);
                }
            }
            self.maybe_stop_write_looper_and_arm_socket_writable_event();
            return;
        }

        if self.write_looper.is_pacing_scheduled(self.now) {
            // The next burst is already scheduled; the burst size does not
            // depend on what is currently buffered, so leave it be.
            self.maybe_stop_write_looper_and_arm_socket_writable_event();
            return;
        }

        // One burst now, then wait out the pacing interval.
        self.write_socket_data_and_catch();
        self.maybe_stop_write_looper_and_arm_socket_writable_event();
    }

    pub(crate) fn write_socket_data_and_catch(&mut self) {
        match self.write_socket_data() {
            Ok(()) => self.process_callbacks_after_write_data(),
            Err(error) => {
                self.exception_close_message = Some(error.message.clone());
                self.close_impl(
                    Some(QuicError::new(error.code, "write socket data error")),
                    true,
                    true,
                );
            }
        }
    }

    /// One write iteration: snapshot counters, hand pending state to the
    /// wire writer, then account for what went out.
    pub(crate) fn write_socket_data(&mut self) -> Result<(), QuicError> {
        if self.socket.is_some() {
            // Incremented on each write or write attempt.
            self.conn.write_count += 1;

            let before_total_bytes_sent = self.conn.loss.total_bytes_sent;
            let before_total_packets_sent = self.conn.loss.total_packets_sent;
            let before_ack_eliciting_sent = self.conn.loss.total_ack_eliciting_packets_sent;
            let before_num_outstanding = self.conn.outstandings.num_outstanding();

            self.update_packet_processors_prewrite_requests();

            // Transitioning out of app-limited with a congestion
            // controller present is observer-visible.
            if self.conn.app_limited_tracker.is_app_limited()
                && self.conn.congestion_controller.is_some()
            {
                self.conn.app_limited_tracker.set_not_app_limited();
                for observer in self.observers.iter_mut() {
                    observer.start_writing_from_app_limited();
                }
            }

            {
                let socket = self.socket.as_deref_mut().expect("socket checked above");
                self.codec.write_data(&mut self.conn, socket)?;
            }

            if self.close_state != CloseState::Closed {
                if self.conn.pending_events.close_transport {
                    return Err(QuicError::new(
                        TransportErrorCode::ProtocolViolation,
                        "Max packet number reached",
                    ));
                }
                self.set_loss_detection_alarm();

                let after_total_bytes_sent = self.conn.loss.total_bytes_sent;
                let after_total_packets_sent = self.conn.loss.total_packets_sent;
                let after_ack_eliciting_sent = self.conn.loss.total_ack_eliciting_packets_sent;
                let after_num_outstanding = self.conn.outstandings.num_outstanding();
                debug_assert!(before_total_packets_sent <= after_total_packets_sent);
                debug_assert!(before_ack_eliciting_sent <= after_ack_eliciting_sent);
                debug_assert!(before_num_outstanding <= after_num_outstanding);
                debug_assert_eq!(
                    after_num_outstanding - before_num_outstanding,
                    after_ack_eliciting_sent - before_ack_eliciting_sent
                );
                let new_packets = after_total_packets_sent > before_total_packets_sent;
                let new_outstanding_packets =
                    after_ack_eliciting_sent > before_ack_eliciting_sent;

                if new_packets && !self.observers.is_empty() {
                    let event = PacketsWrittenEvent {
                        write_count: self.conn.write_count,
                        num_packets_written: after_total_packets_sent - before_total_packets_sent,
                        num_ack_eliciting_packets_written: after_ack_eliciting_sent
                            - before_ack_eliciting_sent,
                        num_bytes_written: after_total_bytes_sent - before_total_bytes_sent,
                        cwnd_bytes: self
                            .conn
                            .congestion_controller
                            .as_ref()
                            .map(|cc| cc.congestion_window()),
                        writable_bytes: self
                            .conn
                            .congestion_controller
                            .as_ref()
                            .map(|cc| cc.writable_bytes()),
                    };
                    for observer in self.observers.iter_mut() {
                        observer.packets_written(&event);
                    }
                }

                if self.conn.loop_detector_callback.is_some() {
                    if new_outstanding_packets {
                        self.conn.write_debug_state.current_empty_loop_count = 0;
                    } else if self.conn.write_debug_state.needs_write_loop_detect {
                        self.conn.write_debug_state.current_empty_loop_count += 1;
                        let count = self.conn.write_debug_state.current_empty_loop_count;
                        let reason = self.conn.write_debug_state.write_data_reason;
                        let scheduler = self.codec.scheduler_name();
                        if let Some(detector) = self.conn.loop_detector_callback.as_mut() {
                            detector.on_suspicious_write_loops(count, reason, scheduler);
                        }
                    }
                }

                // A new packet after quiescence, or after receiving from
                // the peer, restarts the idle clock.
                if new_outstanding_packets
                    && (before_num_outstanding == 0
                        || self.conn.received_new_packet_before_write)
                {
                    self.set_idle_timer();
                    self.conn.received_new_packet_before_write = false;
                }

                // App-limited detection after this round of sending.
                let current_send_buf_len = self.conn.flow_control.sum_cur_stream_buffer_len;
                let loss_buffer_empty =
                    !self.conn.streams.has_loss() && self.conn.crypto.loss_buffers_empty();
                let cc_has_room = self
                    .conn
                    .congestion_controller
                    .as_ref()
                    .is_some_and(|cc| cc.writable_bytes() > 0);
                if cc_has_room
                    && current_send_buf_len < self.conn.udp_send_packet_len
                    && loss_buffer_empty
                {
                    if let Some(cc) = self.conn.congestion_controller.as_mut() {
                        cc.set_app_limited();
                    }
                    if self.transport_ready_notified {
                        if let Some(cb) = self.conn_callback.clone() {
                            self.with_ctx(|ctx| cb.borrow_mut().on_app_rate_limited(ctx));
                        }
                    }
                    self.conn.app_limited_tracker.set_app_limited();
                    for observer in self.observers.iter_mut() {
                        observer.app_rate_limited();
                    }
                }
            }
        }
        // Writing may have flushed an ack and cancelled the need for the
        // ack timer; re-evaluating makes that take effect.
        self.schedule_ack_timeout();
        self.schedule_path_validation_timeout();
        self.update_write_looper(false, false);
        Ok(())
    }

    /// TX byte events for everything the last write put on the wire.
    pub(crate) fn process_callbacks_after_write_data(&mut self) {
        if self.close_state != CloseState::Open {
            return;
        }

        while let Some(id) = self.conn.streams.pop_tx() {
            let Some(largest_offset_txed) = self
                .conn
                .streams
                .get_stream(id)
                .and_then(|stream| stream.largest_offset_txed)
            else {
                // In the TX set implies a valid offset.
                debug_assert!(false, "txed stream without a txed offset");
                continue;
            };

            while let Some(detail) = self.tx_callbacks.pop_front_if_le(id, largest_offset_txed) {
                let event = ByteEvent::new(id, detail.offset, crate::byte_event::ByteEventKind::Tx);
                let state =
                    self.with_ctx(|ctx| detail.callback.borrow_mut().on_byte_event(ctx, event));
                // The connection may be closed by the callback.
                if state != CloseState::Open {
                    return;
                }
            }
            if self.tx_callbacks.is_stream_empty(id) {
                self.tx_callbacks.remove_stream(id);
            }
        }
    }

    /// Aggregate ancillary cmsgs from the packet processors (the L4S
    /// tracker included) for this write iteration.
    pub(crate) fn update_packet_processors_prewrite_requests(&mut self) {
        let mut cmsgs = SocketCmsgMap::new();
        for processor in self.conn.packet_processors.iter_mut() {
            if let Some(request) = processor.prewrite() {
                merge_prewrite_cmsgs(&mut cmsgs, request);
            }
        }
        if let Some(tracker) = self.conn.ecn_l4s_tracker.as_mut() {
            if let Some(request) = tracker.prewrite() {
                merge_prewrite_cmsgs(&mut cmsgs, request);
            }
        }
        self.conn.socket_cmsgs.additional_cmsgs = (!cmsgs.is_empty()).then_some(cmsgs);
        self.conn.socket_cmsgs.target_write_count = self.conn.write_count;
    }

    /// With socket-writable events in use: once only buffered data (or new
    /// data with window available) remains, wait for the socket instead of
    /// spinning the write looper.
    pub(crate) fn maybe_stop_write_looper_and_arm_socket_writable_event(&mut self) {
        if self.socket.is_none() || self.close_state == CloseState::Closed {
            return;
        }
        if !self.conn.transport_settings.use_sock_writable_events {
            return;
        }
        let socket = self.socket.as_deref_mut().expect("socket checked above");
        if socket.is_writable_callback_set() {
            return;
        }
        let write_reason = self.codec.should_write_data(&self.conn);
        let have_buffer_to_retry = write_reason == WriteDataReason::BufferedWrite;
        let have_new_data_to_write =
            write_reason != WriteDataReason::NoWrite && !have_buffer_to_retry;
        let have_congestion_window = self
            .conn
            .congestion_controller
            .as_ref()
            .map_or(true, |cc| cc.writable_bytes() > 0);
        let have_flow_window =
            crate::flow_control::send_conn_flow_control_bytes(&self.conn.flow_control) > 0;
        let conn_has_write_window = have_congestion_window && have_flow_window;
        if have_buffer_to_retry || (have_new_data_to_write && conn_has_write_window) {
            let socket = self.socket.as_deref_mut().expect("socket checked above");
            socket.resume_write();
            self.write_looper.stop();
        }
    }

    /// The socket reports writability: stop waiting and try to write in
    /// this very iteration.
    pub fn on_socket_writable(&mut self) {
        if let Some(socket) = self.socket.as_deref_mut() {
            socket.pause_write();
        }
        self.write_looper.run(true);
    }

    /// The write gate: decides whether the write looper should run at all.
    pub(crate) fn update_write_looper(&mut self, this_iteration: bool, run_inline: bool) {
        if self.close_state == CloseState::Closed {
            trace!("stopping write looper because connection is closed");
            self.write_looper.stop();
            return;
        }

        if self.conn.transport_settings.check_idle_timer_on_write {
            self.check_idle_timer(self.now);
            if self.close_state == CloseState::Closed {
                return;
            }
        }

        // With socket-writable events in use, an armed writable wait wins.
        if self.conn.transport_settings.use_sock_writable_events
            && self
                .socket
                .as_ref()
                .is_some_and(|socket| socket.is_writable_callback_set())
        {
            return;
        }

        let write_reason = self.codec.should_write_data(&self.conn);
        if write_reason != WriteDataReason::NoWrite {
            trace!(?write_reason, this_iteration, "running write looper");
            self.write_looper.run(this_iteration);
            if self.conn.loop_detector_callback.is_some() {
                self.conn.write_debug_state.needs_write_loop_detect = true;
            }
            if run_inline && self.write_looper.should_fire(self.now) {
                self.write_looper.mark_fired();
                self.paced_write_data_to_socket();
            }
        } else {
            trace!("stopping write looper");
            self.write_looper.stop();
            if self.conn.loop_detector_callback.is_some() {
                self.conn.write_debug_state.needs_write_loop_detect = false;
                self.conn.write_debug_state.current_empty_loop_count = 0;
            }
        }
        if self.conn.loop_detector_callback.is_some() {
            self.conn.write_debug_state.write_data_reason = write_reason;
        }
    }
}
