//! Network-data ingress and the post-network callback fan-out.

use std::net::SocketAddr;
use std::time::Instant;

use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use crate::byte_event::{ByteEvent, ByteEventKind};
use crate::ecn::{self, EcnMarkCounts, EcnState, L4sTracker};
use crate::error::{QuicError, TransportErrorCode};
use crate::interfaces::{
    KnobFrameEvent, NetworkData, NoReadReason, ObservedPacket, PacketsReceivedEvent, StreamEvent,
};
use crate::settings::TRANSPORT_KNOB_SPACE;
use crate::state::CloseState;
use crate::timers::TimerKind;
use crate::types::{StreamDirectionality, StreamId, StreamInitiator};

use super::QuicTransport;

impl QuicTransport {
    /// Entry point for one batch of UDP reads addressed to this
    /// connection.
    pub fn on_network_data(&mut self, peer: SocketAddr, data: NetworkData, now: Instant) {
        self.now = now;
        // Run the write looper ourselves unless the caller does it per
        // socket read.
        let schedule_update_write_looper =
            !self.conn.transport_settings.network_data_per_socket_read;

        if let Err(error) = self.on_network_data_inner(peer, data) {
            self.exception_close_message = Some(error.message.clone());
            self.close_impl(Some(error), true, true);
        }

        self.check_for_closed_stream();
        self.update_read_looper();
        self.update_peek_looper();
        if schedule_update_write_looper {
            let inline = self.conn.transport_settings.inline_write_after_read;
            self.update_write_looper(true, inline);
        }
    }

    fn on_network_data_inner(
        &mut self,
        peer: SocketAddr,
        data: NetworkData,
    ) -> Result<(), QuicError> {
        self.conn.loss.total_bytes_recvd += data.total_data();
        let original_ack_version = self.conn.ack_states.current_version();

        if !self.observers.is_empty() {
            let event = PacketsReceivedEvent {
                receive_loop_time: self.now,
                num_packets_received: data.packets.len() as u64,
                num_bytes_received: data.total_data(),
                packets: data
                    .packets
                    .iter()
                    .map(|packet| ObservedPacket {
                        receive_time: packet.receive_time,
                        num_bytes: packet.data.len() as u64,
                        tos: packet.tos,
                        software_rx_timestamp: packet.software_rx_timestamp,
                    })
                    .collect(),
            };
            for observer in self.observers.iter_mut() {
                observer.packets_received(&event);
            }
        }

        let mut processed_callbacks = false;
        for packet in &data.packets {
            self.codec.on_read_data(&mut self.conn, peer, packet)?;
            if self.conn.peer_connection_error.is_some() {
                self.close_impl(
                    Some(QuicError::new(TransportErrorCode::NoError, "Peer closed")),
                    true,
                    true,
                );
                return Ok(());
            }
            if self.conn.transport_settings.process_callbacks_per_packet {
                self.process_callbacks_after_network_data();
                self.invoke_read_data_and_callbacks();
                processed_callbacks = true;
            }
        }

        // Avoid running the fan-out twice for the last packet.
        if !processed_callbacks {
            self.process_callbacks_after_network_data();
        }

        if self.close_state != CloseState::Closed {
            if self.conn.ack_states.current_version() != original_ack_version {
                self.set_idle_timer();
                self.conn.received_new_packet_before_write = true;
                if self.conn.loop_detector_callback.is_some() {
                    self.conn.read_debug_state.no_read_reason = NoReadReason::ReadOk;
                    self.conn.read_debug_state.loop_count = 0;
                }
            } else if self.conn.loop_detector_callback.is_some() {
                self.conn.read_debug_state.no_read_reason = NoReadReason::StaleData;
                self.conn.read_debug_state.loop_count += 1;
                let loop_count = self.conn.read_debug_state.loop_count;
                let reason = self.conn.read_debug_state.no_read_reason;
                if let Some(detector) = self.conn.loop_detector_callback.as_mut() {
                    detector.on_suspicious_read_loops(loop_count, reason);
                }
            }
            // Reading data could process an ack and change the loss timer,
            // the ack state, or complete path validation.
            self.set_loss_detection_alarm();
            self.schedule_ack_timeout();
            self.schedule_path_validation_timeout();
            self.validate_ecn_state();
        } else {
            // Closed while processing: write out the close; the write
            // looper is stopped by now.
            self.write_socket_data()?;
        }
        Ok(())
    }

    /// The fixed post-network dispatch chain. Every step aborts the chain
    /// when a callback moves the connection out of `Open`.
    pub(crate) fn process_callbacks_after_network_data(&mut self) {
        if self.close_state != CloseState::Open {
            return;
        }
        if !self.handle_new_stream_callbacks() {
            return;
        }
        if !self.handle_new_grouped_stream_callbacks() {
            return;
        }
        if !self.handle_ping_callbacks() {
            return;
        }
        if !self.handle_knob_callbacks() {
            return;
        }
        if !self.handle_ack_event_callbacks() {
            return;
        }
        if !self.handle_cancel_byte_event_callbacks() {
            return;
        }
        if !self.handle_delivery_callbacks() {
            return;
        }
        if !self.handle_stream_flow_control_updated_callbacks() {
            return;
        }
        if !self.handle_stream_stop_sending_callbacks() {
            return;
        }
        if !self.handle_conn_writable() {
            return;
        }
        self.invoke_streams_available_callbacks();
        self.cleanup_ack_event_state();
    }

    fn stream_event(&self, id: StreamId) -> StreamEvent {
        let initiator = if id.initiator() == self.conn.node_type {
            StreamInitiator::Local
        } else {
            StreamInitiator::Remote
        };
        let directionality = if id.is_bidirectional() {
            StreamDirectionality::Bidirectional
        } else {
            StreamDirectionality::Unidirectional
        };
        StreamEvent {
            id,
            initiator,
            directionality,
        }
    }

    pub(crate) fn log_stream_open_event(&mut self, id: StreamId) {
        let event = self.stream_event(id);
        for observer in self.observers.iter_mut() {
            observer.stream_opened(&event);
        }
    }

    fn handle_new_stream_callbacks(&mut self) -> bool {
        let new_streams: SmallVec<[StreamId; 8]> =
            self.conn.streams.consume_new_peer_streams().into();
        for id in new_streams {
            let Some(cb) = self.conn_callback.clone() else {
                break;
            };
            let state = self.with_ctx(|ctx| {
                if id.is_bidirectional() {
                    cb.borrow_mut().on_new_bidirectional_stream(ctx, id);
                } else {
                    cb.borrow_mut().on_new_unidirectional_stream(ctx, id);
                }
            });
            if state != CloseState::Open {
                return false;
            }
            self.log_stream_open_event(id);
        }
        true
    }

    fn handle_new_grouped_stream_callbacks(&mut self) -> bool {
        let new_groups = self.conn.streams.consume_new_peer_stream_groups();
        for group in new_groups {
            let Some(cb) = self.conn_callback.clone() else {
                break;
            };
            let state = self.with_ctx(|ctx| {
                if StreamId(group.0).is_bidirectional() {
                    cb.borrow_mut().on_new_bidirectional_stream_group(ctx, group);
                } else {
                    cb.borrow_mut()
                        .on_new_unidirectional_stream_group(ctx, group);
                }
            });
            if state != CloseState::Open {
                return false;
            }
        }

        let new_streams: SmallVec<[StreamId; 8]> =
            self.conn.streams.consume_new_grouped_peer_streams().into();
        for id in new_streams {
            let Some(cb) = self.conn_callback.clone() else {
                break;
            };
            let Some(group) = self
                .conn
                .streams
                .get_stream(id)
                .and_then(|stream| stream.group_id)
            else {
                continue;
            };
            let state = self.with_ctx(|ctx| {
                if id.is_bidirectional() {
                    cb.borrow_mut()
                        .on_new_bidirectional_stream_in_group(ctx, id, group);
                } else {
                    cb.borrow_mut()
                        .on_new_unidirectional_stream_in_group(ctx, id, group);
                }
            });
            if state != CloseState::Open {
                return false;
            }
            self.log_stream_open_event(id);
        }
        true
    }

    pub(crate) fn handle_ping_callbacks(&mut self) -> bool {
        if self.conn.pending_events.notify_ping_received {
            self.conn.pending_events.notify_ping_received = false;
            if let Some(cb) = self.ping_callback.clone() {
                let state = self.with_ctx(|ctx| cb.borrow_mut().on_ping(ctx));
                if state != CloseState::Open {
                    return false;
                }
            }
        }

        if !self.conn.pending_events.cancel_ping_timeout {
            return true; // nothing to cancel
        }
        if !self.timers.is_scheduled(TimerKind::Ping) {
            // Timeout already fired; nothing to acknowledge.
            self.conn.pending_events.cancel_ping_timeout = false;
            return true;
        }
        self.timers.cancel(TimerKind::Ping);
        self.conn.pending_events.cancel_ping_timeout = false;
        if let Some(cb) = self.ping_callback.clone() {
            let state = self.with_ctx(|ctx| cb.borrow_mut().ping_acknowledged(ctx));
            if state != CloseState::Open {
                return false;
            }
        }
        true
    }

    fn handle_knob_callbacks(&mut self) -> bool {
        if self.conn.pending_events.knobs.is_empty() {
            return true;
        }
        if !self.conn.transport_settings.advertised_knob_frame_support {
            warn!("received knob frames without advertising support");
            self.conn.pending_events.knobs.clear();
            return true;
        }
        let knobs = std::mem::take(&mut self.conn.pending_events.knobs);
        for knob in knobs {
            if knob.knob_space != TRANSPORT_KNOB_SPACE {
                let event = KnobFrameEvent {
                    receive_time: self.now,
                    knob_space: knob.knob_space,
                    knob_id: knob.knob_id,
                    blob: knob.blob.clone(),
                };
                for observer in self.observers.iter_mut() {
                    observer.knob_frame_received(&event);
                }
                if let Some(cb) = self.conn_callback.clone() {
                    let state = self.with_ctx(|ctx| {
                        cb.borrow_mut()
                            .on_knob(ctx, knob.knob_space, knob.knob_id, knob.blob)
                    });
                    if state != CloseState::Open {
                        return false;
                    }
                }
            } else {
                // Knob id is ignored for the transport's own space.
                self.on_transport_knobs(&knob.blob);
            }
        }
        true
    }

    fn on_transport_knobs(&mut self, blob: &[u8]) {
        debug!(len = blob.len(), "received transport knobs");
    }

    fn handle_ack_event_callbacks(&mut self) -> bool {
        if self.conn.last_processed_ack_events.is_empty() {
            return true; // nothing to do
        }
        let events = std::mem::take(&mut self.conn.last_processed_ack_events);
        for observer in self.observers.iter_mut() {
            observer.acks_processed(&events);
        }
        true
    }

    fn handle_cancel_byte_event_callbacks(&mut self) -> bool {
        let reset_ids: SmallVec<[StreamId; 8]> =
            self.conn.pending_events.resets.keys().copied().collect();
        for id in reset_ids {
            for kind in ByteEventKind::ALL {
                self.cancel_byte_event_callbacks_for_stream_impl(kind, id, None);
            }
            if self.close_state != CloseState::Open {
                return false;
            }
        }
        true
    }

    pub(crate) fn handle_delivery_callbacks(&mut self) -> bool {
        while let Some(id) = self.conn.streams.pop_deliverable() {
            let max_offset_to_deliver = self
                .conn
                .streams
                .get_stream(id)
                .and_then(|stream| stream.largest_deliverable_offset);

            if let Some(max_offset) = max_offset_to_deliver {
                // Data at or below the delivered offset is never needed
                // again.
                if let Some(stream) = self.conn.streams.get_stream_mut(id) {
                    stream.trim_write_buffer_to(max_offset);
                }

                while let Some(detail) = self.delivery_callbacks.pop_front_if_le(id, max_offset) {
                    let event = ByteEvent::with_srtt(id, detail.offset, self.conn.loss.srtt);
                    let state =
                        self.with_ctx(|ctx| detail.callback.borrow_mut().on_byte_event(ctx, event));
                    if state != CloseState::Open {
                        return false;
                    }
                }
            }

            if self.delivery_callbacks.is_stream_empty(id) {
                self.delivery_callbacks.remove_stream(id);
            }
        }
        true
    }

    fn handle_stream_flow_control_updated_callbacks(&mut self) -> bool {
        let updated: SmallVec<[StreamId; 8]> =
            self.conn.streams.consume_flow_control_updated().into();
        for id in updated {
            let Some(stream) = self.conn.streams.get_stream(id) else {
                continue;
            };
            if !stream.writable() {
                self.pending_write_callbacks.remove(&id);
                continue;
            }
            if let Some(cb) = self.conn_callback.clone() {
                let state = self.with_ctx(|ctx| cb.borrow_mut().on_flow_control_update(ctx, id));
                if state != CloseState::Open {
                    return false;
                }
            }
            // The callback may have mutated the stream map; look again.
            let Some(stream) = self.conn.streams.get_stream(id) else {
                continue;
            };
            let max_stream_writable = self.max_writable_on_stream_state(stream);
            if max_stream_writable != 0 {
                if let Some(wcb) = self.pending_write_callbacks.remove(&id) {
                    let state = self.with_ctx(|ctx| {
                        wcb.borrow_mut()
                            .on_stream_write_ready(ctx, id, max_stream_writable)
                    });
                    if state != CloseState::Open {
                        return false;
                    }
                }
            }
        }
        true
    }

    fn handle_stream_stop_sending_callbacks(&mut self) -> bool {
        for (id, error) in self.conn.streams.consume_stop_sending() {
            let Some(cb) = self.conn_callback.clone() else {
                break;
            };
            let state = self.with_ctx(|ctx| cb.borrow_mut().on_stop_sending(ctx, id, error));
            if state != CloseState::Open {
                return false;
            }
        }
        true
    }

    pub(crate) fn handle_conn_writable(&mut self) -> bool {
        let max_conn_write = self.max_writable_on_conn();
        if max_conn_write == 0 {
            return true;
        }
        // With connection credit available we may have been blocked on a
        // connection-scope write or on individual streams.
        if let Some(cb) = self.conn_write_callback.take() {
            let state =
                self.with_ctx(|ctx| cb.borrow_mut().on_connection_write_ready(ctx, max_conn_write));
            if state != CloseState::Open {
                return false;
            }
        }

        let blocked: SmallVec<[StreamId; 8]> =
            self.pending_write_callbacks.keys().copied().collect();
        for id in blocked {
            let Some(stream) = self.conn.streams.get_stream(id) else {
                self.pending_write_callbacks.remove(&id);
                continue;
            };
            if !stream.writable() {
                self.pending_write_callbacks.remove(&id);
                continue;
            }
            let max_stream_writable = self.max_writable_on_stream_state(stream);
            if max_stream_writable != 0 {
                if let Some(wcb) = self.pending_write_callbacks.remove(&id) {
                    let state = self.with_ctx(|ctx| {
                        wcb.borrow_mut()
                            .on_stream_write_ready(ctx, id, max_stream_writable)
                    });
                    if state != CloseState::Open {
                        return false;
                    }
                }
            }
        }
        true
    }

    pub(crate) fn invoke_streams_available_callbacks(&mut self) {
        if self
            .conn
            .streams
            .consume_max_local_bidirectional_stream_id_increased()
        {
            // New streams may have been created in preceding callbacks and
            // the limit may be spent again already.
            let num_streams = self.conn.streams.openable_local_bidirectional_streams();
            if num_streams > 0 {
                if let Some(cb) = self.conn_callback.clone() {
                    self.with_ctx(|ctx| {
                        cb.borrow_mut()
                            .on_bidirectional_streams_available(ctx, num_streams)
                    });
                }
            }
        }
        if self
            .conn
            .streams
            .consume_max_local_unidirectional_stream_id_increased()
        {
            let num_streams = self.conn.streams.openable_local_unidirectional_streams();
            if num_streams > 0 {
                if let Some(cb) = self.conn_callback.clone() {
                    self.with_ctx(|ctx| {
                        cb.borrow_mut()
                            .on_unidirectional_streams_available(ctx, num_streams)
                    });
                }
            }
        }
    }

    fn cleanup_ack_event_state(&mut self) {
        // With nothing in flight the retained ack events serve no one.
        if self.conn.outstandings.num_outstanding() == 0 {
            self.conn.last_processed_ack_events = Vec::new();
        }
    }

    // ---- read / peek loopers --------------------------------------------

    /// Read-looper body.
    pub(crate) fn invoke_read_data_and_callbacks(&mut self) {
        // Copy: the set changes under the callbacks.
        let mut readable: Vec<StreamId> = self.conn.streams.readable_streams().to_vec();
        if self.conn.transport_settings.ordered_read_callbacks {
            readable.sort_unstable();
        }
        for id in readable {
            let Some(entry) = self.read_callbacks.get(&id) else {
                // No read callback for this stream; skip it.
                continue;
            };
            let callback = entry.callback.clone();
            let resumed = entry.resumed;
            let Some(stream) = self.conn.streams.get_stream(id) else {
                continue;
            };
            let group = stream.group_id;
            let read_error = stream.stream_read_error.clone();

            if let (Some(callback), Some(error)) = (callback.clone(), read_error) {
                // An errored stream is no longer readable or peekable.
                self.conn.streams.unmark_readable(id);
                self.conn.streams.unmark_peekable(id);
                self.read_callbacks.remove(&id);
                self.peek_callbacks.remove(&id);
                trace!(%id, "invoking read error callback");
                self.with_ctx(|ctx| match group {
                    Some(group) => callback
                        .borrow_mut()
                        .read_error_with_group(ctx, id, group, error),
                    None => callback.borrow_mut().read_error(ctx, id, error),
                });
            } else if let Some(callback) = callback {
                if resumed && stream.has_readable_data() {
                    trace!(%id, "invoking read available callback");
                    self.with_ctx(|ctx| match group {
                        Some(group) => {
                            callback.borrow_mut().read_available_with_group(ctx, id, group)
                        }
                        None => callback.borrow_mut().read_available(ctx, id),
                    });
                }
            }
        }

        if !self.conn.datagram_state.read_buffer.is_empty() {
            if let Some(cb) = self.datagram_callback.clone() {
                self.with_ctx(|ctx| cb.borrow_mut().on_datagrams_available(ctx));
            }
        }

        self.check_for_closed_stream();
        self.update_read_looper();
        self.update_write_looper(true, false);
    }

    /// Peek-looper body. Peek is edge-triggered: each stream leaves the
    /// peekable set before its callback runs.
    pub(crate) fn invoke_peek_data_and_callbacks(&mut self) {
        let peekable: Vec<StreamId> = self.conn.streams.peekable_streams().to_vec();
        trace!(count = peekable.len(), "peekable streams snapshot");
        for id in peekable {
            self.conn.streams.unmark_peekable(id);
            let Some(entry) = self.peek_callbacks.get(&id) else {
                trace!(%id, "no peek callback for stream");
                continue;
            };
            let Some(callback) = entry.callback.clone() else {
                continue;
            };
            let Some(stream) = self.conn.streams.get_stream(id) else {
                continue;
            };
            if let Some(error) = stream.stream_read_error.clone() {
                trace!(%id, "invoking peek error callback");
                self.with_ctx(|ctx| callback.borrow_mut().peek_error(ctx, id, error));
            } else if stream.has_peekable_data() {
                let chunks: Vec<_> = stream.read_buffer.iter().cloned().collect();
                self.with_ctx(|ctx| callback.borrow_mut().on_data_available(ctx, id, &chunks));
            }
            if self.close_state != CloseState::Open {
                break;
            }
        }

        self.check_for_closed_stream();
        self.update_peek_looper();
        self.update_write_looper(true, false);
    }

    pub(crate) fn update_read_looper(&mut self) {
        if self.close_state != CloseState::Open {
            trace!("stopping read looper");
            self.read_looper.stop();
            return;
        }
        let has_runnable = self
            .conn
            .streams
            .readable_streams()
            .iter()
            .any(|id| {
                self.read_callbacks
                    .get(id)
                    .is_some_and(|entry| entry.callback.is_some() && entry.resumed)
            });
        let has_datagrams = self.datagram_callback.is_some()
            && !self.conn.datagram_state.read_buffer.is_empty();
        if has_runnable || has_datagrams {
            trace!("scheduling read looper");
            self.read_looper.run(false);
        } else {
            trace!("stopping read looper");
            self.read_looper.stop();
        }
    }

    pub(crate) fn update_peek_looper(&mut self) {
        if self.peek_callbacks.is_empty() || self.close_state != CloseState::Open {
            trace!("stopping peek looper");
            self.peek_looper.stop();
            return;
        }
        let has_runnable = self
            .conn
            .streams
            .peekable_streams()
            .iter()
            .any(|id| {
                self.peek_callbacks
                    .get(id)
                    .is_some_and(|entry| entry.callback.is_some() && entry.resumed)
            });
        if has_runnable {
            trace!("scheduling peek looper");
            self.peek_looper.run(false);
        } else {
            trace!("stopping peek looper");
            self.peek_looper.stop();
        }
    }

    // ---- stream reaping --------------------------------------------------

    /// Walk closed streams and reap the ones nothing still references.
    /// While graceful-closing, reaping the last stream closes the
    /// connection.
    pub(crate) fn check_for_closed_stream(&mut self) {
        if self.close_state == CloseState::Closed {
            return;
        }
        for id in self.conn.streams.closed_streams() {
            // The stream may sit in an active read callback; the read
            // callback defers destruction until EOM was seen.
            if let Some(entry) = self.read_callbacks.get(&id) {
                if entry.callback.is_some()
                    && (self
                        .conn
                        .transport_settings
                        .remove_stream_after_eom_callback_unset
                        || !entry.delivered_eom)
                {
                    trace!(%id, "not reaping stream with active read callback");
                    continue;
                }
            }
            if let Some(entry) = self.peek_callbacks.get(&id) {
                if entry.callback.is_some() {
                    trace!(%id, "not reaping stream with active peek callback");
                    continue;
                }
            }
            let num_byte_events = self.num_byte_event_callbacks_for_stream(id);
            if num_byte_events > 0 {
                trace!(%id, num_byte_events, "not reaping stream with pending byte events");
                continue;
            }

            trace!(%id, "closing stream");
            if let Some(qlogger) = self.conn.qlogger.as_ref() {
                qlogger.add_transport_state_update(&format!("closing stream {id}"));
            }
            let event = self.stream_event(id);
            for observer in self.observers.iter_mut() {
                observer.stream_closed(&event);
            }
            if let Some(cb) = self.conn_callback.clone() {
                self.with_ctx(|ctx| cb.borrow_mut().on_stream_pre_reaped(ctx, id));
            }
            self.conn.streams.remove_closed_stream(id);
            self.read_callbacks.remove(&id);
            self.peek_callbacks.remove(&id);
        }

        if self.close_state == CloseState::GracefulClosing
            && self.conn.streams.stream_count() == 0
        {
            self.close_impl(None, true, true);
        }
    }

    // ---- ECN -------------------------------------------------------------

    /// Check that packet marking is happening as expected once enough
    /// ack-eliciting app-data packets are out.
    pub(crate) fn validate_ecn_state(&mut self) {
        if matches!(
            self.conn.ecn_state,
            EcnState::NotAttempted | EcnState::FailedValidation
        ) {
            return;
        }
        let app_data = &self.conn.ack_states.app_data;
        let min_expected = app_data.minimum_expected_ecn_marks_echoed;
        if min_expected < 10 {
            // Wait for ten marked ack-eliciting app-data packets before
            // judging.
            return;
        }
        let max_expected = self.conn.loss.total_packets_sent;
        let counts = EcnMarkCounts {
            ce: app_data.ecn_ce_count_echoed,
            ect0: app_data.ecn_ect0_count_echoed,
            ect1: app_data.ecn_ect1_count_echoed,
        };

        let previous = self.conn.ecn_state;
        let next = ecn::evaluate(previous, counts, min_expected, max_expected);
        self.conn.ecn_state = next;

        match next {
            EcnState::ValidatedEcn if previous != EcnState::ValidatedEcn => {
                debug!(marked = counts.ce + counts.ect0, min_expected, "ECN validated");
            }
            EcnState::ValidatedL4s => {
                if self.conn.ecn_l4s_tracker.is_none() {
                    self.conn.ecn_l4s_tracker = Some(L4sTracker::default());
                }
                if previous != EcnState::ValidatedL4s {
                    debug!(marked = counts.ce + counts.ect1, min_expected, "L4S validated");
                }
                // Keep the tracker current and hand the CE share to the
                // congestion controller's L4S response.
                if let Some(tracker) = self.conn.ecn_l4s_tracker.as_mut() {
                    tracker.record_echoed(counts.ce, counts.ect1);
                    let fraction = tracker.ce_fraction();
                    if let Some(cc) = self.conn.congestion_controller.as_mut() {
                        cc.on_l4s_mark_fraction(fraction);
                    }
                }
            }
            EcnState::FailedValidation => {
                warn!("ECN validation failed, disabling ECN");
                self.conn.socket_tos.ecn = 0;
                let tos = self.conn.socket_tos.value();
                if let Some(socket) = self.socket.as_mut() {
                    debug_assert!(socket.is_bound());
                    socket.set_tos(tos);
                }
                self.conn.ecn_l4s_tracker = None;
            }
            _ => {}
        }
    }
}
