//! Application-facing operations: streams, datagrams, byte events, flow
//! control, pings, knobs, and priorities.
//!
//! Every operation validates the close state and stream existence up
//! front and fails fast with a `LocalErrorCode`.

use bytes::Bytes;
use tracing::{trace, warn};

use crate::byte_event::{ByteEvent, ByteEventCallbackHandle, ByteEventKind};
use crate::callbacks::{
    DatagramCallbackHandle, PeekCallbackData, PeekCallbackHandle, PingCallbackHandle,
    ReadCallbackData, ReadCallbackHandle, WriteCallbackHandle,
};
use crate::datagram::ReadDatagram;
use crate::error::{
    ApplicationErrorCode, LocalErrorCode, LocalResult, QuicError, QuicErrorCode,
    GENERIC_APP_NO_ERROR,
};
use crate::flow_control::{
    self, send_stream_flow_control_bytes, FlowControlInfo,
};
use crate::settings::MAX_DATAGRAM_PACKET_OVERHEAD;
use crate::state::{CloseState, KnobFrame, SimpleFrame};
use crate::stream::{StreamChunk, StreamRecvState, StreamSendState, StreamState};
use crate::types::{Priority, StreamGroupId, StreamId, MAX_PRIORITY_LEVEL};

use super::QuicTransport;

impl QuicTransport {
    // ---- stream creation -------------------------------------------------

    fn create_stream_internal(
        &mut self,
        bidirectional: bool,
        group: Option<StreamGroupId>,
    ) -> LocalResult<StreamId> {
        self.require_open()?;
        let id = if bidirectional {
            self.conn.streams.create_next_bidirectional_stream(group)?
        } else {
            self.conn.streams.create_next_unidirectional_stream(group)?
        };
        self.log_stream_open_event(id);
        Ok(id)
    }

    pub fn create_bidirectional_stream(&mut self) -> LocalResult<StreamId> {
        self.create_stream_internal(true, None)
    }

    pub fn create_unidirectional_stream(&mut self) -> LocalResult<StreamId> {
        self.create_stream_internal(false, None)
    }

    pub fn create_bidirectional_stream_group(&mut self) -> LocalResult<StreamGroupId> {
        self.require_open()?;
        self.conn.streams.create_next_bidirectional_stream_group()
    }

    pub fn create_unidirectional_stream_group(&mut self) -> LocalResult<StreamGroupId> {
        self.require_open()?;
        self.conn.streams.create_next_unidirectional_stream_group()
    }

    pub fn create_bidirectional_stream_in_group(
        &mut self,
        group: StreamGroupId,
    ) -> LocalResult<StreamId> {
        self.create_stream_internal(true, Some(group))
    }

    pub fn create_unidirectional_stream_in_group(
        &mut self,
        group: StreamGroupId,
    ) -> LocalResult<StreamId> {
        self.create_stream_internal(false, Some(group))
    }

    pub fn get_num_openable_bidirectional_streams(&self) -> u64 {
        self.conn.streams.openable_local_bidirectional_streams()
    }

    pub fn get_num_openable_unidirectional_streams(&self) -> u64 {
        self.conn.streams.openable_local_unidirectional_streams()
    }

    // ---- read callbacks --------------------------------------------------

    pub fn set_read_callback(
        &mut self,
        id: StreamId,
        cb: Option<ReadCallbackHandle>,
        err: Option<ApplicationErrorCode>,
    ) -> LocalResult<()> {
        if id.is_sending_stream(self.conn.node_type) {
            return Err(LocalErrorCode::InvalidOperation);
        }
        self.require_open()?;
        if !self.conn.streams.stream_exists(id) {
            return Err(LocalErrorCode::StreamNotExists);
        }
        self.set_read_callback_internal(id, cb, err)
    }

    pub(crate) fn set_read_callback_internal(
        &mut self,
        id: StreamId,
        cb: Option<ReadCallbackHandle>,
        err: Option<ApplicationErrorCode>,
    ) -> LocalResult<()> {
        trace!(%id, installed = cb.is_some(), "setting read callback");
        if !self.read_callbacks.contains_key(&id) {
            // The initial install must carry a callback.
            let Some(cb) = cb else {
                return Err(LocalErrorCode::InvalidOperation);
            };
            self.read_callbacks.insert(id, ReadCallbackData::new(cb));
            self.update_read_looper();
            return Ok(());
        }
        let entry = self.read_callbacks.get_mut(&id).expect("checked above");
        if entry.callback.is_none() && cb.is_some() {
            // Already unset; re-installing is not allowed.
            return Err(LocalErrorCode::InvalidOperation);
        }
        let unset = cb.is_none();
        entry.callback = cb;
        if unset {
            if let Some(err) = err {
                return self.stop_sending(id, err);
            }
        }
        self.update_read_looper();
        Ok(())
    }

    pub fn unset_all_read_callbacks(&mut self) {
        for id in self.read_callbacks.keys().copied().collect::<Vec<_>>() {
            let _ = self.set_read_callback_internal(id, None, Some(GENERIC_APP_NO_ERROR));
        }
    }

    pub fn pause_read(&mut self, id: StreamId) -> LocalResult<()> {
        self.pause_or_resume_read(id, false)
    }

    pub fn resume_read(&mut self, id: StreamId) -> LocalResult<()> {
        self.pause_or_resume_read(id, true)
    }

    fn pause_or_resume_read(&mut self, id: StreamId, resume: bool) -> LocalResult<()> {
        if id.is_sending_stream(self.conn.node_type) {
            return Err(LocalErrorCode::InvalidOperation);
        }
        self.require_open()?;
        if !self.conn.streams.stream_exists(id) {
            return Err(LocalErrorCode::StreamNotExists);
        }
        let Some(entry) = self.read_callbacks.get_mut(&id) else {
            return Err(LocalErrorCode::AppError);
        };
        if entry.resumed != resume {
            entry.resumed = resume;
            self.update_read_looper();
        }
        Ok(())
    }

    // ---- peek callbacks --------------------------------------------------

    pub fn set_peek_callback(
        &mut self,
        id: StreamId,
        cb: Option<PeekCallbackHandle>,
    ) -> LocalResult<()> {
        self.require_open()?;
        if !self.conn.streams.stream_exists(id) {
            return Err(LocalErrorCode::StreamNotExists);
        }
        self.set_peek_callback_internal(id, cb)
    }

    pub(crate) fn set_peek_callback_internal(
        &mut self,
        id: StreamId,
        cb: Option<PeekCallbackHandle>,
    ) -> LocalResult<()> {
        trace!(%id, installed = cb.is_some(), "setting peek callback");
        if !self.peek_callbacks.contains_key(&id) {
            let Some(cb) = cb else {
                return Err(LocalErrorCode::InvalidOperation);
            };
            self.peek_callbacks.insert(id, PeekCallbackData::new(cb));
        } else {
            let entry = self.peek_callbacks.get_mut(&id).expect("checked above");
            entry.callback = cb;
        }
        self.update_peek_looper();
        Ok(())
    }

    pub fn unset_all_peek_callbacks(&mut self) {
        for id in self.peek_callbacks.keys().copied().collect::<Vec<_>>() {
            let _ = self.set_peek_callback_internal(id, None);
        }
    }

    pub fn pause_peek(&mut self, id: StreamId) -> LocalResult<()> {
        self.pause_or_resume_peek(id, false)
    }

    pub fn resume_peek(&mut self, id: StreamId) -> LocalResult<()> {
        self.pause_or_resume_peek(id, true)
    }

    fn pause_or_resume_peek(&mut self, id: StreamId, resume: bool) -> LocalResult<()> {
        self.require_open()?;
        if !self.conn.streams.stream_exists(id) {
            return Err(LocalErrorCode::StreamNotExists);
        }
        let Some(entry) = self.peek_callbacks.get_mut(&id) else {
            return Err(LocalErrorCode::AppError);
        };
        if entry.resumed != resume {
            entry.resumed = resume;
            self.update_peek_looper();
        }
        Ok(())
    }

    // ---- reading ---------------------------------------------------------

    /// Read up to `max_len` bytes (0 means everything available). Returns
    /// the data and whether EOF was reached.
    pub fn read(&mut self, id: StreamId, max_len: usize) -> Result<(Bytes, bool), LocalErrorCode> {
        if id.is_sending_stream(self.conn.node_type) {
            return Err(LocalErrorCode::InvalidOperation);
        }
        self.require_open()?;
        let result = self.read_inner(id, max_len);
        // Reading affects the peek surface as well.
        self.update_read_looper();
        self.update_peek_looper();
        self.update_write_looper(true, false);
        result
    }

    fn read_inner(&mut self, id: StreamId, max_len: usize) -> Result<(Bytes, bool), LocalErrorCode> {
        if !self.conn.streams.stream_exists(id) {
            return Err(LocalErrorCode::StreamNotExists);
        }
        let read_error = self
            .conn
            .streams
            .get_stream(id)
            .and_then(|stream| stream.stream_read_error.clone());
        if let Some(error) = read_error {
            return match error.code {
                QuicErrorCode::Local(code) => Err(code),
                _ => Err(self.close_on_error(error, "read()")),
            };
        }

        let stream = self
            .conn
            .streams
            .get_stream_mut(id)
            .ok_or(LocalErrorCode::StreamNotExists)?;
        let (data, eof) = stream.read_data(max_len);
        let drained = !stream.has_readable_data();
        if eof {
            trace!(%id, "delivered eof to app");
            stream.recv_state = StreamRecvState::Closed;
            let send_done =
                stream.send_state != StreamSendState::Open || !id.is_bidirectional();
            self.conn.streams.unmark_readable(id);
            if send_done {
                self.conn.streams.mark_closed(id);
            }
            if let Some(entry) = self.read_callbacks.get_mut(&id) {
                // Reading EOF without a read callback installed is not a
                // case worth handling; whoever reads has one.
                entry.delivered_eom = true;
            }
        } else if drained {
            self.conn.streams.unmark_readable(id);
        }
        Ok((data, eof))
    }

    /// Present available data without consuming it.
    pub fn peek(
        &mut self,
        id: StreamId,
        peek_callback: impl FnOnce(StreamId, &[StreamChunk]),
    ) -> LocalResult<()> {
        self.require_open()?;
        let result = self.peek_inner(id, peek_callback);
        self.update_peek_looper();
        self.update_write_looper(true, false);
        result
    }

    fn peek_inner(
        &mut self,
        id: StreamId,
        peek_callback: impl FnOnce(StreamId, &[StreamChunk]),
    ) -> LocalResult<()> {
        let Some(stream) = self.conn.streams.get_stream(id) else {
            return Err(LocalErrorCode::StreamNotExists);
        };
        if let Some(error) = stream.stream_read_error.as_ref() {
            return match error.code {
                QuicErrorCode::Local(code) => Err(code),
                _ => Err(LocalErrorCode::InternalError),
            };
        }
        let chunks: Vec<StreamChunk> = stream.read_buffer.iter().cloned().collect();
        peek_callback(id, &chunks);
        Ok(())
    }

    /// Consume `amount` bytes at the stream's current read offset.
    pub fn consume(&mut self, id: StreamId, amount: usize) -> LocalResult<()> {
        let Some(stream) = self.conn.streams.get_stream(id) else {
            return Err(LocalErrorCode::StreamNotExists);
        };
        let offset = stream.current_read_offset;
        self.consume_from_offset(id, offset, amount)
            .map_err(|(code, _)| code)
    }

    /// Consume with an explicit offset; the offset must match the
    /// stream's current read offset, which is returned on mismatch.
    pub fn consume_from_offset(
        &mut self,
        id: StreamId,
        offset: u64,
        amount: usize,
    ) -> Result<(), (LocalErrorCode, Option<u64>)> {
        if self.close_state != CloseState::Open {
            return Err((LocalErrorCode::ConnectionClosed, None));
        }
        let result = self.consume_inner(id, offset, amount);
        self.update_peek_looper();
        self.update_read_looper(); // consume may affect the read surface
        self.update_write_looper(true, false);
        result
    }

    fn consume_inner(
        &mut self,
        id: StreamId,
        offset: u64,
        amount: usize,
    ) -> Result<(), (LocalErrorCode, Option<u64>)> {
        // Check existence first so the API cannot conjure a peer stream
        // that was never sent.
        if !self.conn.streams.stream_exists(id) {
            return Err((LocalErrorCode::StreamNotExists, None));
        }
        let stream = self.conn.streams.get_stream(id).expect("checked above");
        let read_offset = stream.current_read_offset;
        if read_offset != offset {
            return Err((LocalErrorCode::InternalError, Some(read_offset)));
        }
        if let Some(error) = stream.stream_read_error.as_ref() {
            return match error.code {
                QuicErrorCode::Local(code) => Err((code, None)),
                _ => Err((LocalErrorCode::InternalError, None)),
            };
        }
        let stream = self
            .conn
            .streams
            .get_stream_mut(id)
            .expect("checked above");
        stream.consume_data(amount);
        if !stream.has_readable_data() {
            self.conn.streams.unmark_readable(id);
        }
        Ok(())
    }

    // ---- writing ---------------------------------------------------------

    /// Write a chain of bytes (and optionally EOF) to a stream. With a
    /// callback, an ACK byte event is registered for the last byte.
    pub fn write_chain(
        &mut self,
        id: StreamId,
        data: Bytes,
        eof: bool,
        cb: Option<ByteEventCallbackHandle>,
    ) -> LocalResult<()> {
        if id.is_receiving_stream(self.conn.node_type) {
            return Err(LocalErrorCode::InvalidOperation);
        }
        self.require_open()?;
        if !self.conn.streams.stream_exists(id) {
            return Err(LocalErrorCode::StreamNotExists);
        }
        let stream = self.conn.streams.get_stream(id).expect("checked above");
        if !stream.writable() {
            return Err(LocalErrorCode::StreamClosed);
        }

        if let Some(cb) = cb {
            let data_length = data.len() as u64 + u64::from(eof);
            if data_length > 0 {
                let current_largest_write_offset = stream.largest_write_offset_seen();
                let _ = self.register_delivery_callback(
                    id,
                    current_largest_write_offset + data_length - 1,
                    Some(cb),
                );
            }
        }

        let was_app_limited_or_idle = self
            .conn
            .congestion_controller
            .as_ref()
            .map(|cc| cc.is_app_limited() || self.conn.streams.is_app_idle())
            .unwrap_or(false);

        let len = data.len() as u64;
        let stream = self
            .conn
            .streams
            .get_stream_mut(id)
            .expect("checked above");
        stream.pending_writes += len;
        if eof {
            stream.final_write_offset = Some(stream.largest_write_offset_seen());
        }
        self.conn.flow_control.sum_cur_stream_buffer_len += len;
        self.conn.streams.mark_writable(id);

        // New data after app-limited or app-idle restarts pacing at a
        // clean rate sample.
        if was_app_limited_or_idle {
            if let Some(pacer) = self.conn.pacer.as_mut() {
                pacer.reset();
            }
        }
        self.update_write_looper(true, false);
        Ok(())
    }

    pub fn notify_pending_write_on_connection(
        &mut self,
        cb: WriteCallbackHandle,
    ) -> LocalResult<()> {
        self.require_open()?;
        if self.conn_write_callback.is_some() {
            return Err(LocalErrorCode::InvalidWriteCallback);
        }
        // Install before deferring so a close occurring while we are
        // queued errors the callback out synchronously.
        self.conn_write_callback = Some(cb);
        self.run_on_evb_async(|transport| {
            if transport.conn_write_callback.is_none() {
                // The connection was probably closed.
                return;
            }
            let writable = transport.max_writable_on_conn();
            if writable != 0 {
                if let Some(cb) = transport.conn_write_callback.take() {
                    transport
                        .with_ctx(|ctx| cb.borrow_mut().on_connection_write_ready(ctx, writable));
                }
            }
        });
        Ok(())
    }

    pub fn notify_pending_write_on_stream(
        &mut self,
        id: StreamId,
        cb: WriteCallbackHandle,
    ) -> LocalResult<()> {
        if id.is_receiving_stream(self.conn.node_type) {
            return Err(LocalErrorCode::InvalidOperation);
        }
        self.require_open()?;
        if !self.conn.streams.stream_exists(id) {
            return Err(LocalErrorCode::StreamNotExists);
        }
        let stream = self.conn.streams.get_stream(id).expect("checked above");
        if !stream.writable() {
            return Err(LocalErrorCode::StreamClosed);
        }

        if let Some(existing) = self.pending_write_callbacks.get(&id) {
            return if std::rc::Rc::ptr_eq(existing, &cb) {
                Err(LocalErrorCode::CallbackAlreadyInstalled)
            } else {
                Err(LocalErrorCode::InvalidWriteCallback)
            };
        }
        self.pending_write_callbacks.insert(id, cb);
        self.run_on_evb_async(move |transport| {
            let Some(cb) = transport.pending_write_callbacks.get(&id).cloned() else {
                // The connection was probably closed.
                return;
            };
            if !transport.conn.streams.stream_exists(id) {
                transport.pending_write_callbacks.remove(&id);
                transport.with_ctx(|ctx| {
                    cb.borrow_mut().on_stream_write_error(
                        ctx,
                        id,
                        QuicError::from_code(LocalErrorCode::StreamNotExists),
                    )
                });
                return;
            }
            let writable = transport
                .conn
                .streams
                .get_stream(id)
                .map(|stream| stream.writable())
                .unwrap_or(false);
            if !writable {
                transport.pending_write_callbacks.remove(&id);
                transport.with_ctx(|ctx| {
                    cb.borrow_mut().on_stream_write_error(
                        ctx,
                        id,
                        QuicError::from_code(LocalErrorCode::StreamNotExists),
                    )
                });
                return;
            }
            let max_can_write = transport
                .conn
                .streams
                .get_stream(id)
                .map(|stream| transport.max_writable_on_stream_state(stream))
                .unwrap_or(0);
            if max_can_write != 0 {
                transport.pending_write_callbacks.remove(&id);
                transport
                    .with_ctx(|ctx| cb.borrow_mut().on_stream_write_ready(ctx, id, max_can_write));
            }
        });
        Ok(())
    }

    pub fn unregister_stream_write_callback(&mut self, id: StreamId) -> LocalResult<()> {
        if !self.conn.streams.stream_exists(id) {
            return Err(LocalErrorCode::StreamNotExists);
        }
        if self.pending_write_callbacks.remove(&id).is_none() {
            return Err(LocalErrorCode::InvalidOperation);
        }
        Ok(())
    }

    // ---- flow-control arithmetic ----------------------------------------

    pub(crate) fn max_writable_on_stream_state(&self, stream: &StreamState) -> u64 {
        let conn_writable = self.max_writable_on_conn();
        let stream_flow =
            send_stream_flow_control_bytes(&stream.flow, stream.current_write_offset);
        stream_flow.min(conn_writable)
    }

    pub(crate) fn max_writable_on_conn(&self) -> u64 {
        flow_control::max_writable_on_conn(
            &self.conn.flow_control,
            self.conn
                .congestion_controller
                .as_ref()
                .map(|cc| cc.writable_bytes()),
            self.conn.transport_settings.total_buffer_space_available,
            self.conn.transport_settings.backpressure_headroom_factor,
        )
    }

    pub fn get_max_writable_on_stream(&self, id: StreamId) -> LocalResult<u64> {
        let stream = self.stream_or_err(id)?;
        if id.is_receiving_stream(self.conn.node_type) {
            return Err(LocalErrorCode::InvalidOperation);
        }
        Ok(self.max_writable_on_stream_state(stream))
    }

    pub fn buffer_space_available(&self) -> u64 {
        flow_control::buffer_space_available(
            self.conn.flow_control.sum_cur_stream_buffer_len,
            self.conn.transport_settings.total_buffer_space_available,
        )
    }

    pub fn get_connection_buffer_available(&self) -> u64 {
        self.buffer_space_available()
    }

    pub fn set_connection_flow_control_window(&mut self, window_size: u64) -> LocalResult<()> {
        self.require_open()?;
        self.conn.flow_control.window_size = window_size;
        let target = self.conn.flow_control.sum_max_observed_offset + window_size;
        if target > self.conn.flow_control.advertised_max_offset {
            self.conn.flow_control.advertised_max_offset = target;
        }
        self.update_write_looper(true, false);
        Ok(())
    }

    pub fn set_stream_flow_control_window(
        &mut self,
        id: StreamId,
        window_size: u64,
    ) -> LocalResult<()> {
        self.require_open()?;
        let stream = self
            .conn
            .streams
            .get_stream_mut(id)
            .ok_or(LocalErrorCode::StreamNotExists)?;
        stream.flow.window_size = window_size;
        let target = stream.current_read_offset + window_size;
        if target > stream.flow.advertised_max_offset {
            stream.flow.advertised_max_offset = target;
        }
        self.update_write_looper(true, false);
        Ok(())
    }

    pub fn get_connection_flow_control(&self) -> FlowControlInfo {
        let fc = &self.conn.flow_control;
        FlowControlInfo {
            sendable_bytes: flow_control::send_conn_flow_control_bytes(fc),
            peer_advertised_max_offset: fc.peer_advertised_max_offset,
            receive_window_available: flow_control::recv_conn_flow_control_bytes(fc),
            advertised_max_offset: fc.advertised_max_offset,
        }
    }

    pub fn get_stream_flow_control(&self, id: StreamId) -> LocalResult<FlowControlInfo> {
        let stream = self.stream_or_err(id)?;
        Ok(FlowControlInfo {
            sendable_bytes: send_stream_flow_control_bytes(
                &stream.flow,
                stream.current_write_offset,
            ),
            peer_advertised_max_offset: stream.flow.peer_advertised_max_offset,
            receive_window_available: stream
                .flow
                .advertised_max_offset
                .saturating_sub(stream.current_read_offset),
            advertised_max_offset: stream.flow.advertised_max_offset,
        })
    }

    // ---- stream offsets --------------------------------------------------

    pub fn get_stream_read_offset(&self, id: StreamId) -> LocalResult<u64> {
        if id.is_sending_stream(self.conn.node_type) {
            return Err(LocalErrorCode::InvalidOperation);
        }
        Ok(self.stream_or_err(id)?.current_read_offset)
    }

    pub fn get_stream_write_offset(&self, id: StreamId) -> LocalResult<u64> {
        if id.is_receiving_stream(self.conn.node_type) {
            return Err(LocalErrorCode::InvalidOperation);
        }
        Ok(self.stream_or_err(id)?.current_write_offset)
    }

    pub fn get_stream_write_buffered_bytes(&self, id: StreamId) -> LocalResult<u64> {
        if id.is_receiving_stream(self.conn.node_type) {
            return Err(LocalErrorCode::InvalidOperation);
        }
        Ok(self.stream_or_err(id)?.pending_writes)
    }

    // ---- byte events -----------------------------------------------------

    /// Register a callback for when the byte at `offset` is acknowledged.
    pub fn register_delivery_callback(
        &mut self,
        id: StreamId,
        offset: u64,
        cb: Option<ByteEventCallbackHandle>,
    ) -> LocalResult<()> {
        self.register_byte_event_callback(ByteEventKind::Ack, id, offset, cb)
    }

    /// Register a callback for when the byte at `offset` is handed to the
    /// wire.
    pub fn register_tx_callback(
        &mut self,
        id: StreamId,
        offset: u64,
        cb: Option<ByteEventCallbackHandle>,
    ) -> LocalResult<()> {
        self.register_byte_event_callback(ByteEventKind::Tx, id, offset, cb)
    }

    pub fn register_byte_event_callback(
        &mut self,
        kind: ByteEventKind,
        id: StreamId,
        offset: u64,
        cb: Option<ByteEventCallbackHandle>,
    ) -> LocalResult<()> {
        if id.is_receiving_stream(self.conn.node_type) {
            return Err(LocalErrorCode::InvalidOperation);
        }
        self.require_open()?;
        if !self.conn.streams.stream_exists(id) {
            return Err(LocalErrorCode::StreamNotExists);
        }
        let Some(cb) = cb else {
            return Ok(());
        };

        self.byte_event_map_mut(kind).register(id, offset, cb.clone())?;

        // Tell the recipient registration took.
        let event = ByteEvent::new(id, offset, kind);
        let state = self.with_ctx(|ctx| cb.borrow_mut().on_byte_event_registered(ctx, event));
        if state != CloseState::Open {
            return Ok(());
        }

        let stream = self.conn.streams.get_stream(id).expect("checked above");
        let max_offset_ready = match kind {
            ByteEventKind::Ack => stream.largest_deliverable_offset,
            ByteEventKind::Tx => stream.largest_offset_txed,
        };
        if max_offset_ready.is_some_and(|max| offset <= max) {
            // Already ready: the event still sits in the registry, but
            // dispatch happens on the next loop iteration. The deferred
            // task re-verifies the registration is still present; it may
            // have been cancelled or delivered in the meantime.
            self.run_on_evb_async(move |transport| {
                if transport.close_state != CloseState::Open {
                    // Close errors out all byte-event callbacks.
                    return;
                }
                let map = transport.byte_event_map_mut(kind);
                if map.remove(id, offset, &cb).is_none() {
                    // Already delivered or cancelled.
                    return;
                }
                let event = ByteEvent::new(id, offset, kind);
                transport.with_ctx(|ctx| cb.borrow_mut().on_byte_event(ctx, event));
            });
        }
        Ok(())
    }

    /// Cancel ACK byte events on a stream, all of them or those below
    /// `offset`.
    pub fn cancel_delivery_callbacks_for_stream(
        &mut self,
        id: StreamId,
        offset: Option<u64>,
    ) {
        self.cancel_byte_event_callbacks_for_stream_impl(ByteEventKind::Ack, id, offset);
    }

    /// Cancel byte events of one kind on a stream.
    pub fn cancel_byte_event_callbacks_for_stream(
        &mut self,
        kind: ByteEventKind,
        id: StreamId,
        offset: Option<u64>,
    ) {
        self.cancel_byte_event_callbacks_for_stream_impl(kind, id, offset);
    }

    /// Cancel byte events of both kinds on a stream.
    pub fn cancel_all_byte_event_callbacks_for_stream(
        &mut self,
        id: StreamId,
        offset: Option<u64>,
    ) {
        for kind in ByteEventKind::ALL {
            self.cancel_byte_event_callbacks_for_stream_impl(kind, id, offset);
        }
    }

    pub fn unset_all_delivery_callbacks(&mut self) {
        for id in self.delivery_callbacks.stream_ids() {
            self.cancel_delivery_callbacks_for_stream(id, None);
        }
    }

    pub fn num_byte_event_callbacks_for_stream(&self, id: StreamId) -> usize {
        ByteEventKind::ALL
            .iter()
            .map(|kind| self.num_byte_event_callbacks_for_stream_of_kind(*kind, id))
            .sum()
    }

    pub fn num_byte_event_callbacks_for_stream_of_kind(
        &self,
        kind: ByteEventKind,
        id: StreamId,
    ) -> usize {
        match kind {
            ByteEventKind::Ack => self.delivery_callbacks.callbacks_for_stream(id),
            ByteEventKind::Tx => self.tx_callbacks.callbacks_for_stream(id),
        }
    }

    // ---- stream lifecycle ------------------------------------------------

    /// Send RESET_STREAM and abandon pending writes.
    pub fn reset_stream(&mut self, id: StreamId, error: ApplicationErrorCode) -> LocalResult<()> {
        if id.is_receiving_stream(self.conn.node_type) {
            return Err(LocalErrorCode::InvalidOperation);
        }
        self.require_open()?;
        let result = self.reset_stream_inner(id, error);
        self.check_for_closed_stream();
        self.update_read_looper();
        self.update_peek_looper();
        self.update_write_looper(true, false);
        result
    }

    fn reset_stream_inner(
        &mut self,
        id: StreamId,
        error: ApplicationErrorCode,
    ) -> LocalResult<()> {
        if !self.conn.streams.stream_exists(id) {
            return Err(LocalErrorCode::StreamNotExists);
        }
        let stream = self
            .conn
            .streams
            .get_stream_mut(id)
            .expect("checked above");
        // Drive the send state machine: abandon buffered data, queue the
        // reset frame.
        stream.send_state = StreamSendState::ResetSent;
        stream.stream_write_error = Some(QuicError::from_code(error));
        let dropped = stream.pending_writes;
        stream.pending_writes = 0;
        stream.write_buffer_len = 0;
        let recv_done = stream.recv_state == StreamRecvState::Closed || !id.is_bidirectional();
        self.conn.flow_control.sum_cur_stream_buffer_len = self
            .conn
            .flow_control
            .sum_cur_stream_buffer_len
            .saturating_sub(dropped);
        self.conn.pending_events.resets.insert(id, error);
        if recv_done {
            self.conn.streams.mark_closed(id);
        }

        let reset_ids: Vec<StreamId> = self.conn.pending_events.resets.keys().copied().collect();
        for reset_id in reset_ids {
            if self.close_state != CloseState::Open {
                break;
            }
            for kind in ByteEventKind::ALL {
                self.cancel_byte_event_callbacks_for_stream_impl(kind, reset_id, None);
            }
        }
        self.pending_write_callbacks.remove(&id);
        if let Some(stats) = self.conn.stats_callback.as_mut() {
            stats.on_stream_reset(error);
        }
        Ok(())
    }

    /// Ask the peer to stop sending on a stream.
    pub fn stop_sending(&mut self, id: StreamId, error: ApplicationErrorCode) -> LocalResult<()> {
        if id.is_sending_stream(self.conn.node_type) {
            return Err(LocalErrorCode::InvalidOperation);
        }
        self.require_open()?;
        if !self.conn.streams.stream_exists(id) {
            return Err(LocalErrorCode::StreamNotExists);
        }
        let stream = self.conn.streams.get_stream(id).expect("checked above");
        if stream.recv_state == StreamRecvState::Closed {
            // Ingress already closed; STOP_SENDING would be noise.
            return Ok(());
        }
        if self.conn.transport_settings.drop_ingress_on_stop_sending {
            let stream = self
                .conn
                .streams
                .get_stream_mut(id)
                .expect("checked above");
            stream.read_buffer.clear();
            self.conn.streams.unmark_readable(id);
            self.conn.streams.unmark_peekable(id);
        }
        self.conn
            .send_simple_frame(SimpleFrame::StopSending { id, error });
        self.update_write_looper(true, false);
        Ok(())
    }

    /// Half-close the write side without a reset.
    pub fn shutdown_write(&mut self, id: StreamId) -> LocalResult<()> {
        if id.is_receiving_stream(self.conn.node_type) {
            return Err(LocalErrorCode::InvalidOperation);
        }
        Ok(())
    }

    /// Reset a stream if the read error carries an application code.
    pub fn maybe_reset_stream_from_read_error(
        &mut self,
        id: StreamId,
        code: QuicErrorCode,
    ) -> LocalResult<()> {
        if let QuicErrorCode::Application(app_code) = code {
            return self.reset_stream(id, app_code);
        }
        Ok(())
    }

    /// Mark a stream as a control stream: exempt from graceful-close
    /// accounting and from `reset_non_control_streams`.
    pub fn set_control_stream(&mut self, id: StreamId) -> LocalResult<()> {
        if !self.conn.streams.stream_exists(id) {
            return Err(LocalErrorCode::StreamNotExists);
        }
        self.conn.streams.set_stream_as_control(id);
        Ok(())
    }

    /// Reset every non-control sending stream and stop-send every
    /// non-control receiving stream.
    pub fn reset_non_control_streams(&mut self, error: ApplicationErrorCode, reason: &str) {
        let non_control: Vec<(StreamId, Option<StreamGroupId>)> = self
            .conn
            .streams
            .stream_ids()
            .into_iter()
            .filter_map(|id| {
                let stream = self.conn.streams.get_stream(id)?;
                (!stream.is_control).then_some((id, stream.group_id))
            })
            .collect();
        for (id, group) in non_control {
            if id.is_sending_stream(self.conn.node_type) || id.is_bidirectional() {
                if let Some(wcb) = self.pending_write_callbacks.get(&id).cloned() {
                    let err = QuicError::new(error, reason);
                    self.with_ctx(|ctx| {
                        wcb.borrow_mut().on_stream_write_error(ctx, id, err);
                    });
                }
                let _ = self.reset_stream(id, error);
            }
            if id.is_receiving_stream(self.conn.node_type) || id.is_bidirectional() {
                if let Some(callback) = self
                    .read_callbacks
                    .get(&id)
                    .and_then(|entry| entry.callback.clone())
                {
                    let err = QuicError::new(error, reason);
                    self.with_ctx(|ctx| match group {
                        Some(group) => {
                            callback.borrow_mut().read_error_with_group(ctx, id, group, err)
                        }
                        None => callback.borrow_mut().read_error(ctx, id, err),
                    });
                }
                self.peek_callbacks.remove(&id);
                let _ = self.stop_sending(id, error);
            }
        }
    }

    // ---- datagrams -------------------------------------------------------

    pub fn set_datagram_callback(&mut self, cb: Option<DatagramCallbackHandle>) -> LocalResult<()> {
        self.require_open()?;
        trace!(installed = cb.is_some(), "setting datagram callback");
        self.datagram_callback = cb;
        self.update_read_looper();
        Ok(())
    }

    /// Largest datagram payload that currently fits in one packet.
    pub fn get_datagram_size_limit(&self) -> u64 {
        let max_frame = self
            .conn
            .datagram_state
            .max_write_frame_size
            .min(self.conn.udp_send_packet_len);
        max_frame.saturating_sub(MAX_DATAGRAM_PACKET_OVERHEAD)
    }

    /// Queue an unreliable datagram for the next write.
    pub fn write_datagram(&mut self, data: Bytes) -> LocalResult<()> {
        // max_write_frame_size > 0 means the peer supports datagrams.
        if self.conn.datagram_state.max_write_frame_size == 0 {
            if let Some(stats) = self.conn.stats_callback.as_mut() {
                stats.on_datagram_dropped_on_write();
            }
            return Err(LocalErrorCode::InvalidWriteData);
        }
        if self.conn.datagram_state.write_buffer.len()
            >= self.conn.datagram_state.max_write_buffer_size
        {
            if let Some(stats) = self.conn.stats_callback.as_mut() {
                stats.on_datagram_dropped_on_write();
            }
            if !self
                .conn
                .transport_settings
                .datagram
                .send_drop_old_data_first
            {
                return Err(LocalErrorCode::InvalidWriteData);
            }
            self.conn.datagram_state.write_buffer.pop_front();
        }
        self.conn.datagram_state.write_buffer.push_back(data);
        self.update_write_looper(true, false);
        Ok(())
    }

    /// Drain up to `at_most` received datagrams (0 means all).
    pub fn read_datagrams(&mut self, at_most: usize) -> LocalResult<Vec<ReadDatagram>> {
        self.require_open()?;
        let available = self.conn.datagram_state.read_buffer.len();
        let take = if at_most == 0 {
            available
        } else {
            at_most.min(available)
        };
        Ok(self
            .conn
            .datagram_state
            .read_buffer
            .drain(..take)
            .collect())
    }

    /// Like [`read_datagrams`](Self::read_datagrams), payloads only.
    pub fn read_datagram_bufs(&mut self, at_most: usize) -> LocalResult<Vec<Bytes>> {
        Ok(self
            .read_datagrams(at_most)?
            .into_iter()
            .map(|datagram| datagram.data)
            .collect())
    }

    // ---- ping ------------------------------------------------------------

    pub fn set_ping_callback(&mut self, cb: Option<PingCallbackHandle>) -> LocalResult<()> {
        self.require_open()?;
        trace!(installed = cb.is_some(), "setting ping callback");
        self.ping_callback = cb;
        Ok(())
    }

    /// Queue a PING frame; with a nonzero timeout and a ping callback
    /// installed, arm the ping timer.
    pub fn send_ping(&mut self, timeout: std::time::Duration) {
        if self.close_state == CloseState::Closed {
            return;
        }
        self.conn.pending_events.send_ping = true;
        self.update_write_looper(true, false);
        if self.ping_callback.is_some() && !timeout.is_zero() {
            self.schedule_ping_timeout(timeout);
        }
    }

    // ---- knobs -----------------------------------------------------------

    pub fn set_knob(&mut self, knob_space: u64, knob_id: u64, blob: Bytes) -> LocalResult<()> {
        if !self.is_knob_supported() {
            warn!("cannot set knob, peer does not support knob frames");
            return Err(LocalErrorCode::KnobFrameUnsupported);
        }
        self.conn.send_simple_frame(SimpleFrame::Knob(KnobFrame {
            knob_space,
            knob_id,
            blob,
        }));
        Ok(())
    }

    pub fn is_knob_supported(&self) -> bool {
        self.conn.peer_advertised_knob_frame_support
    }

    // ---- priorities ------------------------------------------------------

    pub fn set_stream_priority(&mut self, id: StreamId, priority: Priority) -> LocalResult<()> {
        self.require_open()?;
        if priority.level > MAX_PRIORITY_LEVEL {
            return Err(LocalErrorCode::InvalidOperation);
        }
        if !self.conn.streams.stream_exists(id) {
            // Prioritizing a nonexistent stream is not an error.
            return Ok(());
        }
        // Prioritizing after FIN is fine too: it reprioritizes
        // retransmissions.
        let updated = self.conn.streams.set_stream_priority(id, priority);
        if updated {
            if let Some(qlogger) = self.conn.qlogger.as_ref() {
                qlogger.add_priority_update(id, priority.level, priority.incremental);
            }
            self.on_stream_priorities_change();
        }
        Ok(())
    }

    pub fn get_stream_priority(&self, id: StreamId) -> LocalResult<Priority> {
        self.require_open()?;
        Ok(self.stream_or_err(id)?.priority)
    }
}
