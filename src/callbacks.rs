//! Application callback capability sets.
//!
//! Each capability is a small trait; the application installs shared
//! handles (`Rc<RefCell<dyn Trait>>`) so the transport can compare callback
//! identity when rejecting duplicate registrations.
//!
//! Every callback receives a [`TransportCtx`]. User code must not be handed
//! an aliased transport handle while the transport is mid-dispatch, so the
//! ctx records requests (currently: close) which the dispatcher applies as
//! soon as the callback returns. A dispatch chain re-checks the close state
//! after every callback and aborts once the connection leaves `Open`.

use std::cell::RefCell;
use std::rc::Rc;

use bytes::Bytes;

use crate::byte_event::ByteEvent;
use crate::error::{ApplicationErrorCode, QuicError};
use crate::state::CloseState;
use crate::stream::StreamChunk;
use crate::types::{StreamGroupId, StreamId};

/// Handed to application callbacks for the duration of one invocation.
pub struct TransportCtx {
    close_state: CloseState,
    pub(crate) close_request: Option<CloseRequest>,
}

#[derive(Debug)]
pub(crate) struct CloseRequest {
    pub error: Option<QuicError>,
    /// `close_now` semantics: skip the drain period.
    pub immediate: bool,
}

impl TransportCtx {
    pub(crate) fn new(close_state: CloseState) -> Self {
        Self {
            close_state,
            close_request: None,
        }
    }

    /// Close state at the time the callback was invoked.
    pub fn close_state(&self) -> CloseState {
        self.close_state
    }

    /// Request an orderly close once this callback returns.
    pub fn close(&mut self, error: Option<QuicError>) {
        self.close_request = Some(CloseRequest {
            error,
            immediate: false,
        });
    }

    /// Request an immediate close (no drain) once this callback returns.
    pub fn close_now(&mut self, error: Option<QuicError>) {
        self.close_request = Some(CloseRequest {
            error,
            immediate: true,
        });
    }
}

/// Readable-data notifications for a stream.
pub trait ReadCallback {
    fn read_available(&mut self, ctx: &mut TransportCtx, id: StreamId);

    fn read_available_with_group(
        &mut self,
        ctx: &mut TransportCtx,
        id: StreamId,
        _group: StreamGroupId,
    ) {
        self.read_available(ctx, id);
    }

    fn read_error(&mut self, ctx: &mut TransportCtx, id: StreamId, error: QuicError);

    fn read_error_with_group(
        &mut self,
        ctx: &mut TransportCtx,
        id: StreamId,
        _group: StreamGroupId,
        error: QuicError,
    ) {
        self.read_error(ctx, id, error);
    }
}

/// Peek notifications: data is presented without consuming it.
pub trait PeekCallback {
    fn on_data_available(&mut self, ctx: &mut TransportCtx, id: StreamId, data: &[StreamChunk]);

    fn peek_error(&mut self, ctx: &mut TransportCtx, id: StreamId, error: QuicError);
}

/// Write-readiness notifications at stream and connection scope.
pub trait WriteCallback {
    fn on_stream_write_ready(&mut self, _ctx: &mut TransportCtx, _id: StreamId, _max_to_send: u64) {
    }

    fn on_connection_write_ready(&mut self, _ctx: &mut TransportCtx, _max_to_send: u64) {}

    fn on_stream_write_error(&mut self, _ctx: &mut TransportCtx, _id: StreamId, _error: QuicError) {
    }

    fn on_connection_write_error(&mut self, _ctx: &mut TransportCtx, _error: QuicError) {}
}

/// TX/ACK byte-event notifications.
///
/// Every registered callback receives exactly one terminal notification:
/// either `on_byte_event` or `on_byte_event_canceled`.
pub trait ByteEventCallback {
    fn on_byte_event_registered(&mut self, _ctx: &mut TransportCtx, _event: ByteEvent) {}

    fn on_byte_event(&mut self, ctx: &mut TransportCtx, event: ByteEvent);

    fn on_byte_event_canceled(&mut self, ctx: &mut TransportCtx, event: ByteEvent);
}

/// Ping lifecycle notifications.
pub trait PingCallback {
    /// Peer sent us a ping.
    fn on_ping(&mut self, _ctx: &mut TransportCtx) {}

    /// Our ping was acknowledged before its timeout.
    fn ping_acknowledged(&mut self, _ctx: &mut TransportCtx) {}

    /// Our ping timed out.
    fn ping_timeout(&mut self, _ctx: &mut TransportCtx) {}
}

/// Datagram arrival notification.
pub trait DatagramCallback {
    fn on_datagrams_available(&mut self, ctx: &mut TransportCtx);
}

/// Callbacks delivered before the handshake has completed.
pub trait ConnectionSetupCallback {
    fn on_transport_ready(&mut self, _ctx: &mut TransportCtx) {}

    fn on_connection_setup_error(&mut self, ctx: &mut TransportCtx, error: QuicError);
}

/// Connection-scope callbacks delivered after the transport is ready.
pub trait ConnectionCallback {
    fn on_new_bidirectional_stream(&mut self, ctx: &mut TransportCtx, id: StreamId);

    fn on_new_unidirectional_stream(&mut self, ctx: &mut TransportCtx, id: StreamId);

    fn on_new_bidirectional_stream_group(
        &mut self,
        _ctx: &mut TransportCtx,
        _group: StreamGroupId,
    ) {
    }

    fn on_new_unidirectional_stream_group(
        &mut self,
        _ctx: &mut TransportCtx,
        _group: StreamGroupId,
    ) {
    }

    fn on_new_bidirectional_stream_in_group(
        &mut self,
        ctx: &mut TransportCtx,
        id: StreamId,
        _group: StreamGroupId,
    ) {
        self.on_new_bidirectional_stream(ctx, id);
    }

    fn on_new_unidirectional_stream_in_group(
        &mut self,
        ctx: &mut TransportCtx,
        id: StreamId,
        _group: StreamGroupId,
    ) {
        self.on_new_unidirectional_stream(ctx, id);
    }

    fn on_stop_sending(
        &mut self,
        _ctx: &mut TransportCtx,
        _id: StreamId,
        _error: ApplicationErrorCode,
    ) {
    }

    fn on_flow_control_update(&mut self, _ctx: &mut TransportCtx, _id: StreamId) {}

    fn on_knob(&mut self, _ctx: &mut TransportCtx, _space: u64, _id: u64, _blob: Bytes) {}

    fn on_app_rate_limited(&mut self, _ctx: &mut TransportCtx) {}

    fn on_bidirectional_streams_available(&mut self, _ctx: &mut TransportCtx, _count: u64) {}

    fn on_unidirectional_streams_available(&mut self, _ctx: &mut TransportCtx, _count: u64) {}

    /// A closed stream is about to be removed from the registry.
    fn on_stream_pre_reaped(&mut self, _ctx: &mut TransportCtx, _id: StreamId) {}

    /// Terminal: connection ended with a benign reason.
    fn on_connection_end(&mut self, _ctx: &mut TransportCtx) {}

    /// Terminal: connection ended with an error.
    fn on_connection_error(&mut self, _ctx: &mut TransportCtx, _error: QuicError) {}

    /// Terminal, used instead of the two above when the transport was
    /// configured with the end-with-error callback shape.
    fn on_connection_end_with_error(&mut self, _ctx: &mut TransportCtx, _error: QuicError) {}
}

pub type ReadCallbackHandle = Rc<RefCell<dyn ReadCallback>>;
pub type PeekCallbackHandle = Rc<RefCell<dyn PeekCallback>>;
pub type WriteCallbackHandle = Rc<RefCell<dyn WriteCallback>>;
pub type PingCallbackHandle = Rc<RefCell<dyn PingCallback>>;
pub type DatagramCallbackHandle = Rc<RefCell<dyn DatagramCallback>>;
pub type ConnectionSetupCallbackHandle = Rc<RefCell<dyn ConnectionSetupCallback>>;
pub type ConnectionCallbackHandle = Rc<RefCell<dyn ConnectionCallback>>;

/// Registry entry for a stream's read callback.
pub(crate) struct ReadCallbackData {
    pub callback: Option<ReadCallbackHandle>,
    pub resumed: bool,
    pub delivered_eom: bool,
}

impl ReadCallbackData {
    pub fn new(callback: ReadCallbackHandle) -> Self {
        Self {
            callback: Some(callback),
            resumed: true,
            delivered_eom: false,
        }
    }
}

/// Registry entry for a stream's peek callback.
pub(crate) struct PeekCallbackData {
    pub callback: Option<PeekCallbackHandle>,
    pub resumed: bool,
}

impl PeekCallbackData {
    pub fn new(callback: PeekCallbackHandle) -> Self {
        Self {
            callback: Some(callback),
            resumed: true,
        }
    }
}
