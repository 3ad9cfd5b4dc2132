//! Scenario tests for the transport core: close/drain protocol, byte-event
//! ordering and cancellation, flow-control unblocking, idle timeout, and
//! ECN validation, driven through mock collaborators and counting mock
//! callbacks.

#![cfg(test)]

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::byte_event::{ByteEvent, ByteEventKind};
use crate::callbacks::{
    ByteEventCallback, ConnectionCallback, ConnectionSetupCallback, DatagramCallback,
    PingCallback, ReadCallback, TransportCtx, WriteCallback,
};
use crate::error::{
    ApplicationErrorCode, LocalErrorCode, QuicError, QuicErrorCode, TransportErrorCode,
    GENERIC_APP_NO_ERROR,
};
use crate::interfaces::{
    LossRecovery, NetworkData, QLogger, ReceivedUdpPacket, TransportSummary, UdpSocket, WireCodec,
    WriteDataReason,
};
use crate::settings::ECN_ECT1;
use crate::state::{CloseState, Conn};
use crate::stream::StreamChunk;
use crate::timers::TimerKind;
use crate::types::{Side, StreamId};

use super::QuicTransport;

// ============================================================================
// Mock collaborators
// ============================================================================

#[derive(Default)]
struct CodecState {
    should_write: Option<WriteDataReason>,
    write_calls: u64,
    on_read: Option<Box<dyn FnMut(&mut Conn)>>,
}

struct ScriptedCodec {
    state: Rc<RefCell<CodecState>>,
}

impl WireCodec for ScriptedCodec {
    fn on_read_data(
        &mut self,
        conn: &mut Conn,
        _peer: SocketAddr,
        _packet: &ReceivedUdpPacket,
    ) -> Result<(), QuicError> {
        if let Some(on_read) = self.state.borrow_mut().on_read.as_mut() {
            on_read(conn);
        }
        Ok(())
    }

    fn write_data(
        &mut self,
        _conn: &mut Conn,
        _socket: &mut dyn UdpSocket,
    ) -> Result<(), QuicError> {
        self.state.borrow_mut().write_calls += 1;
        Ok(())
    }

    fn should_write_data(&self, _conn: &Conn) -> WriteDataReason {
        self.state
            .borrow()
            .should_write
            .unwrap_or(WriteDataReason::NoWrite)
    }
}

struct NullRecovery;

impl LossRecovery for NullRecovery {
    fn alarm_deadline(&self, _conn: &Conn, _now: Instant) -> Option<Instant> {
        None
    }

    fn on_loss_detection_alarm(
        &mut self,
        _conn: &mut Conn,
        _now: Instant,
    ) -> Result<(), QuicError> {
        Ok(())
    }
}

#[derive(Default)]
struct SocketState {
    closed: bool,
    read_paused: bool,
    tos: u8,
}

struct TestSocket {
    state: Rc<RefCell<SocketState>>,
}

impl UdpSocket for TestSocket {
    fn is_bound(&self) -> bool {
        true
    }

    fn local_address(&self) -> Option<SocketAddr> {
        Some("127.0.0.1:4433".parse().unwrap())
    }

    fn set_tos(&mut self, tos: u8) {
        self.state.borrow_mut().tos = tos;
    }

    fn pause_read(&mut self) {
        self.state.borrow_mut().read_paused = true;
    }

    fn close(&mut self) {
        self.state.borrow_mut().closed = true;
    }
}

// ============================================================================
// Counting mock callbacks
// ============================================================================

#[derive(Default)]
struct MockByteEventCallback {
    registered: Vec<ByteEvent>,
    delivered: Vec<ByteEvent>,
    canceled: Vec<ByteEvent>,
}

impl ByteEventCallback for MockByteEventCallback {
    fn on_byte_event_registered(&mut self, _ctx: &mut TransportCtx, event: ByteEvent) {
        self.registered.push(event);
    }

    fn on_byte_event(&mut self, _ctx: &mut TransportCtx, event: ByteEvent) {
        self.delivered.push(event);
    }

    fn on_byte_event_canceled(&mut self, _ctx: &mut TransportCtx, event: ByteEvent) {
        self.canceled.push(event);
    }
}

#[derive(Default)]
struct MockReadCallback {
    available: Vec<StreamId>,
    errors: Vec<(StreamId, QuicError)>,
}

impl ReadCallback for MockReadCallback {
    fn read_available(&mut self, _ctx: &mut TransportCtx, id: StreamId) {
        self.available.push(id);
    }

    fn read_error(&mut self, _ctx: &mut TransportCtx, id: StreamId, error: QuicError) {
        self.errors.push((id, error));
    }
}

#[derive(Default)]
struct MockWriteCallback {
    conn_ready: Vec<u64>,
    stream_ready: Vec<(StreamId, u64)>,
    conn_errors: Vec<QuicError>,
    stream_errors: Vec<(StreamId, QuicError)>,
}

impl WriteCallback for MockWriteCallback {
    fn on_stream_write_ready(&mut self, _ctx: &mut TransportCtx, id: StreamId, max_to_send: u64) {
        self.stream_ready.push((id, max_to_send));
    }

    fn on_connection_write_ready(&mut self, _ctx: &mut TransportCtx, max_to_send: u64) {
        self.conn_ready.push(max_to_send);
    }

    fn on_stream_write_error(&mut self, _ctx: &mut TransportCtx, id: StreamId, error: QuicError) {
        self.stream_errors.push((id, error));
    }

    fn on_connection_write_error(&mut self, _ctx: &mut TransportCtx, error: QuicError) {
        self.conn_errors.push(error);
    }
}

#[derive(Default)]
struct MockConnectionCallback {
    new_streams: Vec<StreamId>,
    stop_sending: Vec<(StreamId, ApplicationErrorCode)>,
    end_count: u32,
    errors: Vec<QuicError>,
    end_with_error: Vec<QuicError>,
}

impl ConnectionCallback for MockConnectionCallback {
    fn on_new_bidirectional_stream(&mut self, _ctx: &mut TransportCtx, id: StreamId) {
        self.new_streams.push(id);
    }

    fn on_new_unidirectional_stream(&mut self, _ctx: &mut TransportCtx, id: StreamId) {
        self.new_streams.push(id);
    }

    fn on_stop_sending(
        &mut self,
        _ctx: &mut TransportCtx,
        id: StreamId,
        error: ApplicationErrorCode,
    ) {
        self.stop_sending.push((id, error));
    }

    fn on_connection_end(&mut self, _ctx: &mut TransportCtx) {
        self.end_count += 1;
    }

    fn on_connection_error(&mut self, _ctx: &mut TransportCtx, error: QuicError) {
        self.errors.push(error);
    }

    fn on_connection_end_with_error(&mut self, _ctx: &mut TransportCtx, error: QuicError) {
        self.end_with_error.push(error);
    }
}

#[derive(Default)]
struct MockSetupCallback {
    ready_count: u32,
    setup_errors: Vec<QuicError>,
}

impl ConnectionSetupCallback for MockSetupCallback {
    fn on_transport_ready(&mut self, _ctx: &mut TransportCtx) {
        self.ready_count += 1;
    }

    fn on_connection_setup_error(&mut self, _ctx: &mut TransportCtx, error: QuicError) {
        self.setup_errors.push(error);
    }
}

#[derive(Default)]
struct MockPingCallback {
    pings: u32,
    acknowledged: u32,
    timeouts: u32,
}

impl PingCallback for MockPingCallback {
    fn on_ping(&mut self, _ctx: &mut TransportCtx) {
        self.pings += 1;
    }

    fn ping_acknowledged(&mut self, _ctx: &mut TransportCtx) {
        self.acknowledged += 1;
    }

    fn ping_timeout(&mut self, _ctx: &mut TransportCtx) {
        self.timeouts += 1;
    }
}

#[derive(Default)]
struct MockDatagramCallback {
    notifications: u32,
}

impl DatagramCallback for MockDatagramCallback {
    fn on_datagrams_available(&mut self, _ctx: &mut TransportCtx) {
        self.notifications += 1;
    }
}

#[derive(Default)]
struct CountingQLogger {
    closes: RefCell<u32>,
    summaries: RefCell<u32>,
}

impl QLogger for CountingQLogger {
    fn add_connection_close(&self, _error: &str, _reason: &str, _drain: bool, _send: bool) {
        *self.closes.borrow_mut() += 1;
    }

    fn add_transport_summary(&self, _summary: &TransportSummary) {
        *self.summaries.borrow_mut() += 1;
    }

    fn add_transport_state_update(&self, _update: &str) {}

    fn add_path_validation_event(&self, _success: bool) {}

    fn add_priority_update(&self, _id: StreamId, _level: u8, _incremental: bool) {}
}

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    transport: QuicTransport,
    codec: Rc<RefCell<CodecState>>,
    socket: Rc<RefCell<SocketState>>,
    now: Instant,
}

impl Harness {
    fn new(side: Side) -> Self {
        let codec = Rc::new(RefCell::new(CodecState::default()));
        let socket = Rc::new(RefCell::new(SocketState::default()));
        let now = Instant::now();
        let transport = QuicTransport::new(
            side,
            "192.0.2.1:443".parse().unwrap(),
            Some(Box::new(TestSocket {
                state: socket.clone(),
            })),
            Box::new(ScriptedCodec {
                state: codec.clone(),
            }),
            Box::new(NullRecovery),
            false,
            now,
        );
        Self {
            transport,
            codec,
            socket,
            now,
        }
    }

    fn client() -> Self {
        Self::new(Side::Client)
    }

    fn advance(&mut self, delta: Duration) {
        self.now += delta;
        self.transport.handle_timeout(self.now);
    }

    fn tick(&mut self) {
        self.transport.run_loop_iteration(self.now);
    }

    fn deliver_packet(&mut self, on_read: impl FnMut(&mut Conn) + 'static) {
        self.codec.borrow_mut().on_read = Some(Box::new(on_read));
        let data = NetworkData {
            packets: vec![ReceivedUdpPacket {
                data: Bytes::from_static(&[0u8; 64]),
                receive_time: self.now,
                tos: 0,
                software_rx_timestamp: None,
            }],
        };
        self.transport
            .on_network_data("192.0.2.1:443".parse().unwrap(), data, self.now);
    }

    fn local_error_code(&self) -> Option<QuicErrorCode> {
        self.transport
            .conn()
            .local_connection_error
            .as_ref()
            .map(|error| error.code)
    }
}

fn byte_event_cb() -> Rc<RefCell<MockByteEventCallback>> {
    Rc::new(RefCell::new(MockByteEventCallback::default()))
}

// ============================================================================
// Close / drain scenarios
// ============================================================================

mod close_tests {
    use super::*;

    /// Close with no error carries the generic application no-error code,
    /// emits a close frame, and drains before tearing the socket down.
    #[test]
    fn test_immediate_close_with_no_error() {
        let mut harness = Harness::client();
        harness.transport.close(None);

        assert_eq!(harness.transport.close_state(), CloseState::Closed);
        assert_eq!(
            harness.local_error_code(),
            Some(QuicErrorCode::Application(GENERIC_APP_NO_ERROR))
        );
        // The close frame went out synchronously.
        assert_eq!(harness.codec.borrow().write_calls, 1);
        // Still draining: socket alive, connection bound.
        assert!(harness.transport.timers.is_scheduled(TimerKind::Drain));
        assert!(!harness.socket.borrow().closed);
        assert!(!harness.transport.is_unbound());

        // After the drain period the socket closes and the connection
        // unbinds.
        harness.advance(Duration::from_secs(2));
        assert!(harness.socket.borrow().closed);
        assert!(harness.socket.borrow().read_paused);
        assert!(harness.transport.is_unbound());
    }

    /// A stateless reset during graceful close moves straight to closed:
    /// no close frame, no drain timer.
    #[test]
    fn test_reset_during_graceful_close() {
        let mut harness = Harness::client();
        harness.transport.create_bidirectional_stream().unwrap();
        harness.transport.create_bidirectional_stream().unwrap();

        harness.transport.close_gracefully();
        assert_eq!(
            harness.transport.close_state(),
            CloseState::GracefulClosing
        );
        assert_eq!(harness.codec.borrow().write_calls, 0);

        harness.deliver_packet(|conn| {
            conn.peer_connection_error = Some(QuicError::new(
                LocalErrorCode::ConnectionReset,
                "stateless reset",
            ));
        });

        assert_eq!(harness.transport.close_state(), CloseState::Closed);
        // Reset: no close frame, no drain.
        assert_eq!(harness.codec.borrow().write_calls, 0);
        assert!(!harness.transport.timers.is_scheduled(TimerKind::Drain));
        assert!(harness.socket.borrow().closed);
        assert!(harness.transport.is_unbound());
    }

    /// Graceful close with no open streams closes immediately.
    #[test]
    fn test_graceful_close_without_streams() {
        let mut harness = Harness::client();
        harness.transport.close_gracefully();
        assert_eq!(harness.transport.close_state(), CloseState::Closed);
        assert!(harness.transport.timers.is_scheduled(TimerKind::Drain));
    }

    /// A second close is a no-op: the original error sticks.
    #[test]
    fn test_close_is_idempotent() {
        let mut harness = Harness::client();
        harness
            .transport
            .close(Some(QuicError::new(ApplicationErrorCode(42), "first")));
        let write_calls = harness.codec.borrow().write_calls;

        harness
            .transport
            .close(Some(QuicError::new(ApplicationErrorCode(43), "second")));
        assert_eq!(
            harness.local_error_code(),
            Some(QuicErrorCode::Application(ApplicationErrorCode(42)))
        );
        assert_eq!(harness.codec.borrow().write_calls, write_calls);
    }

    /// `close_now` cancels a drain armed by a previous close and expires it
    /// synchronously.
    #[test]
    fn test_close_now_cancels_pending_drain() {
        let mut harness = Harness::client();
        harness.transport.close(None);
        assert!(harness.transport.timers.is_scheduled(TimerKind::Drain));

        harness.transport.close_now(None);
        assert!(!harness.transport.timers.is_scheduled(TimerKind::Drain));
        assert!(harness.socket.borrow().closed);
        assert!(harness.transport.is_unbound());
    }

    /// APIs reject with CONNECTION_CLOSED once the connection has closed.
    #[test]
    fn test_apis_reject_after_close() {
        let mut harness = Harness::client();
        let id = harness.transport.create_bidirectional_stream().unwrap();
        harness.transport.close(None);

        assert_eq!(
            harness.transport.create_bidirectional_stream(),
            Err(LocalErrorCode::ConnectionClosed)
        );
        assert_eq!(
            harness.transport.read(id, 0),
            Err(LocalErrorCode::ConnectionClosed)
        );
        assert_eq!(
            harness
                .transport
                .write_chain(id, Bytes::from_static(b"x"), false, None),
            Err(LocalErrorCode::ConnectionClosed)
        );
        assert_eq!(
            harness.transport.register_delivery_callback(id, 0, Some(byte_event_cb())),
            Err(LocalErrorCode::ConnectionClosed)
        );
    }

    /// All registries are empty after close, and every pending callback got
    /// exactly one terminal notification.
    #[test]
    fn test_close_cancels_all_app_callbacks() {
        let mut harness = Harness::client();
        let id = harness.transport.create_bidirectional_stream().unwrap();

        let read_cb = Rc::new(RefCell::new(MockReadCallback::default()));
        harness
            .transport
            .set_read_callback(id, Some(read_cb.clone()), None)
            .unwrap();

        let be_cb = byte_event_cb();
        harness
            .transport
            .register_delivery_callback(id, 100, Some(be_cb.clone()))
            .unwrap();

        let write_cb = Rc::new(RefCell::new(MockWriteCallback::default()));
        harness
            .transport
            .notify_pending_write_on_connection(write_cb.clone())
            .unwrap();

        harness
            .transport
            .close(Some(QuicError::new(LocalErrorCode::InternalError, "boom")));

        assert_eq!(read_cb.borrow().errors.len(), 1);
        assert_eq!(be_cb.borrow().canceled.len(), 1);
        assert_eq!(be_cb.borrow().delivered.len(), 0);
        assert_eq!(write_cb.borrow().conn_errors.len(), 1);

        assert!(harness.transport.read_callbacks.is_empty());
        assert!(harness.transport.peek_callbacks.is_empty());
        assert!(harness.transport.pending_write_callbacks.is_empty());
        assert!(harness.transport.conn_write_callback.is_none());
        assert_eq!(harness.transport.num_byte_event_callbacks_for_stream(id), 0);
    }

    /// The terminal connection callback fires exactly once, and its variant
    /// tracks the benign-ness of the close reason.
    #[test]
    fn test_terminal_callback_selection() {
        // Benign reason (idle timeout) after transport ready: end.
        let mut harness = Harness::client();
        let conn_cb = Rc::new(RefCell::new(MockConnectionCallback::default()));
        harness
            .transport
            .set_connection_callback(Some(conn_cb.clone()));
        harness.transport.mark_transport_ready();
        harness.transport.set_idle_timer();
        harness.advance(Duration::from_secs(120));
        assert_eq!(conn_cb.borrow().end_count, 1);
        assert!(conn_cb.borrow().errors.is_empty());

        // Peer error: on_connection_error.
        let mut harness = Harness::client();
        let conn_cb = Rc::new(RefCell::new(MockConnectionCallback::default()));
        harness
            .transport
            .set_connection_callback(Some(conn_cb.clone()));
        harness.transport.mark_transport_ready();
        harness.deliver_packet(|conn| {
            conn.peer_connection_error = Some(QuicError::new(
                TransportErrorCode::ProtocolViolation,
                "peer violation",
            ));
        });
        assert_eq!(conn_cb.borrow().end_count, 0);
        assert_eq!(conn_cb.borrow().errors.len(), 1);
    }

    /// Before the transport is ready, the setup-error callback is the
    /// terminal one.
    #[test]
    fn test_setup_error_terminal_callback() {
        let mut harness = Harness::client();
        let setup_cb = Rc::new(RefCell::new(MockSetupCallback::default()));
        harness
            .transport
            .set_connection_setup_callback(Some(setup_cb.clone()));
        harness.transport.set_idle_timer();
        harness.advance(Duration::from_secs(120));
        assert_eq!(setup_cb.borrow().setup_errors.len(), 1);
    }

    /// The end-with-error callback shape replaces both terminal variants.
    #[test]
    fn test_end_with_error_callback_shape() {
        let codec = Rc::new(RefCell::new(CodecState::default()));
        let now = Instant::now();
        let mut transport = QuicTransport::new(
            Side::Client,
            "192.0.2.1:443".parse().unwrap(),
            None,
            Box::new(ScriptedCodec {
                state: codec.clone(),
            }),
            Box::new(NullRecovery),
            true,
            now,
        );
        let conn_cb = Rc::new(RefCell::new(MockConnectionCallback::default()));
        transport.set_connection_callback(Some(conn_cb.clone()));
        transport.mark_transport_ready();
        transport.set_idle_timer();
        transport.handle_timeout(now + Duration::from_secs(120));
        assert_eq!(conn_cb.borrow().end_count, 0);
        assert_eq!(conn_cb.borrow().end_with_error.len(), 1);
    }
}

// ============================================================================
// Idle / keepalive timers
// ============================================================================

mod idle_timer_tests {
    use super::*;

    /// Idle expiry closes with IDLE_TIMEOUT, drains, and reports the
    /// non-control stream count.
    #[test]
    fn test_idle_timeout_closes_with_stream_count() {
        let mut harness = Harness::client();
        let mut settings = harness.transport.transport_settings().clone();
        settings.idle_timeout = Duration::from_secs(30);
        harness.transport.set_transport_settings(settings);

        let _data_stream = harness.transport.create_bidirectional_stream().unwrap();
        let control = harness.transport.create_bidirectional_stream().unwrap();
        harness.transport.set_control_stream(control).unwrap();

        harness.transport.set_idle_timer();
        harness.advance(Duration::from_secs(30));

        assert_eq!(harness.transport.close_state(), CloseState::Closed);
        assert_eq!(
            harness.local_error_code(),
            Some(QuicErrorCode::Local(LocalErrorCode::IdleTimeout))
        );
        let error = harness
            .transport
            .conn()
            .local_connection_error
            .clone()
            .unwrap();
        assert!(error.message.contains("num non control streams: 1"));
        // drain = true for the idle path.
        assert!(harness.transport.timers.is_scheduled(TimerKind::Drain));
    }

    /// The keepalive timer fires at 85% of the idle interval and queues a
    /// ping.
    #[test]
    fn test_keepalive_queues_ping() {
        let mut harness = Harness::client();
        let mut settings = harness.transport.transport_settings().clone();
        settings.idle_timeout = Duration::from_secs(20);
        settings.enable_keepalive = true;
        harness.transport.set_transport_settings(settings);

        harness.transport.set_idle_timer();
        assert!(harness.transport.timers.is_scheduled(TimerKind::Keepalive));

        harness.advance(Duration::from_secs(17));
        assert!(harness.transport.conn().pending_events.send_ping);
        // The idle timer itself has not fired yet.
        assert_eq!(harness.transport.close_state(), CloseState::Open);
    }

    /// The idle cross-check schedules a deferred expiry when the deadline
    /// has silently passed, and only once per arming.
    #[test]
    fn test_idle_timer_cross_check_fires_async() {
        let mut harness = Harness::client();
        let mut settings = harness.transport.transport_settings().clone();
        settings.idle_timeout = Duration::from_secs(10);
        harness.transport.set_transport_settings(settings);
        harness.transport.set_idle_timer();

        let late = harness.now + Duration::from_secs(11);
        harness.transport.check_idle_timer(late);
        harness.transport.check_idle_timer(late);
        assert_eq!(harness.transport.close_state(), CloseState::Open);

        harness.transport.run_loop_iteration(late);
        assert_eq!(harness.transport.close_state(), CloseState::Closed);
        assert_eq!(
            harness.local_error_code(),
            Some(QuicErrorCode::Local(LocalErrorCode::IdleTimeout))
        );
    }
}

// ============================================================================
// Byte events
// ============================================================================

mod byte_event_tests {
    use super::*;

    /// Delivery callbacks fire in offset order even when acks arrive out of
    /// order, each exactly once.
    #[test]
    fn test_ack_byte_event_ordering_under_reorder() {
        let mut harness = Harness::client();
        let id = harness.transport.create_bidirectional_stream().unwrap();
        let cb = byte_event_cb();
        for offset in [100, 200, 300] {
            harness
                .transport
                .register_delivery_callback(id, offset, Some(cb.clone()))
                .unwrap();
        }
        assert_eq!(cb.borrow().registered.len(), 3);

        // Acks arrive 200, 300, 100; the deliverable offset is cumulative.
        for deliverable in [200, 300] {
            let stream = harness.transport.conn_mut().streams.get_stream_mut(id).unwrap();
            stream.largest_deliverable_offset = Some(deliverable);
            harness.transport.conn_mut().streams.add_deliverable(id);
            harness.transport.process_callbacks_after_network_data();
        }

        let delivered: Vec<u64> = cb.borrow().delivered.iter().map(|e| e.offset).collect();
        assert_eq!(delivered, vec![100, 200, 300]);
        assert!(cb.borrow().canceled.is_empty());
        assert_eq!(harness.transport.num_byte_event_callbacks_for_stream(id), 0);
    }

    /// Registering at an offset that is already deliverable dispatches
    /// asynchronously on the next loop iteration.
    #[test]
    fn test_register_past_offset_dispatches_async() {
        let mut harness = Harness::client();
        let id = harness.transport.create_bidirectional_stream().unwrap();
        harness
            .transport
            .conn_mut()
            .streams
            .get_stream_mut(id)
            .unwrap()
            .largest_deliverable_offset = Some(150);

        let cb = byte_event_cb();
        harness
            .transport
            .register_delivery_callback(id, 100, Some(cb.clone()))
            .unwrap();
        // Nothing yet: dispatch is deferred to the next iteration.
        assert!(cb.borrow().delivered.is_empty());

        harness.tick();
        assert_eq!(cb.borrow().delivered.len(), 1);
        assert_eq!(cb.borrow().delivered[0].offset, 100);
        assert_eq!(harness.transport.num_byte_event_callbacks_for_stream(id), 0);
    }

    /// A cancellation between registration and the deferred dispatch wins:
    /// one cancel, zero deliveries.
    #[test]
    fn test_register_then_cancel_before_async_dispatch() {
        let mut harness = Harness::client();
        let id = harness.transport.create_bidirectional_stream().unwrap();
        harness
            .transport
            .conn_mut()
            .streams
            .get_stream_mut(id)
            .unwrap()
            .largest_deliverable_offset = Some(150);

        let cb = byte_event_cb();
        harness
            .transport
            .register_delivery_callback(id, 100, Some(cb.clone()))
            .unwrap();
        harness
            .transport
            .cancel_delivery_callbacks_for_stream(id, None);
        harness.tick();

        assert_eq!(cb.borrow().canceled.len(), 1);
        assert!(cb.borrow().delivered.is_empty());
    }

    /// Duplicate registrations (same offset, same callback) are rejected.
    #[test]
    fn test_duplicate_registration_rejected() {
        let mut harness = Harness::client();
        let id = harness.transport.create_bidirectional_stream().unwrap();
        let cb = byte_event_cb();
        harness
            .transport
            .register_tx_callback(id, 100, Some(cb.clone()))
            .unwrap();
        assert_eq!(
            harness.transport.register_tx_callback(id, 100, Some(cb.clone())),
            Err(LocalErrorCode::InvalidOperation)
        );
        // A different callback at the same offset is fine.
        harness
            .transport
            .register_tx_callback(id, 100, Some(byte_event_cb()))
            .unwrap();
    }

    /// Resetting a stream cancels all its byte events in offset order and
    /// drops its pending-write callback.
    #[test]
    fn test_stream_reset_cancels_byte_events() {
        let mut harness = Harness::client();
        let id = harness.transport.create_bidirectional_stream().unwrap();
        let cb = byte_event_cb();
        for offset in [300, 100, 200] {
            harness
                .transport
                .register_delivery_callback(id, offset, Some(cb.clone()))
                .unwrap();
        }
        let write_cb = Rc::new(RefCell::new(MockWriteCallback::default()));
        harness
            .transport
            .notify_pending_write_on_stream(id, write_cb)
            .unwrap();

        harness
            .transport
            .reset_stream(id, ApplicationErrorCode(21))
            .unwrap();

        let canceled: Vec<u64> = cb.borrow().canceled.iter().map(|e| e.offset).collect();
        assert_eq!(canceled, vec![100, 200, 300]);
        assert!(cb.borrow().delivered.is_empty());
        assert_eq!(harness.transport.num_byte_event_callbacks_for_stream(id), 0);
        assert!(!harness.transport.pending_write_callbacks.contains_key(&id));
    }

    /// TX byte events fire after a write for everything at or below the
    /// largest transmitted offset.
    #[test]
    fn test_tx_byte_events_after_write() {
        let mut harness = Harness::client();
        let id = harness.transport.create_bidirectional_stream().unwrap();
        let cb = byte_event_cb();
        harness
            .transport
            .register_tx_callback(id, 10, Some(cb.clone()))
            .unwrap();
        harness
            .transport
            .register_tx_callback(id, 500, Some(cb.clone()))
            .unwrap();

        harness
            .transport
            .conn_mut()
            .streams
            .get_stream_mut(id)
            .unwrap()
            .largest_offset_txed = Some(100);
        harness.transport.conn_mut().streams.add_tx(id);
        harness.transport.process_callbacks_after_write_data();

        let delivered: Vec<u64> = cb.borrow().delivered.iter().map(|e| e.offset).collect();
        assert_eq!(delivered, vec![10]);
        assert_eq!(
            harness
                .transport
                .num_byte_event_callbacks_for_stream_of_kind(ByteEventKind::Tx, id),
            1
        );
    }
}

// ============================================================================
// Flow control
// ============================================================================

mod flow_control_tests {
    use super::*;

    /// A blocked connection write callback fires exactly once when credit
    /// arrives, and further credit does not refire it.
    #[test]
    fn test_flow_control_write_unblock() {
        let mut harness = Harness::client();
        // Window of zero: nothing writable.
        assert_eq!(harness.transport.max_writable_on_conn(), 0);

        let cb = Rc::new(RefCell::new(MockWriteCallback::default()));
        harness
            .transport
            .notify_pending_write_on_connection(cb.clone())
            .unwrap();
        harness.tick();
        assert!(cb.borrow().conn_ready.is_empty());

        // Peer grants 4096 bytes of connection credit.
        harness.transport.conn_mut().flow_control.peer_advertised_max_offset = 4096;
        harness.transport.process_callbacks_after_network_data();

        assert_eq!(cb.borrow().conn_ready, vec![4096]);
        assert!(harness.transport.conn_write_callback.is_none());

        // More credit does not refire.
        harness.transport.conn_mut().flow_control.peer_advertised_max_offset = 8192;
        harness.transport.process_callbacks_after_network_data();
        assert_eq!(cb.borrow().conn_ready, vec![4096]);
    }

    /// Re-registering a stream write callback reports already-installed for
    /// the same handle and invalid for a different one.
    #[test]
    fn test_pending_write_registration_rules() {
        let mut harness = Harness::client();
        let id = harness.transport.create_bidirectional_stream().unwrap();
        let cb = Rc::new(RefCell::new(MockWriteCallback::default()));
        harness
            .transport
            .notify_pending_write_on_stream(id, cb.clone())
            .unwrap();
        assert_eq!(
            harness.transport.notify_pending_write_on_stream(id, cb),
            Err(LocalErrorCode::CallbackAlreadyInstalled)
        );
        let other = Rc::new(RefCell::new(MockWriteCallback::default()));
        assert_eq!(
            harness.transport.notify_pending_write_on_stream(id, other),
            Err(LocalErrorCode::InvalidWriteCallback)
        );
    }

    /// The stream writable bound is the minimum of stream credit, conn
    /// credit, and buffer headroom.
    #[test]
    fn test_max_writable_on_stream_minimum() {
        let mut harness = Harness::client();
        let id = harness.transport.create_bidirectional_stream().unwrap();
        harness.transport.conn_mut().flow_control.peer_advertised_max_offset = 1000;
        harness
            .transport
            .conn_mut()
            .streams
            .get_stream_mut(id)
            .unwrap()
            .flow
            .peer_advertised_max_offset = 600;
        assert_eq!(harness.transport.get_max_writable_on_stream(id), Ok(600));

        harness.transport.conn_mut().flow_control.peer_advertised_max_offset = 400;
        assert_eq!(harness.transport.get_max_writable_on_stream(id), Ok(400));
    }
}

// ============================================================================
// Read path
// ============================================================================

mod read_path_tests {
    use super::*;

    fn peer_uni_stream(harness: &mut Harness, data: &'static [u8], fin: bool) -> StreamId {
        // Server-initiated unidirectional: receive-only for a client.
        let id = StreamId(3);
        let streams = &mut harness.transport.conn_mut().streams;
        streams.add_peer_stream(id, None);
        let stream = streams.get_stream_mut(id).unwrap();
        stream.read_buffer.push_back(StreamChunk {
            offset: 0,
            data: Bytes::from_static(data),
            fin,
        });
        if fin {
            stream.final_read_offset = Some(data.len() as u64);
        }
        streams.mark_readable(id);
        id
    }

    /// Ingress schedules the read looper; the looper delivers
    /// read-available on the next iteration and keeps delivering until the
    /// data is consumed.
    #[test]
    fn test_read_available_delivery() {
        let mut harness = Harness::client();
        let id = peer_uni_stream(&mut harness, b"hello", false);
        let cb = Rc::new(RefCell::new(MockReadCallback::default()));
        harness
            .transport
            .set_read_callback(id, Some(cb.clone()), None)
            .unwrap();

        harness.tick();
        assert_eq!(cb.borrow().available, vec![id]);

        // Still unread: the looper stays scheduled and fires again.
        harness.tick();
        assert_eq!(cb.borrow().available.len(), 2);

        let (data, eof) = harness.transport.read(id, 0).unwrap();
        assert_eq!(&data[..], b"hello");
        assert!(!eof);
        harness.tick();
        assert_eq!(cb.borrow().available.len(), 2);
    }

    /// A stream read error evicts the stream from the read and peek
    /// surfaces and delivers read-error once.
    #[test]
    fn test_read_error_delivery() {
        let mut harness = Harness::client();
        let id = peer_uni_stream(&mut harness, b"x", false);
        let cb = Rc::new(RefCell::new(MockReadCallback::default()));
        harness
            .transport
            .set_read_callback(id, Some(cb.clone()), None)
            .unwrap();

        harness
            .transport
            .conn_mut()
            .streams
            .get_stream_mut(id)
            .unwrap()
            .stream_read_error = Some(QuicError::from_code(ApplicationErrorCode(3)));
        harness.tick();

        assert_eq!(cb.borrow().errors.len(), 1);
        assert!(!harness.transport.read_callbacks.contains_key(&id));
        harness.tick();
        assert_eq!(cb.borrow().errors.len(), 1);
    }

    /// Unsetting the read callback after EOF delivery lets the stream be
    /// reaped on the next closed-stream check.
    #[test]
    fn test_unset_read_callback_after_eom_reaps_stream() {
        let mut harness = Harness::client();
        let mut settings = harness.transport.transport_settings().clone();
        settings.remove_stream_after_eom_callback_unset = true;
        harness.transport.set_transport_settings(settings);

        let id = peer_uni_stream(&mut harness, b"bye", true);
        let cb = Rc::new(RefCell::new(MockReadCallback::default()));
        harness
            .transport
            .set_read_callback(id, Some(cb), None)
            .unwrap();

        let (_, eof) = harness.transport.read(id, 0).unwrap();
        assert!(eof);
        harness.transport.check_for_closed_stream();
        // Callback still installed: the stream lingers.
        assert!(harness.transport.conn().streams.stream_exists(id));

        harness
            .transport
            .set_read_callback(id, None, Some(GENERIC_APP_NO_ERROR))
            .unwrap();
        harness.transport.check_for_closed_stream();
        assert!(!harness.transport.conn().streams.stream_exists(id));
    }

    /// Pause stops read delivery; resume restarts it.
    #[test]
    fn test_pause_resume_read() {
        let mut harness = Harness::client();
        let id = peer_uni_stream(&mut harness, b"hello", false);
        let cb = Rc::new(RefCell::new(MockReadCallback::default()));
        harness
            .transport
            .set_read_callback(id, Some(cb.clone()), None)
            .unwrap();
        harness.transport.pause_read(id).unwrap();
        harness.tick();
        assert!(cb.borrow().available.is_empty());

        harness.transport.resume_read(id).unwrap();
        harness.tick();
        assert_eq!(cb.borrow().available, vec![id]);
    }

    /// Consume validates the caller's offset and reports the real one on
    /// mismatch.
    #[test]
    fn test_consume_offset_mismatch() {
        let mut harness = Harness::client();
        let id = peer_uni_stream(&mut harness, b"abcdef", false);
        assert_eq!(
            harness.transport.consume_from_offset(id, 3, 2),
            Err((LocalErrorCode::InternalError, Some(0)))
        );
        harness.transport.consume(id, 4).unwrap();
        assert_eq!(harness.transport.get_stream_read_offset(id), Ok(4));
    }
}

// ============================================================================
// Ingress
// ============================================================================

mod ingress_tests {
    use super::*;

    /// New packets reset the idle timer and mark the
    /// received-before-write flag.
    #[test]
    fn test_ingress_rearms_idle_timer() {
        let mut harness = Harness::client();
        assert!(!harness.transport.timers.is_scheduled(TimerKind::Idle));
        harness.deliver_packet(|conn| {
            conn.ack_states.app_data.version += 1;
        });
        assert!(harness.transport.timers.is_scheduled(TimerKind::Idle));
        assert!(harness.transport.conn().received_new_packet_before_write);
    }

    /// A batch that advances no ack state leaves the idle timer alone.
    #[test]
    fn test_stale_ingress_does_not_rearm_idle() {
        let mut harness = Harness::client();
        harness.deliver_packet(|_conn| {});
        assert!(!harness.transport.timers.is_scheduled(TimerKind::Idle));
        assert!(!harness.transport.conn().received_new_packet_before_write);
    }

    /// New peer streams surface through the connection callback before any
    /// other fan-out step.
    #[test]
    fn test_new_peer_stream_callbacks() {
        let mut harness = Harness::client();
        let conn_cb = Rc::new(RefCell::new(MockConnectionCallback::default()));
        harness
            .transport
            .set_connection_callback(Some(conn_cb.clone()));
        harness.deliver_packet(|conn| {
            conn.streams.add_peer_stream(StreamId(1), None);
            conn.ack_states.app_data.version += 1;
        });
        assert_eq!(conn_cb.borrow().new_streams, vec![StreamId(1)]);
    }

    /// Stop-sending events queued by the codec reach the connection
    /// callback.
    #[test]
    fn test_stop_sending_callbacks() {
        let mut harness = Harness::client();
        let conn_cb = Rc::new(RefCell::new(MockConnectionCallback::default()));
        harness
            .transport
            .set_connection_callback(Some(conn_cb.clone()));
        harness.deliver_packet(|conn| {
            conn.streams.add_peer_stream(StreamId(1), None);
            conn.streams.queue_stop_sending(StreamId(1), ApplicationErrorCode(5));
        });
        assert_eq!(
            conn_cb.borrow().stop_sending,
            vec![(StreamId(1), ApplicationErrorCode(5))]
        );
    }

    /// Datagram arrivals wake the read looper and notify the datagram
    /// callback.
    #[test]
    fn test_datagram_callback_notified() {
        let mut harness = Harness::client();
        let dg_cb = Rc::new(RefCell::new(MockDatagramCallback::default()));
        harness
            .transport
            .set_datagram_callback(Some(dg_cb.clone()))
            .unwrap();
        harness.deliver_packet(|conn| {
            conn.datagram_state.max_read_buffer_size = 16;
            conn.datagram_state.read_buffer.push_back(crate::datagram::ReadDatagram {
                receive_time: Instant::now(),
                data: Bytes::from_static(b"dgram"),
            });
        });
        harness.tick();
        assert_eq!(dg_cb.borrow().notifications, 1);

        let datagrams = harness.transport.read_datagram_bufs(0).unwrap();
        assert_eq!(datagrams, vec![Bytes::from_static(b"dgram")]);
    }
}

// ============================================================================
// Datagram write policy
// ============================================================================

mod datagram_tests {
    use super::*;

    fn enable_datagrams(harness: &mut Harness, drop_old: bool) {
        let mut settings = harness.transport.transport_settings().clone();
        settings.datagram.enabled = true;
        settings.datagram.write_buf_size = 2;
        settings.datagram.send_drop_old_data_first = drop_old;
        harness.transport.set_transport_settings(settings);
        harness.transport.conn_mut().datagram_state.max_write_frame_size = 1200;
    }

    #[test]
    fn test_write_datagram_rejected_without_peer_support() {
        let mut harness = Harness::client();
        assert_eq!(
            harness.transport.write_datagram(Bytes::from_static(b"a")),
            Err(LocalErrorCode::InvalidWriteData)
        );
    }

    /// Overflow policy: reject the new datagram unless drop-oldest is
    /// configured.
    #[test]
    fn test_write_datagram_overflow_policy() {
        let mut harness = Harness::client();
        enable_datagrams(&mut harness, false);
        harness.transport.write_datagram(Bytes::from_static(b"a")).unwrap();
        harness.transport.write_datagram(Bytes::from_static(b"b")).unwrap();
        assert_eq!(
            harness.transport.write_datagram(Bytes::from_static(b"c")),
            Err(LocalErrorCode::InvalidWriteData)
        );

        let mut harness = Harness::client();
        enable_datagrams(&mut harness, true);
        harness.transport.write_datagram(Bytes::from_static(b"a")).unwrap();
        harness.transport.write_datagram(Bytes::from_static(b"b")).unwrap();
        harness.transport.write_datagram(Bytes::from_static(b"c")).unwrap();
        let buffered: Vec<&Bytes> = harness
            .transport
            .conn()
            .datagram_state
            .write_buffer
            .iter()
            .collect();
        assert_eq!(buffered.len(), 2);
        assert_eq!(buffered[0], &Bytes::from_static(b"b"));
        assert_eq!(buffered[1], &Bytes::from_static(b"c"));
    }
}

// ============================================================================
// ECN
// ============================================================================

mod ecn_validation_tests {
    use super::*;
    use crate::ecn::EcnState;
    use crate::recovery::{CongestionControlType, CongestionController};

    /// Congestion controller that records the L4S mark fractions it is
    /// handed.
    struct MockCongestionController {
        l4s_fractions: Rc<RefCell<Vec<f64>>>,
    }

    impl CongestionController for MockCongestionController {
        fn writable_bytes(&self) -> u64 {
            u64::MAX
        }

        fn congestion_window(&self) -> u64 {
            12_000
        }

        fn is_app_limited(&self) -> bool {
            false
        }

        fn set_app_limited(&mut self) {}

        fn cc_type(&self) -> CongestionControlType {
            CongestionControlType::Cubic
        }

        fn on_l4s_mark_fraction(&mut self, fraction: f64) {
            self.l4s_fractions.borrow_mut().push(fraction);
        }
    }

    fn l4s_harness() -> Harness {
        let mut harness = Harness::client();
        let mut settings = harness.transport.transport_settings().clone();
        settings.enable_ecn_on_egress = true;
        settings.use_l4s_ecn = true;
        harness.transport.set_transport_settings(settings);
        assert_eq!(harness.transport.conn().ecn_state, EcnState::AttemptingL4s);
        harness
    }

    /// Successful L4S validation installs the tracker exactly once, leaves
    /// the TOS byte alone, and feeds the CE share to the congestion
    /// controller.
    #[test]
    fn test_l4s_validation_success() {
        let mut harness = l4s_harness();
        let fractions = Rc::new(RefCell::new(Vec::new()));
        harness.transport.conn_mut().congestion_controller =
            Some(Box::new(MockCongestionController {
                l4s_fractions: fractions.clone(),
            }));
        {
            let conn = harness.transport.conn_mut();
            let app_data = &mut conn.ack_states.app_data;
            app_data.minimum_expected_ecn_marks_echoed = 10;
            app_data.ecn_ce_count_echoed = 2;
            app_data.ecn_ect0_count_echoed = 0;
            app_data.ecn_ect1_count_echoed = 8;
            conn.loss.total_packets_sent = 10;
        }
        harness.transport.validate_ecn_state();
        assert_eq!(harness.transport.conn().ecn_state, EcnState::ValidatedL4s);
        assert!(harness.transport.conn().ecn_l4s_tracker.is_some());
        assert_eq!(harness.transport.conn().socket_tos.ecn, ECN_ECT1);
        // 2 CE of 10 echoed marks.
        assert_eq!(fractions.borrow().as_slice(), &[0.2]);

        // Idempotent: revalidation does not double-install the tracker but
        // keeps feeding the congestion controller.
        harness.transport.validate_ecn_state();
        assert!(harness.transport.conn().ecn_l4s_tracker.is_some());
        assert_eq!(fractions.borrow().len(), 2);
    }

    /// Failed validation clears the ECN bits on the socket and removes the
    /// tracker.
    #[test]
    fn test_l4s_validation_failure_clears_tos() {
        let mut harness = l4s_harness();
        {
            let conn = harness.transport.conn_mut();
            let app_data = &mut conn.ack_states.app_data;
            app_data.minimum_expected_ecn_marks_echoed = 10;
            app_data.ecn_ce_count_echoed = 2;
            // ECT0 echoed under L4S means the path rewrote our marks.
            app_data.ecn_ect0_count_echoed = 3;
            app_data.ecn_ect1_count_echoed = 8;
            conn.loss.total_packets_sent = 20;
        }
        harness.transport.validate_ecn_state();
        assert_eq!(
            harness.transport.conn().ecn_state,
            EcnState::FailedValidation
        );
        assert_eq!(harness.transport.conn().socket_tos.ecn, 0);
        assert_eq!(harness.socket.borrow().tos & 0b11, 0);
        assert!(harness.transport.conn().ecn_l4s_tracker.is_none());
    }

    /// Validation waits for ten expected marks before judging.
    #[test]
    fn test_validation_waits_for_minimum_marks() {
        let mut harness = l4s_harness();
        harness
            .transport
            .conn_mut()
            .ack_states
            .app_data
            .minimum_expected_ecn_marks_echoed = 9;
        harness.transport.validate_ecn_state();
        assert_eq!(harness.transport.conn().ecn_state, EcnState::AttemptingL4s);
    }
}

// ============================================================================
// Ping, knobs, qlog
// ============================================================================

mod misc_tests {
    use super::*;

    #[test]
    fn test_ping_timeout_and_acknowledgement() {
        let mut harness = Harness::client();
        let ping_cb = Rc::new(RefCell::new(MockPingCallback::default()));
        harness
            .transport
            .set_ping_callback(Some(ping_cb.clone()))
            .unwrap();

        // Acknowledged before the timeout.
        harness.transport.send_ping(Duration::from_millis(500));
        assert!(harness.transport.timers.is_scheduled(TimerKind::Ping));
        harness.transport.conn_mut().pending_events.cancel_ping_timeout = true;
        harness.transport.handle_ping_callbacks();
        assert_eq!(ping_cb.borrow().acknowledged, 1);
        assert!(!harness.transport.timers.is_scheduled(TimerKind::Ping));

        // Timeout path.
        harness.transport.send_ping(Duration::from_millis(500));
        harness.advance(Duration::from_secs(1));
        assert_eq!(ping_cb.borrow().timeouts, 1);
    }

    #[test]
    fn test_knob_requires_peer_support() {
        let mut harness = Harness::client();
        assert_eq!(
            harness
                .transport
                .set_knob(123, 1, Bytes::from_static(b"blob")),
            Err(LocalErrorCode::KnobFrameUnsupported)
        );
        harness.transport.conn_mut().peer_advertised_knob_frame_support = true;
        harness
            .transport
            .set_knob(123, 1, Bytes::from_static(b"blob"))
            .unwrap();
        assert_eq!(harness.transport.conn().pending_events.frames.len(), 1);
    }

    /// qlog set/reset is reference-counted; the logger detaches only when
    /// the count returns to zero.
    #[test]
    fn test_qlogger_refcounting() {
        let mut harness = Harness::client();
        let qlogger = Rc::new(CountingQLogger::default());
        harness.transport.set_qlogger(Some(qlogger.clone()));
        harness.transport.set_qlogger(Some(qlogger.clone()));

        harness.transport.set_qlogger(None);
        assert!(harness.transport.qlogger().is_some());
        harness.transport.set_qlogger(None);
        assert!(harness.transport.qlogger().is_none());
    }

    /// Stream priorities are validated and non-existent streams are not an
    /// error.
    #[test]
    fn test_stream_priority() {
        let mut harness = Harness::client();
        let id = harness.transport.create_bidirectional_stream().unwrap();
        assert_eq!(
            harness.transport.set_stream_priority(
                id,
                crate::types::Priority {
                    level: 9,
                    incremental: false
                }
            ),
            Err(LocalErrorCode::InvalidOperation)
        );
        harness
            .transport
            .set_stream_priority(
                id,
                crate::types::Priority {
                    level: 1,
                    incremental: true,
                },
            )
            .unwrap();
        assert_eq!(
            harness.transport.get_stream_priority(id).unwrap().level,
            1
        );
        // Unknown stream: accepted silently.
        harness
            .transport
            .set_stream_priority(
                StreamId(404),
                crate::types::Priority {
                    level: 1,
                    incremental: false,
                },
            )
            .unwrap();
    }

    /// Stream creation API validation and the limit error.
    #[test]
    fn test_stream_creation_errors() {
        let mut harness = Harness::client();
        // Group features disabled by default.
        assert_eq!(
            harness.transport.create_bidirectional_stream_group(),
            Err(LocalErrorCode::StreamLimitExceeded)
        );

        let mut settings = harness.transport.transport_settings().clone();
        settings.advertised_max_stream_groups = 2;
        harness.transport.set_transport_settings(settings);
        let group = harness.transport.create_bidirectional_stream_group().unwrap();
        let id = harness
            .transport
            .create_bidirectional_stream_in_group(group)
            .unwrap();
        assert_eq!(
            harness.transport.conn().streams.get_stream(id).unwrap().group_id,
            Some(group)
        );
    }
}

// ============================================================================
// Write path
// ============================================================================

mod write_path_tests {
    use super::*;

    /// With data pending, the write gate schedules the looper and the next
    /// iteration writes; with nothing to write the looper stops.
    #[test]
    fn test_write_looper_gated_by_predicate() {
        let mut harness = Harness::client();
        harness.codec.borrow_mut().should_write = Some(WriteDataReason::Stream);
        harness.transport.update_write_looper(true, false);
        assert!(harness.transport.write_looper.is_running());

        harness.tick();
        assert_eq!(harness.codec.borrow().write_calls, 1);

        harness.codec.borrow_mut().should_write = Some(WriteDataReason::NoWrite);
        harness.transport.update_write_looper(true, false);
        assert!(!harness.transport.write_looper.is_running());
    }

    /// `write_chain` buffers data, counts it against the connection buffer,
    /// and registers a delivery callback at the last byte when asked.
    #[test]
    fn test_write_chain_registers_delivery_callback() {
        let mut harness = Harness::client();
        let id = harness.transport.create_bidirectional_stream().unwrap();
        let cb = byte_event_cb();
        harness
            .transport
            .write_chain(id, Bytes::from_static(&[0u8; 100]), true, Some(cb.clone()))
            .unwrap();

        // 100 bytes plus EOF: the milestone is offset 100.
        assert_eq!(cb.borrow().registered.len(), 1);
        assert_eq!(cb.borrow().registered[0].offset, 100);
        assert_eq!(
            harness.transport.conn().flow_control.sum_cur_stream_buffer_len,
            100
        );
        assert_eq!(harness.transport.get_stream_write_buffered_bytes(id), Ok(100));
    }

    /// Writing to a reset stream is rejected.
    #[test]
    fn test_write_chain_rejects_closed_stream() {
        let mut harness = Harness::client();
        let id = harness.transport.create_bidirectional_stream().unwrap();
        harness
            .transport
            .reset_stream(id, ApplicationErrorCode(1))
            .unwrap();
        assert_eq!(
            harness
                .transport
                .write_chain(id, Bytes::from_static(b"x"), false, None),
            Err(LocalErrorCode::StreamClosed)
        );
    }
}
