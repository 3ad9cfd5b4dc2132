//! # quic-transport: Connection-Level QUIC Transport Core
//!
//! The per-connection state machine that sits between a UDP socket carrying
//! QUIC datagrams and an application reading/writing streams and datagrams.
//! It owns the connection lifecycle from open to drained, multiplexes
//! application streams over one wire, drives loss recovery and pacing
//! through collaborator traits, and dispatches ordered asynchronous events
//! (readable data, acknowledgements, flow-control credit, stream closure)
//! to registered application callbacks.
//!
//! ## Architecture Overview
//!
//! ```text
//! quic-transport/
//! ├── error         - Local / Transport / Application error families
//! ├── types         - Stream id math, connection ids, priorities
//! ├── settings      - TransportSettings + datagram configuration
//! ├── timers        - Eight one-shot connection timers
//! ├── looper        - Edge-triggered run-once-per-iteration tasks
//! ├── callbacks     - Application callback capability traits
//! ├── byte_event    - Offset-ordered TX/ACK byte-event registry
//! ├── datagram      - Bounded unreliable-datagram buffers
//! ├── ecn           - ECN / L4S validation state machine
//! ├── flow_control  - Write-gating arithmetic
//! ├── recovery      - Loss state, PTO, CC and pacer trait seams
//! ├── stream        - Stream registry and actionable index sets
//! ├── interfaces    - Wire codec, socket, qlog, observer seams
//! ├── state         - The Conn aggregate
//! └── transport     - The orchestrator: QuicTransport
//! ```
//!
//! ## Design Principles
//!
//! 1. **Single-threaded, cooperative**: one connection is bound to one host
//!    loop. There are no locks; safety is structural.
//! 2. **Collaborators behind traits**: wire (de)serialization, congestion
//!    control, pacing, loss detection, socket I/O, and qlog are pluggable.
//! 3. **Driven, not driving**: the host loop polls
//!    [`transport::QuicTransport::next_timeout`] and calls
//!    [`transport::QuicTransport::handle_timeout`] /
//!    [`transport::QuicTransport::run_loop_iteration`]; the transport never
//!    blocks.
//! 4. **Ordered delivery**: byte events per stream fire in non-decreasing
//!    offset order, and every registration receives exactly one terminal
//!    notification.

#![forbid(unsafe_code)]

pub mod byte_event;
pub mod callbacks;
pub mod datagram;
pub mod ecn;
pub mod error;
pub mod flow_control;
pub mod interfaces;
pub mod looper;
pub mod recovery;
pub mod settings;
pub mod state;
pub mod stream;
pub mod timers;
pub mod transport;
pub mod types;

pub use byte_event::{ByteEvent, ByteEventKind};
pub use callbacks::{
    ByteEventCallback, ConnectionCallback, ConnectionSetupCallback, DatagramCallback,
    PeekCallback, PingCallback, ReadCallback, TransportCtx, WriteCallback,
};
pub use error::{
    ApplicationErrorCode, LocalErrorCode, LocalResult, QuicError, QuicErrorCode,
    TransportErrorCode, GENERIC_APP_NO_ERROR,
};
pub use interfaces::{
    LossRecovery, NetworkData, QLogger, ReceivedUdpPacket, TransportObserver, UdpSocket,
    WireCodec, WriteDataReason,
};
pub use settings::{DatagramConfig, TransportSettings};
pub use state::{CloseState, Conn, RetransmissionPolicy};
pub use transport::{ConnectionStats, QuicTransport, StreamTransportInfo, TransportInfo};
pub use types::{ConnectionId, Priority, QuicVersion, Side, StreamGroupId, StreamId};
