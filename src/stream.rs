//! Stream registry: per-stream state the orchestrator consults, plus the
//! actionable index sets the callback fan-out drains.
//!
//! Stream state-machine internals (send/receive transitions driven by wire
//! frames) belong to the wire codec; this module keeps the bookkeeping the
//! transport core needs to gate its APIs and dispatch its callbacks.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Duration;

use bytes::Bytes;

use crate::error::{ApplicationErrorCode, LocalErrorCode, QuicError};
use crate::flow_control::StreamFlowControlState;
use crate::types::{Priority, Side, StreamGroupId, StreamId, MAX_PRIORITY_LEVEL};

/// Sending-side lifecycle, reduced to what the orchestrator gates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSendState {
    Open,
    ResetSent,
    Closed,
}

/// Receiving-side lifecycle, reduced to what the orchestrator gates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamRecvState {
    Open,
    Closed,
}

/// A contiguous chunk of received stream data.
#[derive(Debug, Clone)]
pub struct StreamChunk {
    pub offset: u64,
    pub data: Bytes,
    pub fin: bool,
}

/// Per-stream state.
#[derive(Debug)]
pub struct StreamState {
    pub id: StreamId,
    pub group_id: Option<StreamGroupId>,
    pub is_control: bool,
    pub priority: Priority,

    pub send_state: StreamSendState,
    pub recv_state: StreamRecvState,

    /// Next offset the application will read.
    pub current_read_offset: u64,
    /// Next offset the wire writer will send.
    pub current_write_offset: u64,
    /// Bytes accepted from the application but not yet handed to the wire.
    pub pending_writes: u64,
    /// Bytes retained for retransmission, starting at
    /// `write_buffer_start_offset`.
    pub write_buffer_len: u64,
    pub write_buffer_start_offset: u64,
    /// Bytes sitting in this stream's loss buffer awaiting retransmission.
    pub loss_buffer_len: u64,

    /// In-order chunks awaiting the application.
    pub read_buffer: VecDeque<StreamChunk>,
    /// Final size of the receive side, once known.
    pub final_read_offset: Option<u64>,
    /// Final size of the send side, once the application wrote EOF.
    pub final_write_offset: Option<u64>,

    /// Largest offset handed to the wire, once any data was sent.
    pub largest_offset_txed: Option<u64>,
    /// Largest offset acknowledged contiguously by the peer.
    pub largest_deliverable_offset: Option<u64>,

    pub stream_read_error: Option<QuicError>,
    pub stream_write_error: Option<QuicError>,

    pub flow: StreamFlowControlState,

    // Head-of-line-blocking diagnostics.
    pub total_holb_time: Duration,
    pub holb_count: u32,
    pub is_holb: bool,
    pub num_packets_tx_with_new_data: u64,
    pub stream_loss_count: u64,
}

impl StreamState {
    fn new(id: StreamId, group_id: Option<StreamGroupId>) -> Self {
        Self {
            id,
            group_id,
            is_control: false,
            priority: Priority::default(),
            send_state: StreamSendState::Open,
            recv_state: StreamRecvState::Open,
            current_read_offset: 0,
            current_write_offset: 0,
            pending_writes: 0,
            write_buffer_len: 0,
            write_buffer_start_offset: 0,
            loss_buffer_len: 0,
            read_buffer: VecDeque::new(),
            final_read_offset: None,
            final_write_offset: None,
            largest_offset_txed: None,
            largest_deliverable_offset: None,
            stream_read_error: None,
            stream_write_error: None,
            flow: StreamFlowControlState::default(),
            total_holb_time: Duration::ZERO,
            holb_count: 0,
            is_holb: false,
            num_packets_tx_with_new_data: 0,
            stream_loss_count: 0,
        }
    }

    /// Whether the application may still write to this stream.
    pub fn writable(&self) -> bool {
        self.send_state == StreamSendState::Open && self.final_write_offset.is_none()
    }

    pub fn has_readable_data(&self) -> bool {
        self.read_buffer
            .front()
            .is_some_and(|chunk| chunk.offset <= self.current_read_offset)
            || self.pending_eof_to_deliver()
    }

    pub fn has_peekable_data(&self) -> bool {
        !self.read_buffer.is_empty()
    }

    fn pending_eof_to_deliver(&self) -> bool {
        self.final_read_offset == Some(self.current_read_offset) && self.read_buffer.is_empty()
    }

    /// Largest write offset the application has produced, including data
    /// still buffered.
    pub fn largest_write_offset_seen(&self) -> u64 {
        self.current_write_offset + self.pending_writes
    }

    /// Read up to `max_len` in-order bytes. Returns the data and whether
    /// EOF was reached.
    pub fn read_data(&mut self, max_len: usize) -> (Bytes, bool) {
        let mut collected = Vec::new();
        while collected.len() < max_len || max_len == 0 {
            let Some(front) = self.read_buffer.front_mut() else {
                break;
            };
            if front.offset > self.current_read_offset {
                break;
            }
            let want = if max_len == 0 {
                front.data.len()
            } else {
                (max_len - collected.len()).min(front.data.len())
            };
            let taken = front.data.split_to(want);
            collected.extend_from_slice(&taken);
            front.offset += want as u64;
            self.current_read_offset += want as u64;
            if front.data.is_empty() {
                self.read_buffer.pop_front();
            }
        }
        let eof = self.final_read_offset == Some(self.current_read_offset);
        (Bytes::from(collected), eof)
    }

    /// Drop `amount` in-order bytes without copying them out.
    pub fn consume_data(&mut self, amount: usize) {
        let mut remaining = amount;
        while remaining > 0 {
            let Some(front) = self.read_buffer.front_mut() else {
                break;
            };
            if front.offset > self.current_read_offset {
                break;
            }
            let take = remaining.min(front.data.len());
            let _ = front.data.split_to(take);
            front.offset += take as u64;
            self.current_read_offset += take as u64;
            remaining -= take;
            if front.data.is_empty() {
                self.read_buffer.pop_front();
            }
        }
    }

    /// Trim retained write-buffer data up to `max_offset`; returns the
    /// number of bytes trimmed.
    pub fn trim_write_buffer_to(&mut self, max_offset: u64) -> u64 {
        let trim = max_offset
            .saturating_sub(self.write_buffer_start_offset)
            .min(self.write_buffer_len);
        self.write_buffer_len -= trim;
        self.write_buffer_start_offset += trim;
        trim
    }
}

/// Counters of locally-openable streams.
#[derive(Debug, Clone, Copy)]
struct LocalStreamLimit {
    limit: u64,
    opened: u64,
    increased: bool,
}

impl LocalStreamLimit {
    fn new(limit: u64) -> Self {
        Self {
            limit,
            opened: 0,
            increased: false,
        }
    }

    fn openable(&self) -> u64 {
        self.limit.saturating_sub(self.opened)
    }
}

/// The registry of streams plus the actionable sets the fan-out drains.
pub struct StreamManager {
    side: Side,
    streams: BTreeMap<StreamId, StreamState>,

    bidi_limit: LocalStreamLimit,
    uni_limit: LocalStreamLimit,
    next_bidi_index: u64,
    next_uni_index: u64,

    groups: BTreeSet<StreamGroupId>,
    next_bidi_group_index: u64,
    next_uni_group_index: u64,
    max_stream_groups: u64,

    // Insertion-ordered: read callbacks fire in this order unless the
    // ordered-read-callbacks setting sorts the snapshot.
    readable: Vec<StreamId>,
    peekable: Vec<StreamId>,
    writable: BTreeSet<StreamId>,
    closed: BTreeSet<StreamId>,
    deliverable: BTreeSet<StreamId>,
    txed: BTreeSet<StreamId>,
    loss_streams: BTreeSet<StreamId>,

    new_peer_streams: Vec<StreamId>,
    new_grouped_peer_streams: Vec<StreamId>,
    new_peer_stream_groups: Vec<StreamGroupId>,
    flow_control_updated: Vec<StreamId>,
    stop_sending: Vec<(StreamId, ApplicationErrorCode)>,
}

impl StreamManager {
    pub fn new(side: Side) -> Self {
        Self {
            side,
            streams: BTreeMap::new(),
            bidi_limit: LocalStreamLimit::new(100),
            uni_limit: LocalStreamLimit::new(100),
            next_bidi_index: 0,
            next_uni_index: 0,
            groups: BTreeSet::new(),
            next_bidi_group_index: 0,
            next_uni_group_index: 0,
            max_stream_groups: 0,
            readable: Vec::new(),
            peekable: Vec::new(),
            writable: BTreeSet::new(),
            closed: BTreeSet::new(),
            deliverable: BTreeSet::new(),
            txed: BTreeSet::new(),
            loss_streams: BTreeSet::new(),
            new_peer_streams: Vec::new(),
            new_grouped_peer_streams: Vec::new(),
            new_peer_stream_groups: Vec::new(),
            flow_control_updated: Vec::new(),
            stop_sending: Vec::new(),
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn refresh_max_stream_groups(&mut self, max_stream_groups: u64) {
        self.max_stream_groups = max_stream_groups;
    }

    // ---- lookup ---------------------------------------------------------

    pub fn stream_exists(&self, id: StreamId) -> bool {
        self.streams.contains_key(&id)
    }

    pub fn get_stream(&self, id: StreamId) -> Option<&StreamState> {
        self.streams.get(&id)
    }

    pub fn get_stream_mut(&mut self, id: StreamId) -> Option<&mut StreamState> {
        self.streams.get_mut(&id)
    }

    pub fn stream_count(&self) -> u64 {
        self.streams.len() as u64
    }

    pub fn num_control_streams(&self) -> u64 {
        self.streams.values().filter(|s| s.is_control).count() as u64
    }

    pub fn stream_ids(&self) -> Vec<StreamId> {
        self.streams.keys().copied().collect()
    }

    pub fn set_stream_as_control(&mut self, id: StreamId) {
        if let Some(stream) = self.streams.get_mut(&id) {
            stream.is_control = true;
        }
    }

    // ---- creation -------------------------------------------------------

    fn local_stream_id(&self, index: u64, unidirectional: bool) -> StreamId {
        let initiator_bit = match self.side {
            Side::Client => 0,
            Side::Server => 1,
        };
        let dir_bit = if unidirectional { 2 } else { 0 };
        StreamId(index * 4 + initiator_bit + dir_bit)
    }

    pub fn create_next_bidirectional_stream(
        &mut self,
        group: Option<StreamGroupId>,
    ) -> Result<StreamId, LocalErrorCode> {
        if let Some(group) = group {
            if !self.groups.contains(&group) {
                return Err(LocalErrorCode::InvalidOperation);
            }
        }
        if self.bidi_limit.openable() == 0 {
            return Err(LocalErrorCode::StreamLimitExceeded);
        }
        let id = self.local_stream_id(self.next_bidi_index, false);
        self.next_bidi_index += 1;
        self.bidi_limit.opened += 1;
        self.streams.insert(id, StreamState::new(id, group));
        Ok(id)
    }

    pub fn create_next_unidirectional_stream(
        &mut self,
        group: Option<StreamGroupId>,
    ) -> Result<StreamId, LocalErrorCode> {
        if let Some(group) = group {
            if !self.groups.contains(&group) {
                return Err(LocalErrorCode::InvalidOperation);
            }
        }
        if self.uni_limit.openable() == 0 {
            return Err(LocalErrorCode::StreamLimitExceeded);
        }
        let id = self.local_stream_id(self.next_uni_index, true);
        self.next_uni_index += 1;
        self.uni_limit.opened += 1;
        self.streams.insert(id, StreamState::new(id, group));
        Ok(id)
    }

    pub fn create_next_bidirectional_stream_group(
        &mut self,
    ) -> Result<StreamGroupId, LocalErrorCode> {
        if self.groups.len() as u64 >= self.max_stream_groups {
            return Err(LocalErrorCode::StreamLimitExceeded);
        }
        let group = StreamGroupId(self.local_stream_id(self.next_bidi_group_index, false).0);
        self.next_bidi_group_index += 1;
        self.groups.insert(group);
        Ok(group)
    }

    pub fn create_next_unidirectional_stream_group(
        &mut self,
    ) -> Result<StreamGroupId, LocalErrorCode> {
        if self.groups.len() as u64 >= self.max_stream_groups {
            return Err(LocalErrorCode::StreamLimitExceeded);
        }
        let group = StreamGroupId(self.local_stream_id(self.next_uni_group_index, true).0);
        self.next_uni_group_index += 1;
        self.groups.insert(group);
        Ok(group)
    }

    /// Ingress: a peer-initiated stream was seen on the wire.
    pub fn add_peer_stream(&mut self, id: StreamId, group: Option<StreamGroupId>) {
        if self.streams.contains_key(&id) {
            return;
        }
        self.streams.insert(id, StreamState::new(id, group));
        match group {
            Some(group) => {
                if self.groups.insert(group) {
                    self.new_peer_stream_groups.push(group);
                }
                self.new_grouped_peer_streams.push(id);
            }
            None => self.new_peer_streams.push(id),
        }
    }

    pub fn openable_local_bidirectional_streams(&self) -> u64 {
        self.bidi_limit.openable()
    }

    pub fn openable_local_unidirectional_streams(&self) -> u64 {
        self.uni_limit.openable()
    }

    /// Ingress: peer raised our stream limit (MAX_STREAMS).
    pub fn set_max_local_bidirectional_streams(&mut self, limit: u64) {
        if limit > self.bidi_limit.limit {
            self.bidi_limit.limit = limit;
            self.bidi_limit.increased = true;
        }
    }

    pub fn set_max_local_unidirectional_streams(&mut self, limit: u64) {
        if limit > self.uni_limit.limit {
            self.uni_limit.limit = limit;
            self.uni_limit.increased = true;
        }
    }

    pub fn consume_max_local_bidirectional_stream_id_increased(&mut self) -> bool {
        std::mem::take(&mut self.bidi_limit.increased)
    }

    pub fn consume_max_local_unidirectional_stream_id_increased(&mut self) -> bool {
        std::mem::take(&mut self.uni_limit.increased)
    }

    // ---- actionable sets ------------------------------------------------

    pub fn readable_streams(&self) -> &[StreamId] {
        &self.readable
    }

    pub fn peekable_streams(&self) -> &[StreamId] {
        &self.peekable
    }

    pub fn closed_streams(&self) -> Vec<StreamId> {
        self.closed.iter().copied().collect()
    }

    pub fn mark_readable(&mut self, id: StreamId) {
        if !self.readable.contains(&id) {
            self.readable.push(id);
        }
    }

    pub fn unmark_readable(&mut self, id: StreamId) {
        self.readable.retain(|s| *s != id);
    }

    pub fn mark_peekable(&mut self, id: StreamId) {
        if !self.peekable.contains(&id) {
            self.peekable.push(id);
        }
    }

    pub fn unmark_peekable(&mut self, id: StreamId) {
        self.peekable.retain(|s| *s != id);
    }

    pub fn mark_writable(&mut self, id: StreamId) {
        self.writable.insert(id);
    }

    pub fn mark_closed(&mut self, id: StreamId) {
        self.closed.insert(id);
    }

    pub fn add_deliverable(&mut self, id: StreamId) {
        self.deliverable.insert(id);
    }

    pub fn remove_deliverable(&mut self, id: StreamId) {
        self.deliverable.remove(&id);
    }

    pub fn pop_deliverable(&mut self) -> Option<StreamId> {
        let id = *self.deliverable.iter().next()?;
        self.deliverable.remove(&id);
        Some(id)
    }

    pub fn add_tx(&mut self, id: StreamId) {
        self.txed.insert(id);
    }

    pub fn remove_tx(&mut self, id: StreamId) {
        self.txed.remove(&id);
    }

    pub fn pop_tx(&mut self) -> Option<StreamId> {
        let id = *self.txed.iter().next()?;
        self.txed.remove(&id);
        Some(id)
    }

    pub fn mark_loss(&mut self, id: StreamId) {
        self.loss_streams.insert(id);
    }

    pub fn unmark_loss(&mut self, id: StreamId) {
        self.loss_streams.remove(&id);
    }

    pub fn has_loss(&self) -> bool {
        !self.loss_streams.is_empty()
    }

    pub fn queue_flow_control_updated(&mut self, id: StreamId) {
        self.flow_control_updated.push(id);
    }

    pub fn consume_flow_control_updated(&mut self) -> Vec<StreamId> {
        std::mem::take(&mut self.flow_control_updated)
    }

    pub fn queue_stop_sending(&mut self, id: StreamId, error: ApplicationErrorCode) {
        self.stop_sending.push((id, error));
    }

    pub fn consume_stop_sending(&mut self) -> Vec<(StreamId, ApplicationErrorCode)> {
        std::mem::take(&mut self.stop_sending)
    }

    pub fn consume_new_peer_streams(&mut self) -> Vec<StreamId> {
        std::mem::take(&mut self.new_peer_streams)
    }

    pub fn consume_new_grouped_peer_streams(&mut self) -> Vec<StreamId> {
        std::mem::take(&mut self.new_grouped_peer_streams)
    }

    pub fn consume_new_peer_stream_groups(&mut self) -> Vec<StreamGroupId> {
        std::mem::take(&mut self.new_peer_stream_groups)
    }

    // ---- lifecycle ------------------------------------------------------

    pub fn remove_closed_stream(&mut self, id: StreamId) {
        self.closed.remove(&id);
        self.streams.remove(&id);
        self.readable.retain(|s| *s != id);
        self.peekable.retain(|s| *s != id);
        self.writable.remove(&id);
        self.deliverable.remove(&id);
        self.txed.remove(&id);
        self.loss_streams.remove(&id);
    }

    pub fn clear_open_streams(&mut self) {
        self.streams.clear();
        self.closed.clear();
    }

    pub fn clear_actionable(&mut self) {
        self.readable.clear();
        self.peekable.clear();
        self.deliverable.clear();
        self.txed.clear();
        self.flow_control_updated.clear();
        self.stop_sending.clear();
        self.new_peer_streams.clear();
        self.new_grouped_peer_streams.clear();
        self.new_peer_stream_groups.clear();
    }

    pub fn clear_writable(&mut self) {
        self.writable.clear();
    }

    /// No stream has data waiting for the wire.
    pub fn is_app_idle(&self) -> bool {
        self.streams
            .values()
            .all(|s| s.pending_writes == 0 && s.loss_buffer_len == 0)
    }

    // ---- priorities -----------------------------------------------------

    pub fn set_stream_priority(&mut self, id: StreamId, priority: Priority) -> bool {
        match self.streams.get_mut(&id) {
            Some(stream) if stream.priority != priority => {
                stream.priority = priority;
                true
            }
            _ => false,
        }
    }

    /// Numerically smallest level across streams, i.e. the most urgent.
    pub fn highest_priority_level(&self) -> u8 {
        self.streams
            .values()
            .map(|s| s.priority.level)
            .min()
            .unwrap_or(MAX_PRIORITY_LEVEL)
    }
}

#[cfg(test)]
mod stream_manager_tests {
    use super::*;

    #[test]
    fn test_local_stream_id_allocation() {
        let mut mgr = StreamManager::new(Side::Client);
        assert_eq!(mgr.create_next_bidirectional_stream(None), Ok(StreamId(0)));
        assert_eq!(mgr.create_next_bidirectional_stream(None), Ok(StreamId(4)));
        assert_eq!(mgr.create_next_unidirectional_stream(None), Ok(StreamId(2)));

        let mut mgr = StreamManager::new(Side::Server);
        assert_eq!(mgr.create_next_bidirectional_stream(None), Ok(StreamId(1)));
        assert_eq!(mgr.create_next_unidirectional_stream(None), Ok(StreamId(3)));
    }

    #[test]
    fn test_stream_limit_enforced() {
        let mut mgr = StreamManager::new(Side::Client);
        mgr.bidi_limit = LocalStreamLimit::new(1);
        assert!(mgr.create_next_bidirectional_stream(None).is_ok());
        assert_eq!(
            mgr.create_next_bidirectional_stream(None),
            Err(LocalErrorCode::StreamLimitExceeded)
        );
    }

    #[test]
    fn test_group_creation_requires_advertisement() {
        let mut mgr = StreamManager::new(Side::Client);
        assert_eq!(
            mgr.create_next_bidirectional_stream_group(),
            Err(LocalErrorCode::StreamLimitExceeded)
        );
        mgr.refresh_max_stream_groups(4);
        let group = mgr.create_next_bidirectional_stream_group().unwrap();
        assert!(mgr.create_next_bidirectional_stream(Some(group)).is_ok());
        // Unknown group is rejected.
        assert_eq!(
            mgr.create_next_bidirectional_stream(Some(StreamGroupId(999))),
            Err(LocalErrorCode::InvalidOperation)
        );
    }

    #[test]
    fn test_peer_stream_queues() {
        let mut mgr = StreamManager::new(Side::Server);
        mgr.add_peer_stream(StreamId(0), None);
        mgr.add_peer_stream(StreamId(4), Some(StreamGroupId(0)));
        assert_eq!(mgr.consume_new_peer_streams(), vec![StreamId(0)]);
        assert_eq!(mgr.consume_new_grouped_peer_streams(), vec![StreamId(4)]);
        assert_eq!(mgr.consume_new_peer_stream_groups(), vec![StreamGroupId(0)]);
        // Consumption drains.
        assert!(mgr.consume_new_peer_streams().is_empty());
    }

    #[test]
    fn test_read_data_in_order() {
        let mut stream = StreamState::new(StreamId(0), None);
        stream.read_buffer.push_back(StreamChunk {
            offset: 0,
            data: Bytes::from_static(b"hello "),
            fin: false,
        });
        stream.read_buffer.push_back(StreamChunk {
            offset: 6,
            data: Bytes::from_static(b"world"),
            fin: true,
        });
        stream.final_read_offset = Some(11);

        let (data, eof) = stream.read_data(8);
        assert_eq!(&data[..], b"hello wo");
        assert!(!eof);
        let (data, eof) = stream.read_data(0);
        assert_eq!(&data[..], b"rld");
        assert!(eof);
    }

    #[test]
    fn test_trim_write_buffer() {
        let mut stream = StreamState::new(StreamId(0), None);
        stream.write_buffer_len = 100;
        stream.write_buffer_start_offset = 50;
        assert_eq!(stream.trim_write_buffer_to(120), 70);
        assert_eq!(stream.write_buffer_start_offset, 120);
        assert_eq!(stream.write_buffer_len, 30);
        // Trimming behind the start is a no-op.
        assert_eq!(stream.trim_write_buffer_to(100), 0);
    }

    #[test]
    fn test_highest_priority_level() {
        let mut mgr = StreamManager::new(Side::Client);
        assert_eq!(mgr.highest_priority_level(), MAX_PRIORITY_LEVEL);
        let id = mgr.create_next_bidirectional_stream(None).unwrap();
        mgr.set_stream_priority(
            id,
            Priority {
                level: 5,
                incremental: false,
            },
        );
        let id2 = mgr.create_next_bidirectional_stream(None).unwrap();
        mgr.set_stream_priority(
            id2,
            Priority {
                level: 2,
                incremental: true,
            },
        );
        assert_eq!(mgr.highest_priority_level(), 2);
    }
}
