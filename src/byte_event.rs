//! Byte events: per-stream milestones at the TX (handed to the wire) and
//! ACK (acknowledged by the peer) boundaries.
//!
//! Registrations for one stream are kept in a deque sorted by offset, so
//! dispatch and cancellation walk the front in non-decreasing offset order.

use std::cell::RefCell;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::time::Duration;

use crate::callbacks::ByteEventCallback;
use crate::error::LocalErrorCode;
use crate::types::StreamId;

/// The milestone a byte event fires on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ByteEventKind {
    /// Byte was handed to the wire encoder.
    Tx,
    /// Byte was acknowledged by the peer.
    Ack,
}

impl ByteEventKind {
    pub const ALL: [ByteEventKind; 2] = [ByteEventKind::Tx, ByteEventKind::Ack];
}

/// Notification payload for byte-event delivery, registration, and
/// cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteEvent {
    pub id: StreamId,
    pub offset: u64,
    pub kind: ByteEventKind,
    /// SRTT observed at delivery; only set for ACK events.
    pub srtt: Option<Duration>,
}

impl ByteEvent {
    pub fn new(id: StreamId, offset: u64, kind: ByteEventKind) -> Self {
        Self {
            id,
            offset,
            kind,
            srtt: None,
        }
    }

    pub fn with_srtt(id: StreamId, offset: u64, srtt: Duration) -> Self {
        Self {
            id,
            offset,
            kind: ByteEventKind::Ack,
            srtt: Some(srtt),
        }
    }
}

/// Shared handle to an application byte-event callback.
pub type ByteEventCallbackHandle = Rc<RefCell<dyn ByteEventCallback>>;

/// One registration: fire `callback` once the stream reaches `offset`.
pub(crate) struct ByteEventDetail {
    pub offset: u64,
    pub callback: ByteEventCallbackHandle,
}

/// Registrations of one kind, per stream, sorted by offset.
#[derive(Default)]
pub(crate) struct ByteEventMap {
    streams: HashMap<StreamId, VecDeque<ByteEventDetail>>,
}

impl ByteEventMap {
    /// Insert keeping the per-stream deque sorted by offset. A registration
    /// with the same offset and the same callback is rejected.
    pub fn register(
        &mut self,
        id: StreamId,
        offset: u64,
        callback: ByteEventCallbackHandle,
    ) -> Result<(), LocalErrorCode> {
        match self.streams.entry(id) {
            Entry::Vacant(entry) => {
                entry
                    .insert(VecDeque::new())
                    .push_back(ByteEventDetail { offset, callback });
                Ok(())
            }
            Entry::Occupied(mut entry) => {
                let queue = entry.get_mut();
                let pos = queue.partition_point(|detail| detail.offset <= offset);
                let duplicate = queue.iter().take(pos).any(|detail| {
                    detail.offset == offset && Rc::ptr_eq(&detail.callback, &callback)
                });
                if duplicate {
                    return Err(LocalErrorCode::InvalidOperation);
                }
                queue.insert(pos, ByteEventDetail { offset, callback });
                Ok(())
            }
        }
    }

    /// Pop the front registration if its offset is at or below `max_offset`.
    pub fn pop_front_if_le(&mut self, id: StreamId, max_offset: u64) -> Option<ByteEventDetail> {
        let queue = self.streams.get_mut(&id)?;
        if queue.front()?.offset > max_offset {
            return None;
        }
        queue.pop_front()
    }

    /// Pop the front registration if its offset is strictly below `limit`,
    /// or unconditionally when `limit` is `None`. Used by cancellation.
    pub fn pop_front_if_lt(&mut self, id: StreamId, limit: Option<u64>) -> Option<ByteEventDetail> {
        let queue = self.streams.get_mut(&id)?;
        let front = queue.front()?;
        match limit {
            Some(limit) if front.offset >= limit => None,
            _ => queue.pop_front(),
        }
    }

    /// Remove one registration by offset and callback identity. Deferred
    /// dispatch re-verifies the registration is still present by whether
    /// this returns it.
    pub fn remove(
        &mut self,
        id: StreamId,
        offset: u64,
        callback: &ByteEventCallbackHandle,
    ) -> Option<ByteEventDetail> {
        let queue = self.streams.get_mut(&id)?;
        let pos = queue
            .iter()
            .position(|detail| detail.offset == offset && Rc::ptr_eq(&detail.callback, callback))?;
        queue.remove(pos)
    }

    pub fn is_stream_empty(&self, id: StreamId) -> bool {
        self.streams.get(&id).map_or(true, VecDeque::is_empty)
    }

    pub fn remove_stream(&mut self, id: StreamId) {
        self.streams.remove(&id);
    }

    pub fn callbacks_for_stream(&self, id: StreamId) -> usize {
        self.streams.get(&id).map_or(0, VecDeque::len)
    }

    pub fn stream_ids(&self) -> Vec<StreamId> {
        self.streams.keys().copied().collect()
    }

    /// Move the whole map out, leaving it empty. Close-time cancellation
    /// iterates the moved map so cancel callbacks cannot re-grow it.
    pub fn take_all(&mut self) -> Vec<(StreamId, VecDeque<ByteEventDetail>)> {
        let mut drained: Vec<_> = std::mem::take(&mut self.streams).into_iter().collect();
        drained.sort_by_key(|(id, _)| *id);
        drained
    }
}

#[cfg(test)]
mod byte_event_map_tests {
    use super::*;
    use crate::callbacks::TransportCtx;

    #[derive(Default)]
    struct NopCallback;

    impl ByteEventCallback for NopCallback {
        fn on_byte_event(&mut self, _ctx: &mut TransportCtx, _event: ByteEvent) {}
        fn on_byte_event_canceled(&mut self, _ctx: &mut TransportCtx, _event: ByteEvent) {}
    }

    fn handle() -> ByteEventCallbackHandle {
        Rc::new(RefCell::new(NopCallback))
    }

    #[test]
    fn test_register_keeps_offsets_sorted() {
        let mut map = ByteEventMap::default();
        let id = StreamId(4);
        map.register(id, 300, handle()).unwrap();
        map.register(id, 100, handle()).unwrap();
        map.register(id, 200, handle()).unwrap();

        assert_eq!(map.pop_front_if_le(id, u64::MAX).unwrap().offset, 100);
        assert_eq!(map.pop_front_if_le(id, u64::MAX).unwrap().offset, 200);
        assert_eq!(map.pop_front_if_le(id, u64::MAX).unwrap().offset, 300);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut map = ByteEventMap::default();
        let id = StreamId(0);
        let cb = handle();
        map.register(id, 100, cb.clone()).unwrap();
        // Same offset, same callback identity.
        assert_eq!(
            map.register(id, 100, cb.clone()),
            Err(LocalErrorCode::InvalidOperation)
        );
        // Same offset, different callback is fine.
        map.register(id, 100, handle()).unwrap();
        // Same callback, different offset is fine.
        map.register(id, 101, cb).unwrap();
    }

    #[test]
    fn test_pop_front_respects_bounds() {
        let mut map = ByteEventMap::default();
        let id = StreamId(8);
        map.register(id, 50, handle()).unwrap();
        map.register(id, 150, handle()).unwrap();

        assert!(map.pop_front_if_le(id, 49).is_none());
        assert_eq!(map.pop_front_if_le(id, 50).unwrap().offset, 50);
        // Cancellation bound is exclusive.
        assert!(map.pop_front_if_lt(id, Some(150)).is_none());
        assert_eq!(map.pop_front_if_lt(id, None).unwrap().offset, 150);
        assert!(map.is_stream_empty(id));
    }
}
