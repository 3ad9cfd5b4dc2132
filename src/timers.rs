//! One-shot timer slots for the connection.
//!
//! Each timer has at most one pending deadline. Arming replaces any pending
//! deadline; cancelling an unarmed timer is a no-op. The host loop polls
//! [`TimerSet::next_deadline`] and drives expiry through
//! [`TimerSet::pop_expired`].

use std::time::Instant;

/// The timers a connection owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Loss,
    Ack,
    PathValidation,
    Idle,
    Keepalive,
    Drain,
    Ping,
    ExcessWrite,
}

impl TimerKind {
    pub const ALL: [TimerKind; 8] = [
        TimerKind::Loss,
        TimerKind::Ack,
        TimerKind::PathValidation,
        TimerKind::Idle,
        TimerKind::Keepalive,
        TimerKind::Drain,
        TimerKind::Ping,
        TimerKind::ExcessWrite,
    ];

    fn index(self) -> usize {
        match self {
            TimerKind::Loss => 0,
            TimerKind::Ack => 1,
            TimerKind::PathValidation => 2,
            TimerKind::Idle => 3,
            TimerKind::Keepalive => 4,
            TimerKind::Drain => 5,
            TimerKind::Ping => 6,
            TimerKind::ExcessWrite => 7,
        }
    }
}

/// Deadlines for every timer on one connection.
#[derive(Debug, Default)]
pub struct TimerSet {
    deadlines: [Option<Instant>; 8],
}

impl TimerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `kind` to fire at `deadline`, replacing any pending deadline.
    pub fn schedule(&mut self, kind: TimerKind, deadline: Instant) {
        self.deadlines[kind.index()] = Some(deadline);
    }

    /// Idempotent.
    pub fn cancel(&mut self, kind: TimerKind) {
        self.deadlines[kind.index()] = None;
    }

    pub fn is_scheduled(&self, kind: TimerKind) -> bool {
        self.deadlines[kind.index()].is_some()
    }

    pub fn deadline(&self, kind: TimerKind) -> Option<Instant> {
        self.deadlines[kind.index()]
    }

    /// Earliest pending deadline across all timers.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.iter().flatten().min().copied()
    }

    /// Remove and return the earliest timer due at or before `now`.
    ///
    /// Callers loop on this so that an expiry handler which cancels other
    /// timers prevents them from firing.
    pub fn pop_expired(&mut self, now: Instant) -> Option<TimerKind> {
        let mut due: Option<(Instant, TimerKind)> = None;
        for kind in TimerKind::ALL {
            if let Some(deadline) = self.deadlines[kind.index()] {
                if deadline <= now && due.map_or(true, |(d, _)| deadline < d) {
                    due = Some((deadline, kind));
                }
            }
        }
        let (_, kind) = due?;
        self.deadlines[kind.index()] = None;
        Some(kind)
    }

    pub fn cancel_all(&mut self) {
        self.deadlines = [None; 8];
    }
}

#[cfg(test)]
mod timer_set_tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_schedule_replaces_pending_deadline() {
        let now = Instant::now();
        let mut timers = TimerSet::new();
        timers.schedule(TimerKind::Idle, now + Duration::from_secs(30));
        timers.schedule(TimerKind::Idle, now + Duration::from_secs(10));
        assert_eq!(timers.deadline(TimerKind::Idle), Some(now + Duration::from_secs(10)));
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let mut timers = TimerSet::new();
        timers.cancel(TimerKind::Loss);
        timers.schedule(TimerKind::Loss, Instant::now());
        timers.cancel(TimerKind::Loss);
        timers.cancel(TimerKind::Loss);
        assert!(!timers.is_scheduled(TimerKind::Loss));
    }

    #[test]
    fn test_pop_expired_orders_by_deadline() {
        let now = Instant::now();
        let mut timers = TimerSet::new();
        timers.schedule(TimerKind::Ack, now + Duration::from_millis(5));
        timers.schedule(TimerKind::Loss, now + Duration::from_millis(2));
        timers.schedule(TimerKind::Idle, now + Duration::from_secs(60));

        let later = now + Duration::from_millis(10);
        assert_eq!(timers.pop_expired(later), Some(TimerKind::Loss));
        assert_eq!(timers.pop_expired(later), Some(TimerKind::Ack));
        assert_eq!(timers.pop_expired(later), None);
        assert!(timers.is_scheduled(TimerKind::Idle));
    }

    #[test]
    fn test_next_deadline_is_minimum() {
        let now = Instant::now();
        let mut timers = TimerSet::new();
        assert_eq!(timers.next_deadline(), None);
        timers.schedule(TimerKind::Idle, now + Duration::from_secs(60));
        timers.schedule(TimerKind::Keepalive, now + Duration::from_secs(51));
        assert_eq!(timers.next_deadline(), Some(now + Duration::from_secs(51)));
    }
}
