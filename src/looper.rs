//! Edge-triggered per-iteration tasks.
//!
//! A looper is either running or stopped. While running, its body executes
//! at most once per host-loop iteration. The write looper additionally
//! carries a pacing deadline: while the next burst time is in the future
//! the body does not fire even though the looper is running.

use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LooperKind {
    Read,
    Peek,
    Write,
}

#[derive(Debug)]
pub struct Looper {
    kind: LooperKind,
    running: bool,
    fired_this_iteration: bool,
    pacing_deadline: Option<Instant>,
}

impl Looper {
    pub fn new(kind: LooperKind) -> Self {
        Self {
            kind,
            running: false,
            fired_this_iteration: false,
            pacing_deadline: None,
        }
    }

    pub fn kind(&self) -> LooperKind {
        self.kind
    }

    /// Schedule the looper. `this_iteration` allows the body to fire in the
    /// current host-loop iteration even if it already ran once.
    pub fn run(&mut self, this_iteration: bool) {
        self.running = true;
        if this_iteration {
            self.fired_this_iteration = false;
        }
    }

    pub fn stop(&mut self) {
        self.running = false;
        self.pacing_deadline = None;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Called once at the top of each host-loop iteration.
    pub fn begin_iteration(&mut self) {
        self.fired_this_iteration = false;
    }

    /// Whether the body should execute now.
    pub fn should_fire(&self, now: Instant) -> bool {
        if !self.running || self.fired_this_iteration {
            return false;
        }
        match self.pacing_deadline {
            Some(deadline) => deadline <= now,
            None => true,
        }
    }

    pub fn mark_fired(&mut self) {
        self.fired_this_iteration = true;
    }

    /// Defer the next fire until `deadline` (write looper pacing).
    pub fn set_pacing_deadline(&mut self, deadline: Option<Instant>) {
        self.pacing_deadline = deadline;
    }

    /// A pacing deadline strictly in the future means the next burst is
    /// already scheduled.
    pub fn is_pacing_scheduled(&self, now: Instant) -> bool {
        matches!(self.pacing_deadline, Some(deadline) if deadline > now)
    }

    pub fn pacing_deadline(&self) -> Option<Instant> {
        self.pacing_deadline
    }
}

#[cfg(test)]
mod looper_tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_fires_once_per_iteration() {
        let now = Instant::now();
        let mut looper = Looper::new(LooperKind::Read);
        looper.run(true);
        assert!(looper.should_fire(now));
        looper.mark_fired();
        assert!(!looper.should_fire(now));
        looper.begin_iteration();
        assert!(looper.should_fire(now));
    }

    #[test]
    fn test_stop_clears_pacing() {
        let now = Instant::now();
        let mut looper = Looper::new(LooperKind::Write);
        looper.run(true);
        looper.set_pacing_deadline(Some(now + Duration::from_millis(5)));
        assert!(looper.is_pacing_scheduled(now));
        assert!(!looper.should_fire(now));
        looper.stop();
        assert!(!looper.is_pacing_scheduled(now));
        assert!(!looper.should_fire(now));
    }

    #[test]
    fn test_pacing_deadline_gates_fire() {
        let now = Instant::now();
        let mut looper = Looper::new(LooperKind::Write);
        looper.run(true);
        looper.set_pacing_deadline(Some(now + Duration::from_millis(2)));
        assert!(!looper.should_fire(now));
        assert!(looper.should_fire(now + Duration::from_millis(2)));
    }
}
