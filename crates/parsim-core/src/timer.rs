//! Self-scheduled callback timers.
//!
//! A timer dispatches to a callback instead of waking a process. Timers are
//! always local to their timeline, re-schedulable, and cancelable; the queue
//! discards voided entries lazily on pop by comparing generations.

use crate::timeline::SimCtx;

/// Handle to a timer, valid for the kernel that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerRef(pub(crate) u32);

impl TimerRef {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// The callback fired when a timer pops. The context's owner is the timer's
/// owning entity.
pub type TimerCallback = Box<dyn FnMut(&mut SimCtx<'_>) + Send>;

/// Timeline-local slot of a timer.
pub(crate) struct TimerSlot {
    /// Owning entity, timeline-local index.
    pub owner: usize,
    /// Taken out while the callback runs, put back afterwards.
    pub callback: Option<TimerCallback>,
    /// Bumped on every schedule; a popped entry with a stale generation is
    /// a cancelled or superseded schedule and is dropped.
    pub generation: u64,
    pub armed: bool,
}

impl TimerSlot {
    pub fn new(owner: usize, callback: TimerCallback) -> Self {
        TimerSlot {
            owner,
            callback: Some(callback),
            generation: 0,
            armed: false,
        }
    }

    /// Arm for a new pop; returns the generation to tag the queue entry with.
    pub fn arm(&mut self) -> u64 {
        self.generation += 1;
        self.armed = true;
        self.generation
    }

    /// Cancel. Idempotent; a no-op after firing.
    pub fn cancel(&mut self) {
        self.armed = false;
    }

    /// Whether a popped entry with this generation should fire.
    pub fn live(&self, generation: u64) -> bool {
        self.armed && self.generation == generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot() -> TimerSlot {
        TimerSlot::new(0, Box::new(|_| {}))
    }

    #[test]
    fn test_arm_then_fire() {
        let mut t = slot();
        let generation = t.arm();
        assert!(t.live(generation));
    }

    #[test]
    fn test_cancel_voids_pending_entry() {
        let mut t = slot();
        let generation = t.arm();
        t.cancel();
        assert!(!t.live(generation));
        // Idempotent, including after the entry would have fired.
        t.cancel();
        assert!(!t.live(generation));
    }

    #[test]
    fn test_reschedule_voids_older_entry() {
        let mut t = slot();
        let first = t.arm();
        let second = t.arm();
        assert!(!t.live(first));
        assert!(t.live(second));
    }
}
