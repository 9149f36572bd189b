//! Counting semaphores coupling processes on one timeline.

use std::collections::VecDeque;

/// Handle to a semaphore, valid for the kernel that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SemaphoreRef(pub(crate) u32);

impl SemaphoreRef {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Timeline-local slot of a semaphore.
///
/// `wait` is a legal suspension point: a positive counter grants
/// synchronously, otherwise the process parks in FIFO order and resumes
/// exactly when a `signal` hands it a unit (the unit passes straight
/// through; the counter is untouched).
pub(crate) struct SemaphoreSlot {
    pub count: i64,
    pub waiters: VecDeque<usize>,
    // Conservation bookkeeping: signals - waits_completed must equal
    // count - initial at all times.
    pub initial: i64,
    pub signals: u64,
    pub waits_completed: u64,
}

impl SemaphoreSlot {
    pub fn new(initial: i64) -> Self {
        SemaphoreSlot {
            count: initial,
            waiters: VecDeque::new(),
            initial,
            signals: 0,
            waits_completed: 0,
        }
    }

    /// Try to take a unit synchronously. Returns whether the wait completed.
    pub fn try_wait(&mut self) -> bool {
        if self.count > 0 {
            self.count -= 1;
            self.waits_completed += 1;
            true
        } else {
            false
        }
    }

    /// Deliver a unit. Returns the process to wake, if one was parked.
    pub fn signal(&mut self) -> Option<usize> {
        self.signals += 1;
        match self.waiters.pop_front() {
            Some(pid) => {
                self.waits_completed += 1;
                Some(pid)
            }
            None => {
                self.count += 1;
                None
            }
        }
    }

    /// Conservation invariant check, used by tests.
    pub fn conserved(&self) -> bool {
        self.signals as i64 - self.waits_completed as i64 == self.count - self.initial
    }
}
