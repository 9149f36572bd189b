//! Entities: user-defined actors bound to one timeline for life.

use std::any::Any;

use crate::event::Event;
use crate::time::VirtualTime;
use crate::timeline::SimCtx;

/// Handle to an entity, valid for the kernel that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityRef(pub(crate) u32);

impl EntityRef {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// A user-defined actor. Owns channels, processes, semaphores, and timers;
/// inhabits exactly one timeline from `start()` to `finalize()`.
///
/// The `Any` supertrait lets procedure frames and callbacks downcast the
/// owning entity back to its concrete type through the context.
pub trait Entity: Any + Send {
    /// Called once when the simulation starts, before any event dispatch.
    fn init(&mut self, ctx: &mut SimCtx<'_>) {
        let _ = ctx;
    }

    /// Called once in `finalize()`, after the run ends — including runs that
    /// ended with an error — for statistics flushing.
    fn wrap_up(&mut self) {}

    /// Called when an externally injected event reaches this entity.
    /// Only invoked for entities declared emulated.
    fn emulate(&mut self, ctx: &mut SimCtx<'_>, event: Box<dyn Event>) {
        let _ = (ctx, event);
    }
}

/// Builder-side record of an entity.
pub(crate) struct EntitySpec {
    pub entity: Option<Box<dyn Entity>>,
    pub emulated: bool,
    pub responsiveness: VirtualTime,
}

/// Timeline-local slot of an entity.
pub(crate) struct EntitySlot {
    /// Taken out while the entity runs user code, put back afterwards.
    pub entity: Option<Box<dyn Entity>>,
    pub emulated: bool,
    pub responsiveness: VirtualTime,
}

/// Union-find over entity indices, used to group aligned entities onto one
/// timeline.
pub(crate) struct AlignmentGroups {
    parent: Vec<usize>,
}

impl AlignmentGroups {
    pub fn new(n: usize) -> Self {
        AlignmentGroups {
            parent: (0..n).collect(),
        }
    }

    pub fn grow(&mut self) -> usize {
        let id = self.parent.len();
        self.parent.push(id);
        id
    }

    pub fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    pub fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            // Smaller root wins so group identity follows creation order.
            let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[hi] = lo;
        }
    }

    /// Group label per element: the smallest member index of its group.
    pub fn labels(&mut self) -> Vec<usize> {
        (0..self.parent.len()).map(|i| self.find(i)).collect()
    }
}
