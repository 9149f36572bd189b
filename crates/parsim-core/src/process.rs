//! Resumable processes: the frame-stack coroutine machinery.
//!
//! A process is a stack of procedure frames. Each frame is a struct holding
//! the procedure's locals and parameters plus an entry-point label; its
//! `resume` method switches on the label and runs until the procedure either
//! suspends (storing the label to continue from), calls a sub-procedure
//! (pushing a child frame), or returns (popping itself, handing its value to
//! the caller through the kernel slot). All state a procedure keeps across a
//! suspension lives in the frame, never on the native call stack.
//!
//! Suspension happens only at the declared wait primitives carried by
//! [`WaitRequest`]; between them a process runs without preemption.

use std::any::Any;

use crate::channel::InChannel;
use crate::error::SimError;
use crate::semaphore::SemaphoreRef;
use crate::time::VirtualTime;
use crate::timeline::SimCtx;

/// Handle to a process, valid for the kernel that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessRef(pub(crate) u32);

impl ProcessRef {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// A value returned by a sub-procedure to its caller.
pub type FrameValue = Box<dyn Any + Send>;

/// What a procedure frame asks of the scheduler when it yields control.
pub enum ProcedureStep {
    /// Park the process until the request is satisfied.
    Suspend(WaitRequest),
    /// Push a sub-procedure frame; it runs immediately. When it returns,
    /// this frame resumes and may collect the value via
    /// [`SimCtx::take_return`].
    Call(Box<dyn ProcedureFrame>),
    /// Pop this frame. An empty stack terminates the process.
    Return(Option<FrameValue>),
}

/// The kernel's four suspension primitives plus semaphore wait.
pub enum WaitRequest {
    /// Suspend until an event arrives on any of the listed channels.
    OnChannels(Vec<InChannel>),
    /// Suspend until an event arrives on the process's default channels
    /// (see `Kernel::waits_on`).
    OnDefault,
    /// Suspend for a relative duration. Zero is a legal yield; negative is
    /// fatal.
    For(VirtualTime),
    /// Suspend until an absolute time. Fails if the time is in the past.
    Until(VirtualTime),
    /// Wait on channels with a timeout; whichever fires first wins and the
    /// other is cancelled. `SimCtx::timed_out` reports which.
    OnChannelsFor(Vec<InChannel>, VirtualTime),
    /// Timeout variant of `OnDefault`.
    OnDefaultFor(VirtualTime),
    /// Semaphore wait: synchronous grant when the counter is positive,
    /// parked in FIFO order otherwise.
    Semaphore(SemaphoreRef),
}

/// One resumable procedure.
///
/// Implementations are hand-written state machines: keep an entry-point
/// field, start `resume` with a `match` on it, set it before every
/// `Suspend`/`Call` so the next resume continues at the right label.
pub trait ProcedureFrame: Send {
    fn resume(&mut self, ctx: &mut SimCtx<'_>) -> Result<ProcedureStep, SimError>;
}

/// Scheduling state of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProcState {
    Runnable,
    WaitChannel,
    WaitTime,
    WaitSem,
    Terminated,
}

/// Timeline-local slot of a process.
pub(crate) struct ProcessSlot {
    pub label: String,
    /// Owning entity, timeline-local index.
    pub owner: usize,
    pub frames: Vec<Box<dyn ProcedureFrame>>,
    pub state: ProcState,
    /// Default channels for `WaitRequest::OnDefault` (timeline-local ids).
    pub default_channels: Vec<usize>,
    /// Channels this process is currently parked on, for cleanup at wake.
    pub parked_on: Vec<usize>,
    /// Bumped at every wake; queue entries carry the epoch they were armed
    /// in, so stale wakes and timeouts are discarded lazily.
    pub wait_epoch: u64,
    /// Channel that woke the process, while it runs.
    pub active_channel: Option<usize>,
    /// Whether the last `wait_on_for` ended by timeout.
    pub timed_out: bool,
    /// Return value left by the last sub-procedure to return.
    pub returned: Option<FrameValue>,
}

impl ProcessSlot {
    pub fn new(label: String, owner: usize, root: Box<dyn ProcedureFrame>) -> Self {
        ProcessSlot {
            label,
            owner,
            frames: vec![root],
            state: ProcState::Runnable,
            default_channels: Vec::new(),
            parked_on: Vec::new(),
            wait_epoch: 0,
            active_channel: None,
            timed_out: false,
            returned: None,
        }
    }
}
