//! # parsim-core
//!
//! **Conservative parallel discrete-event simulation, as a library.**
//!
//! `parsim-core` drives virtual time forward by dispatching timestamped
//! events between user-defined entities connected through delay-annotated
//! channels, preserving global causality across worker threads and, through
//! a pluggable substrate, across machines.
//!
//! ## Quick Start
//!
//! ```no_run
//! use parsim_core::{Config, Kernel, VirtualTime};
//!
//! let mut sim = Kernel::new(Config::default()).unwrap();
//! // ... register events, add entities, wire channels, attach processes ...
//! let summary = sim.start(VirtualTime::SECOND * 10).unwrap();
//! println!("{} events in {} epochs", summary.events, summary.epochs);
//! sim.finalize();
//! ```
//!
//! ## Architecture
//!
//! Entities → Timelines (shared-nothing schedulers) → Worker pool → Barrier
//!
//! Entities are partitioned into *timelines* at `start()`; each timeline is
//! a single-threaded cooperative scheduler over one `(time, tiebreak)`
//! priority queue. A fixed pool of workers runs the timelines in epochs: a
//! synchronization barrier computes each timeline's *horizon* — the lower
//! bound on anything a peer could still send it, derived from per-channel
//! minimum delays (*lookahead*) — and every timeline then executes freely up
//! to its horizon. No rollback, no locks on the dispatch path.
//!
//! Processes are resumable frame stacks: user procedures are hand-written
//! state machines that suspend only at the declared wait primitives
//! (`wait_on`, `wait_for`, `wait_until`, `wait_on_for`, semaphore wait).
//! An optional emulation bridge paces designated timelines against wall
//! clock and lets external threads inject events with bounded latency.

pub mod channel;
pub mod config;
pub mod emulation;
pub mod entity;
pub mod error;
pub mod event;
pub mod kernel;
pub mod process;
pub mod queue;
pub mod random;
pub mod semaphore;
pub mod time;
pub mod timer;
mod timeline;
pub mod transport;
mod sync;

pub use channel::{InChannel, OutChannel};
pub use config::Config;
pub use emulation::{EmulationHandle, wallclock_nanos};
pub use entity::{Entity, EntityRef};
pub use error::{SetupError, SimError, TransportError};
pub use event::{BareEvent, Event, EventRegistry, EventTypeId};
pub use kernel::{Kernel, RunSummary, TimelineSummary};
pub use process::{FrameValue, ProcedureFrame, ProcedureStep, ProcessRef, WaitRequest};
pub use random::LehmerStream;
pub use semaphore::SemaphoreRef;
pub use time::VirtualTime;
pub use timeline::{SimCtx, TimelineStats};
pub use timer::TimerRef;
pub use transport::{MeshSubstrate, Substrate, mesh};

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
