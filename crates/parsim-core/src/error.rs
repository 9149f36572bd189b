//! Error taxonomy.
//!
//! Setup errors are detected while wiring the simulation or resolving it at
//! `start()` and fail the whole run. Runtime errors terminate the event loop
//! on the offending worker; every other worker drains out at the next
//! barrier, and `finalize()` still runs entity wrap-up callbacks.

use thiserror::Error;

use crate::time::VirtualTime;

/// Errors detected during construction or at `start()`-time resolution.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("duplicate input channel name {name:?}")]
    DuplicateChannelName { name: String },

    #[error("output channel mapping {pattern:?} matches no input channel")]
    UnknownChannel { pattern: String },

    #[error(
        "zero-delay mapping {pattern:?} crosses timelines (total delay must be positive between timelines)"
    )]
    ZeroDelayCrossTimeline { pattern: String },

    #[error("entity {entity} is not emulated; declare it with emulated_entity() first")]
    NotEmulated { entity: usize },

    #[error("simulation already started; the population is fixed after start()")]
    AlreadyStarted,

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("unknown {kind} handle {index}")]
    UnknownHandle { kind: &'static str, index: usize },

    #[error("event type id {type_id} registered twice")]
    DuplicateEventType { type_id: u32 },
}

/// Errors surfacing while the simulation runs.
#[derive(Debug, Error)]
pub enum SimError {
    #[error(transparent)]
    Setup(#[from] SetupError),

    #[error("negative delay {delay} in {context}")]
    NegativeDelay { delay: VirtualTime, context: String },

    #[error("wait_until({target}) at virtual time {now} targets the past in {context}")]
    WaitInPast {
        target: VirtualTime,
        now: VirtualTime,
        context: String,
    },

    #[error("{primitive} called outside a procedure context in {context}")]
    NotInProcedure { primitive: &'static str, context: String },

    #[error("wait with no channels in {context}")]
    EmptyWait { context: String },

    #[error("handle used on a foreign timeline in {context}")]
    ForeignTimeline { context: String },

    #[error("simulation is not running")]
    NotRunning,

    #[error("causality violated: {detail}")]
    Causality { detail: String },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("worker thread panicked: {detail}")]
    WorkerPanic { detail: String },
}

/// Errors in the cross-machine transport layer.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer machine {peer} disconnected")]
    Closed { peer: usize },

    #[error("malformed wire frame: {detail}")]
    Codec { detail: String },

    #[error("frame addressed to unknown channel {name:?}")]
    UnknownChannel { name: String },

    #[error("frame carries unregistered event type {type_id}")]
    UnknownEventType { type_id: u32 },
}
