//! # parsim-models
//!
//! Demonstration models for the parsim kernel, shared by the CLI and the
//! scenario test battery:
//!
//! - [`ring`] — a token circling entities with unit channel delay; the
//!   smallest possible model.
//! - [`phold`] — the classic PHOLD benchmark: queues in a randomized ring
//!   topology, exponential service, Poisson initial population.
//! - [`muxtree`] — a fan-in tree of multiplexers with bounded buffers and
//!   loss accounting.
//! - [`echo`] — a ring with one emulated entity answering wall-clock-driven
//!   injections within a responsiveness bound.
//!
//! Every model exposes a params struct, a `build` function that populates a
//! [`parsim_core::Kernel`] with this machine's share of the entities (SPMD
//! style: call it on every machine of a distributed run), and accessors for
//! post-run statistics.

pub mod echo;
pub mod muxtree;
pub mod phold;
pub mod ring;
