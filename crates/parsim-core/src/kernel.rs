//! The lifecycle driver: build, partition, run, finalize.
//!
//! A [`Kernel`] starts as a builder. User programs register event types,
//! instantiate entities, wire channels, attach processes, then call
//! [`Kernel::start`]. Resolution happens there: alignment groups become
//! timelines, channel name patterns become concrete destinations, the
//! lookahead matrix is gossiped across machines, and a fixed pool of worker
//! threads runs the epoch loop until every timeline is out of work at or
//! before the end time. After `start` returns, entities are reachable again
//! for statistics; [`Kernel::finalize`] runs their wrap-up hooks — also
//! after a failed run.

use std::any::Any;
use std::collections::HashMap;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, info};
use serde::Serialize;

use crate::channel::{
    Dest, InChannel, InChannelSlot, InChannelSpec, MapRequest, OutChannel, OutChannelSlot,
    OutChannelSpec, pattern_matches,
};
use crate::config::Config;
use crate::emulation::{EmulationHandle, Injected, InjectionInbox, RealtimeClock};
use crate::entity::{AlignmentGroups, Entity, EntityRef, EntitySlot, EntitySpec};
use crate::error::{SetupError, SimError};
use crate::event::{Event, EventRegistry, EventTypeId, UnpackFn};
use crate::process::{ProcedureFrame, ProcessRef, ProcessSlot};
use crate::random::LehmerStream;
use crate::semaphore::{SemaphoreRef, SemaphoreSlot};
use crate::sync::{LookaheadMatrix, SyncState, Verdict, sections_from_outbox};
use crate::time::VirtualTime;
use crate::timeline::{
    EpochOutcome, Mailboxes, RouteTable, SimCtx, Timeline, TimelineStats,
};
use crate::timer::{TimerCallback, TimerRef, TimerSlot};
use crate::transport::{
    EdgeGossip, HelloGossip, Substrate, TransportHandle, WireSection, decode_gossip,
    encode_gossip,
};

/// Cap on the paced-sleep slice so injected events are picked up within the
/// responsiveness window.
const INJECTION_POLL: Duration = Duration::from_micros(100);

struct ProcessSpec {
    label: String,
    owner: usize,
    frame: Option<Box<dyn ProcedureFrame>>,
    waits_on: Vec<InChannel>,
}

struct TimerSpec {
    owner: usize,
    callback: Option<TimerCallback>,
}

struct EmulationTap {
    entity: usize,
    handle: EmulationHandle,
    rx: Option<Receiver<Injected>>,
}

/// Post-run report of one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// The requested end time.
    pub end_time: VirtualTime,
    /// Wall-clock duration of the run.
    pub wall_seconds: f64,
    /// Synchronization epochs executed.
    pub epochs: u64,
    /// Total dispatches (events, wakes, timers, injections) across timelines.
    pub events: u64,
    /// Per-timeline detail.
    pub timelines: Vec<TimelineSummary>,
}

/// Per-timeline slice of the run summary.
#[derive(Debug, Clone, Serialize)]
pub struct TimelineSummary {
    pub timeline: usize,
    pub final_lvt: VirtualTime,
    pub stats: TimelineStats,
}

/// The simulation kernel: builder, runner, and post-run accessor.
pub struct Kernel {
    config: Config,
    registry: EventRegistry,
    started: bool,
    substrate: Option<Box<dyn Substrate>>,

    entities: Vec<EntitySpec>,
    processes: Vec<ProcessSpec>,
    in_specs: Vec<InChannelSpec>,
    out_specs: Vec<OutChannelSpec>,
    sem_specs: Vec<(usize, i64)>,
    timer_specs: Vec<TimerSpec>,
    align: AlignmentGroups,
    initial_writes: Vec<(OutChannel, Box<dyn Event>, VirtualTime)>,
    taps: Vec<EmulationTap>,

    route: Option<Arc<RouteTable>>,
    timelines: Vec<Timeline>,
}

impl Kernel {
    /// A single-machine kernel.
    pub fn new(config: Config) -> Result<Self, SetupError> {
        config.validate()?;
        if config.machines > 1 {
            return Err(SetupError::InvalidConfig {
                reason: "multi-machine runs need a substrate; use with_substrate()".into(),
            });
        }
        Ok(Self::build(config, None))
    }

    /// A kernel participating in a multi-machine run over the given
    /// substrate.
    pub fn with_substrate(
        config: Config,
        substrate: Box<dyn Substrate>,
    ) -> Result<Self, SetupError> {
        config.validate()?;
        if substrate.num_machines() != config.machines
            || substrate.machine_index() != config.machine_index
        {
            return Err(SetupError::InvalidConfig {
                reason: format!(
                    "substrate is rank {}/{}, config says {}/{}",
                    substrate.machine_index(),
                    substrate.num_machines(),
                    config.machine_index,
                    config.machines
                ),
            });
        }
        Ok(Self::build(config, Some(substrate)))
    }

    fn build(config: Config, substrate: Option<Box<dyn Substrate>>) -> Self {
        Kernel {
            config,
            registry: EventRegistry::new(),
            started: false,
            substrate,
            entities: Vec::new(),
            processes: Vec::new(),
            in_specs: Vec::new(),
            out_specs: Vec::new(),
            sem_specs: Vec::new(),
            timer_specs: Vec::new(),
            align: AlignmentGroups::new(0),
            initial_writes: Vec::new(),
            taps: Vec::new(),
            route: None,
            timelines: Vec::new(),
        }
    }

    pub fn machine_index(&self) -> usize {
        self.config.machine_index
    }

    pub fn num_machines(&self) -> usize {
        self.config.machines
    }

    // -- population -------------------------------------------------------

    /// Register an event type's unpack factory under its tag.
    pub fn register_event(
        &mut self,
        type_id: EventTypeId,
        unpack: UnpackFn,
    ) -> Result<(), SetupError> {
        self.guard_building()?;
        self.registry.register(type_id, unpack)
    }

    /// Add an entity.
    pub fn entity(&mut self, entity: impl Entity) -> Result<EntityRef, SetupError> {
        self.guard_building()?;
        let id = self.entities.len() as u32;
        self.entities.push(EntitySpec {
            entity: Some(Box::new(entity)),
            emulated: false,
            responsiveness: VirtualTime::INFINITY,
        });
        self.align.grow();
        Ok(EntityRef(id))
    }

    /// Add an emulated entity: wall-clock-driven threads may inject events
    /// toward it, answered within the given responsiveness.
    pub fn emulated_entity(
        &mut self,
        entity: impl Entity,
        responsiveness: VirtualTime,
    ) -> Result<EntityRef, SetupError> {
        let id = self.entity(entity)?;
        let spec = &mut self.entities[id.index()];
        spec.emulated = true;
        spec.responsiveness = responsiveness;
        Ok(id)
    }

    /// Create a named input channel on an entity. Names are global; a
    /// duplicate anywhere in the run fails `start()`.
    pub fn input_channel(
        &mut self,
        owner: EntityRef,
        name: &str,
    ) -> Result<InChannel, SetupError> {
        self.guard_building()?;
        self.guard_entity(owner)?;
        if self
            .in_specs
            .iter()
            .any(|spec| spec.name.as_deref() == Some(name))
        {
            return Err(SetupError::DuplicateChannelName {
                name: name.to_string(),
            });
        }
        let id = self.in_specs.len() as u32;
        self.in_specs.push(InChannelSpec {
            owner: owner.index(),
            name: Some(name.to_string()),
        });
        Ok(InChannel(id))
    }

    /// Create an anonymous input channel, reachable only through
    /// [`map_to_channel`](Self::map_to_channel) — entity-internal wiring.
    pub fn internal_channel(&mut self, owner: EntityRef) -> Result<InChannel, SetupError> {
        self.guard_building()?;
        self.guard_entity(owner)?;
        let id = self.in_specs.len() as u32;
        self.in_specs.push(InChannelSpec {
            owner: owner.index(),
            name: None,
        });
        Ok(InChannel(id))
    }

    /// Create an output channel with a non-negative default delay.
    pub fn output_channel(
        &mut self,
        owner: EntityRef,
        delay: VirtualTime,
    ) -> Result<OutChannel, SetupError> {
        self.guard_building()?;
        self.guard_entity(owner)?;
        if delay < VirtualTime::ZERO {
            return Err(SetupError::InvalidConfig {
                reason: format!("output channel delay {delay} is negative"),
            });
        }
        let id = self.out_specs.len() as u32;
        self.out_specs.push(OutChannelSpec {
            owner: owner.index(),
            delay,
            mappings: Vec::new(),
        });
        Ok(OutChannel(id))
    }

    /// Map an output channel onto every input channel matching the pattern
    /// (exact name, or one `*` wildcard), with extra delay on top of the
    /// channel's default. Resolved at `start()`.
    pub fn map_to(
        &mut self,
        oc: OutChannel,
        pattern: &str,
        extra: VirtualTime,
    ) -> Result<(), SetupError> {
        self.guard_building()?;
        let spec = self
            .out_specs
            .get_mut(oc.index())
            .ok_or(SetupError::UnknownHandle {
                kind: "output channel",
                index: oc.index(),
            })?;
        if extra < VirtualTime::ZERO {
            return Err(SetupError::InvalidConfig {
                reason: format!("mapping extra delay {extra} is negative"),
            });
        }
        spec.mappings.push(MapRequest::Pattern {
            pattern: pattern.to_string(),
            extra,
        });
        Ok(())
    }

    /// Map an output channel directly onto a local input channel object,
    /// bypassing the name table. The usual way to wire an entity to itself.
    pub fn map_to_channel(&mut self, oc: OutChannel, ic: InChannel) -> Result<(), SetupError> {
        self.guard_building()?;
        if ic.index() >= self.in_specs.len() {
            return Err(SetupError::UnknownHandle {
                kind: "input channel",
                index: ic.index(),
            });
        }
        let spec = self
            .out_specs
            .get_mut(oc.index())
            .ok_or(SetupError::UnknownHandle {
                kind: "output channel",
                index: oc.index(),
            })?;
        spec.mappings.push(MapRequest::Direct {
            target: ic,
            extra: VirtualTime::ZERO,
        });
        Ok(())
    }

    /// Attach a process to an entity: its root frame starts running at time
    /// zero.
    pub fn process(
        &mut self,
        owner: EntityRef,
        label: &str,
        frame: Box<dyn ProcedureFrame>,
    ) -> Result<ProcessRef, SetupError> {
        self.guard_building()?;
        self.guard_entity(owner)?;
        let id = self.processes.len() as u32;
        self.processes.push(ProcessSpec {
            label: label.to_string(),
            owner: owner.index(),
            frame: Some(frame),
            waits_on: Vec::new(),
        });
        Ok(ProcessRef(id))
    }

    /// Declare the default channels an argument-less `wait_on` parks on.
    pub fn waits_on(
        &mut self,
        process: ProcessRef,
        channels: &[InChannel],
    ) -> Result<(), SetupError> {
        self.guard_building()?;
        for ch in channels {
            if ch.index() >= self.in_specs.len() {
                return Err(SetupError::UnknownHandle {
                    kind: "input channel",
                    index: ch.index(),
                });
            }
        }
        let spec = self
            .processes
            .get_mut(process.index())
            .ok_or(SetupError::UnknownHandle {
                kind: "process",
                index: process.index(),
            })?;
        spec.waits_on.extend_from_slice(channels);
        Ok(())
    }

    /// Create a counting semaphore owned by an entity.
    pub fn semaphore(&mut self, owner: EntityRef, initial: i64) -> Result<SemaphoreRef, SetupError> {
        self.guard_building()?;
        self.guard_entity(owner)?;
        let id = self.sem_specs.len() as u32;
        self.sem_specs.push((owner.index(), initial));
        Ok(SemaphoreRef(id))
    }

    /// Create a timer owned by an entity, dispatching to the callback.
    pub fn timer(
        &mut self,
        owner: EntityRef,
        callback: impl FnMut(&mut SimCtx<'_>) + Send + 'static,
    ) -> Result<TimerRef, SetupError> {
        self.guard_building()?;
        self.guard_entity(owner)?;
        let id = self.timer_specs.len() as u32;
        self.timer_specs.push(TimerSpec {
            owner: owner.index(),
            callback: Some(Box::new(callback)),
        });
        Ok(TimerRef(id))
    }

    /// Force two entities onto the same timeline.
    pub fn align_to(&mut self, entity: EntityRef, with: EntityRef) -> Result<(), SetupError> {
        self.guard_building()?;
        self.guard_entity(entity)?;
        self.guard_entity(with)?;
        self.align.union(entity.index(), with.index());
        Ok(())
    }

    /// Queue an event for delivery at simulation start (virtual time zero
    /// plus the channel delay).
    pub fn write(&mut self, oc: OutChannel, event: Box<dyn Event>) -> Result<(), SetupError> {
        self.write_delayed(oc, event, VirtualTime::ZERO)
    }

    /// Like [`write`](Self::write) with extra delay.
    pub fn write_delayed(
        &mut self,
        oc: OutChannel,
        event: Box<dyn Event>,
        extra: VirtualTime,
    ) -> Result<(), SetupError> {
        self.guard_building()?;
        if oc.index() >= self.out_specs.len() {
            return Err(SetupError::UnknownHandle {
                kind: "output channel",
                index: oc.index(),
            });
        }
        if extra < VirtualTime::ZERO {
            return Err(SetupError::InvalidConfig {
                reason: format!("initial write extra delay {extra} is negative"),
            });
        }
        self.initial_writes.push((oc, event, extra));
        Ok(())
    }

    /// An injection handle for an emulated entity, usable by external
    /// threads once `start()` has run.
    pub fn emulation_handle(&mut self, entity: EntityRef) -> Result<EmulationHandle, SetupError> {
        self.guard_building()?;
        self.guard_entity(entity)?;
        if !self.entities[entity.index()].emulated {
            return Err(SetupError::NotEmulated {
                entity: entity.index(),
            });
        }
        let (handle, rx) = EmulationHandle::new();
        self.taps.push(EmulationTap {
            entity: entity.index(),
            handle: handle.clone(),
            rx: Some(rx),
        });
        Ok(handle)
    }

    fn guard_building(&self) -> Result<(), SetupError> {
        if self.started {
            Err(SetupError::AlreadyStarted)
        } else {
            Ok(())
        }
    }

    fn guard_entity(&self, entity: EntityRef) -> Result<(), SetupError> {
        if entity.index() < self.entities.len() {
            Ok(())
        } else {
            Err(SetupError::UnknownHandle {
                kind: "entity",
                index: entity.index(),
            })
        }
    }

    // -- post-run access --------------------------------------------------

    /// Borrow an entity by handle, downcast to its concrete type.
    pub fn entity_as<T: Entity>(&self, entity: EntityRef) -> Option<&T> {
        if let Some(route) = &self.route {
            let &(tl_idx, slot) = route.ent_loc.get(entity.index())?;
            let tl = self.timelines.iter().find(|t| t.local_idx == tl_idx)?;
            let boxed = tl.entities[slot].entity.as_ref()?;
            let any: &dyn Any = boxed.as_ref();
            any.downcast_ref::<T>()
        } else {
            let boxed = self.entities.get(entity.index())?.entity.as_ref()?;
            let any: &dyn Any = boxed.as_ref();
            any.downcast_ref::<T>()
        }
    }

    /// Borrow an entity mutably by handle, downcast to its concrete type.
    /// The usual way to hand an entity the channel handles created after it.
    pub fn entity_as_mut<T: Entity>(&mut self, entity: EntityRef) -> Option<&mut T> {
        if let Some(route) = &self.route {
            let &(tl_idx, slot) = route.ent_loc.get(entity.index())?;
            let tl = self.timelines.iter_mut().find(|t| t.local_idx == tl_idx)?;
            let boxed = tl.entities[slot].entity.as_mut()?;
            let any: &mut dyn Any = boxed.as_mut();
            any.downcast_mut::<T>()
        } else {
            let boxed = self.entities.get_mut(entity.index())?.entity.as_mut()?;
            let any: &mut dyn Any = boxed.as_mut();
            any.downcast_mut::<T>()
        }
    }

    /// Current counter of a semaphore, for diagnostics and tests.
    pub fn semaphore_value(&self, sem: SemaphoreRef) -> Option<i64> {
        if let Some(route) = &self.route {
            let &(tl_idx, slot) = route.sem_loc.get(sem.index())?;
            let tl = self.timelines.iter().find(|t| t.local_idx == tl_idx)?;
            Some(tl.semaphores[slot].count)
        } else {
            self.sem_specs.get(sem.index()).map(|&(_, initial)| initial)
        }
    }

    /// Run entity wrap-up hooks and tear the kernel down. Runs even after a
    /// failed `start`, so statistics flush regardless.
    pub fn finalize(mut self) {
        if self.timelines.is_empty() {
            for spec in &mut self.entities {
                if let Some(entity) = spec.entity.as_mut() {
                    entity.wrap_up();
                }
            }
        } else {
            for tl in &mut self.timelines {
                for slot in &mut tl.entities {
                    if let Some(entity) = slot.entity.as_mut() {
                        entity.wrap_up();
                    }
                }
            }
        }
    }

    // -- start ------------------------------------------------------------

    /// Run the simulation to `end_time`. Blocks until every timeline has no
    /// work at or before it (or wall clock catches up, for emulated runs).
    pub fn start(&mut self, end_time: VirtualTime) -> Result<RunSummary, SimError> {
        self.guard_building()?;
        if end_time < VirtualTime::ZERO {
            return Err(SetupError::InvalidConfig {
                reason: format!("end time {end_time} is negative"),
            }
            .into());
        }
        self.started = true;
        let begun = Instant::now();

        // Partition alignment groups onto timelines, in creation order.
        let labels = self.align.labels();
        let mut group_to_tl: HashMap<usize, usize> = HashMap::new();
        let mut entity_tl: Vec<usize> = Vec::with_capacity(labels.len());
        for &label in &labels {
            let next = group_to_tl.len();
            let tl = *group_to_tl.entry(label).or_insert(next);
            entity_tl.push(tl);
        }
        let n_local = group_to_tl.len();

        let transport = match (self.config.machines, self.substrate.take()) {
            (1, _) => None,
            (_, Some(substrate)) => Some(TransportHandle::spawn(substrate)),
            (_, None) => {
                return Err(SetupError::InvalidConfig {
                    reason: "multi-machine run without a substrate".into(),
                }
                .into());
            }
        };

        // Route table: every handle to its (timeline, slot).
        let mut route = RouteTable {
            machine: self.config.machine_index,
            machines: self.config.machines,
            ent_loc: Vec::new(),
            proc_loc: Vec::new(),
            in_loc: Vec::new(),
            out_loc: Vec::new(),
            sem_loc: Vec::new(),
            timer_loc: Vec::new(),
        };
        let mut counts = vec![0usize; n_local];
        for &tl in &entity_tl {
            route.ent_loc.push((tl, counts[tl]));
            counts[tl] += 1;
        }
        let locate = |route: &mut Vec<(usize, usize)>, counts: &mut [usize], tl: usize| {
            route.push((tl, counts[tl]));
            counts[tl] += 1;
        };
        let mut counts_in = vec![0usize; n_local];
        for spec in &self.in_specs {
            locate(&mut route.in_loc, &mut counts_in, entity_tl[spec.owner]);
        }
        let mut counts_out = vec![0usize; n_local];
        for spec in &self.out_specs {
            locate(&mut route.out_loc, &mut counts_out, entity_tl[spec.owner]);
        }
        let mut counts_proc = vec![0usize; n_local];
        for spec in &self.processes {
            locate(&mut route.proc_loc, &mut counts_proc, entity_tl[spec.owner]);
        }
        let mut counts_sem = vec![0usize; n_local];
        for &(owner, _) in &self.sem_specs {
            locate(&mut route.sem_loc, &mut counts_sem, entity_tl[owner]);
        }
        let mut counts_timer = vec![0usize; n_local];
        for spec in &self.timer_specs {
            locate(&mut route.timer_loc, &mut counts_timer, entity_tl[spec.owner]);
        }

        // Gossip round one: timeline counts and channel names.
        let my_hello = HelloGossip {
            timelines: n_local,
            channels: self
                .in_specs
                .iter()
                .enumerate()
                .filter_map(|(i, spec)| {
                    spec.name.as_ref().map(|name| {
                        let (tl, slot) = route.in_loc[i];
                        crate::transport::ChannelAd {
                            name: name.clone(),
                            timeline: tl,
                            ic_slot: slot,
                        }
                    })
                })
                .collect(),
        };
        let hellos = self.gossip_round(&transport, &my_hello)?;

        // Global timeline ids: machines in rank order.
        let mut offsets = vec![0usize; self.config.machines];
        let mut n_global = 0usize;
        for (machine, hello) in hellos.iter().enumerate() {
            offsets[machine] = n_global;
            n_global += hello.timelines;
        }
        let my_offset = offsets[self.config.machine_index];

        // Global name table, with duplicate detection across machines.
        // name -> (machine, machine-local timeline, ic slot)
        let mut names: HashMap<String, (usize, usize, usize)> = HashMap::new();
        for (machine, hello) in hellos.iter().enumerate() {
            for ad in &hello.channels {
                if names
                    .insert(ad.name.clone(), (machine, ad.timeline, ad.ic_slot))
                    .is_some()
                {
                    return Err(SetupError::DuplicateChannelName {
                        name: ad.name.clone(),
                    }
                    .into());
                }
            }
        }

        // Resolve output channel mappings into concrete destinations and
        // collect this machine's lookahead edge contributions.
        let mut dests_per_out: Vec<Vec<Dest>> = Vec::with_capacity(self.out_specs.len());
        let mut my_edges: Vec<(usize, usize, i64)> = Vec::new();
        for (oc_idx, spec) in self.out_specs.iter().enumerate() {
            let src_tl = route.out_loc[oc_idx].0;
            let src_gid = my_offset + src_tl;
            let mut dests = Vec::new();
            for mapping in &spec.mappings {
                match mapping {
                    MapRequest::Pattern { pattern, extra } => {
                        let mut matches: Vec<(&String, &(usize, usize, usize))> = names
                            .iter()
                            .filter(|(name, _)| pattern_matches(pattern, name))
                            .collect();
                        if matches.is_empty() {
                            return Err(SetupError::UnknownChannel {
                                pattern: pattern.clone(),
                            }
                            .into());
                        }
                        matches.sort_by(|a, b| a.0.cmp(b.0));
                        for (name, &(machine, tl, ic_slot)) in matches {
                            let total = spec.delay + *extra;
                            let dst_gid = offsets[machine] + tl;
                            dests.push(self.make_dest(
                                machine, tl, dst_gid, ic_slot, name, total, src_gid, pattern,
                                &mut my_edges,
                            )?);
                        }
                    }
                    MapRequest::Direct { target, extra } => {
                        let (tl, ic_slot) = route.in_loc[target.index()];
                        let total = spec.delay + *extra;
                        let dst_gid = my_offset + tl;
                        let label = self.in_specs[target.index()]
                            .name
                            .clone()
                            .unwrap_or_else(|| format!("<internal {}>", target.index()));
                        dests.push(self.make_dest(
                            self.config.machine_index,
                            tl,
                            dst_gid,
                            ic_slot,
                            &label,
                            total,
                            src_gid,
                            &label,
                            &mut my_edges,
                        )?);
                    }
                }
            }
            dests_per_out.push(dests);
        }

        // Gossip round two: the full lookahead edge set.
        let my_gossip = EdgeGossip {
            edges: my_edges.clone(),
        };
        let edge_gossips = self.gossip_round(&transport, &my_gossip)?;
        let matrix = LookaheadMatrix::new(
            n_global,
            edge_gossips
                .into_iter()
                .flat_map(|g| g.edges)
                .map(|(s, d, l)| (s, d, l)),
        );
        debug!(
            "lookahead graph: {} timeline(s), {} edge(s)",
            n_global,
            matrix.edges().len()
        );

        // Per-machine frame routing tables.
        let mut remote_resolve: HashMap<String, (usize, usize)> = HashMap::new();
        let mut dst_gids: HashMap<(usize, String), usize> = HashMap::new();
        for (name, &(machine, tl, ic_slot)) in &names {
            dst_gids.insert((machine, name.clone()), offsets[machine] + tl);
            if machine == self.config.machine_index {
                remote_resolve.insert(name.clone(), (tl, ic_slot));
            }
        }

        // Materialize timelines.
        let route = Arc::new(route);
        self.route = Some(Arc::clone(&route));
        let mut timelines = self.materialize(
            n_local,
            my_offset,
            end_time,
            &route,
            dests_per_out,
        )?;

        // Realtime coupling.
        let hosts_emulated = timelines.iter().any(|tl| tl.hosts_emulated());
        let clock = if hosts_emulated || self.config.speed.is_finite() {
            Some(Arc::new(RealtimeClock::new()))
        } else {
            None
        };
        if let Some(clock) = &clock {
            for tl in timelines.iter_mut() {
                tl.clock = Some(Arc::clone(clock));
                tl.pace_speed = if tl.hosts_emulated() {
                    Some(1.0)
                } else if self.config.speed.is_finite() {
                    Some(self.config.speed)
                } else {
                    None
                };
            }
        }

        // Wire injection inboxes and arm handles.
        let mut inbox_rx: HashMap<usize, Vec<Receiver<Injected>>> = HashMap::new();
        for tap in &mut self.taps {
            let (tl_idx, ent_slot) = route.ent_loc[tap.entity];
            let clock = clock.as_ref().expect("emulated entity without clock");
            tap.handle.arm(
                Arc::clone(clock),
                ent_slot,
                self.entities[tap.entity].responsiveness,
            );
            if let Some(rx) = tap.rx.take() {
                inbox_rx.entry(tl_idx).or_default().push(rx);
            }
        }
        for (tl_idx, rxs) in inbox_rx {
            timelines[tl_idx].inbox = Some(InjectionInbox::new(rxs));
        }

        // Initial writes land before the first epoch.
        let writes = std::mem::take(&mut self.initial_writes);
        for (oc, event, extra) in writes {
            let (tl_idx, _) = route.out_loc[oc.index()];
            timelines[tl_idx].write_event(oc, event, extra, "initial write")?;
        }

        let workers = if n_local == 0 {
            if self.config.machines > 1 { 1 } else { 0 }
        } else {
            self.config.workers_per_machine.min(n_local)
        };
        if workers == 0 {
            self.timelines = timelines;
            return Ok(RunSummary {
                end_time,
                wall_seconds: begun.elapsed().as_secs_f64(),
                epochs: 0,
                events: 0,
                timelines: Vec::new(),
            });
        }

        let mailboxes: Arc<Mailboxes> =
            Arc::new((0..n_local).map(|_| Mutex::new(Vec::new())).collect());
        let sync = Arc::new(SyncState::new(
            workers,
            n_global,
            end_time,
            matrix,
            my_offset..my_offset + n_local,
            transport,
            Arc::clone(&mailboxes),
            remote_resolve,
            Arc::new(std::mem::replace(&mut self.registry, EventRegistry::new())),
            self.config.progress_interval,
        ));

        info!(
            "starting: {} timeline(s) on {} worker(s), machine {}/{}, end time {}",
            n_local, workers, self.config.machine_index, self.config.machines, end_time
        );

        // Static assignment: timeline i runs on worker i mod workers.
        let mut assignments: Vec<Vec<Timeline>> = (0..workers).map(|_| Vec::new()).collect();
        for (i, tl) in timelines.into_iter().enumerate() {
            assignments[i % workers].push(tl);
        }

        let sync_interval = self.config.sync_interval;
        let dst_gids = &dst_gids;
        let mut returned: Vec<Timeline> = Vec::new();
        std::thread::scope(|scope| {
            let mut handles = Vec::with_capacity(workers);
            for mut set in assignments {
                let sync = Arc::clone(&sync);
                let mailboxes = Arc::clone(&mailboxes);
                handles.push(scope.spawn(move || {
                    if let Err(err) = worker_loop(&mut set, &sync, &mailboxes, dst_gids, sync_interval)
                    {
                        sync.fail(err);
                    }
                    set
                }));
            }
            for handle in handles {
                match handle.join() {
                    Ok(set) => returned.extend(set),
                    Err(_) => sync.fail(SimError::WorkerPanic {
                        detail: "worker thread did not return its timelines".into(),
                    }),
                }
            }
        });
        returned.sort_by_key(|tl| tl.local_idx);
        self.timelines = returned;

        if let Some(err) = sync.take_error() {
            return Err(err);
        }

        let (epochs, events) = sync.totals();
        let summary = RunSummary {
            end_time,
            wall_seconds: begun.elapsed().as_secs_f64(),
            epochs,
            events,
            timelines: self
                .timelines
                .iter()
                .map(|tl| TimelineSummary {
                    timeline: tl.gid,
                    final_lvt: tl.lvt,
                    stats: tl.stats,
                })
                .collect(),
        };
        info!(
            "finished: {} events over {} epochs in {:.3}s",
            summary.events, summary.epochs, summary.wall_seconds
        );
        Ok(summary)
    }

    #[allow(clippy::too_many_arguments)]
    fn make_dest(
        &self,
        machine: usize,
        tl: usize,
        dst_gid: usize,
        ic_slot: usize,
        name: &str,
        total: VirtualTime,
        src_gid: usize,
        pattern: &str,
        edges: &mut Vec<(usize, usize, i64)>,
    ) -> Result<Dest, SetupError> {
        let same_machine = machine == self.config.machine_index;
        let same_timeline = same_machine && src_gid == dst_gid;
        if same_timeline {
            return Ok(Dest::LocalSame {
                ic_slot,
                delay: total,
            });
        }
        if total <= VirtualTime::ZERO {
            return Err(SetupError::ZeroDelayCrossTimeline {
                pattern: pattern.to_string(),
            });
        }
        edges.push((src_gid, dst_gid, total.ticks()));
        if same_machine {
            Ok(Dest::LocalOther {
                timeline: tl,
                ic_slot,
                delay: total,
            })
        } else {
            Ok(Dest::Remote {
                machine,
                name: Arc::from(name),
                delay: total,
            })
        }
    }

    fn materialize(
        &mut self,
        n_local: usize,
        my_offset: usize,
        end_time: VirtualTime,
        route: &Arc<RouteTable>,
        mut dests_per_out: Vec<Vec<Dest>>,
    ) -> Result<Vec<Timeline>, SimError> {
        let mut ent_slots: Vec<Vec<EntitySlot>> = (0..n_local).map(|_| Vec::new()).collect();
        for (i, spec) in self.entities.iter_mut().enumerate() {
            let (tl, _) = route.ent_loc[i];
            ent_slots[tl].push(EntitySlot {
                entity: spec.entity.take(),
                emulated: spec.emulated,
                responsiveness: spec.responsiveness,
            });
        }
        let mut in_slots: Vec<Vec<InChannelSlot>> = (0..n_local).map(|_| Vec::new()).collect();
        for (i, spec) in self.in_specs.iter().enumerate() {
            let (tl, _) = route.in_loc[i];
            in_slots[tl].push(InChannelSlot {
                handle: InChannel(i as u32),
                name: spec.name.as_deref().map(Arc::from),
                waiters: Vec::new(),
                active: None,
            });
        }
        let mut out_slots: Vec<Vec<OutChannelSlot>> = (0..n_local).map(|_| Vec::new()).collect();
        for (i, _) in self.out_specs.iter().enumerate() {
            let (tl, _) = route.out_loc[i];
            out_slots[tl].push(OutChannelSlot {
                dests: std::mem::take(&mut dests_per_out[i]),
            });
        }
        let mut proc_slots: Vec<Vec<ProcessSlot>> = (0..n_local).map(|_| Vec::new()).collect();
        for (i, spec) in self.processes.iter_mut().enumerate() {
            let (tl, _) = route.proc_loc[i];
            let owner_slot = route.ent_loc[spec.owner].1;
            let frame = spec.frame.take().ok_or(SetupError::UnknownHandle {
                kind: "process frame",
                index: i,
            })?;
            let mut slot = ProcessSlot::new(spec.label.clone(), owner_slot, frame);
            for ch in &spec.waits_on {
                let (ch_tl, ch_slot) = route.in_loc[ch.index()];
                if ch_tl != tl {
                    return Err(SimError::ForeignTimeline {
                        context: format!(
                            "process {:?} default channel on timeline {ch_tl}, process on {tl}",
                            spec.label
                        ),
                    });
                }
                slot.default_channels.push(ch_slot);
            }
            proc_slots[tl].push(slot);
        }
        let mut sem_slots: Vec<Vec<SemaphoreSlot>> = (0..n_local).map(|_| Vec::new()).collect();
        for (i, &(_, initial)) in self.sem_specs.iter().enumerate() {
            let (tl, _) = route.sem_loc[i];
            sem_slots[tl].push(SemaphoreSlot::new(initial));
        }
        let mut timer_slots: Vec<Vec<TimerSlot>> = (0..n_local).map(|_| Vec::new()).collect();
        for (i, spec) in self.timer_specs.iter_mut().enumerate() {
            let (tl, _) = route.timer_loc[i];
            let owner_slot = route.ent_loc[spec.owner].1;
            let callback = spec.callback.take().ok_or(SetupError::UnknownHandle {
                kind: "timer callback",
                index: i,
            })?;
            timer_slots[tl].push(TimerSlot::new(owner_slot, callback));
        }

        let seed = self.config.seed;
        let mut timelines = Vec::with_capacity(n_local);
        let mut iters = (
            ent_slots.into_iter(),
            proc_slots.into_iter(),
            in_slots.into_iter(),
            out_slots.into_iter(),
            sem_slots.into_iter(),
            timer_slots.into_iter(),
        );
        for local_idx in 0..n_local {
            let gid = my_offset + local_idx;
            // Distinct deterministic stream per timeline, derived from the
            // run seed.
            let stream = LehmerStream::new(
                seed.wrapping_add((gid as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)),
            );
            timelines.push(Timeline::new(
                local_idx,
                gid,
                end_time,
                Arc::clone(route),
                stream,
                iters.0.next().unwrap_or_default(),
                iters.1.next().unwrap_or_default(),
                iters.2.next().unwrap_or_default(),
                iters.3.next().unwrap_or_default(),
                iters.4.next().unwrap_or_default(),
                iters.5.next().unwrap_or_default(),
            ));
        }
        Ok(timelines)
    }

    /// One all-to-all gossip exchange; returns every machine's value in rank
    /// order, this machine's included.
    fn gossip_round<T: Serialize + for<'de> serde::Deserialize<'de> + Clone>(
        &self,
        transport: &Option<TransportHandle>,
        mine: &T,
    ) -> Result<Vec<T>, SimError> {
        let Some(transport) = transport else {
            return Ok(vec![mine.clone()]);
        };
        let payload = encode_gossip(mine)?;
        let outbound = (0..self.config.machines)
            .filter(|&peer| peer != self.config.machine_index)
            .map(|peer| (peer, payload.clone()))
            .collect();
        let inbound = transport.exchange(outbound)?;
        let mut all: Vec<Option<T>> = (0..self.config.machines).map(|_| None).collect();
        all[self.config.machine_index] = Some(mine.clone());
        for (peer, buf) in inbound {
            all[peer] = Some(decode_gossip(&buf)?);
        }
        Ok(all.into_iter().map(|v| v.expect("gossip gap")).collect())
    }
}

/// The per-worker epoch loop: rendezvous, consume, reduce, run, flush.
fn worker_loop(
    timelines: &mut [Timeline],
    sync: &SyncState,
    mailboxes: &Mailboxes,
    dst_gids: &HashMap<(usize, String), usize>,
    sync_interval: Duration,
) -> Result<(), SimError> {
    for tl in timelines.iter_mut() {
        tl.run_init()?;
    }
    let mut pending_sections: Vec<(usize, WireSection)> = Vec::new();
    let mut pending_mins: Vec<(usize, i64)> = Vec::new();
    flush_phase(timelines, mailboxes, dst_gids, &mut pending_sections, &mut pending_mins);

    let mut last_dispatched = 0u64;
    loop {
        if !sync.rendezvous() {
            return Ok(());
        }

        let mut reports = Vec::with_capacity(timelines.len());
        for tl in timelines.iter_mut() {
            let batches: Vec<_> = mailboxes[tl.local_idx].lock().unwrap().drain(..).collect();
            tl.consume_inbox(batches)?;
            tl.consume_injected()?;
            reports.push((tl.gid, tl.lower_bound().ticks()));
            debug_assert!(tl.outbox_min().is_infinite(), "outbox not drained at barrier");
        }

        let dispatched: u64 = timelines
            .iter()
            .map(|tl| tl.stats.events + tl.stats.wakes + tl.stats.timers + tl.stats.injected)
            .sum();
        let delta = dispatched - last_dispatched;
        last_dispatched = dispatched;

        let verdict = sync.reduce(
            &reports,
            std::mem::take(&mut pending_sections),
            &std::mem::take(&mut pending_mins),
            delta,
        );
        let horizons = match verdict {
            Verdict::Halt => {
                debug!("worker done after {dispatched} dispatches");
                return Ok(());
            }
            Verdict::Continue(h) => h,
        };
        for tl in timelines.iter_mut() {
            tl.horizon = VirtualTime::from_ticks(horizons[tl.gid]);
        }

        let deadline = Instant::now() + sync_interval;
        loop {
            let mut nap: Option<Duration> = None;
            for tl in timelines.iter_mut() {
                match tl.run_epoch()? {
                    EpochOutcome::Done => {}
                    EpochOutcome::NeedsWall(target) => {
                        let clock = tl.clock.as_ref().expect("paced timeline without clock");
                        let speed = tl.pace_speed.unwrap_or(1.0);
                        let wait = clock.wall_until(target, speed);
                        nap = Some(nap.map_or(wait, |n| n.min(wait)));
                    }
                }
            }
            let Some(nap) = nap else { break };
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            if !nap.is_zero() {
                std::thread::sleep(nap.min(remaining).min(INJECTION_POLL));
            }
            for tl in timelines.iter_mut() {
                tl.consume_injected()?;
            }
        }

        // A realtime-coupled run with nothing due naps instead of spinning
        // the barrier loop.
        let after: u64 = timelines
            .iter()
            .map(|tl| tl.stats.events + tl.stats.wakes + tl.stats.timers + tl.stats.injected)
            .sum();
        if after == dispatched && timelines.iter().any(|tl| tl.clock.is_some()) {
            std::thread::sleep(INJECTION_POLL);
            for tl in timelines.iter_mut() {
                tl.consume_injected()?;
            }
        }

        flush_phase(timelines, mailboxes, dst_gids, &mut pending_sections, &mut pending_mins);
    }
}

fn flush_phase(
    timelines: &mut [Timeline],
    mailboxes: &Mailboxes,
    dst_gids: &HashMap<(usize, String), usize>,
    pending_sections: &mut Vec<(usize, WireSection)>,
    pending_mins: &mut Vec<(usize, i64)>,
) {
    for tl in timelines.iter_mut() {
        tl.flush_local(mailboxes);
        let taken = tl.take_remote();
        if !taken.is_empty() {
            let (sections, mins) = sections_from_outbox(tl.gid, taken, dst_gids);
            pending_sections.extend(sections);
            pending_mins.extend(mins);
        }
    }
}


#[cfg(test)]
mod call_tests {
    use super::*;
    use crate::event::BareEvent;
    use crate::process::{ProcedureStep, WaitRequest};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    // -----------------------------------------------------------------------
    // Sub-procedure calls: push a child frame, collect its return value.
    // -----------------------------------------------------------------------

    struct CallHost {
        got: Option<i64>,
        at: VirtualTime,
    }

    impl Entity for CallHost {}

    struct Inner {
        entry: u8,
        base: i64,
    }

    impl ProcedureFrame for Inner {
        fn resume(&mut self, _ctx: &mut SimCtx<'_>) -> Result<ProcedureStep, SimError> {
            match self.entry {
                0 => {
                    self.entry = 1;
                    Ok(ProcedureStep::Suspend(WaitRequest::For(
                        VirtualTime::from_ticks(5),
                    )))
                }
                _ => Ok(ProcedureStep::Return(Some(Box::new(self.base * 2)))),
            }
        }
    }

    struct Outer {
        entry: u8,
    }

    impl ProcedureFrame for Outer {
        fn resume(&mut self, ctx: &mut SimCtx<'_>) -> Result<ProcedureStep, SimError> {
            match self.entry {
                0 => {
                    self.entry = 1;
                    Ok(ProcedureStep::Call(Box::new(Inner { entry: 0, base: 21 })))
                }
                _ => {
                    let got = ctx.take_return::<i64>();
                    let now = ctx.now();
                    let host = ctx.owner_as_mut::<CallHost>().unwrap();
                    host.got = got;
                    host.at = now;
                    Ok(ProcedureStep::Return(None))
                }
            }
        }
    }

    #[test]
    fn test_sub_procedure_returns_value_to_caller() {
        let mut sim = Kernel::new(Config::default()).unwrap();
        let host = sim
            .entity(CallHost {
                got: None,
                at: VirtualTime::ZERO,
            })
            .unwrap();
        sim.process(host, "outer", Box::new(Outer { entry: 0 })).unwrap();
        sim.start(VirtualTime::from_ticks(100)).unwrap();

        let host = sim.entity_as::<CallHost>(host).unwrap();
        assert_eq!(host.got, Some(42));
        // The caller resumed after the callee's suspension elapsed.
        assert_eq!(host.at, VirtualTime::from_ticks(5));
    }

    // -----------------------------------------------------------------------
    // Fan-out: a wildcard mapping clones the event to every match.
    // -----------------------------------------------------------------------

    struct Sink {
        hits: u64,
    }

    impl Entity for Sink {}

    struct CountFrame {
        entry: u8,
    }

    impl ProcedureFrame for CountFrame {
        fn resume(&mut self, ctx: &mut SimCtx<'_>) -> Result<ProcedureStep, SimError> {
            loop {
                match self.entry {
                    0 => {
                        self.entry = 1;
                        return Ok(ProcedureStep::Suspend(WaitRequest::OnDefault));
                    }
                    _ => {
                        assert!(ctx.active_event().is_some());
                        ctx.owner_as_mut::<Sink>().unwrap().hits += 1;
                        self.entry = 0;
                    }
                }
            }
        }
    }

    #[test]
    fn test_wildcard_mapping_fans_out() {
        let mut sim = Kernel::new(Config::default()).unwrap();
        let src = sim.entity(Sink { hits: 0 }).unwrap();
        let oc = sim.output_channel(src, VirtualTime::from_ticks(1)).unwrap();

        let mut sinks = Vec::new();
        for i in 0..3 {
            let ent = sim.entity(Sink { hits: 0 }).unwrap();
            let ic = sim.input_channel(ent, &format!("FAN_{i}")).unwrap();
            let p = sim
                .process(ent, &format!("count_{i}"), Box::new(CountFrame { entry: 0 }))
                .unwrap();
            sim.waits_on(p, &[ic]).unwrap();
            sinks.push(ent);
        }
        sim.map_to(oc, "FAN_*", VirtualTime::ZERO).unwrap();
        sim.write(oc, Box::new(BareEvent)).unwrap();
        sim.start(VirtualTime::from_ticks(10)).unwrap();

        for ent in sinks {
            assert_eq!(sim.entity_as::<Sink>(ent).unwrap().hits, 1);
        }
    }

    // -----------------------------------------------------------------------
    // finalize() runs wrap_up even when the run failed.
    // -----------------------------------------------------------------------

    struct Flusher {
        flushed: Arc<AtomicU64>,
    }

    impl Entity for Flusher {
        fn wrap_up(&mut self) {
            self.flushed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct BadWait;

    impl ProcedureFrame for BadWait {
        fn resume(&mut self, _ctx: &mut SimCtx<'_>) -> Result<ProcedureStep, SimError> {
            Ok(ProcedureStep::Suspend(WaitRequest::For(
                VirtualTime::from_ticks(-1),
            )))
        }
    }

    #[test]
    fn test_wrap_up_runs_after_fatal_error() {
        let flushed = Arc::new(AtomicU64::new(0));
        let mut sim = Kernel::new(Config::default()).unwrap();
        let ent = sim
            .entity(Flusher {
                flushed: Arc::clone(&flushed),
            })
            .unwrap();
        sim.process(ent, "bad", Box::new(BadWait)).unwrap();

        let err = sim.start(VirtualTime::from_ticks(10)).unwrap_err();
        assert!(matches!(err, SimError::NegativeDelay { .. }));

        sim.finalize();
        assert_eq!(flushed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_wrap_up_runs_without_start() {
        let flushed = Arc::new(AtomicU64::new(0));
        let mut sim = Kernel::new(Config::default()).unwrap();
        sim.entity(Flusher {
            flushed: Arc::clone(&flushed),
        })
        .unwrap();
        sim.finalize();
        assert_eq!(flushed.load(Ordering::SeqCst), 1);
    }
}
