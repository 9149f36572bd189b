//! Multiplexer tree: bounded buffers, loss accounting, in-tree aggregation.
//!
//! Traffic sources feed the leaves of a `fanin`-ary tree of multiplexers.
//! Each multiplexer queues arrivals in a bounded buffer (overflow is counted
//! and dropped), services them at an exponential rate, and forwards upward.
//! The arrival and service processes of one multiplexer are coupled through
//! an internal zero-delay channel pair, the entity-internal wiring pattern.
//! Sources are aligned to their leaf multiplexer, so a leaf and its feeders
//! always share a timeline.

use std::any::Any;
use std::collections::VecDeque;

use parsim_core::{
    BareEvent, EntityRef, Event, EventTypeId, InChannel, Kernel, LehmerStream, OutChannel,
    ProcedureFrame, ProcedureStep, SetupError, SimCtx, SimError, TransportError, VirtualTime,
    WaitRequest,
};

/// Mux-tree construction parameters.
#[derive(Debug, Clone)]
pub struct MuxTreeParams {
    /// Tree depth; level 0 is the root, `levels - 1` the leaves.
    pub levels: usize,
    /// Children per multiplexer, and sources per leaf.
    pub fanin: usize,
    /// Multiplexer buffer capacity.
    pub bufsize: usize,
    /// Mean source inter-arrival time.
    pub inter_arrival: VirtualTime,
    /// Mean multiplexer service time.
    pub service: VirtualTime,
    /// Per-hop transmission delay.
    pub delay: VirtualTime,
}

impl Default for MuxTreeParams {
    fn default() -> Self {
        MuxTreeParams {
            levels: 2,
            fanin: 4,
            bufsize: 8,
            inter_arrival: VirtualTime::SECOND,
            service: VirtualTime::SECOND * 5,
            delay: VirtualTime::SECOND,
        }
    }
}

/// The message generated by sources: creation time and source id.
#[derive(Debug, Clone, PartialEq)]
pub struct MsgEvent {
    pub born: VirtualTime,
    pub src: u32,
}

impl MsgEvent {
    /// Registered wire tag.
    pub const TYPE_ID: EventTypeId = 1;

    pub fn unpack(payload: &[u8]) -> Result<Box<dyn Event>, TransportError> {
        if payload.len() != 12 {
            return Err(TransportError::Codec {
                detail: format!("mux message payload is {} bytes, want 12", payload.len()),
            });
        }
        let born = i64::from_le_bytes(payload[0..8].try_into().unwrap());
        let src = u32::from_le_bytes(payload[8..12].try_into().unwrap());
        Ok(Box::new(MsgEvent {
            born: VirtualTime::from_ticks(born),
            src,
        }))
    }
}

impl Event for MsgEvent {
    fn event_type(&self) -> EventTypeId {
        Self::TYPE_ID
    }
    fn clone_event(&self) -> Box<dyn Event> {
        Box::new(self.clone())
    }
    fn pack(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.born.ticks().to_le_bytes());
        buf.extend_from_slice(&self.src.to_le_bytes());
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// One multiplexer node.
pub struct Mux {
    pub level: usize,
    pub id: usize,
    pub nrcvd: u64,
    pub nlost: u64,
    pub nsent: u64,
    buffer: VecDeque<Box<dyn Event>>,
    in_service: Option<Box<dyn Event>>,
    rng: LehmerStream,
}

impl parsim_core::Entity for Mux {}

impl Mux {
    /// Messages currently held: queued plus the one in service.
    pub fn in_flight(&self) -> usize {
        self.buffer.len() + usize::from(self.in_service.is_some())
    }
}

/// One traffic source.
pub struct Source {
    pub id: usize,
    pub nsent: u64,
    rng: LehmerStream,
}

impl parsim_core::Entity for Source {}

struct MuxArrival {
    entry: u8,
    notify: OutChannel,
    bufsize: usize,
}

impl ProcedureFrame for MuxArrival {
    fn resume(&mut self, ctx: &mut SimCtx<'_>) -> Result<ProcedureStep, SimError> {
        loop {
            match self.entry {
                0 => {
                    self.entry = 1;
                    return Ok(ProcedureStep::Suspend(WaitRequest::OnDefault));
                }
                _ => {
                    let msg = ctx.take_active_event().expect("arrival without event");
                    let mux = ctx.owner_as_mut::<Mux>().expect("owner is a Mux");
                    mux.nrcvd += 1;
                    if mux.buffer.len() == self.bufsize {
                        mux.nlost += 1;
                    } else {
                        mux.buffer.push_back(msg);
                        if mux.buffer.len() == 1 {
                            ctx.write(self.notify, Box::new(BareEvent))?;
                        }
                    }
                    self.entry = 0;
                }
            }
        }
    }
}

struct MuxService {
    entry: u8,
    upward: OutChannel,
    service: VirtualTime,
}

impl ProcedureFrame for MuxService {
    fn resume(&mut self, ctx: &mut SimCtx<'_>) -> Result<ProcedureStep, SimError> {
        loop {
            match self.entry {
                0 => {
                    self.entry = 1;
                    return Ok(ProcedureStep::Suspend(WaitRequest::OnDefault));
                }
                1 => {
                    let mean = self.service.as_seconds();
                    let mux = ctx.owner_as_mut::<Mux>().expect("owner is a Mux");
                    match mux.buffer.pop_front() {
                        Some(msg) => {
                            mux.in_service = Some(msg);
                            let hold = VirtualTime::from_seconds(mux.rng.exponential(1.0 / mean));
                            self.entry = 2;
                            return Ok(ProcedureStep::Suspend(WaitRequest::For(hold)));
                        }
                        None => self.entry = 0,
                    }
                }
                _ => {
                    let mux = ctx.owner_as_mut::<Mux>().expect("owner is a Mux");
                    let msg = mux.in_service.take().expect("service without message");
                    mux.nsent += 1;
                    ctx.write(self.upward, msg)?;
                    self.entry = 1;
                }
            }
        }
    }
}

struct SourceEmit {
    entry: u8,
    out: OutChannel,
    inter_arrival: VirtualTime,
}

impl ProcedureFrame for SourceEmit {
    fn resume(&mut self, ctx: &mut SimCtx<'_>) -> Result<ProcedureStep, SimError> {
        loop {
            match self.entry {
                0 => {
                    let mean = self.inter_arrival.as_seconds();
                    let source = ctx.owner_as_mut::<Source>().expect("owner is a Source");
                    let gap = VirtualTime::from_seconds(source.rng.exponential(1.0 / mean));
                    self.entry = 1;
                    return Ok(ProcedureStep::Suspend(WaitRequest::For(gap)));
                }
                _ => {
                    let now = ctx.now();
                    let source = ctx.owner_as_mut::<Source>().expect("owner is a Source");
                    source.nsent += 1;
                    let msg = MsgEvent {
                        born: now,
                        src: source.id as u32,
                    };
                    ctx.write(self.out, Box::new(msg))?;
                    self.entry = 0;
                }
            }
        }
    }
}

/// Handles to this machine's share of the tree.
pub struct MuxTree {
    pub muxes: Vec<EntityRef>,
    pub sources: Vec<EntityRef>,
}

fn ic_name(level: usize, id: usize) -> String {
    format!("IN_{level}_{id}")
}

fn build_mux(
    sim: &mut Kernel,
    params: &MuxTreeParams,
    level: usize,
    id: usize,
) -> Result<(EntityRef, InChannel), SetupError> {
    let ent = sim.entity(Mux {
        level,
        id,
        nrcvd: 0,
        nlost: 0,
        nsent: 0,
        buffer: VecDeque::new(),
        in_service: None,
        rng: LehmerStream::new(((params.fanin ^ level) + id) as u64),
    })?;
    let ic = sim.input_channel(ent, &ic_name(level, id))?;

    // Upward channel; the root's stays unmapped and its sends vanish.
    let upward = sim.output_channel(ent, params.delay)?;
    if level > 0 {
        sim.map_to(upward, &ic_name(level - 1, id / params.fanin), VirtualTime::ZERO)?;
    }

    // Internal zero-delay pair coupling arrival to service.
    let int_ic = sim.internal_channel(ent)?;
    let int_oc = sim.output_channel(ent, VirtualTime::ZERO)?;
    sim.map_to_channel(int_oc, int_ic)?;

    let arrival = sim.process(
        ent,
        &format!("mux_arrival_{level}_{id}"),
        Box::new(MuxArrival {
            entry: 0,
            notify: int_oc,
            bufsize: params.bufsize,
        }),
    )?;
    sim.waits_on(arrival, &[ic])?;

    let service = sim.process(
        ent,
        &format!("mux_service_{level}_{id}"),
        Box::new(MuxService {
            entry: 0,
            upward,
            service: params.service,
        }),
    )?;
    sim.waits_on(service, &[int_ic])?;

    Ok((ent, ic))
}

fn build_source(
    sim: &mut Kernel,
    params: &MuxTreeParams,
    id: usize,
    leaf: EntityRef,
) -> Result<EntityRef, SetupError> {
    let ent = sim.entity(Source {
        id,
        nsent: 0,
        rng: LehmerStream::new(((params.fanin ^ params.levels) + id) as u64),
    })?;
    let out = sim.output_channel(ent, params.delay)?;
    sim.map_to(
        out,
        &ic_name(params.levels - 1, id / params.fanin),
        VirtualTime::ZERO,
    )?;
    sim.process(
        ent,
        &format!("source_{id}"),
        Box::new(SourceEmit {
            entry: 0,
            out,
            inter_arrival: params.inter_arrival,
        }),
    )?;
    sim.align_to(ent, leaf)?;
    Ok(ent)
}

/// Populate the kernel with this machine's share of the tree. Multiplexers
/// are dealt round-robin per level; each leaf brings its sources along.
pub fn build(sim: &mut Kernel, params: &MuxTreeParams) -> Result<MuxTree, SetupError> {
    sim.register_event(MsgEvent::TYPE_ID, MsgEvent::unpack)?;
    let machines = sim.num_machines();
    let me = sim.machine_index();

    let mut muxes = Vec::new();
    let mut sources = Vec::new();
    let mut nnodes = 1;
    for level in 0..params.levels {
        let mut id = me;
        while id < nnodes {
            let (mux, _) = build_mux(sim, params, level, id)?;
            muxes.push(mux);
            if level == params.levels - 1 {
                for s in 0..params.fanin {
                    sources.push(build_source(sim, params, id * params.fanin + s, mux)?);
                }
            }
            id += machines;
        }
        nnodes *= params.fanin;
    }

    Ok(MuxTree { muxes, sources })
}

/// Per-multiplexer accounting row.
#[derive(Debug, Clone, Copy)]
pub struct MuxCounts {
    pub level: usize,
    pub id: usize,
    pub nrcvd: u64,
    pub nlost: u64,
    pub nsent: u64,
    pub in_flight: u64,
}

/// Counters for the locally built multiplexers.
pub fn mux_counts(sim: &Kernel, tree: &MuxTree) -> Vec<MuxCounts> {
    tree.muxes
        .iter()
        .map(|&ent| {
            let mux = sim.entity_as::<Mux>(ent).expect("mux");
            MuxCounts {
                level: mux.level,
                id: mux.id,
                nrcvd: mux.nrcvd,
                nlost: mux.nlost,
                nsent: mux.nsent,
                in_flight: mux.in_flight() as u64,
            }
        })
        .collect()
}

/// Total messages emitted by the locally built sources.
pub fn source_sent(sim: &Kernel, tree: &MuxTree) -> u64 {
    tree.sources
        .iter()
        .map(|&ent| sim.entity_as::<Source>(ent).expect("source").nsent)
        .sum()
}
