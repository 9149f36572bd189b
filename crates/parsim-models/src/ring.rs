//! Token ring: the hello-world of the kernel.
//!
//! N entities arranged in a ring, one tick of delay per hop. Entity 0
//! bootstraps itself with a zero-delay self-mapping written before start, so
//! the token visits entity `i` at exactly tick `i`. Each relay forwards the
//! token once and terminates; the token's final lap into entity 0 finds no
//! listener and is dropped.

use parsim_core::{
    BareEvent, EntityRef, Kernel, OutChannel, ProcedureFrame, ProcedureStep, SetupError, SimCtx,
    SimError, VirtualTime, WaitRequest,
};

/// Ring construction parameters.
#[derive(Debug, Clone)]
pub struct RingParams {
    /// Entities in the ring.
    pub nodes: usize,
    /// Per-hop channel delay.
    pub delay: VirtualTime,
}

impl Default for RingParams {
    fn default() -> Self {
        RingParams {
            nodes: 3,
            delay: VirtualTime::from_ticks(1),
        }
    }
}

/// One ring member; records the virtual times it saw the token.
pub struct RingNode {
    pub id: usize,
    pub visits: Vec<VirtualTime>,
}

impl parsim_core::Entity for RingNode {}

struct TokenRelay {
    entry: u8,
    forward: OutChannel,
}

impl ProcedureFrame for TokenRelay {
    fn resume(&mut self, ctx: &mut SimCtx<'_>) -> Result<ProcedureStep, SimError> {
        match self.entry {
            0 => {
                self.entry = 1;
                Ok(ProcedureStep::Suspend(WaitRequest::OnDefault))
            }
            _ => {
                let now = ctx.now();
                ctx.owner_as_mut::<RingNode>()
                    .expect("relay owner is a RingNode")
                    .visits
                    .push(now);
                ctx.write(self.forward, Box::new(BareEvent))?;
                Ok(ProcedureStep::Return(None))
            }
        }
    }
}

/// Handles to this machine's share of the ring.
pub struct Ring {
    /// `(ring position, entity)` for locally built nodes.
    pub nodes: Vec<(usize, EntityRef)>,
}

/// Populate the kernel with this machine's nodes (node `i` lives on machine
/// `i mod machines`) and wire the ring.
pub fn build(sim: &mut Kernel, params: &RingParams) -> Result<Ring, SetupError> {
    let machines = sim.num_machines();
    let me = sim.machine_index();
    let mut nodes = Vec::new();

    for id in (me..params.nodes).step_by(machines) {
        let ent = sim.entity(RingNode {
            id,
            visits: Vec::new(),
        })?;
        let ic = sim.input_channel(ent, &format!("IN_{id}"))?;
        let oc = sim.output_channel(ent, params.delay)?;
        sim.map_to(oc, &format!("IN_{}", (id + 1) % params.nodes), VirtualTime::ZERO)?;
        let relay = sim.process(
            ent,
            &format!("relay_{id}"),
            Box::new(TokenRelay {
                entry: 0,
                forward: oc,
            }),
        )?;
        sim.waits_on(relay, &[ic])?;

        if id == 0 {
            let boot = sim.output_channel(ent, VirtualTime::ZERO)?;
            sim.map_to_channel(boot, ic)?;
            sim.write(boot, Box::new(BareEvent))?;
        }
        nodes.push((id, ent));
    }

    Ok(Ring { nodes })
}

/// Visit traces of the locally built nodes, by ring position.
pub fn visit_trace(sim: &Kernel, ring: &Ring) -> Vec<(usize, Vec<VirtualTime>)> {
    ring.nodes
        .iter()
        .map(|&(id, ent)| {
            let node = sim.entity_as::<RingNode>(ent).expect("ring node");
            (id, node.visits.clone())
        })
        .collect()
}
