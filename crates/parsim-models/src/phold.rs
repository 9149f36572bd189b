//! PHOLD: the classic conservative-synchronization benchmark.
//!
//! `n` queues hold jobs; each queue's service process draws an exponential
//! service time, then forwards the finished job to a random neighbor over a
//! channel whose delay is the model's lookahead. An arrival process counts
//! jobs in and hands the service process batches through a semaphore. The
//! initial population is Poisson-distributed per queue.
//!
//! Each queue connects to `branching` neighbors drawn within `radius`
//! positions of itself; the first two are always its ring neighbors, the
//! rest are drawn without replacement from the queue's own random stream, so
//! the topology is a function of the queue ids alone.

use parsim_core::{
    BareEvent, EntityRef, Kernel, LehmerStream, OutChannel, ProcedureFrame, ProcedureStep,
    SemaphoreRef, SetupError, SimCtx, SimError, VirtualTime, WaitRequest,
};

/// PHOLD construction parameters.
#[derive(Debug, Clone)]
pub struct PholdParams {
    /// Total number of queues.
    pub queues: usize,
    /// A queue may connect to this many positions before and after itself.
    pub radius: usize,
    /// Outgoing channels per queue (at least 2: the ring neighbors).
    pub branching: usize,
    /// Channel delay; this is the run's lookahead.
    pub delay: VirtualTime,
    /// Mean of the exponential service time.
    pub mean_service: VirtualTime,
    /// Mean of the Poisson initial job count per queue.
    pub init_jobs: f64,
    /// Alignment groups per machine (queues in one group share a timeline).
    pub groups: usize,
}

impl Default for PholdParams {
    fn default() -> Self {
        PholdParams {
            queues: 16,
            radius: 1,
            branching: 2,
            delay: VirtualTime::from_seconds(0.1),
            mean_service: VirtualTime::SECOND,
            init_jobs: 8.0,
            groups: 1,
        }
    }
}

/// One queueing node.
pub struct Queue {
    pub id: usize,
    pub num_in_buffer: i64,
    pub serviced: u64,
    pub rng: LehmerStream,
}

impl parsim_core::Entity for Queue {}

struct ArrivalLoop {
    entry: u8,
    sem: SemaphoreRef,
}

impl ProcedureFrame for ArrivalLoop {
    fn resume(&mut self, ctx: &mut SimCtx<'_>) -> Result<ProcedureStep, SimError> {
        loop {
            match self.entry {
                0 => {
                    self.entry = 1;
                    return Ok(ProcedureStep::Suspend(WaitRequest::OnDefault));
                }
                _ => {
                    let queue = ctx.owner_as_mut::<Queue>().expect("owner is a Queue");
                    queue.num_in_buffer += 1;
                    let first = queue.num_in_buffer == 1;
                    if first {
                        ctx.signal(self.sem)?;
                    }
                    self.entry = 0;
                }
            }
        }
    }
}

struct ServiceLoop {
    entry: u8,
    sem: SemaphoreRef,
    outputs: Vec<OutChannel>,
    mean_service: VirtualTime,
}

impl ProcedureFrame for ServiceLoop {
    fn resume(&mut self, ctx: &mut SimCtx<'_>) -> Result<ProcedureStep, SimError> {
        loop {
            match self.entry {
                0 => {
                    self.entry = 1;
                    return Ok(ProcedureStep::Suspend(WaitRequest::Semaphore(self.sem)));
                }
                1 => {
                    // Drain the buffer one job at a time; back to the
                    // semaphore once it is empty.
                    let mean = self.mean_service.as_seconds();
                    let queue = ctx.owner_as_mut::<Queue>().expect("owner is a Queue");
                    if queue.num_in_buffer > 0 {
                        let service = VirtualTime::from_seconds(queue.rng.exponential(1.0 / mean));
                        self.entry = 2;
                        return Ok(ProcedureStep::Suspend(WaitRequest::For(service)));
                    }
                    self.entry = 0;
                }
                _ => {
                    let queue = ctx.owner_as_mut::<Queue>().expect("owner is a Queue");
                    queue.num_in_buffer -= 1;
                    if !self.outputs.is_empty() {
                        let k = if self.outputs.len() > 1 {
                            queue.rng.equilikely(0, self.outputs.len() as i64 - 1) as usize
                        } else {
                            0
                        };
                        queue.serviced += 1;
                        let out = self.outputs[k];
                        ctx.write(out, Box::new(BareEvent))?;
                    }
                    self.entry = 1;
                }
            }
        }
    }
}

/// Handles to this machine's share of the model.
pub struct Phold {
    pub queues: Vec<(usize, EntityRef)>,
    pub semaphores: Vec<SemaphoreRef>,
}

/// Block bounds of machine `m` out of `p` over `n` items (inclusive low,
/// exclusive high).
fn block(m: usize, p: usize, n: usize) -> (usize, usize) {
    (m * n / p, (m + 1) * n / p)
}

/// The neighbor offsets of one queue: the two adjacent ring positions plus
/// `branching - 2` distinct random picks within the radius.
fn neighbor_offsets(rng: &mut LehmerStream, radius: usize, branching: usize, maxb: usize) -> Vec<usize> {
    let mut nb = vec![0usize; branching];
    for i in 0..branching {
        let x = match i {
            0 => radius - 1,
            1 => radius,
            _ => rng.equilikely(0, (maxb - 1 - i) as i64) as usize,
        };
        // Insert into the sorted prefix, skipping over already-taken slots.
        let mut x = x;
        let mut j = 0;
        while j < i {
            if x >= nb[j] {
                x += 1;
                j += 1;
            } else {
                for k in (j..i).rev() {
                    nb[k + 1] = nb[k];
                }
                nb[j] = x;
                break;
            }
        }
        if j == i {
            nb[i] = x;
        }
    }
    nb
}

/// Populate the kernel with this machine's block of queues and wire the
/// topology.
pub fn build(sim: &mut Kernel, params: &PholdParams) -> Result<Phold, SetupError> {
    let machines = sim.num_machines();
    let me = sim.machine_index();
    let n = params.queues;
    if n < 2 {
        return Err(SetupError::InvalidConfig {
            reason: "phold needs at least two queues".into(),
        });
    }
    let mut radius = params.radius;
    if radius == 0 || radius > n / 2 {
        radius = n / 2;
    }
    let maxb = (2 * radius).min(n.saturating_sub(1));
    let branching = params.branching.clamp(2, maxb.max(2));

    let (lo, hi) = block(me, machines, n);
    let local = hi - lo;
    let groups = params.groups.clamp(1, local.max(1));

    let mut queues = Vec::new();
    let mut semaphores = Vec::new();
    let mut group_anchor: Vec<Option<EntityRef>> = vec![None; groups];

    for id in lo..hi {
        let mut rng = LehmerStream::new(12345 + id as u64);
        let num_in_buffer = rng.poisson(params.init_jobs) as i64;
        let offsets = neighbor_offsets(&mut rng, radius, branching, maxb);

        let ent = sim.entity(Queue {
            id,
            num_in_buffer,
            serviced: 0,
            rng,
        })?;
        let ic = sim.input_channel(ent, &format!("{id}"))?;
        let sem = sim.semaphore(ent, if params.init_jobs > 0.0 { 1 } else { 0 })?;

        let mut outputs = Vec::with_capacity(branching);
        for &offset in &offsets {
            let oc = sim.output_channel(ent, VirtualTime::ZERO)?;
            let mut target = id as i64 - radius as i64 + offset as i64;
            if offset >= radius {
                target += 1;
            }
            let target = target.rem_euclid(n as i64);
            sim.map_to(oc, &format!("{target}"), params.delay)?;
            outputs.push(oc);
        }

        let arrival = sim.process(
            ent,
            &format!("arrival_{id}"),
            Box::new(ArrivalLoop { entry: 0, sem }),
        )?;
        sim.waits_on(arrival, &[ic])?;
        sim.process(
            ent,
            &format!("service_{id}"),
            Box::new(ServiceLoop {
                entry: 0,
                sem,
                outputs,
                mean_service: params.mean_service,
            }),
        )?;

        // Spread the block over the requested alignment groups.
        let group = (groups * (id - lo + 1) - 1) / local;
        match group_anchor[group] {
            Some(anchor) => sim.align_to(ent, anchor)?,
            None => group_anchor[group] = Some(ent),
        }

        queues.push((id, ent));
        semaphores.push(sem);
    }

    Ok(Phold { queues, semaphores })
}

/// Total jobs serviced by the locally built queues.
pub fn total_serviced(sim: &Kernel, phold: &Phold) -> u64 {
    phold
        .queues
        .iter()
        .map(|&(_, ent)| sim.entity_as::<Queue>(ent).expect("queue").serviced)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_partition_covers_everything() {
        let n = 16;
        let p = 3;
        let mut covered = Vec::new();
        for m in 0..p {
            let (lo, hi) = block(m, p, n);
            covered.extend(lo..hi);
        }
        assert_eq!(covered, (0..n).collect::<Vec<_>>());
    }

    #[test]
    fn test_neighbor_offsets_distinct_and_sorted_prefix() {
        let mut rng = LehmerStream::new(99);
        for _ in 0..100 {
            let nb = neighbor_offsets(&mut rng, 4, 5, 8);
            let mut seen = nb.clone();
            seen.sort_unstable();
            seen.dedup();
            assert_eq!(seen.len(), nb.len(), "offsets must be distinct: {nb:?}");
            assert!(nb.iter().all(|&x| x < 8));
        }
    }

    #[test]
    fn test_fixed_picks_use_no_randomness() {
        // The first two offsets are fixed (the insertion walk shifts the
        // second past the first), so no random draws are consumed.
        let mut a = LehmerStream::new(7);
        let nb = neighbor_offsets(&mut a, 1, 2, 2);
        assert_eq!(nb, vec![0, 2]);
        let mut b = LehmerStream::new(7);
        assert_eq!(a.uniform(), b.uniform());
    }
}
