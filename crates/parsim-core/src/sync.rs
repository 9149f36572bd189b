//! Conservative synchronization with lookahead barriers.
//!
//! Each epoch, every timeline reports a lower bound on any timestamp it
//! could still produce (its queue top, capped for emulated timelines by the
//! earliest possible injection). The barrier gathers the reports — across
//! machines through one exchange per peer — and computes each timeline's
//! horizon: the minimum over all paths into it of `report(source) + path
//! lookahead`. Looking only at direct peers is not enough, because an event
//! can cascade (S wakes T, T writes to U), so the horizon is the fixpoint of
//! the peer formula, computed by Bellman–Ford relaxation over the lookahead
//! graph. Positive lookahead on every cross-timeline edge guarantees
//! convergence.
//!
//! The barrier is two-phase per epoch: a plain rendezvous after outbox
//! flushing (so every mailbox write is visible before anyone consumes), then
//! the reduction. The last worker to arrive at the reduction acts as
//! coordinator: it runs the cross-machine exchange, folds in-flight frame
//! minimums into the reports, relaxes, checks termination, and publishes.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::error::{SimError, TransportError};
use crate::event::EventRegistry;
use crate::time::VirtualTime;
use crate::timeline::{Batch, LocalMsg, Mailboxes, RemoteMsg};
use crate::transport::{
    EpochMessage, TransportHandle, WireFrame, WireSection, decode_epoch_message,
    encode_epoch_message,
};

const INF: i64 = i64::MAX;

fn sat_add(a: i64, b: i64) -> i64 {
    if a == INF || b == INF {
        INF
    } else {
        a.saturating_add(b)
    }
}

/// The fixed lookahead graph over global timeline ids, built at `start()`.
pub(crate) struct LookaheadMatrix {
    n: usize,
    /// `(src, dst, min delay in ticks)`, deduplicated to the pair minimum.
    edges: Vec<(usize, usize, i64)>,
}

impl LookaheadMatrix {
    pub fn new(n: usize, raw_edges: impl IntoIterator<Item = (usize, usize, i64)>) -> Self {
        let mut min_per_pair: HashMap<(usize, usize), i64> = HashMap::new();
        for (src, dst, delay) in raw_edges {
            min_per_pair
                .entry((src, dst))
                .and_modify(|d| *d = (*d).min(delay))
                .or_insert(delay);
        }
        let mut edges: Vec<_> = min_per_pair
            .into_iter()
            .map(|((s, d), l)| (s, d, l))
            .collect();
        edges.sort_unstable();
        LookaheadMatrix { n, edges }
    }

    pub fn edges(&self) -> &[(usize, usize, i64)] {
        &self.edges
    }

    /// Horizon per timeline: for every T, the minimum over paths
    /// `P -> ... -> T` of `report(P) + sum of path lookaheads`. A timeline
    /// nobody can reach gets an unconstrained horizon.
    pub fn relax(&self, reports: &[i64]) -> Vec<i64> {
        debug_assert_eq!(reports.len(), self.n);
        let mut horizon = vec![INF; self.n];
        // Positive edge weights bound the fixpoint at n rounds.
        for _ in 0..self.n {
            let mut changed = false;
            for &(src, dst, delay) in &self.edges {
                let base = reports[src].min(horizon[src]);
                let candidate = sat_add(base, delay);
                if candidate < horizon[dst] {
                    horizon[dst] = candidate;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        horizon
    }
}

/// What the barrier tells a worker to do next.
pub(crate) enum Verdict {
    /// Keep running; per-timeline horizons in ticks, indexed by global id.
    Continue(Vec<i64>),
    /// The run is over (termination, error, or peer failure).
    Halt,
}

struct Inner {
    epoch: u64,
    gate_count: usize,
    gate_gen: u64,
    reduce_count: usize,
    reduce_gen: u64,
    reports: Vec<i64>,
    frame_mins: Vec<i64>,
    outbound: Vec<(usize, WireSection)>,
    horizons: Vec<i64>,
    halt: bool,
    failed: bool,
    events_delta: u64,
    events_total: u64,
    last_progress: Option<Instant>,
}

/// Shared state of the synchronization protocol for one machine.
pub(crate) struct SyncState {
    workers: usize,
    end_ticks: i64,
    matrix: LookaheadMatrix,
    my_gids: std::ops::Range<usize>,
    transport: Option<TransportHandle>,
    mailboxes: Arc<Mailboxes>,
    /// Inbound frame routing: channel name to `(machine-local timeline,
    /// input channel slot)`.
    remote_resolve: HashMap<String, (usize, usize)>,
    registry: Arc<EventRegistry>,
    progress_interval: Duration,
    inner: Mutex<Inner>,
    cv: Condvar,
    error: Mutex<Option<SimError>>,
}

impl SyncState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        workers: usize,
        n_global: usize,
        end_time: VirtualTime,
        matrix: LookaheadMatrix,
        my_gids: std::ops::Range<usize>,
        transport: Option<TransportHandle>,
        mailboxes: Arc<Mailboxes>,
        remote_resolve: HashMap<String, (usize, usize)>,
        registry: Arc<EventRegistry>,
        progress_interval: Duration,
    ) -> Self {
        SyncState {
            workers,
            end_ticks: end_time.ticks(),
            matrix,
            my_gids,
            transport,
            mailboxes,
            remote_resolve,
            registry,
            progress_interval,
            inner: Mutex::new(Inner {
                epoch: 0,
                gate_count: 0,
                gate_gen: 0,
                reduce_count: 0,
                reduce_gen: 0,
                reports: vec![INF; n_global],
                frame_mins: vec![INF; n_global],
                outbound: Vec::new(),
                horizons: vec![INF; n_global],
                halt: false,
                failed: false,
                events_delta: 0,
                events_total: 0,
                last_progress: None,
            }),
            cv: Condvar::new(),
            error: Mutex::new(None),
        }
    }

    /// Record a fatal error and release every waiting worker.
    pub fn fail(&self, err: SimError) {
        {
            let mut slot = self.error.lock().unwrap();
            if slot.is_none() {
                *slot = Some(err);
            }
        }
        let mut inner = self.inner.lock().unwrap();
        inner.failed = true;
        inner.halt = true;
        self.cv.notify_all();
    }

    /// Take the first recorded error, if any.
    pub fn take_error(&self) -> Option<SimError> {
        self.error.lock().unwrap().take()
    }

    /// Epochs executed and total dispatches, for the run summary.
    pub fn totals(&self) -> (u64, u64) {
        let inner = self.inner.lock().unwrap();
        (inner.epoch, inner.events_total + inner.events_delta)
    }

    /// Phase A: plain rendezvous. Returns false when the run should stop.
    pub fn rendezvous(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.failed {
            return false;
        }
        inner.gate_count += 1;
        if inner.gate_count == self.workers {
            inner.gate_count = 0;
            inner.gate_gen += 1;
            self.cv.notify_all();
        } else {
            let gen_ = inner.gate_gen;
            while inner.gate_gen == gen_ && !inner.failed {
                inner = self.cv.wait(inner).unwrap();
            }
        }
        !inner.failed
    }

    /// Phase B: deposit reports and outbound remote traffic; the last
    /// arriver coordinates the exchange and horizon computation.
    pub fn reduce(
        &self,
        local_reports: &[(usize, i64)],
        outbound: Vec<(usize, WireSection)>,
        frame_mins: &[(usize, i64)],
        events_delta: u64,
    ) -> Verdict {
        let mut inner = self.inner.lock().unwrap();
        if inner.failed {
            return Verdict::Halt;
        }
        for &(gid, report) in local_reports {
            inner.reports[gid] = report;
        }
        for &(gid, min) in frame_mins {
            inner.frame_mins[gid] = inner.frame_mins[gid].min(min);
        }
        inner.outbound.extend(outbound);
        inner.events_delta += events_delta;
        inner.reduce_count += 1;

        if inner.reduce_count < self.workers {
            let gen_ = inner.reduce_gen;
            while inner.reduce_gen == gen_ && !inner.failed {
                inner = self.cv.wait(inner).unwrap();
            }
            if inner.failed || inner.halt {
                return Verdict::Halt;
            }
            return Verdict::Continue(inner.horizons.clone());
        }

        // Coordinator path. Peers' workers are parked on the condvar; holding
        // the lock through the exchange is fine.
        if let Err(err) = self.coordinate(&mut inner) {
            drop(inner);
            self.fail(err);
            return Verdict::Halt;
        }

        let verdict = if inner.halt {
            Verdict::Halt
        } else {
            Verdict::Continue(inner.horizons.clone())
        };
        inner.reduce_count = 0;
        inner.reduce_gen += 1;
        inner.epoch += 1;
        inner.events_total += inner.events_delta;
        inner.events_delta = 0;
        for r in inner.reports.iter_mut() {
            *r = INF;
        }
        for m in inner.frame_mins.iter_mut() {
            *m = INF;
        }
        self.cv.notify_all();
        verdict
    }

    fn coordinate(&self, inner: &mut Inner) -> Result<(), SimError> {
        if let Some(transport) = &self.transport {
            self.exchange_with_peers(inner, transport)?;
        }
        for gid in 0..inner.reports.len() {
            inner.reports[gid] = inner.reports[gid].min(inner.frame_mins[gid]);
        }
        let gvt = inner.reports.iter().copied().min().unwrap_or(INF);
        if gvt > self.end_ticks {
            inner.halt = true;
        } else {
            inner.horizons = self.matrix.relax(&inner.reports);
        }

        let due = inner
            .last_progress
            .is_none_or(|at| at.elapsed() >= self.progress_interval);
        if due {
            info!(
                "epoch {}: gvt {}, {} events dispatched",
                inner.epoch,
                VirtualTime::from_ticks(gvt.min(self.end_ticks)),
                inner.events_total + inner.events_delta,
            );
            inner.last_progress = Some(Instant::now());
        } else {
            debug!("epoch {}: gvt {}", inner.epoch, VirtualTime::from_ticks(gvt));
        }
        Ok(())
    }

    /// One send and one receive per peer: reports, in-flight frame minimums,
    /// and the event sections addressed to each machine.
    fn exchange_with_peers(
        &self,
        inner: &mut Inner,
        transport: &TransportHandle,
    ) -> Result<(), SimError> {
        let machines = transport.num_machines();
        let me = transport.machine_index();

        let reports: Vec<(u32, i64)> = self
            .my_gids
            .clone()
            .map(|gid| (gid as u32, inner.reports[gid]))
            .collect();
        let frame_mins: Vec<(u32, i64)> = inner
            .frame_mins
            .iter()
            .enumerate()
            .filter(|&(_, &m)| m != INF)
            .map(|(gid, &m)| (gid as u32, m))
            .collect();

        let mut per_machine: Vec<Vec<WireSection>> = (0..machines).map(|_| Vec::new()).collect();
        for (machine, section) in inner.outbound.drain(..) {
            per_machine[machine].push(section);
        }

        let mut outbound = Vec::with_capacity(machines - 1);
        for (peer, sections) in per_machine.into_iter().enumerate() {
            if peer == me {
                debug_assert!(sections.is_empty());
                continue;
            }
            let msg = EpochMessage {
                epoch: inner.epoch,
                reports: reports.clone(),
                frame_mins: frame_mins.clone(),
                sections,
            };
            outbound.push((peer, encode_epoch_message(&msg)));
        }

        let inbound = transport.exchange(outbound)?;
        for (peer, buf) in inbound {
            let msg = decode_epoch_message(&buf)?;
            if msg.epoch != inner.epoch {
                return Err(SimError::Transport(TransportError::Codec {
                    detail: format!(
                        "peer {} at epoch {}, expected {}",
                        peer, msg.epoch, inner.epoch
                    ),
                }));
            }
            for (gid, report) in msg.reports {
                inner.reports[gid as usize] = report;
            }
            for (gid, min) in msg.frame_mins {
                let slot = &mut inner.frame_mins[gid as usize];
                *slot = (*slot).min(min);
            }
            for section in msg.sections {
                self.deliver_section(section)?;
            }
        }
        Ok(())
    }

    fn deliver_section(&self, section: WireSection) -> Result<(), SimError> {
        if section.frames.is_empty() {
            return Ok(());
        }
        let mut per_timeline: HashMap<usize, Vec<LocalMsg>> = HashMap::new();
        for frame in section.frames {
            let WireFrame {
                type_id,
                deliver_ticks,
                tiebreak,
                name,
                payload,
            } = frame;
            let &(timeline, ic_slot) =
                self.remote_resolve
                    .get(&name)
                    .ok_or(SimError::Transport(TransportError::UnknownChannel {
                        name: name.clone(),
                    }))?;
            let event = self.registry.unpack(type_id, &payload)?;
            let deliver_at = VirtualTime::from_ticks(deliver_ticks);
            per_timeline.entry(timeline).or_default().push(LocalMsg {
                seq: tiebreak,
                ic_slot,
                sent_at: deliver_at,
                deliver_at,
                payload: event,
            });
        }
        for (timeline, msgs) in per_timeline {
            self.mailboxes[timeline].lock().unwrap().push(Batch {
                src_gid: section.src_gid as usize,
                msgs,
            });
        }
        Ok(())
    }
}

/// Pack one timeline's remote outbox into wire sections, per destination
/// machine, and collect per-destination-timeline frame minimums.
pub(crate) fn sections_from_outbox(
    src_gid: usize,
    taken: Vec<(usize, Vec<RemoteMsg>)>,
    dst_gids: &HashMap<(usize, String), usize>,
) -> (Vec<(usize, WireSection)>, Vec<(usize, i64)>) {
    let mut sections = Vec::new();
    let mut mins: HashMap<usize, i64> = HashMap::new();
    for (machine, msgs) in taken {
        let mut frames = Vec::with_capacity(msgs.len());
        for msg in msgs {
            if let Some(&dst_gid) = dst_gids.get(&(machine, msg.name.to_string())) {
                let entry = mins.entry(dst_gid).or_insert(INF);
                *entry = (*entry).min(msg.deliver_at.ticks());
            }
            frames.push(WireFrame {
                type_id: msg.type_id,
                deliver_ticks: msg.deliver_at.ticks(),
                tiebreak: msg.seq,
                name: msg.name.to_string(),
                payload: msg.payload,
            });
        }
        sections.push((
            machine,
            WireSection {
                src_gid: src_gid as u32,
                frames,
            },
        ));
    }
    (sections, mins.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relax_two_timelines() {
        // Lookahead 10 each way. Timeline 1's horizon is the direct-peer
        // formula; timeline 0's is tightened by the bounce path 0 -> 1 -> 0
        // (an arrival at 1 as early as 110 can come back by 120, well before
        // 1's own queue top at 200 would).
        let m = LookaheadMatrix::new(2, vec![(0, 1, 10), (1, 0, 10)]);
        let horizons = m.relax(&[100, 200]);
        assert_eq!(horizons, vec![120, 110]);
    }

    #[test]
    fn test_relax_transitive_cascade() {
        // S -(1)-> T -(1)-> U: U's horizon must see S's report through T,
        // not just T's own (infinite) report.
        let m = LookaheadMatrix::new(3, vec![(0, 1, 1), (1, 2, 1)]);
        let horizons = m.relax(&[10, INF, INF]);
        assert_eq!(horizons[1], 11);
        assert_eq!(horizons[2], 12);
        // Nothing reaches S.
        assert_eq!(horizons[0], INF);
    }

    #[test]
    fn test_relax_cycle_converges() {
        let m = LookaheadMatrix::new(3, vec![(0, 1, 5), (1, 2, 5), (2, 0, 5)]);
        let horizons = m.relax(&[0, 0, 0]);
        assert_eq!(horizons, vec![5, 5, 5]);
    }

    #[test]
    fn test_relax_with_infinite_reports() {
        let m = LookaheadMatrix::new(2, vec![(0, 1, 3)]);
        let horizons = m.relax(&[INF, 7]);
        assert_eq!(horizons, vec![INF, INF]);
    }

    #[test]
    fn test_matrix_keeps_pair_minimum() {
        let m = LookaheadMatrix::new(2, vec![(0, 1, 9), (0, 1, 4), (0, 1, 6)]);
        assert_eq!(m.edges(), &[(0, 1, 4)]);
    }

    #[test]
    fn test_barrier_two_workers_reach_verdict() {
        let mailboxes: Arc<Mailboxes> = Arc::new(Vec::new());
        let sync = Arc::new(SyncState::new(
            2,
            2,
            VirtualTime::from_ticks(1_000),
            LookaheadMatrix::new(2, vec![(0, 1, 10), (1, 0, 10)]),
            0..2,
            None,
            mailboxes,
            HashMap::new(),
            Arc::new(EventRegistry::new()),
            Duration::from_secs(3600),
        ));

        let peer = Arc::clone(&sync);
        let other = std::thread::spawn(move || {
            assert!(peer.rendezvous());
            match peer.reduce(&[(1, 500)], Vec::new(), &[], 3) {
                Verdict::Continue(h) => h,
                Verdict::Halt => panic!("unexpected halt"),
            }
        });

        assert!(sync.rendezvous());
        let horizons = match sync.reduce(&[(0, 100)], Vec::new(), &[], 5) {
            Verdict::Continue(h) => h,
            Verdict::Halt => panic!("unexpected halt"),
        };
        let peer_horizons = other.join().unwrap();
        assert_eq!(horizons, peer_horizons);
        assert_eq!(horizons, vec![120, 110]);
    }

    #[test]
    fn test_barrier_halts_past_end_time() {
        let sync = SyncState::new(
            1,
            1,
            VirtualTime::from_ticks(100),
            LookaheadMatrix::new(1, vec![]),
            0..1,
            None,
            Arc::new(Vec::new()),
            HashMap::new(),
            Arc::new(EventRegistry::new()),
            Duration::from_secs(3600),
        );
        assert!(matches!(
            sync.reduce(&[(0, 101)], Vec::new(), &[], 0),
            Verdict::Halt
        ));
    }

    #[test]
    fn test_frame_min_folds_into_reports() {
        // A timeline with an empty queue (INF report) still bounds the run
        // when a frame addressed to it is in flight.
        let sync = SyncState::new(
            1,
            2,
            VirtualTime::from_ticks(1_000),
            LookaheadMatrix::new(2, vec![(1, 0, 10)]),
            0..2,
            None,
            Arc::new(Vec::new()),
            HashMap::new(),
            Arc::new(EventRegistry::new()),
            Duration::from_secs(3600),
        );
        match sync.reduce(&[(0, INF), (1, INF)], Vec::new(), &[(1, 50)], 0) {
            Verdict::Continue(h) => assert_eq!(h[0], 60),
            Verdict::Halt => panic!("unexpected halt"),
        }
    }

    #[test]
    fn test_fail_releases_and_halts() {
        let sync = SyncState::new(
            1,
            1,
            VirtualTime::from_ticks(100),
            LookaheadMatrix::new(1, vec![]),
            0..1,
            None,
            Arc::new(Vec::new()),
            HashMap::new(),
            Arc::new(EventRegistry::new()),
            Duration::from_secs(3600),
        );
        sync.fail(SimError::NotRunning);
        assert!(!sync.rendezvous());
        assert!(matches!(
            sync.reduce(&[(0, 0)], Vec::new(), &[], 0),
            Verdict::Halt
        ));
        assert!(matches!(sync.take_error(), Some(SimError::NotRunning)));
    }
}
