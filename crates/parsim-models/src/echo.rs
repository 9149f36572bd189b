//! Emulated echo ring: wall-clock injections answered under a bound.
//!
//! A ring of nodes with millisecond-scale channel delays; node 0 is
//! emulated. External threads inject [`EchoEvent`]s through an
//! `EmulationHandle`; the kernel stamps each injection with the wall-mapped
//! virtual time plus the node's responsiveness and hands it to
//! `Entity::emulate`, which launches it around the ring. When it comes back
//! to node 0's input channel, the node records the virtual round-trip
//! (exactly one ring lap of channel delays) and the wall-clock round-trip.

use std::any::Any;

use parsim_core::{
    EntityRef, Event, EventTypeId, Kernel, OutChannel, ProcedureFrame, ProcedureStep, SetupError,
    SimCtx, SimError, TransportError, VirtualTime, WaitRequest, wallclock_nanos,
};

/// Echo construction parameters.
#[derive(Debug, Clone)]
pub struct EchoParams {
    /// Ring size, including the emulated node.
    pub nodes: usize,
    /// Per-hop channel delay.
    pub delay: VirtualTime,
    /// Responsiveness of the emulated node.
    pub responsiveness: VirtualTime,
}

impl Default for EchoParams {
    fn default() -> Self {
        EchoParams {
            nodes: 4,
            delay: VirtualTime::MILLISECOND,
            responsiveness: VirtualTime::MICROSECOND * 100,
        }
    }
}

/// The injected event: wall-clock birth time, virtual launch time.
#[derive(Debug, Clone, PartialEq)]
pub struct EchoEvent {
    /// `wallclock_nanos()` at the injection site.
    pub born_wall_ns: u64,
    /// Virtual time at which node 0 launched it onto the ring.
    pub launched_at: VirtualTime,
}

impl EchoEvent {
    /// Registered wire tag.
    pub const TYPE_ID: EventTypeId = 2;

    /// A fresh event stamped with the current wall clock, for injectors.
    pub fn now() -> Self {
        EchoEvent {
            born_wall_ns: wallclock_nanos(),
            launched_at: VirtualTime::ZERO,
        }
    }

    pub fn unpack(payload: &[u8]) -> Result<Box<dyn Event>, TransportError> {
        if payload.len() != 16 {
            return Err(TransportError::Codec {
                detail: format!("echo payload is {} bytes, want 16", payload.len()),
            });
        }
        let born_wall_ns = u64::from_le_bytes(payload[0..8].try_into().unwrap());
        let launched = i64::from_le_bytes(payload[8..16].try_into().unwrap());
        Ok(Box::new(EchoEvent {
            born_wall_ns,
            launched_at: VirtualTime::from_ticks(launched),
        }))
    }
}

impl Event for EchoEvent {
    fn event_type(&self) -> EventTypeId {
        Self::TYPE_ID
    }
    fn clone_event(&self) -> Box<dyn Event> {
        Box::new(self.clone())
    }
    fn pack(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.born_wall_ns.to_le_bytes());
        buf.extend_from_slice(&self.launched_at.ticks().to_le_bytes());
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// One completed round trip.
#[derive(Debug, Clone, Copy)]
pub struct RoundTrip {
    /// Wall-clock nanoseconds from injection to return.
    pub wall_ns: u64,
    /// Virtual time from ring launch to return.
    pub virtual_elapsed: VirtualTime,
}

/// A ring member. Node 0 is the emulated endpoint and keeps the statistics.
pub struct EchoNode {
    pub id: usize,
    /// Ring output, filled in after channel construction.
    pub ring_out: Option<OutChannel>,
    /// Injections launched onto the ring (node 0 only).
    pub launched: u64,
    /// Completed round trips (node 0 only).
    pub round_trips: Vec<RoundTrip>,
}

impl parsim_core::Entity for EchoNode {
    fn emulate(&mut self, ctx: &mut SimCtx<'_>, event: Box<dyn Event>) {
        let born = match event.as_any().downcast_ref::<EchoEvent>() {
            Some(e) => e.born_wall_ns,
            None => {
                log::warn!("echo endpoint injected with a non-echo event; restamping");
                wallclock_nanos()
            }
        };
        let launch = EchoEvent {
            born_wall_ns: born,
            launched_at: ctx.now(),
        };
        self.launched += 1;
        if let Some(out) = self.ring_out {
            // A write on the node's own mapped output cannot fail.
            ctx.write(out, Box::new(launch)).expect("ring write failed");
        }
    }
}

struct EchoRelay {
    entry: u8,
    forward: OutChannel,
    terminus: bool,
}

impl ProcedureFrame for EchoRelay {
    fn resume(&mut self, ctx: &mut SimCtx<'_>) -> Result<ProcedureStep, SimError> {
        loop {
            match self.entry {
                0 => {
                    self.entry = 1;
                    return Ok(ProcedureStep::Suspend(WaitRequest::OnDefault));
                }
                _ => {
                    let event = ctx.take_active_event().expect("relay woken without event");
                    if self.terminus {
                        let now = ctx.now();
                        let echo = event
                            .as_any()
                            .downcast_ref::<EchoEvent>()
                            .expect("ring carries echo events");
                        let trip = RoundTrip {
                            wall_ns: wallclock_nanos().saturating_sub(echo.born_wall_ns),
                            virtual_elapsed: now - echo.launched_at,
                        };
                        ctx.owner_as_mut::<EchoNode>()
                            .expect("owner is an EchoNode")
                            .round_trips
                            .push(trip);
                    } else {
                        ctx.write(self.forward, event)?;
                    }
                    self.entry = 0;
                }
            }
        }
    }
}

/// Handles to this machine's share of the ring.
pub struct Echo {
    /// `(ring position, entity)` for locally built nodes.
    pub nodes: Vec<(usize, EntityRef)>,
    /// The emulated endpoint, when built on this machine.
    pub endpoint: Option<EntityRef>,
}

/// Populate the kernel with this machine's nodes (node `i` lives on machine
/// `i mod machines`). Obtain the injection handle from the returned
/// `endpoint` via `Kernel::emulation_handle`.
pub fn build(sim: &mut Kernel, params: &EchoParams) -> Result<Echo, SetupError> {
    sim.register_event(EchoEvent::TYPE_ID, EchoEvent::unpack)?;
    let machines = sim.num_machines();
    let me = sim.machine_index();

    let mut nodes = Vec::new();
    let mut endpoint = None;
    for id in (me..params.nodes).step_by(machines) {
        let node = EchoNode {
            id,
            ring_out: None,
            launched: 0,
            round_trips: Vec::new(),
        };
        let ent = if id == 0 {
            let ent = sim.emulated_entity(node, params.responsiveness)?;
            endpoint = Some(ent);
            ent
        } else {
            sim.entity(node)?
        };
        let ic = sim.input_channel(ent, &format!("ECHO_{id}"))?;
        let oc = sim.output_channel(ent, params.delay)?;
        sim.map_to(oc, &format!("ECHO_{}", (id + 1) % params.nodes), VirtualTime::ZERO)?;
        sim.entity_as_mut::<EchoNode>(ent)
            .expect("just added")
            .ring_out = Some(oc);

        let relay = sim.process(
            ent,
            &format!("echo_relay_{id}"),
            Box::new(EchoRelay {
                entry: 0,
                forward: oc,
                terminus: id == 0,
            }),
        )?;
        sim.waits_on(relay, &[ic])?;
        nodes.push((id, ent));
    }

    Ok(Echo { nodes, endpoint })
}

/// Round trips recorded by the emulated endpoint.
pub fn round_trips(sim: &Kernel, echo: &Echo) -> Vec<RoundTrip> {
    echo.endpoint
        .and_then(|ent| sim.entity_as::<EchoNode>(ent))
        .map(|node| node.round_trips.clone())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echo_event_round_trip() {
        let ev = EchoEvent {
            born_wall_ns: 123_456_789,
            launched_at: VirtualTime::MILLISECOND * 7,
        };
        let mut buf = Vec::new();
        ev.pack(&mut buf);
        let back = EchoEvent::unpack(&buf).unwrap();
        assert_eq!(back.as_any().downcast_ref::<EchoEvent>().unwrap(), &ev);
    }

    #[test]
    fn test_unpack_rejects_wrong_size() {
        assert!(EchoEvent::unpack(&[0; 15]).is_err());
        assert!(EchoEvent::unpack(&[0; 17]).is_err());
    }
}
