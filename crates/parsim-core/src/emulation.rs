//! The emulation bridge: bounded-latency coupling to wall clock.
//!
//! This is the only component that reads wall-clock time. A run acquires a
//! [`RealtimeClock`] when it hosts emulated entities or a finite speed; the
//! clock maps elapsed wall time into virtual time at a configurable rate.
//! External threads inject events through an [`EmulationHandle`]; each
//! injection is stamped `virtual_now + responsiveness` and lands in the
//! target timeline's inbox, a multi-producer single-consumer queue drained
//! by the owning worker.

use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::error::SimError;
use crate::event::Event;
use crate::time::VirtualTime;

/// Wall clock reading in nanoseconds since the Unix epoch, for models that
/// stamp events with their injection time.
pub fn wallclock_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Maps wall-clock time into virtual time, anchored at `start()`.
#[derive(Debug)]
pub struct RealtimeClock {
    origin: Instant,
}

impl RealtimeClock {
    pub(crate) fn new() -> Self {
        RealtimeClock {
            origin: Instant::now(),
        }
    }

    /// Virtual time corresponding to wall clock now, at rate 1:1. Emulated
    /// timelines pace against this.
    pub fn virtual_now(&self) -> VirtualTime {
        VirtualTime::from_seconds(self.origin.elapsed().as_secs_f64())
    }

    /// Virtual time at a configured speed, for non-emulated pacing.
    pub fn virtual_now_at(&self, speed: f64) -> VirtualTime {
        if speed.is_infinite() {
            VirtualTime::INFINITY
        } else {
            VirtualTime::from_seconds(self.origin.elapsed().as_secs_f64() * speed)
        }
    }

    /// Wall-clock duration until virtual time `target` is reached at the
    /// given speed. Zero if already past.
    pub fn wall_until(&self, target: VirtualTime, speed: f64) -> Duration {
        let now = self.virtual_now_at(speed);
        if target <= now || speed.is_infinite() {
            return Duration::ZERO;
        }
        Duration::from_secs_f64((target - now).as_seconds() / speed)
    }
}

/// An injected event in flight toward an emulated timeline.
pub(crate) struct Injected {
    /// Timeline-local slot of the receiving entity.
    pub ent_slot: usize,
    pub deliver_at: VirtualTime,
    pub payload: Box<dyn Event>,
}

/// The receiving half of every injection handle targeting one timeline.
pub(crate) struct InjectionInbox {
    receivers: Vec<Receiver<Injected>>,
}

impl InjectionInbox {
    pub fn new(receivers: Vec<Receiver<Injected>>) -> Self {
        InjectionInbox { receivers }
    }

    /// Drain all pending injections without blocking. The worker's paced
    /// sleep is a poll loop over this, per the spin/sleep discipline.
    pub fn drain(&self) -> Vec<Injected> {
        let mut out = Vec::new();
        for rx in &self.receivers {
            while let Ok(injected) = rx.try_recv() {
                out.push(injected);
            }
        }
        out
    }
}

struct Armed {
    clock: Arc<RealtimeClock>,
    ent_slot: usize,
    responsiveness: VirtualTime,
}

struct HandleShared {
    tx: Sender<Injected>,
    armed: OnceLock<Armed>,
}

/// Cloneable injection handle for one emulated entity. Created before
/// `start()`, functional while the simulation runs.
#[derive(Clone)]
pub struct EmulationHandle {
    shared: Arc<HandleShared>,
}

impl EmulationHandle {
    pub(crate) fn new() -> (Self, Receiver<Injected>) {
        let (tx, rx) = channel();
        let handle = EmulationHandle {
            shared: Arc::new(HandleShared {
                tx,
                armed: OnceLock::new(),
            }),
        };
        (handle, rx)
    }

    pub(crate) fn arm(
        &self,
        clock: Arc<RealtimeClock>,
        ent_slot: usize,
        responsiveness: VirtualTime,
    ) {
        let _ = self.shared.armed.set(Armed {
            clock,
            ent_slot,
            responsiveness,
        });
    }

    /// Inject an event from outside the simulation. It is stamped with the
    /// virtual time corresponding to wall clock now plus the entity's
    /// responsiveness, and delivered through `Entity::emulate`.
    ///
    /// Fails with [`SimError::NotRunning`] before `start()` and after the
    /// run ends.
    pub fn insert_emulated_event(&self, payload: Box<dyn Event>) -> Result<(), SimError> {
        let armed = self.shared.armed.get().ok_or(SimError::NotRunning)?;
        let deliver_at = armed.clock.virtual_now() + armed.responsiveness;
        self.shared
            .tx
            .send(Injected {
                ent_slot: armed.ent_slot,
                deliver_at,
                payload,
            })
            .map_err(|_| SimError::NotRunning)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::BareEvent;

    #[test]
    fn test_clock_is_monotone() {
        let clock = RealtimeClock::new();
        let a = clock.virtual_now();
        let b = clock.virtual_now();
        assert!(b >= a);
    }

    #[test]
    fn test_clock_speed_scaling() {
        let clock = RealtimeClock::new();
        std::thread::sleep(Duration::from_millis(5));
        let slow = clock.virtual_now_at(0.5);
        let fast = clock.virtual_now_at(2.0);
        assert!(slow < fast);
        assert_eq!(clock.virtual_now_at(f64::INFINITY), VirtualTime::INFINITY);
    }

    #[test]
    fn test_wall_until_past_target_is_zero() {
        let clock = RealtimeClock::new();
        assert_eq!(clock.wall_until(VirtualTime::ZERO, 1.0), Duration::ZERO);
    }

    #[test]
    fn test_unarmed_handle_rejects_injection() {
        let (handle, _rx) = EmulationHandle::new();
        assert!(matches!(
            handle.insert_emulated_event(Box::new(BareEvent)),
            Err(SimError::NotRunning)
        ));
    }

    #[test]
    fn test_armed_handle_stamps_responsiveness() {
        let (handle, rx) = EmulationHandle::new();
        let clock = Arc::new(RealtimeClock::new());
        handle.arm(clock.clone(), 3, VirtualTime::MILLISECOND * 2);
        handle.insert_emulated_event(Box::new(BareEvent)).unwrap();
        let inbox = InjectionInbox::new(vec![rx]);
        let drained = inbox.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].ent_slot, 3);
        assert!(drained[0].deliver_at >= VirtualTime::MILLISECOND * 2);
        assert!(drained[0].deliver_at <= clock.virtual_now() + VirtualTime::MILLISECOND * 2);
    }

    #[test]
    fn test_injection_after_receiver_drop_fails() {
        let (handle, rx) = EmulationHandle::new();
        handle.arm(Arc::new(RealtimeClock::new()), 0, VirtualTime::ZERO);
        drop(rx);
        assert!(matches!(
            handle.insert_emulated_event(Box::new(BareEvent)),
            Err(SimError::NotRunning)
        ));
    }

    #[test]
    fn test_wallclock_nanos_advances() {
        let a = wallclock_nanos();
        std::thread::sleep(Duration::from_millis(1));
        let b = wallclock_nanos();
        assert!(b > a);
    }
}
