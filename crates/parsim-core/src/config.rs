//! Kernel configuration.

use std::time::Duration;

use crate::error::SetupError;

/// Options governing a simulation run. Lives from kernel construction to
/// `finalize()`.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of machines participating in the run.
    pub machines: usize,
    /// This machine's rank in `0..machines`.
    pub machine_index: usize,
    /// Worker threads on this machine. Timelines are statically assigned to
    /// workers round-robin.
    pub workers_per_machine: usize,
    /// Seed for the kernel's internal random streams (per-timeline streams
    /// exposed through the context derive from it deterministically).
    pub seed: u64,
    /// Upper bound on wall-clock time between synchronization barriers while
    /// a paced timeline is sleeping.
    pub sync_interval: Duration,
    /// How often to emit progress telemetry through `log`.
    pub progress_interval: Duration,
    /// Rate at which virtual time may overtake wall clock for non-emulated
    /// timelines. `f64::INFINITY` (the default) means as fast as possible;
    /// emulated timelines always pace 1:1.
    pub speed: f64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            machines: 1,
            machine_index: 0,
            workers_per_machine: 1,
            seed: 1,
            sync_interval: Duration::from_millis(10),
            progress_interval: Duration::from_secs(5),
            speed: f64::INFINITY,
        }
    }
}

impl Config {
    pub(crate) fn validate(&self) -> Result<(), SetupError> {
        if self.machines == 0 {
            return Err(SetupError::InvalidConfig {
                reason: "machines must be at least 1".into(),
            });
        }
        if self.machine_index >= self.machines {
            return Err(SetupError::InvalidConfig {
                reason: format!(
                    "machine_index {} out of range for {} machine(s)",
                    self.machine_index, self.machines
                ),
            });
        }
        if self.workers_per_machine == 0 {
            return Err(SetupError::InvalidConfig {
                reason: "workers_per_machine must be at least 1".into(),
            });
        }
        if !(self.speed > 0.0) {
            return Err(SetupError::InvalidConfig {
                reason: format!("speed must be positive, got {}", self.speed),
            });
        }
        Ok(())
    }
}
