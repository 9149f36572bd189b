//! Shared plumbing for the model subcommands.

use std::time::Duration;

use parsim_core::{Config, RunSummary, VirtualTime};

/// Options common to every subcommand.
#[derive(Debug, Clone)]
pub struct RunOpts {
    pub workers: usize,
    pub machines: usize,
    pub seed: u64,
    pub speed: Option<f64>,
    pub sync_interval_ms: u64,
    pub progress_interval_s: u64,
    pub output: Option<String>,
}

impl RunOpts {
    /// The kernel config for one machine rank.
    pub fn config(&self, machine_index: usize) -> Config {
        Config {
            machines: self.machines,
            machine_index,
            workers_per_machine: self.workers,
            seed: self.seed,
            sync_interval: Duration::from_millis(self.sync_interval_ms),
            progress_interval: Duration::from_secs(self.progress_interval_s),
            speed: self.speed.unwrap_or(f64::INFINITY),
        }
    }
}

/// Parse a user-supplied virtual time argument.
pub fn parse_time(label: &str, value: &str) -> Result<VirtualTime, String> {
    value
        .parse()
        .map_err(|e| format!("{label}: {e}"))
}

/// Print the per-run header and summary table.
pub fn print_summary(title: &str, summary: &RunSummary) {
    println!("\n{}", "=".repeat(60));
    println!("{title}");
    println!("{}", "=".repeat(60));
    println!("End time: {}", summary.end_time);
    println!(
        "Dispatched: {} events over {} epochs in {:.3}s wall",
        summary.events, summary.epochs, summary.wall_seconds
    );
    println!(
        "\n{:<10} {:>16} {:>8} {:>8} {:>8} {:>8}",
        "Timeline", "LVT", "Events", "Wakes", "Timers", "Injected"
    );
    println!("{}", "-".repeat(62));
    for tl in &summary.timelines {
        println!(
            "{:<10} {:>16} {:>8} {:>8} {:>8} {:>8}",
            tl.timeline,
            tl.final_lvt.to_string(),
            tl.stats.events,
            tl.stats.wakes,
            tl.stats.timers,
            tl.stats.injected
        );
    }
}

/// Run the same model SPMD-style on every machine rank: single-machine runs
/// stay on this thread, multi-machine runs get one thread per rank over an
/// in-process mesh. Returns `(summary, extracted stats)` in rank order.
pub fn run_spmd<H, T, FB, FX>(
    opts: &RunOpts,
    end: VirtualTime,
    build: FB,
    extract: FX,
) -> Result<Vec<(parsim_core::RunSummary, T)>, String>
where
    H: Send,
    T: Send,
    FB: Fn(&mut parsim_core::Kernel) -> Result<H, String> + Send + Sync,
    FX: Fn(&parsim_core::Kernel, &H) -> T + Send + Sync,
{
    use parsim_core::{Kernel, mesh};

    let one = |mut sim: Kernel| -> Result<(parsim_core::RunSummary, T), String> {
        let handles = build(&mut sim)?;
        let summary = sim.start(end).map_err(|e| e.to_string())?;
        let stats = extract(&sim, &handles);
        sim.finalize();
        Ok((summary, stats))
    };

    if opts.machines <= 1 {
        let sim = Kernel::new(opts.config(0)).map_err(|e| e.to_string())?;
        return Ok(vec![one(sim)?]);
    }

    let substrates = mesh(opts.machines);
    let one = &one;
    std::thread::scope(|scope| {
        let mut ranks = Vec::with_capacity(opts.machines);
        for (machine_index, substrate) in substrates.into_iter().enumerate() {
            let config = opts.config(machine_index);
            ranks.push(scope.spawn(move || {
                let sim = Kernel::with_substrate(config, Box::new(substrate))
                    .map_err(|e| e.to_string())?;
                one(sim)
            }));
        }
        ranks
            .into_iter()
            .map(|rank| {
                rank.join()
                    .map_err(|_| "machine thread panicked".to_string())?
            })
            .collect()
    })
}

/// Write the summary (plus model-specific extras) as JSON.
pub fn write_output(path: &str, value: &serde_json::Value) -> Result<(), String> {
    let body = serde_json::to_string_pretty(value).map_err(|e| e.to_string())?;
    std::fs::write(path, body).map_err(|e| format!("writing {path}: {e}"))?;
    println!("\nSummary written to {path}");
    Ok(())
}
