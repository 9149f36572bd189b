//! `parsim echo` — ping the emulated ring from a wall-clock thread.

use std::time::Duration;

use parsim_core::Kernel;
use parsim_models::echo::{self, EchoEvent, EchoParams};

use super::common::{self, RunOpts};

pub fn run(
    nodes: usize,
    delay: &str,
    responsiveness: &str,
    pings: usize,
    ping_interval_ms: u64,
    end: &str,
    opts: RunOpts,
) -> Result<(), String> {
    if opts.machines > 1 {
        return Err("echo runs on a single machine".into());
    }
    let params = EchoParams {
        nodes,
        delay: common::parse_time("--delay", delay)?,
        responsiveness: common::parse_time("--responsiveness", responsiveness)?,
    };
    let end = common::parse_time("--end", end)?;

    let mut sim = Kernel::new(opts.config(0)).map_err(|e| e.to_string())?;
    let handles = echo::build(&mut sim, &params).map_err(|e| e.to_string())?;
    let endpoint = handles.endpoint.expect("single machine hosts node 0");
    let injector = sim.emulation_handle(endpoint).map_err(|e| e.to_string())?;

    let feeder = std::thread::spawn(move || {
        let mut delivered = 0usize;
        for _ in 0..pings {
            std::thread::sleep(Duration::from_millis(ping_interval_ms));
            if injector
                .insert_emulated_event(Box::new(EchoEvent::now()))
                .is_err()
            {
                break;
            }
            delivered += 1;
        }
        delivered
    });

    let summary = sim.start(end).map_err(|e| e.to_string())?;
    let injected = feeder.join().unwrap_or(0);
    let trips = echo::round_trips(&sim, &handles);
    sim.finalize();

    common::print_summary(
        &format!(
            "ECHO: {} node(s), delay {}, responsiveness {}",
            params.nodes, params.delay, params.responsiveness
        ),
        &summary,
    );
    println!("\nInjected {injected} event(s), {} returned", trips.len());
    if !trips.is_empty() {
        let wall_ms: Vec<f64> = trips.iter().map(|t| t.wall_ns as f64 / 1e6).collect();
        let min = wall_ms.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = wall_ms.iter().cloned().fold(0.0, f64::max);
        let avg = wall_ms.iter().sum::<f64>() / wall_ms.len() as f64;
        println!("Virtual round trip: {}", trips[0].virtual_elapsed);
        println!("Wall round trip: min {min:.3}ms, avg {avg:.3}ms, max {max:.3}ms");
    }

    if let Some(path) = &opts.output {
        let value = serde_json::json!({
            "model": "echo",
            "injected": injected,
            "returned": trips.len(),
            "wall_ns": trips.iter().map(|t| t.wall_ns).collect::<Vec<_>>(),
            "virtual_elapsed": trips.iter().map(|t| t.virtual_elapsed).collect::<Vec<_>>(),
            "summary": summary,
        });
        common::write_output(path, &value)?;
    }
    Ok(())
}
