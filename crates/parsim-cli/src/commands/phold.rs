//! `parsim phold` — run the PHOLD benchmark and print throughput figures.

use parsim_models::phold::{self, PholdParams};

use super::common::{self, RunOpts};

#[allow(clippy::too_many_arguments)]
pub fn run(
    queues: usize,
    radius: usize,
    branching: usize,
    delay: &str,
    mean_service: &str,
    init_jobs: f64,
    groups: usize,
    end: &str,
    opts: RunOpts,
) -> Result<(), String> {
    let params = PholdParams {
        queues,
        radius,
        branching,
        delay: common::parse_time("--delay", delay)?,
        mean_service: common::parse_time("--mean-service", mean_service)?,
        init_jobs,
        groups,
    };
    let end = common::parse_time("--end", end)?;
    if queues < opts.machines {
        return Err(format!(
            "{queues} queue(s) cannot be split across {} machine(s)",
            opts.machines
        ));
    }

    let results = common::run_spmd(
        &opts,
        end,
        |sim| phold::build(sim, &params).map_err(|e| e.to_string()),
        |sim, handles| phold::total_serviced(sim, handles),
    )?;

    let serviced: u64 = results.iter().map(|&(_, s)| s).sum();
    let wall = results[0].0.wall_seconds;
    common::print_summary(
        &format!(
            "PHOLD: {} queue(s), branching {}, lookahead {}",
            params.queues, params.branching, params.delay
        ),
        &results[0].0,
    );
    println!("\nTotal jobs serviced: {serviced}");
    println!(
        "Event density (jobs per simulated second): {:.3}",
        serviced as f64 / end.as_seconds()
    );
    println!(
        "Processing rate (jobs per wall-clock second): {:.0}",
        serviced as f64 / wall
    );

    if let Some(path) = &opts.output {
        let value = serde_json::json!({
            "model": "phold",
            "queues": params.queues,
            "serviced": serviced,
            "summaries": results.iter().map(|(s, _)| s).collect::<Vec<_>>(),
        });
        common::write_output(path, &value)?;
    }
    Ok(())
}
