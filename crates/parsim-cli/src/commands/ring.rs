//! `parsim ring` — run the token ring and print the visit trace.

use parsim_models::ring::{self, RingParams};

use super::common::{self, RunOpts};

pub fn run(nodes: usize, delay: &str, end: &str, opts: RunOpts) -> Result<(), String> {
    let params = RingParams {
        nodes,
        delay: common::parse_time("--delay", delay)?,
    };
    let end = common::parse_time("--end", end)?;

    let results = common::run_spmd(
        &opts,
        end,
        |sim| ring::build(sim, &params).map_err(|e| e.to_string()),
        |sim, handles| ring::visit_trace(sim, handles),
    )?;

    let mut visits: Vec<(parsim_core::VirtualTime, usize)> = Vec::new();
    for (_, trace) in &results {
        for (id, times) in trace {
            for &t in times {
                visits.push((t, *id));
            }
        }
    }
    visits.sort();
    for &(t, id) in &visits {
        println!("{t}: entity {id} got the token");
    }

    common::print_summary(&format!("RING: {} node(s)", params.nodes), &results[0].0);

    if let Some(path) = &opts.output {
        let value = serde_json::json!({
            "model": "ring",
            "nodes": params.nodes,
            "visits": visits
                .iter()
                .map(|&(t, id)| serde_json::json!({ "entity": id, "time": t }))
                .collect::<Vec<_>>(),
            "summaries": results.iter().map(|(s, _)| s).collect::<Vec<_>>(),
        });
        common::write_output(path, &value)?;
    }
    Ok(())
}
