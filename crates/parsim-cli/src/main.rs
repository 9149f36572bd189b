//! CLI for parsim — run the demonstration models and print run statistics.

mod commands;

use clap::{Parser, Subcommand};

use commands::common::RunOpts;

#[derive(Parser)]
#[command(name = "parsim")]
#[command(about = "parsim — conservative parallel discrete-event simulation")]
#[command(version = parsim_core::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct CommonArgs {
    /// Worker threads per machine
    #[arg(long, default_value = "1")]
    workers: usize,

    /// In-process machines (exercises the cross-machine transport)
    #[arg(long, default_value = "1")]
    machines: usize,

    /// Seed for the kernel's internal random streams
    #[arg(long, default_value = "1")]
    seed: u64,

    /// Virtual-over-wall speed limit (e.g. "1.0" for realtime); unlimited by
    /// default
    #[arg(long)]
    speed: Option<f64>,

    /// Upper bound on wall-clock milliseconds between barriers
    #[arg(long, default_value = "10")]
    sync_interval_ms: u64,

    /// Progress telemetry period in seconds
    #[arg(long, default_value = "5")]
    progress_interval_s: u64,

    /// Write the run summary as JSON
    #[arg(long)]
    output: Option<String>,
}

impl CommonArgs {
    fn opts(&self) -> RunOpts {
        RunOpts {
            workers: self.workers,
            machines: self.machines,
            seed: self.seed,
            speed: self.speed,
            sync_interval_ms: self.sync_interval_ms,
            progress_interval_s: self.progress_interval_s,
            output: self.output.clone(),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Token ring: the smallest possible model
    Ring {
        /// Entities in the ring
        #[arg(long, default_value = "3")]
        nodes: usize,

        /// Per-hop channel delay (e.g. "1ns", "5ms")
        #[arg(long, default_value = "1ns")]
        delay: String,

        /// Simulation end time (e.g. "10ns", "1s")
        #[arg(long, default_value = "10ns")]
        end: String,

        #[command(flatten)]
        common: CommonArgs,
    },

    /// PHOLD: queues in a randomized ring, the classic PDES benchmark
    Phold {
        /// Total number of queues
        #[arg(long, default_value = "16")]
        queues: usize,

        /// Connection radius around each queue
        #[arg(long, default_value = "1")]
        radius: usize,

        /// Outgoing channels per queue (minimum 2)
        #[arg(long, default_value = "2")]
        branching: usize,

        /// Channel delay — the run's lookahead (e.g. "0.1s")
        #[arg(long, default_value = "0.1s")]
        delay: String,

        /// Mean exponential service time
        #[arg(long, default_value = "1s")]
        mean_service: String,

        /// Mean Poisson initial jobs per queue
        #[arg(long, default_value = "8.0")]
        init_jobs: f64,

        /// Alignment groups per machine (timelines hosting the queues)
        #[arg(long, default_value = "4")]
        groups: usize,

        /// Simulation end time
        #[arg(long, default_value = "1000s")]
        end: String,

        #[command(flatten)]
        common: CommonArgs,
    },

    /// Mux-tree: bounded buffers with overflow accounting
    Muxtree {
        /// Tree depth (root is level 0)
        #[arg(long, default_value = "2")]
        levels: usize,

        /// Children per multiplexer, sources per leaf
        #[arg(long, default_value = "4")]
        fanin: usize,

        /// Multiplexer buffer capacity
        #[arg(long, default_value = "8")]
        bufsize: usize,

        /// Mean source inter-arrival time
        #[arg(long, default_value = "1s")]
        inter_arrival: String,

        /// Mean multiplexer service time
        #[arg(long, default_value = "5s")]
        service: String,

        /// Per-hop transmission delay
        #[arg(long, default_value = "1s")]
        delay: String,

        /// Simulation end time
        #[arg(long, default_value = "100s")]
        end: String,

        #[command(flatten)]
        common: CommonArgs,
    },

    /// Emulated echo ring: wall-clock injections answered under a bound
    Echo {
        /// Ring size, including the emulated node
        #[arg(long, default_value = "4")]
        nodes: usize,

        /// Per-hop channel delay
        #[arg(long, default_value = "1ms")]
        delay: String,

        /// Responsiveness of the emulated node
        #[arg(long, default_value = "100us")]
        responsiveness: String,

        /// Number of events to inject
        #[arg(long, default_value = "10")]
        pings: usize,

        /// Wall-clock gap between injections, in milliseconds
        #[arg(long, default_value = "10")]
        ping_interval_ms: u64,

        /// Simulation end time (paced against wall clock)
        #[arg(long, default_value = "500ms")]
        end: String,

        #[command(flatten)]
        common: CommonArgs,
    },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Ring {
            nodes,
            delay,
            end,
            common,
        } => commands::ring::run(nodes, &delay, &end, common.opts()),
        Commands::Phold {
            queues,
            radius,
            branching,
            delay,
            mean_service,
            init_jobs,
            groups,
            end,
            common,
        } => commands::phold::run(
            queues,
            radius,
            branching,
            &delay,
            &mean_service,
            init_jobs,
            groups,
            &end,
            common.opts(),
        ),
        Commands::Muxtree {
            levels,
            fanin,
            bufsize,
            inter_arrival,
            service,
            delay,
            end,
            common,
        } => commands::muxtree::run(
            levels,
            fanin,
            bufsize,
            &inter_arrival,
            &service,
            &delay,
            &end,
            common.opts(),
        ),
        Commands::Echo {
            nodes,
            delay,
            responsiveness,
            pings,
            ping_interval_ms,
            end,
            common,
        } => commands::echo::run(
            nodes,
            &delay,
            &responsiveness,
            pings,
            ping_interval_ms,
            &end,
            common.opts(),
        ),
    };

    if let Err(message) = result {
        eprintln!("error: {message}");
        std::process::exit(1);
    }
}
