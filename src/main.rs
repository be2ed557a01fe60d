use std::fs::File;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use rayon::prelude::*;
use tracing_subscriber::EnvFilter;

use qnetsim::network::topology::{
    apply_perfect_hardware, attach_random_request_apps, populate_forwarding_tables,
};
use qnetsim::protocols::bb84::{run_distance_trial, Bb84TrialStats};
use qnetsim::report;
use qnetsim::simulation::{SimRng, Simulation, Time, SECOND};
use qnetsim::SimError;

#[derive(Parser)]
#[command(name = "qnetsim", version, about = "Discrete-event quantum network simulator")]
struct Cli {
    /// Seed for the deterministic random stream.
    #[arg(long, global = true, default_value_t = 1)]
    seed: u64,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run an entanglement-distribution experiment over a JSON topology.
    Run {
        /// Topology description (nodes, qchannels, cchannels).
        #[arg(long)]
        config: PathBuf,
        /// Virtual-time cap in picoseconds.
        #[arg(long, default_value_t = 10 * SECOND)]
        runtime: Time,
        /// Directory for the metrics CSVs.
        #[arg(long, default_value = "results")]
        out: PathBuf,
        /// Override all hardware to ideal parameters.
        #[arg(long)]
        perfect: bool,
    },
    /// BB84 error-rate sweep over fiber distance.
    Sweep {
        #[arg(long, default_value_t = 120.0)]
        max_distance_km: f64,
        /// Receiver dark count rate, Hz.
        #[arg(long, default_value_t = 425.0)]
        dark_count: f64,
        /// Pulses per key generation.
        #[arg(long, default_value_t = 20_000)]
        rounds: u32,
        #[arg(long, default_value = "results")]
        out: PathBuf,
    },
}

fn main() -> Result<(), SimError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            config,
            runtime,
            out,
            perfect,
        } => run_experiment(&config, runtime, cli.seed, &out, perfect),
        Command::Sweep {
            max_distance_km,
            dark_count,
            rounds,
            out,
        } => run_sweep(max_distance_km, dark_count, rounds, cli.seed, &out),
    }
}

fn run_experiment(
    config: &PathBuf,
    runtime: Time,
    seed: u64,
    out: &PathBuf,
    perfect: bool,
) -> Result<(), SimError> {
    let mut sim = Simulation::from_json_file(config, runtime, seed)?;
    populate_forwarding_tables(&mut sim.network)?;
    if perfect {
        apply_perfect_hardware(&mut sim.network);
    }
    attach_random_request_apps(&mut sim.network);
    sim.init()?;
    sim.run()?;

    std::fs::create_dir_all(out)?;
    report::write_request_csv(&sim.network, File::create(out.join("requests.csv"))?)?;
    report::write_memory_usage_csv(&sim.network, File::create(out.join("memory_usage.csv"))?)?;

    let stats = sim.timeline.stats();
    println!(
        "done: {} events executed, clock at {:.3} s",
        stats.executed,
        sim.timeline.now() as f64 / SECOND as f64
    );
    for node in &sim.network.nodes {
        let Some(state) = node.try_router() else {
            continue;
        };
        let Some(app) = state.app.as_ref() else {
            continue;
        };
        println!(
            "  {}: {}/{} requests accepted, throughputs {:?}",
            node.name,
            app.requests_accepted,
            app.requests_sent,
            app.get_throughput()
        );
    }
    println!("metrics written to {}", out.display());
    Ok(())
}

fn run_sweep(
    max_distance_km: f64,
    dark_count: f64,
    rounds: u32,
    seed: u64,
    out: &PathBuf,
) -> Result<(), SimError> {
    let mut distances = vec![1.0];
    let mut d = 10.0;
    while d <= max_distance_km {
        distances.push(d);
        d += 10.0;
    }

    // Each distance runs as an independent simulation on its own forked
    // stream, so the parallel schedule cannot perturb the results.
    let root = SimRng::seeded(seed);
    let results: Vec<Result<Bb84TrialStats, SimError>> = distances
        .par_iter()
        .map(|&km| {
            let trial_seed = root.fork(&format!("sweep/{km}km")).seed();
            run_distance_trial(km, 2e-4, dark_count, rounds, trial_seed)
        })
        .collect();

    std::fs::create_dir_all(out)?;
    let mut csv = csv::Writer::from_writer(File::create(out.join("bb84_sweep.csv"))?);
    csv.write_record(["distance_km", "error_rate", "throughput", "latency_s", "sifted_bits"])
        .map_err(SimError::from)?;
    println!("{:>12} {:>12} {:>14} {:>12} {:>12}", "distance", "error", "throughput", "latency", "sifted");
    for result in results {
        let stats = result?;
        csv.write_record([
            format!("{}", stats.distance_km),
            format!("{:.6}", stats.error_rate),
            format!("{:.3}", stats.throughput),
            format!("{:.6}", stats.latency_s),
            format!("{}", stats.sifted_bits),
        ])
        .map_err(SimError::from)?;
        println!(
            "{:>10}km {:>12.4} {:>14.2} {:>11.4}s {:>12}",
            stats.distance_km,
            stats.error_rate,
            stats.throughput,
            stats.latency_s,
            stats.sifted_bits
        );
    }
    csv.flush()?;
    println!("sweep written to {}", out.join("bb84_sweep.csv").display());
    Ok(())
}
