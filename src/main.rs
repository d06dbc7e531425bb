// SPDX-License-Identifier: Apache-2.0

//! The pktflow daemon.
//!
//! Loads a pipeline spec, brings the dataplane up (pools → workers →
//! modules → classes → tasks), resumes the workers, and runs until the
//! configured duration elapses (or forever), optionally logging per-second
//! throughput.

use clap::Parser;
use pktflow_config::PipelineSpec;
use pktflow_engine::Pipeline;
use pktflow_engine::worker::exclude_cores_from_master;
use pktflow_modules::default_registry;
use pktflow_sched::Resource;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "pktflowd", about = "Modular packet-processing dataplane")]
struct Args {
    /// Pipeline spec (YAML).
    #[arg(short, long)]
    config: PathBuf,

    /// Seconds to run before a graceful teardown; 0 runs forever.
    #[arg(short, long, default_value_t = 0)]
    duration: u64,

    /// Log per-second dataplane statistics.
    #[arg(short, long)]
    stats: bool,

    /// Log filter (overridden by RUST_LOG).
    #[arg(long, default_value = "info")]
    log: String,
}

fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log)),
        )
        .init();

    if let Err(e) = run(&args) {
        tracing::error!(error = %e, "daemon.failed");
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let spec = PipelineSpec::from_yaml_file(&args.config)?;
    tracing::info!(
        config = %args.config.display(),
        workers = spec.workers.len(),
        modules = spec.modules.len(),
        "daemon.start"
    );

    let pipeline = Pipeline::new(default_registry());
    pipeline.apply_spec(&spec)?;

    // The master thread stays off the worker cores; it only does control
    // work and stats.
    let worker_cores: Vec<u32> = spec.workers.iter().map(|w| w.core).collect();
    if let Err(e) = exclude_cores_from_master(&worker_cores) {
        tracing::warn!(error = %e, "daemon.master_affinity_failed");
    }

    pipeline.resume_all();
    tracing::info!("daemon.running");

    let started = std::time::Instant::now();
    let mut last_usage: std::collections::HashMap<String, u64> = std::collections::HashMap::new();
    loop {
        std::thread::sleep(Duration::from_secs(1));

        if args.stats {
            for tc in pipeline.get_tc_stats() {
                let packets = tc.usage[Resource::Packets.index()];
                let delta = packets - last_usage.get(&tc.name).copied().unwrap_or(0);
                let _ = last_usage.insert(tc.name.clone(), packets);
                if delta > 0 || tc.cnt_throttled > 0 {
                    tracing::info!(
                        tc = %tc.name,
                        wid = tc.wid,
                        pps = delta,
                        throttled = tc.cnt_throttled,
                        "stats.tc"
                    );
                }
            }
            for worker in pipeline.list_workers() {
                tracing::debug!(
                    wid = worker.wid,
                    status = %worker.status,
                    silent_drops = worker.silent_drops,
                    "stats.worker"
                );
            }
        }

        if args.duration > 0 && started.elapsed() >= Duration::from_secs(args.duration) {
            break;
        }
    }

    tracing::info!("daemon.stopping");
    pipeline.pause_all();
    pipeline.destroy_workers();
    Ok(())
}
