//! cluster-pipe-sim: replay a file to every node of a cluster.
//!
//! Every node opens the same file through `open_file`. Only the master reads
//! the disk; slaves receive its bytes through the multiplexer. Each node
//! prints the SHA-256 of what it read, then all nodes meet at a barrier and
//! agree on the total byte count with a gather.
//!
//! In the default simulated mode all nodes run as threads of this process
//! over a lossy in-memory network. With `--udp-node N` this process is node N
//! of a real UDP cluster described by the config file.

mod config;
mod input_gen;

use clap::Parser;
use cluster_pipe_core::{open_file, ClusterConfig, GatherOp, LoopbackNetwork, Multiplexer, OpenMode};
use config::{Args, Config, RunMode};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;
use tracing::{error, info};

/// What one node observed.
#[derive(Debug)]
struct NodeReport {
    node_index: usize,
    bytes_read: u64,
    digest: String,
    total_bytes: u64,
}

fn exit_err(msg: impl std::fmt::Display) -> ! {
    eprintln!("{msg}");
    std::process::exit(1);
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cluster_pipe=info".into()),
        )
        .init();

    let args = Args::parse();

    // --config-template: dump defaults and exit
    if args.config_template {
        match config::template() {
            Ok(toml) => {
                println!("{toml}");
                std::process::exit(0);
            }
            Err(e) => exit_err(e),
        }
    }

    let config = Config::from_args(&args).unwrap_or_else(|e| exit_err(format!("error: {e}")));
    if config.print_config {
        config.print();
    }

    let (input, _scratch) = prepare_input(&config);
    info!(path = %input.display(), "replaying input");

    let reports = match config.mode {
        RunMode::Simulated => run_simulated(&config, &input),
        RunMode::Udp { .. } => vec![run_udp(&config, &input)],
    };

    let mut digests = Vec::new();
    for report in &reports {
        match report {
            Ok(report) => {
                println!(
                    "node {}: {} bytes, sha256 {}, cluster total {}",
                    report.node_index, report.bytes_read, report.digest, report.total_bytes
                );
                digests.push(report.digest.clone());
            }
            Err(e) => error!(error = %e, "node failed"),
        }
    }

    let failed = reports.iter().any(Result::is_err);
    digests.dedup();
    if failed || digests.len() > 1 {
        exit_err("nodes disagree on the replayed data");
    }
}

/// Pick the input file, generating a sample in a scratch directory when
/// none was given. The scratch directory lives as long as the returned guard.
fn prepare_input(config: &Config) -> (PathBuf, Option<TempDir>) {
    if let Some(path) = &config.input_file {
        return (path.clone(), None);
    }

    let dir = tempfile::Builder::new()
        .prefix("cluster-pipe-sim-")
        .tempdir()
        .unwrap_or_else(|e| exit_err(format!("error: {e}")));
    let path = dir.path().join("sample.bin");
    // UDP slaves never open the file
    if config.cluster.is_master() || config.mode == RunMode::Simulated {
        input_gen::write_sample_file(&path, config.seed, config.sample_bytes)
            .unwrap_or_else(|e| exit_err(format!("failed to write sample: {e}")));
    }
    (path, Some(dir))
}

fn run_simulated(config: &Config, input: &Path) -> Vec<cluster_pipe_core::Result<NodeReport>> {
    let num_nodes = config.cluster.num_nodes;
    let network = LoopbackNetwork::new(num_nodes, config.network);

    let handles: Vec<_> = (0..num_nodes)
        .map(|node_index| {
            let endpoint = network.endpoint(node_index);
            let cluster = ClusterConfig {
                node_index,
                ..config.cluster.clone()
            };
            let input = input.to_path_buf();
            let print_metrics = config.print_metrics;
            thread::Builder::new()
                .name(format!("node-{}", node_index))
                .spawn(move || {
                    let mux = Multiplexer::new(cluster, endpoint)?;
                    run_node(&mux, &input, print_metrics)
                })
        })
        .collect();

    let reports = handles
        .into_iter()
        .map(|spawned| match spawned {
            Ok(handle) => handle
                .join()
                .unwrap_or_else(|_| exit_err("node thread panicked")),
            Err(e) => Err(e.into()),
        })
        .collect();

    let stats = network.stats();
    info!(
        sent = stats.datagrams_sent,
        dropped = stats.datagrams_dropped,
        loss = %format!("{:.2}%", stats.loss_rate() * 100.0),
        "simulated network finished"
    );
    reports
}

fn run_udp(config: &Config, input: &Path) -> cluster_pipe_core::Result<NodeReport> {
    let mux = Multiplexer::with_udp(config.cluster.clone())?;
    run_node(&mux, input, config.print_metrics)
}

/// The program every node runs in lock-step.
fn run_node(
    mux: &Arc<Multiplexer>,
    input: &Path,
    print_metrics: bool,
) -> cluster_pipe_core::Result<NodeReport> {
    let mut file = open_file(Some(mux), input, OpenMode::ReadOnly)?;

    let mut hasher = Sha256::new();
    let mut buf = [0u8; 4096];
    let mut bytes_read = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        bytes_read += n as u64;
    }
    let digest = format!("{:x}", hasher.finalize());

    let channel = file
        .channel()
        .ok_or_else(|| cluster_pipe_core::Error::Config("file is not shared".into()))?;
    channel.barrier()?;
    let total_bytes = channel.cluster_pipe().gather(bytes_read, GatherOp::Sum)?;

    if print_metrics {
        mux.stats().print_summary(mux.node_index());
    }

    Ok(NodeReport {
        node_index: mux.node_index(),
        bytes_read,
        digest,
        total_bytes,
    })
}
