//! Configuration for the cluster-pipe-sim application.
//!
//! Settings are layered: built-in defaults, then an optional TOML file holding
//! a `ClusterConfig`, then command-line flags (or their environment variables).
//!
//! # Philosophy
//!
//! The tool should work with ZERO arguments. Unset network impairments are
//! drawn from a seeded generator and printed, so any run can be reproduced
//! with `--seed`.

use clap::Parser;
use cluster_pipe_core::{ClusterConfig, NetworkConfig};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to render template: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Parser)]
#[command(
    name = "cluster-pipe-sim",
    about = "replay a file from a master node to every node of a cluster"
)]
pub struct Args {
    /// path to a TOML file with cluster settings
    #[arg(short = 'c', long, env = "CLUSTER_PIPE_CONFIG")]
    pub config: Option<PathBuf>,

    /// print the default cluster settings as TOML and exit
    #[arg(long)]
    pub config_template: bool,

    /// file to replay (default: generate a sample)
    #[arg(long = "in")]
    pub input: Option<PathBuf>,

    /// size of the generated sample in bytes
    #[arg(long, default_value_t = 10 * 1024)]
    pub sample_bytes: usize,

    /// random seed for the sample and the network simulation
    #[arg(long, env = "CLUSTER_PIPE_SEED")]
    pub seed: Option<u64>,

    /// number of nodes, master included
    #[arg(short = 'n', long)]
    pub nodes: Option<usize>,

    /// run a single node of a real UDP cluster with this index
    /// (addresses come from the `nodes` list in the config file)
    #[arg(long)]
    pub udp_node: Option<usize>,

    /// link MTU in bytes
    #[arg(long)]
    pub mtu: Option<usize>,

    /// simulated base latency in milliseconds
    #[arg(long)]
    pub latency: Option<u64>,

    /// simulated latency jitter in milliseconds
    #[arg(long)]
    pub jitter: Option<u64>,

    /// simulated datagram loss rate, 0.0 - 1.0
    #[arg(long)]
    pub loss: Option<f64>,

    /// disable simulated loss (same as --loss 0)
    #[arg(long)]
    pub no_loss: bool,

    /// print the resolved configuration
    #[arg(long)]
    pub print_config: bool,

    /// don't print per-node statistics
    #[arg(long)]
    pub no_metrics: bool,
}

/// How the nodes talk to each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// All nodes as threads of this process over a simulated network
    Simulated,
    /// This process is one node of a UDP cluster
    Udp { node_index: usize },
}

/// Complete configuration for a run.
#[derive(Debug, Clone)]
pub struct Config {
    // === Data ===
    /// Input file path (None = generate sample)
    pub input_file: Option<PathBuf>,

    /// Size of the generated sample
    pub sample_bytes: usize,

    /// Seed for the sample and the simulated network
    pub seed: u64,

    // === Cluster ===
    /// Cluster settings shared by all nodes (node_index set per node)
    pub cluster: ClusterConfig,

    pub mode: RunMode,

    // === Network ===
    /// Simulation settings (simulated mode only)
    pub network: NetworkConfig,

    // === Behavior ===
    pub print_config: bool,

    pub print_metrics: bool,
}

/// The default cluster settings rendered as TOML.
pub fn template() -> Result<String, ConfigError> {
    Ok(toml::to_string_pretty(&ClusterConfig::default())?)
}

fn load_cluster_file(path: &Path) -> Result<ClusterConfig, ConfigError> {
    let display = path.display().to_string();
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: display.clone(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: display,
        source,
    })
}

impl Config {
    /// Resolve defaults, the config file and the command line.
    pub fn from_args(args: &Args) -> Result<Self, ConfigError> {
        let mut cluster = match &args.config {
            Some(path) => load_cluster_file(path)?,
            None => ClusterConfig::for_node(3, 0),
        };
        if let Some(nodes) = args.nodes {
            cluster.num_nodes = nodes;
        }
        if let Some(mtu) = args.mtu {
            cluster.mtu = mtu;
        }

        let mode = match args.udp_node {
            Some(node_index) => {
                if cluster.nodes.len() != cluster.num_nodes {
                    return Err(ConfigError::Invalid(format!(
                        "UDP mode needs {} node addresses in the config file, found {}",
                        cluster.num_nodes,
                        cluster.nodes.len()
                    )));
                }
                cluster.node_index = node_index;
                RunMode::Udp { node_index }
            }
            None => RunMode::Simulated,
        };
        cluster
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        // Determine seed (explicit or time-based)
        let seed = args.seed.unwrap_or_else(|| {
            use std::time::{SystemTime, UNIX_EPOCH};
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|elapsed| elapsed.as_millis() as u64)
                .unwrap_or(0)
        });

        // Generate defaults using seed
        let mut rng = ChaCha8Rng::seed_from_u64(seed);

        let loss_rate = if args.no_loss {
            0.0
        } else {
            args.loss.unwrap_or_else(|| {
                // Bias toward small loss rates
                let r: f64 = rng.gen();
                (r * r * 0.05).min(0.05)
            })
        };
        if !(0.0..=1.0).contains(&loss_rate) {
            return Err(ConfigError::Invalid(format!("loss rate {} not in 0.0 - 1.0", loss_rate)));
        }

        Ok(Config {
            input_file: args.input.clone(),
            sample_bytes: args.sample_bytes,
            seed,
            cluster,
            mode,
            network: NetworkConfig {
                base_latency_ms: args.latency.unwrap_or_else(|| rng.gen_range(0..=5)),
                jitter_ms: args.jitter.unwrap_or_else(|| rng.gen_range(0..=3)),
                loss_rate,
                seed,
            },
            print_config: args.print_config,
            print_metrics: !args.no_metrics,
        })
    }

    /// Print the configuration in human-readable form.
    pub fn print(&self) {
        println!("=== Configuration ===");
        match &self.input_file {
            Some(path) => println!("Input file: {}", path.display()),
            None => println!("Input file: (generate {} byte sample)", self.sample_bytes),
        }
        println!("Seed: {}", self.seed);
        println!();
        println!("=== Cluster ===");
        println!("Nodes: {}", self.cluster.num_nodes);
        match self.mode {
            RunMode::Simulated => println!("Mode: simulated (all nodes in this process)"),
            RunMode::Udp { node_index } => println!("Mode: UDP, node {}", node_index),
        }
        println!(
            "MTU: {} bytes ({} payload bytes per packet)",
            self.cluster.mtu,
            self.cluster.max_packet_size()
        );
        println!(
            "Retransmit timeout: {} ms, node timeout: {} ms",
            self.cluster.retransmit_timeout_ms, self.cluster.node_timeout_ms
        );
        println!();
        if self.mode == RunMode::Simulated {
            println!("=== Network Simulation ===");
            println!("Base latency: {} ms", self.network.base_latency_ms);
            println!("Jitter: ±{} ms", self.network.jitter_ms);
            println!("Loss rate: {:.2}%", self.network.loss_rate * 100.0);
            println!();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::parse_from(std::iter::once("cluster-pipe-sim").chain(args.iter().copied()))
    }

    #[test]
    fn test_zero_argument_defaults() {
        let config = Config::from_args(&parse(&["--seed", "7"])).unwrap();
        assert_eq!(config.cluster.num_nodes, 3);
        assert_eq!(config.mode, RunMode::Simulated);
        assert!(config.network.loss_rate <= 0.05);
        assert!(config.print_metrics);
    }

    #[test]
    fn test_seed_makes_defaults_reproducible() {
        let a = Config::from_args(&parse(&["--seed", "99"])).unwrap();
        let b = Config::from_args(&parse(&["--seed", "99"])).unwrap();
        assert_eq!(a.network, b.network);
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_args(&parse(&[
            "--seed", "1", "-n", "5", "--mtu", "1200", "--no-loss", "--latency", "3",
        ]))
        .unwrap();
        assert_eq!(config.cluster.num_nodes, 5);
        assert_eq!(config.cluster.mtu, 1200);
        assert_eq!(config.network.loss_rate, 0.0);
        assert_eq!(config.network.base_latency_ms, 3);
    }

    #[test]
    fn test_invalid_loss_rejected() {
        assert!(Config::from_args(&parse(&["--loss", "1.5"])).is_err());
    }

    #[test]
    fn test_udp_mode_needs_addresses() {
        assert!(matches!(
            Config::from_args(&parse(&["--udp-node", "1"])),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_config_file_and_template() {
        let text = template().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster.toml");
        std::fs::write(&path, text.replace("num_nodes = 1", "num_nodes = 4")).unwrap();

        let config = Config::from_args(&parse(&["-c", path.to_str().unwrap(), "--seed", "3"])).unwrap();
        assert_eq!(config.cluster.num_nodes, 4);
    }
}
