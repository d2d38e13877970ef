//! Command-line runner: builds a simulation from flags or a TOML
//! config file, runs a fixed number of rounds, and prints the final
//! status snapshot as JSON.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use quorumsim::{
    NetworkMode, ProtocolKind, RoundOutcome, SimConfig, Simulation,
};

#[derive(Parser, Debug)]
#[command(name = "simrun", about = "Consensus network simulator")]
struct Args {
    /// Consensus protocol: pbft, pos or poa
    #[arg(long, default_value = "pbft")]
    protocol: String,

    /// Number of nodes in the cluster
    #[arg(long, default_value_t = 4)]
    nodes: usize,

    /// Rounds to run before reporting
    #[arg(long, default_value_t = 10)]
    rounds: u64,

    /// Base one-way message delay in seconds
    #[arg(long, default_value_t = 0.1)]
    delay: f64,

    /// Delay mode: fixed or randomized
    #[arg(long, default_value = "fixed")]
    network_mode: String,

    /// Probability that a message is dropped
    #[arg(long, default_value_t = 0.0)]
    drop_rate: f64,

    /// Fraction of nodes behaving maliciously
    #[arg(long, default_value_t = 0.0)]
    malicious_ratio: f64,

    /// RNG seed; the same seed reproduces the same run
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// TOML config file; overrides all other flags
    #[arg(long)]
    config: Option<PathBuf>,
}

impl Args {
    fn into_config(self) -> Result<SimConfig> {
        if let Some(path) = &self.config {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            let config: SimConfig = toml::from_str(&raw)
                .with_context(|| format!("parsing config file {}", path.display()))?;
            return Ok(config);
        }

        let protocol = match self.protocol.as_str() {
            "pbft" => ProtocolKind::Pbft,
            "pos" | "proof_of_stake" => ProtocolKind::ProofOfStake,
            "poa" | "proof_of_authority" => ProtocolKind::ProofOfAuthority,
            other => bail!("unknown protocol {other:?}, expected pbft, pos or poa"),
        };
        let network_mode = match self.network_mode.as_str() {
            "fixed" => NetworkMode::Fixed,
            "randomized" => NetworkMode::Randomized,
            other => bail!("unknown network mode {other:?}, expected fixed or randomized"),
        };

        Ok(SimConfig::new(protocol)
            .with_nodes(self.nodes)
            .with_delay(self.delay)
            .with_network_mode(network_mode)
            .with_drop_rate(self.drop_rate)
            .with_malicious_ratio(self.malicious_ratio)
            .with_seed(self.seed))
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let rounds = args.rounds;
    let config = args.into_config()?;
    config.validate().context("invalid configuration")?;

    let mut sim = Simulation::new(config)?;
    for _ in 0..rounds {
        match sim.run_round()? {
            RoundOutcome::Finalized { block, view, .. } => {
                tracing::debug!(height = block.height, view, id = block.id, "finalized");
            }
            RoundOutcome::QuorumUnreachable { height, .. } => {
                tracing::warn!(height, "no quorum this round");
            }
        }
    }

    let snapshot = sim.status_snapshot(false);
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}
