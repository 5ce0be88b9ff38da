//! `bootchain` command line.
//!
//! Usage:
//!   bootchain [--config <file>] [--state-dir <dir>] run <kver> [-c <chain>]... [-u <glob>]
//!   bootchain [--config <file>] [--state-dir <dir>] prune [-c <chain>]... [-k <kver>]

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use bootchain::chain::check_until;
use bootchain::config::DEFAULT_STATE_DIR;
use bootchain::{
    run_chains, Chain, ChainReport, Config, HostEnv, Pruner, Registry, RunOutcome, RunStore,
};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_ENV: &str = "BOOTCHAIN_LOG";
const DEFAULT_LOG_FILTER: &str = "bootchain=info";

#[derive(Parser)]
#[command(name = "bootchain", version, about = "Build, install and prune kernel boot artifacts")]
struct Cli {
    /// Configuration file (default: /etc/bootchain/config.toml)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Directory holding the recorded runs
    #[arg(long, global = true, value_name = "DIR", default_value = DEFAULT_STATE_DIR)]
    state_dir: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run chains for a kernel version
    Run {
        /// Kernel version to run the chains for
        kver: String,
        /// Run only this chain (repeatable)
        #[arg(short, long = "chain", value_name = "NAME")]
        chains: Vec<String>,
        /// Stop after the first link matching this glob; `prepare` stops
        /// before any link runs and keeps the scratch tree
        #[arg(short, long, value_name = "GLOB")]
        until: Option<String>,
    },
    /// Prune old runs and their installed files
    Prune {
        /// Prune only this chain (repeatable)
        #[arg(short, long = "chain", value_name = "NAME")]
        chains: Vec<String>,
        /// Prune exactly this kernel version instead of applying `keep`
        #[arg(short, long)]
        kver: Option<String>,
    },
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Run {
            kver,
            chains,
            until,
        } => run(&cli, kver, chains, until.as_deref()),
        Commands::Prune { chains, kver } => prune(&cli, chains, kver.as_deref()),
    }
}

fn init_logging() {
    let filter =
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load(cli: &Cli) -> Result<(Registry, Config, RunStore)> {
    let mut registry = Registry::builtin().context("registering built-in steps")?;
    let config = Config::load(cli.config.as_deref(), &mut registry)
        .context("loading configuration")?;
    let runs = RunStore::open(&cli.state_dir).with_context(|| {
        format!("opening run store in '{}'", cli.state_dir.display())
    })?;
    Ok((registry, config, runs))
}

fn run(cli: &Cli, kver: &str, names: &[String], until: Option<&str>) -> Result<()> {
    if let Some(until) = until {
        check_until(until)?;
    }
    let (mut registry, config, runs) = load(cli)?;
    let selected = config.select(names)?;
    let host = HostEnv::default();

    // Resolve every chain first: configuration problems stop everything
    // before the first step runs.
    let mut chains = Vec::with_capacity(selected.len());
    for chain in &selected {
        let resolved = Chain::new(kver, chain, &mut registry, &host)
            .with_context(|| format!("setting up chain '{}'", chain.name))?;
        chains.push(resolved);
    }

    let total = chains.len();
    let mut failed = Vec::new();
    for (name, result) in run_chains(chains, until, &mut registry, &runs) {
        let tag = format!("[run:{name}:{kver}]");
        match result {
            Ok(report) => print_report(&tag, &report),
            Err(e) if e.is_chain_local() => {
                eprintln!("{tag} failed: {e}");
                failed.push(name);
            }
            Err(e) => return Err(e).with_context(|| format!("chain '{name}'")),
        }
    }

    if !failed.is_empty() {
        bail!(
            "{} of {total} chain(s) failed: {}",
            failed.len(),
            failed.join(", ")
        );
    }
    Ok(())
}

fn print_report(tag: &str, report: &ChainReport) {
    match &report.outcome {
        RunOutcome::Prepared { scratch } => {
            println!("{tag} scratch tree prepared at {}", scratch.display());
        }
        RunOutcome::Stopped { at } => {
            println!("{tag} stopped after {at}; run not recorded");
        }
        RunOutcome::Completed => {
            for path in &report.removed {
                println!("{tag} removed orphan {}", path.display());
            }
            for artifact in &report.installed {
                println!("{tag} installed {} {}", artifact.kind(), artifact.path.display());
            }
        }
    }
}

fn prune(cli: &Cli, names: &[String], kver: Option<&str>) -> Result<()> {
    let (mut registry, config, runs) = load(cli)?;
    let selected = config.select(names)?;
    let mut pruner = Pruner::new(&runs, &mut registry);

    for chain in selected {
        match kver {
            Some(kver) => {
                let tag = format!("[prune:{}:{kver}]", chain.name);
                match pruner.prune_kver(&chain.name, kver) {
                    Ok(()) => println!("{tag} pruned"),
                    Err(e) if e.is_not_found() => println!("{tag} nothing to prune"),
                    Err(e) => {
                        return Err(e).with_context(|| {
                            format!("pruning chain '{}' for {kver}", chain.name)
                        })
                    }
                }
            }
            None => {
                let pruned = pruner
                    .apply_retention(&chain.name, chain.keep)
                    .with_context(|| format!("applying retention to chain '{}'", chain.name))?;
                if pruned.is_empty() {
                    println!("[prune:{}] nothing to prune (keep = {})", chain.name, chain.keep);
                }
                for kver in pruned {
                    println!("[prune:{}:{kver}] pruned", chain.name);
                }
            }
        }
    }
    Ok(())
}
