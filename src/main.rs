//! tierjit CLI
//!
//! Maintenance commands over a persistent artifact directory.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::collections::BTreeSet;
use std::path::PathBuf;
use tierjit::artifact::{ArtifactStore, CleanupMode, Hast, HastRegistry};
use tierjit::VERSION;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tierjit")]
#[command(author, version, about = "Inspect and maintain tierjit artifact directories", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// List the metadata entries of an artifact directory
    Inspect {
        /// Artifact directory
        dir: PathBuf,
        /// Print the full metadata as JSON
        #[arg(long)]
        json: bool,
    },

    /// Delete entries tainted by blacklisted hasts
    Cleanup {
        /// Artifact directory
        dir: PathBuf,
        /// Hast to blacklist, in hex (repeatable)
        #[arg(short, long = "blacklist", value_name = "HAST", required = true)]
        blacklist: Vec<String>,
        /// Follow dependencies transitively instead of one level
        #[arg(long)]
        transitive: bool,
    },

    /// Scan a directory the way a starting runtime does and print the
    /// dependency map it would build
    Relink {
        /// Artifact directory
        dir: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);
    tracing::debug!(version = VERSION, "tierjit cli");

    match cli.command {
        Commands::Inspect { dir, json } => inspect(dir, json),
        Commands::Cleanup {
            dir,
            blacklist,
            transitive,
        } => cleanup(dir, &blacklist, transitive),
        Commands::Relink { dir } => relink(dir),
    }
}

fn setup_logging(verbosity: u8) {
    let default = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn open(dir: PathBuf) -> anyhow::Result<ArtifactStore> {
    if !dir.is_dir() {
        bail!("'{}' is not a directory", dir.display());
    }
    Ok(ArtifactStore::new(dir))
}

fn inspect(dir: PathBuf, json: bool) -> anyhow::Result<()> {
    let store = open(dir)?;
    let (entries, unreadable) = store.scan().context("cannot read artifact directory")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    for meta in &entries {
        let deps: Vec<String> = meta.dependencies().iter().map(|h| h.to_string()).collect();
        println!(
            "{} {} digest={:016x} ({} contexts)",
            meta.hast,
            meta.name,
            meta.digest,
            meta.context_count()
        );
        for (offset, context, unit) in meta.units() {
            println!("  @{} ctx={} v{} blob={}", offset, context, unit.version, unit.binary.epoch);
        }
        if !deps.is_empty() {
            println!("  requests: {}", deps.join(" "));
        }
    }
    for hast in &unreadable {
        println!("{} unreadable", hast);
    }
    println!("{} entries, {} unreadable", entries.len(), unreadable.len());
    Ok(())
}

fn cleanup(dir: PathBuf, blacklist: &[String], transitive: bool) -> anyhow::Result<()> {
    let store = open(dir)?;
    let mut set = BTreeSet::new();
    for raw in blacklist {
        let hast: Hast = raw
            .parse()
            .with_context(|| format!("invalid hast '{}'", raw))?;
        set.insert(hast);
    }
    let mode = if transitive {
        CleanupMode::Transitive
    } else {
        CleanupMode::Direct
    };
    let report = store.cleanup(&set, mode)?;
    for hast in &report.removed {
        println!("removed {}", hast);
    }
    println!("{}", report);
    Ok(())
}

fn relink(dir: PathBuf) -> anyhow::Result<()> {
    let store = open(dir)?;
    let mut registry = HastRegistry::new();
    let report = store.relink(&mut registry)?;
    let (entries, _) = store.scan()?;
    for meta in &entries {
        let deps = registry
            .dependencies(meta.hast)
            .map(|d| d.iter().map(|h| h.to_string()).collect::<Vec<_>>().join(" "))
            .unwrap_or_default();
        println!("{} -> [{}]", meta.hast, deps);
    }
    println!("{}", report);
    Ok(())
}
