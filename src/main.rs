//! `barrel`: run one shard in-process.
//!
//! Boots a shard (from its checkpoint if one exists), optionally ingests raw
//! crawl messages from stdin, writes a checkpoint, and optionally runs one
//! search and prints its rows.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use barrel_index::link::{Link, LinkState};
use barrel_index::{Barrel, BarrelConfig, LocalCluster, SearchOutcome};
use clap::Parser;
use tracing::{info, warn};

/// Command line arguments.
#[derive(Parser, Debug)]
#[command(name = "barrel")]
#[command(about = "Inverted-index shard of a distributed search engine")]
struct Args {
    /// TOML configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Checkpoint directory, overriding the configuration
    #[arg(long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Read crawl messages from stdin, one per line
    #[arg(long)]
    ingest: bool,

    /// Words to search for after ingesting
    #[arg(short, long, num_args = 1.., value_name = "WORD")]
    search: Vec<String>,

    /// Result page to print
    #[arg(long, default_value_t = 0)]
    page: usize,

    /// Results per page
    #[arg(long, default_value_t = 10)]
    page_size: usize,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => BarrelConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => BarrelConfig::default(),
    };
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose || config.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .with_writer(io::stderr)
        .init();

    let cluster = LocalCluster::new();
    let coordinator = Link::open(Arc::clone(&cluster), config.retry_policy())?;
    if coordinator.wait_settled(config.retry_policy().timeout) != LinkState::Connected {
        anyhow::bail!("coordinator unreachable");
    }
    let barrel = Barrel::boot(config, Arc::new(coordinator), cluster.clone())?;
    if let Some(max_id) = barrel.state().catalog.max_id() {
        cluster.advance_past(max_id);
    }
    cluster.join(&barrel);

    if args.ingest {
        let mut rejected = 0usize;
        let mut accepted = 0usize;
        for line in io::stdin().lock().lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match barrel.submit_message(&line) {
                Ok(()) => accepted += 1,
                Err(e) => {
                    rejected += 1;
                    warn!(error = %e, "skipping message");
                }
            }
        }
        while !barrel.wait_until_idle(Duration::from_secs(5)) {
            info!(stats = ?barrel.ingest_stats(), "waiting for ingestion");
        }
        info!(accepted, rejected, "stdin ingested");
        barrel.checkpoint()?;
    }

    if !args.search.is_empty() {
        let outcome = if args.search.len() == 1 {
            barrel.search_word(&args.search[0], args.page, args.page_size, true)?
        } else {
            barrel.search_word_set(args.search.as_slice(), args.page, args.page_size, true)?
        };
        let mut out = io::stdout().lock();
        match outcome {
            SearchOutcome::Found(page) => {
                for row in page.rows() {
                    writeln!(out, "{}", row.join("\t"))?;
                }
            }
            SearchOutcome::NoMatch => writeln!(out, "no results")?,
            SearchOutcome::Unavailable => writeln!(out, "shard unavailable")?,
        }
    }

    barrel.shutdown();
    Ok(())
}
