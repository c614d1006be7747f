// main.rs - Driver: wire the walker or the cache reader into the
// removal engine across a group of ranks.
use std::path::PathBuf;
use std::time::Instant;

use anyhow::Result;
use chrono::{Local, Utc};
use clap::{ColorChoice, Parser};

use drm::cache;
use drm::comm::{run_ranks, Comm, Reduce, ROOT};
use drm::ids::{self, IdTable};
use drm::inventory::{self, InventoryMode, PackedBuffer};
use drm::queue::WorkQueue;
use drm::remove::{removal_items, RemovalEngine, Strategy};
use drm::util;
use drm::walk::{walk, WalkMode};

#[derive(Parser, Debug)]
#[command(version, color = ColorChoice::Auto,
    about = "Distributed parallel file tree removal")]
struct Args {
    /// Root of the tree to remove (omit to read --cache)
    #[arg(required_unless_present = "cache")]
    path: Option<String>,
    /// Read (without <path>) or write (with <path>) an inventory cache file
    #[arg(short, long, value_name = "FILE")]
    cache: Option<PathBuf>,
    /// Walk without per-entry stat; types come from directory entries
    #[arg(short, long)]
    lite: bool,
    /// Number of ranks in the collective group (default: logical CPUs)
    #[arg(short = 'n', long, value_name = "N")]
    ranks: Option<usize>,
    /// Redistribution strategy used at each depth level
    #[arg(short, long, value_enum, default_value = "spread")]
    strategy: Strategy,
    /// Progress and timing output
    #[arg(short, long)]
    verbose: bool,
}

struct Config {
    root: Option<PathBuf>,
    cache: Option<PathBuf>,
    lite: bool,
    strategy: Strategy,
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    util::print_about();

    // absolute path with ".", "..", duplicate and trailing slashes
    // removed; depths and dirnames rely on this
    let cfg = Config {
        root: args.path.as_deref().map(|p| util::abs_reduce(p.as_ref())),
        cache: args.cache,
        lite: args.lite,
        strategy: args.strategy,
        verbose: args.verbose,
    };
    let ranks = args.ranks.unwrap_or_else(num_cpus::get).max(1);

    if let Some(root) = &cfg.root {
        println!("Input        : {}", root.display());
    }
    if let Some(cache) = &cfg.cache {
        println!("Cache        : {}", cache.display());
    }
    println!("Ranks        : {}", ranks);
    println!("Strategy     : {:?}", cfg.strategy);

    let queue = WorkQueue::new();
    let start = Instant::now();
    let removed: u64 = run_ranks(ranks, |comm| run_rank(comm, &queue, &cfg))
        .into_iter()
        .sum();

    println!("Removed items: {}", removed);
    println!("Elapsed time : {:.2} seconds", start.elapsed().as_secs_f64());
    Ok(())
}

/// One rank's share of the whole job. Collective calls happen in the
/// same order on every rank; the config is identical everywhere.
fn run_rank<C: Comm>(comm: &C, queue: &WorkQueue, cfg: &Config) -> u64 {
    let rank = comm.rank();
    let mut users = IdTable::default();
    let mut groups = IdTable::default();
    let files: PackedBuffer;

    if let Some(root) = &cfg.root {
        let mode = if cfg.lite {
            InventoryMode::Lite
        } else {
            InventoryMode::Stat
        };
        if mode == InventoryMode::Stat {
            users = ids::get_users(comm);
            groups = ids::get_groups(comm);
        }

        let walk_start = Utc::now().timestamp() as u64;
        if cfg.verbose && rank == ROOT {
            println!(
                "{}: Walking directory: {}",
                Local::now().format("%Y-%m-%dT%H:%M:%S"),
                root.display()
            );
        }
        let timer = Instant::now();
        let records = walk(
            comm,
            queue,
            root,
            if cfg.lite {
                WalkMode::Lite
            } else {
                WalkMode::Stat
            },
        );
        let walk_end = Utc::now().timestamp() as u64;

        files = PackedBuffer::from_records(comm, records, mode);
        let all_count = comm.allreduce_u64(files.count, Reduce::Sum);
        if cfg.verbose && rank == ROOT {
            let secs = timer.elapsed().as_secs_f64();
            let rate = if secs > 0.0 { all_count as f64 / secs } else { 0.0 };
            println!(
                "Walked {} files in {:.3} seconds ({:.3} files/sec)",
                all_count, secs, rate
            );
        }

        if let Some(name) = &cfg.cache {
            cache::write_cache(comm, name, &files, &users, &groups, walk_start, walk_end);
        }
    } else {
        let name = cfg.cache.as_ref().expect("clap requires a cache or a path");
        if cfg.verbose && rank == ROOT {
            println!("Reading from cache file: {}", name.display());
        }
        let timer = Instant::now();
        let contents = cache::read_cache(comm, name);
        files = contents.files;
        users = contents.users;
        groups = contents.groups;

        let all_count = comm.allreduce_u64(files.count, Reduce::Sum);
        if cfg.verbose && rank == ROOT {
            let secs = timer.elapsed().as_secs_f64();
            let rate = if secs > 0.0 { all_count as f64 / secs } else { 0.0 };
            println!(
                "Read {} files in {:.3} seconds ({:.3} files/sec)",
                all_count, secs, rate
            );
        }
    }

    if cfg.verbose {
        inventory::print_records(rank, &files, &mut users, &mut groups);
    }

    let timer = Instant::now();
    let engine = RemovalEngine::new(comm, queue, cfg.strategy, cfg.verbose, removal_items(&files));
    let removed = engine.run();

    let all_removed = comm.allreduce_u64(removed, Reduce::Sum);
    if cfg.verbose && rank == ROOT {
        let secs = timer.elapsed().as_secs_f64();
        let rate = if secs > 0.0 {
            all_removed as f64 / secs
        } else {
            0.0
        };
        println!(
            "Removed {} files in {:.3} seconds ({:.3} files/sec)",
            all_removed, secs, rate
        );
    }
    removed
}
