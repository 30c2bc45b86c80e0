#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use loam_alloc::{bitmap_render, free_block_count};
use loam_block::{BlockDevice, BufferCache, FileBlockDevice};
use loam_btree::BTree;
use loam_error::LoamError;
use loam_types::{BlockNumber, FIRST_DATA_BLOCK, InodeNumber};
use serde::Serialize;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "loam", about = "loam — disk-backed B-tree storage engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create and format a fresh image with an empty tree.
    Mkfs {
        /// Path of the image file to create.
        image: PathBuf,
        /// Image size in 4 KiB blocks.
        #[arg(long, default_value_t = 1024)]
        blocks: u64,
    },
    /// Show allocation occupancy of an image.
    Stat {
        /// Path to the image file.
        image: PathBuf,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// Interactive shell: insert, search, print, delete, sync, exit.
    Shell {
        /// Path to the image file.
        image: PathBuf,
    },
}

#[derive(Debug, Serialize)]
struct StatOutput {
    total_blocks: u64,
    used_blocks: u64,
    free_blocks: u64,
    root_block: u64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    match Cli::parse().command {
        Command::Mkfs { image, blocks } => mkfs(&image, blocks),
        Command::Stat { image, json } => stat(&image, json),
        Command::Shell { image } => shell(&image),
    }
}

// ── Commands ────────────────────────────────────────────────────────────────

fn mkfs(image: &PathBuf, blocks: u64) -> Result<()> {
    let dev = FileBlockDevice::create(image, blocks)
        .with_context(|| format!("creating {}", image.display()))?;
    let mut cache = BufferCache::with_slot_count(64)?;
    let tree = BTree::create(&dev, &mut cache)?;
    if tree.root() != FIRST_DATA_BLOCK {
        bail!(
            "fresh image placed the tree root at block {}, expected {}",
            tree.root(),
            FIRST_DATA_BLOCK
        );
    }
    cache.sync_all(&dev)?;
    println!(
        "formatted {}: {} blocks, tree root at block {}",
        image.display(),
        blocks,
        tree.root()
    );
    Ok(())
}

fn stat(image: &PathBuf, json: bool) -> Result<()> {
    let dev =
        FileBlockDevice::open(image).with_context(|| format!("opening {}", image.display()))?;
    let mut cache = BufferCache::with_slot_count(64)?;
    let total = dev.block_count();
    let free = free_block_count(&dev, &mut cache)?;
    let out = StatOutput {
        total_blocks: total,
        used_blocks: total - free,
        free_blocks: free,
        root_block: FIRST_DATA_BLOCK.0,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!("image:        {}", image.display());
        println!("total blocks: {}", out.total_blocks);
        println!("used blocks:  {}", out.used_blocks);
        println!("free blocks:  {}", out.free_blocks);
        println!("tree root:    block {}", out.root_block);
        let shown = total.min(128);
        let bitmap = cache.get(&dev, InodeNumber(0), BlockNumber(0))?;
        println!("bitmap[0..{shown}]: {}", bitmap_render(bitmap, shown));
    }
    Ok(())
}

fn shell(image: &PathBuf) -> Result<()> {
    let dev =
        FileBlockDevice::open(image).with_context(|| format!("opening {}", image.display()))?;
    let mut cache = BufferCache::new();
    let tree = BTree::open(FIRST_DATA_BLOCK);

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("> ");
        io::stdout().flush()?;
        let Some(line) = lines.next() else {
            break;
        };
        let line = line?;
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            continue;
        };

        if matches!(verb, "exit" | "quit") {
            break;
        }
        match run_verb(&tree, &dev, &mut cache, verb, &mut words) {
            Ok(()) => {}
            Err(err) => match err.downcast_ref::<LoamError>() {
                // A corrupt tree must not be worked on any further.
                Some(LoamError::CorruptTree { .. }) => return Err(err),
                Some(LoamError::NotFound(what)) => println!("not found: {what}"),
                _ => println!("error: {err:#}"),
            },
        }
    }

    cache.sync_all(&dev)?;
    Ok(())
}

fn run_verb(
    tree: &BTree,
    dev: &FileBlockDevice,
    cache: &mut BufferCache,
    verb: &str,
    words: &mut std::str::SplitWhitespace<'_>,
) -> Result<()> {
    match verb {
        "insert" => {
            let key = parse_u64(words.next(), "key")?;
            let value = parse_u64(words.next(), "value")?;
            tree.insert(dev, cache, key, value)?;
            println!("inserted {key}");
        }
        "search" => {
            let key = parse_u64(words.next(), "key")?;
            let value = tree.search(dev, cache, key)?;
            println!("{key} = {value}");
        }
        "print" => {
            let rendered = tree.dump(dev, cache)?;
            print!("{rendered}");
        }
        "delete" => {
            let key = parse_u64(words.next(), "key")?;
            tree.delete(dev, cache, key)?;
            println!("deleted {key}");
        }
        "sync" => {
            cache.sync_all(dev)?;
            println!("synced");
        }
        other => {
            println!("unknown verb '{other}'");
            println!(
                "verbs: insert <key> <value> | search <key> | print | delete <key> | sync | exit"
            );
        }
    }
    Ok(())
}

fn parse_u64(word: Option<&str>, what: &str) -> Result<u64> {
    let word = word.with_context(|| format!("missing {what}"))?;
    word.parse::<u64>()
        .with_context(|| format!("{what} '{word}' is not a non-negative integer"))
}
