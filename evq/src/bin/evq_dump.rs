use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;

use evq::queue::HEADER_SLOTS;
use evq::{EventPointer, IndexQueue, SequenceOracle};

/// Prints the contents of an index checkpoint file: active-log refcounts, the
/// header fields, and every ring slot.
#[derive(Debug, Parser)]
#[command(name = "evq-dump", version)]
struct Args {
    /// Path to the checkpoint file.
    checkpoint: PathBuf,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let len = std::fs::metadata(&args.checkpoint)
        .with_context(|| format!("cannot stat `{}`", args.checkpoint.display()))?
        .len();
    let slots = len / 8;
    if len % 8 != 0 || slots <= HEADER_SLOTS as u64 {
        bail!(
            "`{}` is not an index checkpoint file ({len} bytes)",
            args.checkpoint.display()
        );
    }
    let capacity = (slots - HEADER_SLOTS as u64) as usize;

    let queue = IndexQueue::open(&args.checkpoint, capacity, Arc::new(SequenceOracle::new()))
        .with_context(|| format!("cannot open `{}`", args.checkpoint.display()))?;

    for (file_id, count) in queue.ref_counts() {
        println!("fileID {file_id} refcount {count}");
    }
    println!("capacity {}", queue.capacity());
    println!("size {}", queue.size());
    println!("head {}", queue.head());
    for (index, raw) in queue.ring_slots().into_iter().enumerate() {
        let (file_id, offset) = match EventPointer::from_raw(raw) {
            Some(ptr) => (ptr.file_id(), ptr.offset()),
            None => (0, 0),
        };
        println!("{index}: {raw:#018x} fileID={file_id} offset={offset}");
    }
    Ok(())
}
