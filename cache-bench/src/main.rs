//! In-process file cache workload driver: exercises the cache directly
//! without network or remote-store overhead.
//!
//! Worker threads issue random range reads against a synthetic remote
//! object. Each worker plays the role the coordination protocol assigns
//! it per segment: the elected downloader fetches bytes from the object
//! and appends them through the segment, everyone else waits and then
//! reads the cached file.

use clap::Parser;
use filecache::{
    CacheConfig, CacheError, CacheKey, CallerScope, DownloadState, FileCache, FileSegment,
    SyncMode,
};
use rand::{Rng, RngCore, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

/// Bytes fetched from the object store per reserve/write step.
const DOWNLOAD_CHUNK: u64 = 16 * 1024;

#[derive(Parser)]
#[command(name = "cache-bench")]
#[command(about = "In-process file cache workload driver")]
struct Args {
    /// Worker threads issuing range reads
    #[arg(long, default_value_t = 4)]
    threads: usize,

    /// Range reads per worker
    #[arg(long, default_value_t = 1000)]
    ops: u64,

    /// Size of the synthetic remote object in bytes
    #[arg(long, default_value_t = 8 * 1024 * 1024)]
    object_size: u64,

    /// Cache byte quota
    #[arg(long, default_value_t = 4 * 1024 * 1024)]
    cache_size: u64,

    /// Maximum size of a single cached segment
    #[arg(long, default_value_t = 256 * 1024)]
    segment_size: u64,

    /// Maximum bytes per range read
    #[arg(long, default_value_t = 64 * 1024)]
    read_size: u64,

    /// Cache directory (a temporary directory if omitted)
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// fsync after every segment write instead of once per download
    #[arg(long)]
    sync: bool,

    /// RNG seed for the object contents and the workload
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

fn main() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    if let Err(e) = run(args) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(args.seed);
    let mut object = vec![0u8; args.object_size as usize];
    rng.fill_bytes(&mut object);
    let object = Arc::new(object);

    let mut _tempdir = None;
    let cache_dir = match &args.cache_dir {
        Some(dir) => dir.clone(),
        None => {
            let dir = tempfile::tempdir()?;
            let path = dir.path().to_path_buf();
            _tempdir = Some(dir);
            path
        }
    };

    let sync_mode = if args.sync {
        SyncMode::Sync
    } else {
        SyncMode::Async
    };
    let cache = FileCache::new(
        CacheConfig::new()
            .cache_dir(&cache_dir)
            .max_size(args.cache_size)
            .max_segment_size(args.segment_size)
            .sync_mode(sync_mode),
    )?;
    let key = CacheKey::from_path("bench/object");

    tracing::info!(
        threads = args.threads,
        ops = args.ops,
        object_size = args.object_size,
        cache_size = args.cache_size,
        segment_size = args.segment_size,
        "starting workload"
    );

    let start = Instant::now();
    let workers: Vec<_> = (0..args.threads)
        .map(|worker| {
            let cache = cache.clone();
            let object = object.clone();
            let mut rng = Xoshiro256PlusPlus::seed_from_u64(args.seed ^ (worker as u64 + 1));
            let ops = args.ops;
            let max_read = args.read_size.min(object.len() as u64);
            thread::spawn(move || -> Result<u64, CacheError> {
                let _scope = CallerScope::enter(format!("worker-{worker}"));
                let mut bytes_read = 0u64;
                for _ in 0..ops {
                    let len = rng.gen_range(1..=max_read);
                    let offset = rng.gen_range(0..=(object.len() as u64 - len));
                    bytes_read += read_range(&cache, key, &object, offset, len)?;
                }
                Ok(bytes_read)
            })
        })
        .collect();

    let mut total_bytes = 0u64;
    for worker in workers {
        total_bytes += worker.join().expect("worker panicked")?;
    }
    let elapsed = start.elapsed();

    let snapshot = cache.metrics().snapshot();
    println!("elapsed:          {:.3}s", elapsed.as_secs_f64());
    println!(
        "throughput:       {:.1} MiB/s",
        total_bytes as f64 / (1024.0 * 1024.0) / elapsed.as_secs_f64()
    );
    println!(
        "hit ratio:        {:.1}% ({} hits, {} misses)",
        snapshot.hit_ratio() * 100.0,
        snapshot.hits,
        snapshot.misses
    );
    println!(
        "evictions:        {} ({} removals, {} reserve refusals)",
        snapshot.evictions, snapshot.removals, snapshot.reserve_refusals
    );
    println!(
        "cached:           {} segments, {} bytes",
        cache.segment_count(),
        cache.used_bytes()
    );

    Ok(())
}

/// Read one range through the cache, covering each returned segment via
/// whatever role the election assigns.
fn read_range(
    cache: &FileCache,
    key: CacheKey,
    object: &[u8],
    offset: u64,
    len: u64,
) -> Result<u64, CacheError> {
    let holder = cache.get_or_set(key, offset, len)?;
    let me = cache.caller_id().ok_or(CacheError::NoCallerId)?;
    let mut bytes = 0u64;

    for segment in holder.iter() {
        loop {
            match segment.state() {
                DownloadState::Downloaded => {
                    bytes += read_cached(cache, object, segment)?;
                    break;
                }
                DownloadState::SkipCache
                | DownloadState::PartiallyDownloadedNoContinuation => {
                    // Not cacheable right now; serve straight from the
                    // object store.
                    bytes += segment.range().size();
                    break;
                }
                _ => {
                    if segment.get_or_set_downloader()? == me {
                        download(segment, object)?;
                    } else {
                        segment.wait()?;
                    }
                }
            }
        }
    }

    Ok(bytes)
}

/// Fetch the remaining bytes of a segment from the object store as its
/// elected downloader.
fn download(segment: &FileSegment, object: &[u8]) -> Result<(), CacheError> {
    let range = segment.range();
    loop {
        let downloaded = segment.downloaded_size();
        if downloaded == range.size() {
            return segment.complete(DownloadState::Downloaded);
        }

        let chunk_len = DOWNLOAD_CHUNK.min(range.size() - downloaded);
        if !segment.reserve(chunk_len)? {
            // Quota exhausted and nothing evictable; stop caching this
            // range and let readers go to the object store.
            return segment.complete(DownloadState::PartiallyDownloadedNoContinuation);
        }

        let start = (range.left + downloaded) as usize;
        segment.write(&object[start..start + chunk_len as usize])?;
    }
}

/// Read a fully downloaded segment back from its cache file.
fn read_cached(
    cache: &FileCache,
    object: &[u8],
    segment: &FileSegment,
) -> Result<u64, CacheError> {
    let path = cache.segment_path(segment.key(), segment.offset());
    let bytes = std::fs::read(path)?;
    let range = segment.range();
    debug_assert!(
        bytes[..] == object[range.left as usize..=range.right as usize],
        "cached bytes diverge from the object at {range}"
    );
    Ok(bytes.len() as u64)
}
