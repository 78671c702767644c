//! Runtime tunables for the disk search engine.
//!
//! Every knob has a compiled-in default and a `KWIRK_*` environment
//! override, so long-running searches can be re-tuned between resumes
//! without rebuilding.

use std::env;
use std::str::FromStr;

use crate::compressed::CompressedState;

/// Default RAM budget shared by the sort buffer and the recent-state
/// cache (they are never live at the same time).
const DEFAULT_RAM_SIZE: usize = 256 * 1024 * 1024;

/// Cells per cache bucket (set associativity).
const DEFAULT_NODES_PER_HASH: usize = 4;

/// Stream buffer sizes, in records (16 bytes each): roughly 1 MB.
const DEFAULT_BUFFER_RECORDS: usize = 1024 * 1024 / CompressedState::BYTES;

/// Capacity of the worker process queue, in records.
const DEFAULT_PROCESS_QUEUE_LEN: usize = 1 << 20;

#[derive(Debug, Clone)]
pub struct Config {
    /// RAM budget in bytes for the sort buffer / cache region.
    pub ram_size: usize,
    /// Total threads; the pipeline producer takes one, workers get the rest.
    pub threads: usize,
    /// Cache associativity (K).
    pub nodes_per_hash: usize,
    /// Buffer size in records for ordinary streams.
    pub buffer_records: usize,
    /// Buffer size in records for the consolidated "all" file streams.
    pub all_buffer_records: usize,
    /// Buffer size in records for each chunk input during the k-way merge.
    pub merge_buffer_records: usize,
    /// Capacity of the bounded worker queue, in records.
    pub process_queue_len: usize,
    /// When > 0: if the open files on disk grow past this many bytes,
    /// the driver runs sort-open + filter-open in place to reclaim space.
    pub open_bytes_limit: u64,
    /// Maintain a consolidated union of all closed files and filter
    /// against it instead of the per-group closed files.
    pub use_all: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ram_size: DEFAULT_RAM_SIZE,
            threads: std::thread::available_parallelism().map_or(1, |n| n.get()),
            nodes_per_hash: DEFAULT_NODES_PER_HASH,
            buffer_records: DEFAULT_BUFFER_RECORDS,
            all_buffer_records: DEFAULT_BUFFER_RECORDS,
            merge_buffer_records: DEFAULT_BUFFER_RECORDS,
            process_queue_len: DEFAULT_PROCESS_QUEUE_LEN,
            open_bytes_limit: 0,
            use_all: false,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            ram_size: env_or("KWIRK_RAM_SIZE", defaults.ram_size),
            threads: env_or("KWIRK_THREADS", defaults.threads).max(1),
            nodes_per_hash: env_or("KWIRK_NODES_PER_HASH", defaults.nodes_per_hash).max(1),
            buffer_records: env_or("KWIRK_BUFFER_RECORDS", defaults.buffer_records).max(1),
            all_buffer_records: env_or("KWIRK_ALL_BUFFER_RECORDS", defaults.all_buffer_records)
                .max(1),
            merge_buffer_records: env_or(
                "KWIRK_MERGE_BUFFER_RECORDS",
                defaults.merge_buffer_records,
            )
            .max(1),
            process_queue_len: env_or("KWIRK_PROCESS_QUEUE_LEN", defaults.process_queue_len)
                .max(1),
            open_bytes_limit: env_or("KWIRK_OPEN_BYTES_LIMIT", defaults.open_bytes_limit),
            use_all: env_or("KWIRK_USE_ALL", defaults.use_all),
        }
    }

    /// Records that fit in the RAM budget during the sort phase.
    pub fn sort_buffer_records(&self) -> usize {
        (self.ram_size / CompressedState::BYTES).max(1)
    }

    /// Worker thread count: everything except the pipeline producer.
    pub fn workers(&self) -> usize {
        self.threads.saturating_sub(1)
    }
}

fn env_or<T: FromStr + Copy>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.parse().unwrap_or(default),
        Err(_) => default,
    }
}
