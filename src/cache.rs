//! In-RAM recent-state cache: a sharded, K-way set-associative table
//! that suppresses obviously redundant appends to the open queue.
//!
//! The cache is advisory. Every child a worker generates must reach
//! the open queue at least once; the cache may only skip a write when
//! it recognizes a strictly-not-better rediscovery. The disk filter
//! stage stays authoritative.

use std::sync::Mutex;

use anyhow::{anyhow, Result};

use crate::compressed::{CompressedState, Frame};
use crate::open_queue::OpenQueue;

/// Frame sentinel marking an empty cell.
const FRAME_NONE: Frame = Frame::MAX;

/// Buckets per shard lock; keeps contention around workers / shards.
const BUCKETS_PER_SHARD: usize = 256;

#[derive(Clone, Copy)]
struct CacheNode {
    state: CompressedState,
    frame: Frame,
}

impl CacheNode {
    const EMPTY: Self = Self {
        state: CompressedState::ZERO,
        frame: FRAME_NONE,
    };
}

pub struct RecentCache {
    shards: Vec<Mutex<Box<[CacheNode]>>>,
    buckets: usize,
    assoc: usize,
}

impl RecentCache {
    /// Sizes the table to `ram_size` bytes with `assoc` cells per
    /// bucket.
    pub fn new(ram_size: usize, assoc: usize) -> Self {
        let assoc = assoc.max(1);
        let cell = std::mem::size_of::<CacheNode>();
        let buckets = (ram_size / (cell * assoc)).max(1);
        let shard_count = (buckets / BUCKETS_PER_SHARD).max(1);
        // Round down so every shard owns the same number of buckets.
        let buckets = (buckets / shard_count) * shard_count;
        let per_shard = buckets / shard_count;
        let shards = (0..shard_count)
            .map(|_| Mutex::new(vec![CacheNode::EMPTY; per_shard * assoc].into_boxed_slice()))
            .collect();
        Self {
            shards,
            buckets,
            assoc,
        }
    }

    /// Records that `state` was discovered at `frame`, appending it to
    /// the open queue unless the cache proves the append redundant.
    pub fn observe(&self, state: CompressedState, frame: Frame, open: &OpenQueue) -> Result<()> {
        let hash = state.hash() as usize;
        let bucket = hash % self.buckets;
        let shard_count = self.shards.len();
        let row = bucket / shard_count;
        let enqueue = {
            let mut shard = self.shards[bucket % shard_count]
                .lock()
                .map_err(|_| anyhow!("cache lock poisoned"))?;
            let cells = &mut shard[row * self.assoc..(row + 1) * self.assoc];
            match cells
                .iter()
                .position(|c| c.frame != FRAME_NONE && c.state == state)
            {
                Some(i) => {
                    // Rediscovery: re-enqueue only when this path is
                    // strictly shorter than the one the cache saw.
                    let better = cells[i].frame > frame;
                    cells[..=i].rotate_right(1);
                    cells[0] = CacheNode { state, frame };
                    better
                }
                None => {
                    cells.rotate_right(1);
                    cells[0] = CacheNode { state, frame };
                    true
                }
            }
        };
        if enqueue {
            open.enqueue(state, frame)?;
        }
        Ok(())
    }

    /// Empties the table between frame groups.
    pub fn clear(&self) -> Result<()> {
        for shard in &self.shards {
            let mut cells = shard.lock().map_err(|_| anyhow!("cache lock poisoned"))?;
            cells.fill(CacheNode::EMPTY);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::{BufferedInputStream, FileNames};

    fn setup(tag: &str) -> (FileNames, OpenQueue, RecentCache) {
        let dir = std::env::temp_dir().join(format!("kwirk_cache_{tag}_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let names = FileNames::new(dir, "t");
        let open = OpenQueue::new(names.clone(), 64, 8);
        let cache = RecentCache::new(64 * 1024, 4);
        (names, open, cache)
    }

    fn count_records(names: &FileNames, group: u32) -> u64 {
        match BufferedInputStream::open(names.open(group), 8) {
            Ok(s) => s.size(),
            Err(_) => 0,
        }
    }

    #[test]
    fn first_observation_enqueues_repeat_does_not() {
        let (names, open, cache) = setup("first");
        let cs = CompressedState::from_data(0xabcd);
        cache.observe(cs, 12, &open).unwrap();
        cache.observe(cs, 12, &open).unwrap();
        cache.observe(cs, 15, &open).unwrap();
        open.flush_all().unwrap();
        assert_eq!(count_records(&names, 1), 1);
        std::fs::remove_dir_all(names.dir()).unwrap();
    }

    #[test]
    fn better_frame_re_enqueues() {
        let (names, open, cache) = setup("better");
        let cs = CompressedState::from_data(0xabcd);
        cache.observe(cs, 15, &open).unwrap();
        cache.observe(cs, 12, &open).unwrap();
        open.flush_all().unwrap();
        assert_eq!(count_records(&names, 1), 2);
        std::fs::remove_dir_all(names.dir()).unwrap();
    }

    #[test]
    fn clear_forgets_everything() {
        let (names, open, cache) = setup("clear");
        let cs = CompressedState::from_data(7);
        cache.observe(cs, 3, &open).unwrap();
        cache.clear().unwrap();
        cache.observe(cs, 3, &open).unwrap();
        open.flush_all().unwrap();
        assert_eq!(count_records(&names, 0), 2);
        std::fs::remove_dir_all(names.dir()).unwrap();
    }

    #[test]
    fn eviction_is_lru_within_a_bucket() {
        // A one-bucket, two-way cache: the third distinct state evicts
        // the least recently used.
        let dir =
            std::env::temp_dir().join(format!("kwirk_cache_lru_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let names = FileNames::new(dir, "t");
        let open = OpenQueue::new(names.clone(), 64, 8);
        let cache = RecentCache::new(2 * std::mem::size_of::<CacheNode>(), 2);
        assert_eq!(cache.buckets, 1);

        let a = CompressedState::from_data(1);
        let b = CompressedState::from_data(2);
        let c = CompressedState::from_data(3);
        cache.observe(a, 0, &open).unwrap(); // enqueue: a new
        cache.observe(b, 0, &open).unwrap(); // enqueue: b new
        cache.observe(a, 0, &open).unwrap(); // hit, a becomes MRU
        cache.observe(c, 0, &open).unwrap(); // enqueue: evicts b, not a
        cache.observe(b, 0, &open).unwrap(); // enqueue: b was evicted
        cache.observe(c, 0, &open).unwrap(); // still cached
        open.flush_all().unwrap();
        assert_eq!(count_records(&names, 0), 4);
        std::fs::remove_dir_all(names.dir()).unwrap();
    }
}
