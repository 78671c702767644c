//! Per-frame-group open files: unsorted append-only logs of states
//! waiting to be expanded.
//!
//! Group files are created lazily on first write and guarded by one
//! mutex per group, so workers touching different groups never
//! contend. Groups can be marked `no_queue` to drop writes (used by
//! `regenerate-open` to protect files that already exist).

use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Result};

use crate::compressed::{CompressedState, Frame, FrameGroup, FRAMES_PER_GROUP};
use crate::disk::{BufferedOutputStream, FileNames};

#[derive(Default)]
struct Slot {
    stream: Option<BufferedOutputStream>,
    no_queue: bool,
}

pub struct OpenQueue {
    names: FileNames,
    buffer_records: usize,
    groups: Vec<Mutex<Slot>>,
}

impl OpenQueue {
    pub fn new(names: FileNames, max_groups: FrameGroup, buffer_records: usize) -> Self {
        let groups = (0..max_groups).map(|_| Mutex::new(Slot::default())).collect();
        Self {
            names,
            buffer_records,
            groups,
        }
    }

    pub fn max_groups(&self) -> FrameGroup {
        self.groups.len() as FrameGroup
    }

    fn slot(&self, group: FrameGroup) -> Result<MutexGuard<'_, Slot>> {
        self.groups[group as usize]
            .lock()
            .map_err(|_| anyhow!("open queue lock poisoned"))
    }

    /// Appends `state` to the open file of `frame`'s group. Frames at
    /// or beyond the group limit and `no_queue` groups are dropped.
    pub fn enqueue(&self, mut state: CompressedState, frame: Frame) -> Result<()> {
        let group = frame / FRAMES_PER_GROUP;
        if group >= self.max_groups() {
            return Ok(());
        }
        state.set_subframe(frame);
        let mut slot = self.slot(group)?;
        if slot.no_queue {
            return Ok(());
        }
        if slot.stream.is_none() {
            slot.stream = Some(BufferedOutputStream::create(
                self.names.open(group),
                self.buffer_records,
            )?);
        }
        if let Some(stream) = slot.stream.as_mut() {
            stream.write(state)?;
        }
        Ok(())
    }

    /// Reopens an existing open file in append mode (resume).
    pub fn reopen(&self, group: FrameGroup) -> Result<()> {
        let stream = BufferedOutputStream::append(self.names.open(group), self.buffer_records)?;
        self.slot(group)?.stream = Some(stream);
        Ok(())
    }

    pub fn is_active(&self, group: FrameGroup) -> Result<bool> {
        Ok(self.slot(group)?.stream.is_some())
    }

    /// Flushes and releases the group's stream before the pipeline
    /// consumes its file.
    pub fn close_group(&self, group: FrameGroup) -> Result<()> {
        let stream = self.slot(group)?.stream.take();
        if let Some(mut stream) = stream {
            stream.flush()?;
        }
        Ok(())
    }

    pub fn mark_no_queue(&self, group: FrameGroup) -> Result<()> {
        self.slot(group)?.no_queue = true;
        Ok(())
    }

    /// Durability checkpoint: after this returns, every prior enqueue
    /// is on disk.
    pub fn flush_all(&self) -> Result<()> {
        for group in 0..self.max_groups() {
            let mut slot = self.slot(group)?;
            if let Some(stream) = slot.stream.as_mut() {
                stream.flush()?;
            }
        }
        Ok(())
    }

    /// Total records across all active group streams.
    pub fn total_size(&self) -> Result<u64> {
        let mut total = 0;
        for group in 0..self.max_groups() {
            total += self.slot(group)?.stream.as_ref().map_or(0, |s| s.size());
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::BufferedInputStream;

    fn scratch(tag: &str) -> FileNames {
        let dir = std::env::temp_dir().join(format!("kwirk_openq_{tag}_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        FileNames::new(dir, "t")
    }

    #[test]
    fn enqueue_routes_by_group_and_sets_subframe() {
        let names = scratch("route");
        let queue = OpenQueue::new(names.clone(), 4, 8);
        queue.enqueue(CompressedState::from_data(1), 0).unwrap();
        queue.enqueue(CompressedState::from_data(2), 13).unwrap();
        queue.enqueue(CompressedState::from_data(3), 17).unwrap();
        // Beyond the group limit: silently dropped.
        queue.enqueue(CompressedState::from_data(4), 400).unwrap();
        queue.flush_all().unwrap();

        let mut g1 = BufferedInputStream::open(names.open(1), 8).unwrap();
        let a = g1.read().unwrap().unwrap();
        let b = g1.read().unwrap().unwrap();
        assert_eq!((a.data(), a.subframe()), (2, 3));
        assert_eq!((b.data(), b.subframe()), (3, 7));
        assert!(g1.read().unwrap().is_none());
        assert!(!names.open(3).exists());
        std::fs::remove_dir_all(names.dir()).unwrap();
    }

    #[test]
    fn no_queue_groups_drop_writes() {
        let names = scratch("noqueue");
        let queue = OpenQueue::new(names.clone(), 2, 8);
        queue.mark_no_queue(0).unwrap();
        queue.enqueue(CompressedState::from_data(9), 5).unwrap();
        queue.flush_all().unwrap();
        assert!(!names.open(0).exists());
        std::fs::remove_dir_all(names.dir()).unwrap();
    }

    #[test]
    fn close_then_reopen_appends() {
        let names = scratch("reopen");
        {
            let queue = OpenQueue::new(names.clone(), 2, 8);
            queue.enqueue(CompressedState::from_data(1), 2).unwrap();
            queue.close_group(0).unwrap();
            assert!(!queue.is_active(0).unwrap());
        }
        {
            let queue = OpenQueue::new(names.clone(), 2, 8);
            queue.reopen(0).unwrap();
            assert!(queue.is_active(0).unwrap());
            queue.enqueue(CompressedState::from_data(2), 4).unwrap();
            queue.flush_all().unwrap();
            assert_eq!(queue.total_size().unwrap(), 2);
        }
        std::fs::remove_dir_all(names.dir()).unwrap();
    }
}
