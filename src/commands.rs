//! Maintenance and inspection commands: everything the CLI exposes
//! besides `search` itself.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use anyhow::{bail, ensure, Result};
use rand::Rng;
use tracing::{info, warn};

use crate::compressed::{CompressedState, FrameGroup, FRAMES_PER_GROUP};
use crate::disk::{
    remove, rename, BufferedInputStream, BufferedOutputStream, BufferedRewriteStream, FileNames,
    InputStream,
};
use crate::merge::{filter, merge, InputHeap, RecordSource};
use crate::problem::Problem;
use crate::search::{Outcome, Session};
use crate::trace;

/// A rewrite stream that can sit inside an input heap while the
/// filter writes back to it by group index.
#[derive(Clone)]
struct SharedRewrite(Rc<RefCell<BufferedRewriteStream>>);

impl RecordSource for SharedRewrite {
    fn read(&mut self) -> Result<Option<CompressedState>> {
        self.0.borrow_mut().read()
    }
}

impl<P: Problem> Session<P> {
    /// Picks the closed file if present, the open file otherwise.
    fn closed_or_open(&self, g: FrameGroup) -> Result<std::path::PathBuf> {
        let closed = self.names.closed(g);
        if closed.exists() {
            return Ok(closed);
        }
        let open = self.names.open(g);
        ensure!(
            open.exists(),
            "no open or closed node file for frame group {}",
            FileNames::group_token(g)
        );
        Ok(open)
    }

    /// Prints every record of a group's node file.
    pub fn dump(&self, g: FrameGroup) -> Result<Outcome> {
        let path = self.closed_or_open(g)?;
        let mut input = BufferedInputStream::open(path, self.cfg.buffer_records)?;
        while let Some(cs) = input.read()? {
            println!("Frame {}:", cs.frame(g));
            println!("{}", self.problem.state_to_string(&self.problem.decompress(&cs)));
        }
        Ok(Outcome::Ok)
    }

    /// Prints one uniformly random record of a group's node file.
    pub fn sample(&self, g: FrameGroup) -> Result<Outcome> {
        let path = self.closed_or_open(g)?;
        let mut input = InputStream::open(path)?;
        ensure!(input.size() > 0, "file is empty");
        let pick = rand::rng().random_range(0..input.size());
        input.seek(pick)?;
        let mut buf = [CompressedState::ZERO];
        ensure!(input.read(&mut buf)? == 1, "short read");
        println!("Frame {}:", buf[0].frame(g));
        println!("{}", self.problem.state_to_string(&self.problem.decompress(&buf[0])));
        Ok(Outcome::Ok)
    }

    /// Counts duplicate records and order interleaves between two
    /// sorted files.
    pub fn compare(&self, file1: &str, file2: &str) -> Result<Outcome> {
        let mut i1 = BufferedInputStream::open(file1, self.cfg.buffer_records)?;
        let mut i2 = BufferedInputStream::open(file2, self.cfg.buffer_records)?;
        println!("{file1}: {} states", i1.size());
        println!("{file2}: {} states", i2.size());
        let mut a = i1.read()?;
        let mut b = i2.read()?;
        let mut duplicates = 0u64;
        let mut switches = 0u64;
        let mut last = 0i32;
        while let (Some(x), Some(y)) = (a, b) {
            let cur = if x < y {
                a = i1.read()?;
                -1
            } else if x > y {
                b = i2.read()?;
                1
            } else {
                duplicates += 1;
                a = i1.read()?;
                b = i2.read()?;
                0
            };
            if cur != last {
                switches += 1;
            }
            last = cur;
        }
        println!("{duplicates} duplicate states");
        println!("{switches} interweaves");
        Ok(Outcome::Ok)
    }

    /// Migrates legacy per-frame files into frame-group files. Each
    /// stream carries its subframe index explicitly.
    pub fn convert(&self, first: FrameGroup, max: FrameGroup) -> Result<Outcome> {
        for g in first..max {
            let mut inputs: Vec<(u32, BufferedInputStream)> = Vec::new();
            let mut have_open = false;
            for frame in g * FRAMES_PER_GROUP..(g + 1) * FRAMES_PER_GROUP {
                let closed = self.names.frame_file("closed", frame);
                let open = self.names.frame_file("open", frame);
                let path = if closed.exists() {
                    closed
                } else if open.exists() {
                    have_open = true;
                    open
                } else {
                    continue;
                };
                inputs.push((
                    frame % FRAMES_PER_GROUP,
                    BufferedInputStream::open(path, self.cfg.merge_buffer_records)?,
                ));
            }
            if inputs.is_empty() {
                continue;
            }
            info!("converting group {}", FileNames::group_token(g));
            {
                let mut out = BufferedOutputStream::create(
                    self.names.converting(g),
                    self.cfg.buffer_records,
                )?;
                convert_merge(inputs, &mut out)?;
                out.flush()?;
            }
            let dest = if have_open {
                self.names.open(g)
            } else {
                self.names.closed(g)
            };
            rename(&self.names.converting(g), &dest)?;
        }
        Ok(Outcome::Ok)
    }

    /// Splits frame-group closed files back into per-frame files.
    pub fn unpack(&self, first: FrameGroup, max: FrameGroup) -> Result<Outcome> {
        for g in first..max {
            if !self.names.closed(g).exists() {
                continue;
            }
            info!("unpacking group {}", FileNames::group_token(g));
            let mut input =
                BufferedInputStream::open(self.names.closed(g), self.cfg.buffer_records)?;
            let mut outputs = (0..FRAMES_PER_GROUP)
                .map(|i| {
                    BufferedOutputStream::create(
                        self.names.frame_file("closed", g * FRAMES_PER_GROUP + i),
                        self.cfg.merge_buffer_records,
                    )
                })
                .collect::<Result<Vec<_>>>()?;
            while let Some(cs) = input.read()? {
                let sub = cs.subframe() as usize;
                ensure!(sub < outputs.len(), "subframe out of range (corrupted data?)");
                let mut clean = cs;
                clean.set_subframe(0);
                outputs[sub].write(clean)?;
            }
            for out in &mut outputs {
                out.flush()?;
            }
        }
        Ok(Outcome::Ok)
    }

    /// Prints the per-frame census of closed frame-group files.
    pub fn count(&self, first: FrameGroup, max: FrameGroup) -> Result<Outcome> {
        for g in first..max {
            if !self.names.closed(g).exists() {
                continue;
            }
            println!("Frame group {}:", FileNames::group_token(g));
            let mut counts = vec![0u64; FRAMES_PER_GROUP as usize];
            let mut input =
                BufferedInputStream::open(self.names.closed(g), self.cfg.buffer_records)?;
            while let Some(cs) = input.read()? {
                let sub = cs.subframe() as usize;
                ensure!(sub < counts.len(), "invalid subframe (corrupted data?)");
                counts[sub] += 1;
            }
            for (i, &n) in counts.iter().enumerate() {
                if n > 0 {
                    println!("Frame {}: {n}", g * FRAMES_PER_GROUP + i as u32);
                }
            }
        }
        Ok(Outcome::Ok)
    }

    /// Checks one file for sortedness, duplicates and subframe range.
    pub fn verify(&self, path: &str) -> Result<Outcome> {
        let mut input = BufferedInputStream::open(path, self.cfg.buffer_records)?;
        let Some(mut prev) = input.read()? else {
            println!("Empty file.");
            return Ok(Outcome::Ok);
        };
        let mut equal_found = false;
        let mut unordered_found = false;
        let mut pos = 0u64;
        while let Some(cs) = input.read()? {
            pos += 1;
            if prev == cs && !equal_found {
                println!("Equal states found: {pos}");
                equal_found = true;
            }
            if prev > cs && !unordered_found {
                println!("Unordered states found: {pos}");
                unordered_found = true;
            }
            ensure!(
                cs.subframe() < FRAMES_PER_GROUP,
                "invalid subframe (corrupted data?)"
            );
            prev = cs;
            if equal_found && unordered_found {
                return Ok(Outcome::Ok);
            }
        }
        if !equal_found && !unordered_found {
            println!("OK: {} records.", pos + 1);
        }
        Ok(Outcome::Ok)
    }

    /// One-pass compaction: sorts and deduplicates each RAM-sized
    /// chunk of every open file without a full merge.
    pub fn pack_open(&self, first: FrameGroup, max: FrameGroup) -> Result<Outcome> {
        for g in first..max {
            if !self.names.open(g).exists() {
                continue;
            }
            let (read, written) = {
                let mut input = InputStream::open(self.names.open(g))?;
                let cap = self
                    .cfg
                    .sort_buffer_records()
                    .min(input.size().max(1) as usize);
                let mut buffer = vec![CompressedState::ZERO; cap];
                let mut output = crate::disk::OutputStream::create(self.names.openpacked(g))?;
                let mut read = 0u64;
                let mut written = 0u64;
                loop {
                    let got = input.read(&mut buffer)?;
                    if got == 0 {
                        break;
                    }
                    read += got as u64;
                    let chunk = &mut buffer[..got];
                    chunk.sort_unstable();
                    let n = crate::merge::deduplicate(chunk)?;
                    written += n as u64;
                    output.write(&chunk[..n])?;
                }
                output.flush()?;
                (read, written)
            };
            if read == written {
                info!("group {}: no improvement", FileNames::group_token(g));
            } else {
                info!("group {}: {read} -> {written}", FileNames::group_token(g));
            }
            remove(&self.names.open(g))?;
            rename(&self.names.openpacked(g), &self.names.open(g))?;
        }
        Ok(Outcome::Ok)
    }

    /// Fully sorts and deduplicates open files, newest group first.
    pub fn sort_open(&self, first: FrameGroup, max: FrameGroup) -> Result<Outcome> {
        for g in (first..max).rev() {
            if !self.names.open(g).exists() {
                continue;
            }
            ensure!(
                !self.names.merged(g).exists(),
                "merged file present for group {}",
                FileNames::group_token(g)
            );
            let initial = InputStream::open(self.names.open(g))?.size();
            if initial == 0 {
                continue;
            }
            self.sort_and_merge(g)?;
            remove(&self.names.open(g))?;
            rename(&self.names.merged(g), &self.names.open(g))?;
            let final_size = InputStream::open(self.names.open(g))?.size();
            info!(
                "group {}: {initial} -> {final_size}",
                FileNames::group_token(g)
            );
            if self.check_stop()? {
                return Ok(Outcome::Stop);
            }
        }
        Ok(Outcome::Ok)
    }

    /// In-place filter of every open file against the closed past.
    /// Requires sorted, deduplicated open files (run sort-open first).
    pub fn filter_open(&self) -> Result<()> {
        let mut streams: Vec<Option<SharedRewrite>> = (0..self.max_groups).map(|_| None).collect();
        let mut heap_inputs: Vec<(u32, SharedRewrite)> = Vec::new();
        for g in 0..self.max_groups {
            if self.names.open(g).exists() {
                ensure!(
                    !self.names.closed(g).exists(),
                    "open and closed node files present for group {}",
                    FileNames::group_token(g)
                );
                let shared = SharedRewrite(Rc::new(RefCell::new(BufferedRewriteStream::open(
                    self.names.open(g),
                    self.cfg.merge_buffer_records,
                )?)));
                heap_inputs.push((g, shared.clone()));
                streams[g as usize] = Some(shared);
            }
        }
        if heap_inputs.is_empty() {
            return Ok(());
        }

        let mut closed_inputs: Vec<(u32, BufferedInputStream)> = Vec::new();
        if self.cfg.use_all {
            if let Some(k) = self.last_all(self.max_groups) {
                closed_inputs.push((
                    k,
                    BufferedInputStream::open(self.names.all(k), self.cfg.all_buffer_records)?,
                ));
            }
        }
        if closed_inputs.is_empty() {
            for g in 0..self.max_groups {
                if self.names.closed(g).exists() {
                    closed_inputs.push((
                        g,
                        BufferedInputStream::open(
                            self.names.closed(g),
                            self.cfg.merge_buffer_records,
                        )?,
                    ));
                }
            }
        }

        let mut open_heap = InputHeap::new(heap_inputs)?;
        let mut closed_heap = InputHeap::new(closed_inputs)?;

        while let Some((state, tag)) = open_heap.head_entry() {
            // Collapse duplicates of this state across groups, keeping
            // the lowest frame.
            let mut lowest = state.frame(tag);
            let mut done = false;
            loop {
                if !open_heap.next()? {
                    done = true;
                    break;
                }
                let Some((next, tag)) = open_heap.head_entry() else {
                    done = true;
                    break;
                };
                ensure!(
                    next >= state,
                    "unsorted open node file (run sort-open first)"
                );
                if next != state {
                    break;
                }
                lowest = lowest.min(next.frame(tag));
            }

            let seen = closed_heap.scan_to(&state)? && closed_heap.head() == Some(state);
            if seen {
                closed_heap.next()?;
            } else {
                let mut out = state;
                out.set_subframe(lowest);
                let group = (lowest / FRAMES_PER_GROUP) as usize;
                let Some(stream) = streams[group].as_ref() else {
                    bail!("no open stream for the lowest frame group {group}");
                };
                stream.0.borrow_mut().write(out)?;
            }
            if done {
                break;
            }
        }

        for stream in streams.into_iter().flatten() {
            stream.0.borrow_mut().truncate()?;
        }
        Ok(())
    }

    /// Per-group sort + filter of open files, without expansion.
    pub fn seq_filter_open(&self, first: FrameGroup, max: FrameGroup) -> Result<Outcome> {
        for g in first..max {
            if !self.names.open(g).exists() && !self.names.merged(g).exists() {
                continue;
            }
            info!("filtering group {}", FileNames::group_token(g));
            if !self.names.merged(g).exists() {
                self.sort_and_merge(g)?;
            }

            {
                let mut source =
                    BufferedInputStream::open(self.names.merged(g), self.cfg.buffer_records)?;
                let mut inputs: Vec<(u32, BufferedInputStream)> = Vec::new();
                for gg in 0..g {
                    if self.cfg.use_all && self.names.all(gg).exists() {
                        inputs.push((
                            gg,
                            BufferedInputStream::open(
                                self.names.all(gg),
                                self.cfg.all_buffer_records,
                            )?,
                        ));
                        break;
                    }
                    let path = if self.names.open(gg).exists() {
                        self.names.open(gg)
                    } else if self.names.closed(gg).exists() {
                        self.names.closed(gg)
                    } else {
                        continue;
                    };
                    inputs.push((
                        gg,
                        BufferedInputStream::open(path, self.cfg.merge_buffer_records)?,
                    ));
                }
                let mut excludes = InputHeap::new(inputs)?;
                let mut output =
                    BufferedOutputStream::create(self.names.filtering(g), self.cfg.buffer_records)?;
                filter(&mut source, &mut excludes, &mut output, &mut |_| Ok(()))?;
                output.flush()?;
            }
            remove(&self.names.merged(g))?;
            if self.names.open(g).exists() {
                remove(&self.names.open(g))?;
            }
            rename(&self.names.filtering(g), &self.names.open(g))?;

            if self.check_stop()? {
                return Ok(Outcome::Stop);
            }
        }
        Ok(Outcome::Ok)
    }

    /// Re-expands closed files to repopulate missing open files.
    /// Groups that already have node files are protected from writes.
    pub fn regenerate_open(&self, first: FrameGroup, max: FrameGroup) -> Result<Outcome> {
        for g in 0..self.max_groups {
            if self.names.closed(g).exists() || self.names.open(g).exists() {
                self.open.mark_no_queue(g)?;
            }
        }
        let mut max = max;
        while max > 0 && !self.names.closed(max - 1).exists() {
            max -= 1;
        }

        let mut previous_total = 0u64;
        for g in first..max {
            if !self.names.closed(g).exists() {
                continue;
            }
            info!("re-expanding group {}", FileNames::group_token(g));
            let finish = Arc::new(Mutex::new(None));
            let pool = crate::workers::WorkerPool::start(
                self.cfg.workers(),
                self.cfg.process_queue_len,
                self.expand_handler(g, &finish),
            );
            let mut input =
                BufferedInputStream::open(self.names.closed(g), self.cfg.buffer_records)?;
            let feed: Result<()> = (|| {
                while let Some(cs) = input.read()? {
                    pool.process(cs)?;
                }
                Ok(())
            })();
            let drained = pool.drain();
            feed?;
            drained?;
            self.open.flush_all()?;

            let total = self.open.total_size()?;
            info!("regenerated {} open records", total - previous_total);
            previous_total = total;

            if self.check_stop()? {
                return Ok(Outcome::Stop);
            }
        }
        Ok(Outcome::Ok)
    }

    /// Builds the consolidated all-file from every closed file.
    pub fn create_all(&self) -> Result<Outcome> {
        let mut inputs = Vec::new();
        let mut max_closed = None;
        for g in 0..self.max_groups {
            if self.names.closed(g).exists() {
                inputs.push(BufferedInputStream::open(
                    self.names.closed(g),
                    self.cfg.merge_buffer_records,
                )?);
                max_closed = Some(g);
            }
        }
        let Some(max_closed) = max_closed else {
            bail!("no closed node files to merge");
        };
        {
            let mut out = BufferedOutputStream::create(
                self.names.allnew(max_closed),
                self.cfg.all_buffer_records,
            )?;
            merge(inputs, &mut out)?;
            out.flush()?;
        }
        rename(&self.names.allnew(max_closed), &self.names.all(max_closed))?;
        Ok(Outcome::Ok)
    }

    /// Scans node files for any finish state and traces it.
    pub fn find_exit(&self, first: FrameGroup, max: FrameGroup) -> Result<Outcome> {
        ensure!(
            !self.names.partial_solution().exists(),
            "partial trace checkpoint present; run search to resume it, or delete {}",
            self.names.partial_solution().display()
        );
        for g in first..max {
            let path = if self.names.closed(g).exists() {
                self.names.closed(g)
            } else if self.names.open(g).exists() {
                self.names.open(g)
            } else {
                continue;
            };
            info!("scanning group {}", FileNames::group_token(g));
            let mut input = BufferedInputStream::open(path, self.cfg.buffer_records)?;
            while let Some(cs) = input.read()? {
                let state = self.problem.decompress(&cs);
                if self.problem.is_finish(&state) {
                    let frame = cs.frame(g);
                    info!("exit found at frame {frame}, tracing path");
                    trace::trace_exit(self, Some((state, frame)))?;
                    return Ok(Outcome::Ok);
                }
            }
        }
        info!("exit not found");
        Ok(Outcome::NotFound)
    }
}

/// Merge for `convert`: heads adopt their stream's subframe tag, the
/// smallest subframe wins among duplicates, and out-of-order records
/// (from historic flush bugs) are skipped with a warning.
fn convert_merge(
    inputs: Vec<(u32, BufferedInputStream)>,
    output: &mut BufferedOutputStream,
) -> Result<()> {
    let mut heap = InputHeap::new(inputs)?;
    let Some((mut current, first_tag)) = heap.head_entry() else {
        return Ok(());
    };
    current.set_subframe(first_tag);
    let mut warned_order = false;
    let mut warned_dup = false;
    while heap.next()? {
        let Some((mut next, tag)) = heap.head_entry() else {
            break;
        };
        next.set_subframe(tag);
        if next < current {
            if !warned_order {
                warn!("unordered states found in subframe {tag}, skipping");
                warned_order = true;
            }
            continue;
        }
        if next == current {
            if !warned_dup {
                warn!(
                    "duplicate states found in subframes {} and {tag}",
                    current.subframe()
                );
                warned_dup = true;
            }
            if current.subframe() > next.subframe() {
                current.set_subframe(next.subframe());
            }
        } else {
            output.write(current)?;
            current = next;
        }
    }
    output.write(current)
}
