//! The outer BFS driver: one frame group per iteration, each group
//! flowing through sort, merge, filter and expansion.
//!
//! A group may take several passes: while expanding group `g`, workers
//! can discover children whose frames still fall inside `g` (any
//! problem whose smallest delay is below the group width does this
//! constantly). Each pass consumes the re-created open file and
//! filters it against the closed files plus the closing parts already
//! written, until the group stops producing for itself. The closing
//! parts are merged into the final closed file.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, ensure, Context, Result};
use tracing::{debug, info};

use crate::cache::RecentCache;
use crate::compressed::{max_groups, CompressedState, Frame, FrameGroup};
use crate::config::Config;
use crate::disk::{
    copy_file, remove, rename, BufferedInputStream, BufferedOutputStream, FileNames, InputStream,
    OutputStream,
};
use crate::merge::{deduplicate, filter, merge, merge_two, HeapReader, InputHeap};
use crate::open_queue::OpenQueue;
use crate::problem::Problem;
use crate::trace;
use crate::workers::{StateHandler, WorkerPool};

/// Why a run ended; `main` maps these to process exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    Stop,
    NotFound,
}

/// The best finish seen so far: smallest frame wins.
pub type FinishRecord = Arc<Mutex<Option<(Frame, CompressedState)>>>;

#[derive(Default)]
pub struct Stats {
    pub states_processed: AtomicU64,
    pub children_generated: AtomicU64,
}

pub struct Session<P: Problem> {
    pub problem: Arc<P>,
    pub cfg: Config,
    pub names: FileNames,
    pub max_groups: FrameGroup,
    pub open: Arc<OpenQueue>,
    pub cache: Arc<RecentCache>,
    pub stats: Arc<Stats>,
    stop_requested: Arc<AtomicBool>,
}

enum GroupResult {
    Closed,
    FinishFound,
}

impl<P: Problem> Session<P> {
    pub fn new(problem: P, cfg: Config, names: FileNames) -> Self {
        let groups = max_groups(problem.max_frames());
        let open = Arc::new(OpenQueue::new(names.clone(), groups, cfg.buffer_records));
        let cache = Arc::new(RecentCache::new(cfg.ram_size, cfg.nodes_per_hash));
        Self {
            problem: Arc::new(problem),
            cfg,
            names,
            max_groups: groups,
            open,
            cache,
            stats: Arc::new(Stats::default()),
            stop_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag polled at group boundaries; wire it to ctrl-c.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop_requested)
    }

    /// The main search loop.
    pub fn search(&self, max_group_limit: Option<FrameGroup>) -> Result<Outcome> {
        let limit = max_group_limit
            .map_or(self.max_groups, |m| m.min(self.max_groups));

        if self.names.partial_solution().exists() {
            info!("partial trace checkpoint present, resuming exit trace");
            trace::trace_exit(self, None)?;
            return Ok(Outcome::Ok);
        }

        let mut first_group = 0;
        for g in (0..self.max_groups).rev() {
            if self.names.closed(g).exists() {
                first_group = g + 1;
                info!("resuming from frame group {}", FileNames::group_token(g + 1));
                break;
            }
        }

        for g in first_group..self.max_groups {
            if self.names.open(g).exists() {
                debug!("reopening queue for group {}", FileNames::group_token(g));
                self.open.reopen(g)?;
            }
        }

        if first_group == 0 && !self.group_has_work(0)? {
            for state in self.problem.initial_states() {
                let cs = self.problem.compress(&state);
                self.open.enqueue(cs, 0)?;
            }
        }

        for g in first_group..limit {
            if !self.group_has_work(g)? {
                continue;
            }
            info!(
                "frame group {}/{}",
                FileNames::group_token(g),
                FileNames::group_token(limit)
            );

            let finish: FinishRecord = Arc::new(Mutex::new(None));
            match self.process_group(g, &finish)? {
                GroupResult::FinishFound => {
                    let recorded = *finish
                        .lock()
                        .map_err(|_| anyhow!("finish record lock poisoned"))?;
                    let Some((frame, cs)) = recorded else {
                        bail!("finish flagged but not recorded");
                    };
                    ensure!(frame / crate::compressed::FRAMES_PER_GROUP == g, "finish outside current group");
                    info!("exit found at frame {frame}, tracing path");
                    let state = self.problem.decompress(&cs);
                    trace::trace_exit(self, Some((state, frame)))?;
                    return Ok(Outcome::Ok);
                }
                GroupResult::Closed => {}
            }

            if self.check_stop()? {
                return Ok(Outcome::Stop);
            }

            if self.cfg.open_bytes_limit > 0
                && self.open_bytes_on_disk()? > self.cfg.open_bytes_limit
            {
                info!("open files exceed the disk budget, compacting in place");
                self.compact_open(g + 1)?;
            }
        }

        info!("exit not found");
        Ok(Outcome::NotFound)
    }

    fn group_has_work(&self, g: FrameGroup) -> Result<bool> {
        Ok(self.open.is_active(g)?
            || self.names.open(g).exists()
            || self.names.merged(g).exists()
            || self.closing_part(g, 0).exists())
    }

    /// Closing part `i` of group `g`; part 0 uses the plain name.
    pub fn closing_part(&self, g: FrameGroup, part: usize) -> PathBuf {
        if part == 0 {
            self.names.closing(g)
        } else {
            self.names
                .dir()
                .join(format!(
                    "{}-{part}.bin",
                    self.names.closing(g).file_stem().unwrap_or_default().to_string_lossy()
                ))
        }
    }

    fn allnew_part(&self, g: FrameGroup, part: usize) -> PathBuf {
        if part == 0 {
            self.names.allnew(g)
        } else {
            self.names
                .dir()
                .join(format!(
                    "{}-{part}.bin",
                    self.names.allnew(g).file_stem().unwrap_or_default().to_string_lossy()
                ))
        }
    }

    fn process_group(&self, g: FrameGroup, finish: &FinishRecord) -> Result<GroupResult> {
        let mut parts: Vec<PathBuf> = Vec::new();
        while self.closing_part(g, parts.len()).exists() {
            parts.push(self.closing_part(g, parts.len()));
        }

        let mut found_finish = false;
        loop {
            self.open.close_group(g)?;
            if !self.names.merged(g).exists() {
                if !self.names.open(g).exists() {
                    break;
                }
                self.sort_and_merge(g)?;
                remove(&self.names.open(g))?;
            } else {
                debug!("reopening merged file for group {}", FileNames::group_token(g));
            }

            self.cache.clear()?;
            let pass = parts.len();
            self.run_filter_pass(g, pass, &parts, finish)?;
            parts.push(self.closing_part(g, pass));

            if self.names.merged(g).exists() {
                remove(&self.names.merged(g))?;
            }
            if finish
                .lock()
                .map_err(|_| anyhow!("finish record lock poisoned"))?
                .is_some()
            {
                // Finalize what was expanded so far: the exit trace
                // needs the finish's ancestors from this group's
                // closing parts.
                found_finish = true;
                break;
            }
            if !self.names.open(g).exists() && !self.open.is_active(g)? {
                break;
            }
            debug!("group {} produced same-group children, re-running", FileNames::group_token(g));
        }

        // Combine closing parts into the closed file.
        match parts.len() {
            0 => {}
            1 => rename(&parts[0], &self.names.closed(g))?,
            _ => {
                let inputs = parts
                    .iter()
                    .map(|p| BufferedInputStream::open(p, self.cfg.merge_buffer_records))
                    .collect::<Result<Vec<_>>>()?;
                let mut out =
                    BufferedOutputStream::create(self.names.filtering(g), self.cfg.buffer_records)?;
                merge(inputs, &mut out)?;
                out.flush()?;
                rename(&self.names.filtering(g), &self.names.closed(g))?;
                for part in &parts {
                    remove(part)?;
                }
            }
        }

        if self.cfg.use_all && !parts.is_empty() {
            let previous_all = self.last_all(g);
            let last = self.allnew_part(g, parts.len() - 1);
            rename(&last, &self.names.all(g))?;
            for i in 0..parts.len() - 1 {
                let p = self.allnew_part(g, i);
                if p.exists() {
                    remove(&p)?;
                }
            }
            if let Some(k) = previous_all {
                remove(&self.names.all(k))?;
            }
        }

        debug!(
            states = self.stats.states_processed.load(Ordering::Relaxed),
            children = self.stats.children_generated.load(Ordering::Relaxed),
            "group {} closed",
            FileNames::group_token(g)
        );
        Ok(if found_finish {
            GroupResult::FinishFound
        } else {
            GroupResult::Closed
        })
    }

    /// Sort phase: RAM-sized chunks of the open file, sorted and
    /// deduplicated, then k-way merged into the group's merged file.
    pub fn sort_and_merge(&self, g: FrameGroup) -> Result<()> {
        let mut chunks = 0usize;
        {
            let mut input = InputStream::open(self.names.open(g))?;
            let cap = self
                .cfg
                .sort_buffer_records()
                .min(input.size().max(1) as usize);
            let mut buffer = vec![CompressedState::ZERO; cap];
            loop {
                let got = input.read(&mut buffer)?;
                if got == 0 {
                    break;
                }
                let chunk = &mut buffer[..got];
                chunk.sort_unstable();
                let n = deduplicate(chunk)?;
                let mut out = OutputStream::create(self.names.chunk(g, chunks))?;
                out.write(&chunk[..n])?;
                out.flush()?;
                chunks += 1;
            }
        }
        debug!("sorted {} chunk(s)", chunks);

        match chunks {
            0 => {
                let mut out = OutputStream::create(self.names.merging(g))?;
                out.flush()?;
                rename(&self.names.merging(g), &self.names.merged(g))?;
            }
            1 => rename(&self.names.chunk(g, 0), &self.names.merged(g))?,
            _ => {
                let inputs = (0..chunks)
                    .map(|i| {
                        BufferedInputStream::open(
                            self.names.chunk(g, i),
                            self.cfg.merge_buffer_records,
                        )
                    })
                    .collect::<Result<Vec<_>>>()?;
                let mut out =
                    BufferedOutputStream::create(self.names.merging(g), self.cfg.buffer_records)?;
                merge(inputs, &mut out)?;
                out.flush()?;
                rename(&self.names.merging(g), &self.names.merged(g))?;
                for i in 0..chunks {
                    remove(&self.names.chunk(g, i))?;
                }
            }
        }
        Ok(())
    }

    /// Filter + expand: streams the merged file against everything
    /// already seen, writing survivors to the next closing part and
    /// handing them to the workers.
    fn run_filter_pass(
        &self,
        g: FrameGroup,
        pass: usize,
        parts: &[PathBuf],
        finish: &FinishRecord,
    ) -> Result<()> {
        let pool = WorkerPool::start(
            self.cfg.workers(),
            self.cfg.process_queue_len,
            self.expand_handler(g, finish),
        );
        let filtering = self.names.filtering(g);
        let part_path = self.closing_part(g, pass);

        let result: Result<()> = (|| {
            if self.cfg.use_all {
                if g == 0 && pass == 0 {
                    // No previous "all": the merged file is both the
                    // closing set and the seed of the all-chain.
                    copy_file(
                        &self.names.merged(0),
                        &self.allnew_part(0, 0),
                        self.cfg.buffer_records,
                    )?;
                    copy_file(&self.names.merged(0), &filtering, self.cfg.buffer_records)?;
                    let mut input =
                        BufferedInputStream::open(self.names.merged(0), self.cfg.buffer_records)?;
                    while let Some(cs) = input.read()? {
                        pool.process(cs)?;
                    }
                    return Ok(());
                }

                let mut source =
                    BufferedInputStream::open(self.names.merged(g), self.cfg.buffer_records)?;
                let mut inputs: Vec<(u32, BufferedInputStream)> = Vec::new();
                if pass == 0 {
                    let Some(k) = self.last_all(g) else {
                        bail!("no all file below group {g}; run create-all first");
                    };
                    inputs.push((
                        0,
                        BufferedInputStream::open(
                            self.names.all(k),
                            self.cfg.all_buffer_records,
                        )?,
                    ));
                    for c in k + 1..g {
                        if self.names.closed(c).exists() {
                            inputs.push((
                                c,
                                BufferedInputStream::open(
                                    self.names.closed(c),
                                    self.cfg.merge_buffer_records,
                                )?,
                            ));
                        }
                    }
                } else {
                    let prev = self.allnew_part(g, pass - 1);
                    ensure!(
                        prev.exists(),
                        "missing union file for group {g} pass {pass}"
                    );
                    inputs.push((
                        0,
                        BufferedInputStream::open(prev, self.cfg.all_buffer_records)?,
                    ));
                }
                let mut seen = HeapReader::new(InputHeap::new(inputs)?);
                let mut allnew_out = BufferedOutputStream::create(
                    self.allnew_part(g, pass),
                    self.cfg.all_buffer_records,
                )?;
                let mut closing_out =
                    BufferedOutputStream::create(&filtering, self.cfg.buffer_records)?;
                merge_two(
                    &mut source,
                    &mut seen,
                    &mut allnew_out,
                    &mut closing_out,
                    &mut |cs| pool.process(cs),
                )?;
                allnew_out.flush()?;
                closing_out.flush()?;
            } else {
                let mut source =
                    BufferedInputStream::open(self.names.merged(g), self.cfg.buffer_records)?;
                let mut inputs: Vec<(u32, BufferedInputStream)> = Vec::new();
                for c in 0..g {
                    if self.names.closed(c).exists() {
                        inputs.push((
                            c,
                            BufferedInputStream::open(
                                self.names.closed(c),
                                self.cfg.merge_buffer_records,
                            )?,
                        ));
                    }
                }
                for (i, part) in parts.iter().enumerate() {
                    inputs.push((
                        g + i as u32,
                        BufferedInputStream::open(part, self.cfg.merge_buffer_records)?,
                    ));
                }
                let mut excludes = InputHeap::new(inputs)?;
                let mut closing_out =
                    BufferedOutputStream::create(&filtering, self.cfg.buffer_records)?;
                filter(&mut source, &mut excludes, &mut closing_out, &mut |cs| {
                    pool.process(cs)
                })?;
                closing_out.flush()?;
            }
            Ok(())
        })();

        // Always drain the pool so worker errors surface even when the
        // producer failed first.
        let drained = pool.drain();
        result?;
        drained?;
        self.open.flush_all()?;
        // The pass is only marked complete (the part renamed into
        // place) once every kept state has been expanded and its
        // children are on disk.
        rename(&filtering, &part_path)
    }

    /// The worker-side handler: decompress, finish-check, expand and
    /// enqueue children through the cache.
    pub fn expand_handler(&self, g: FrameGroup, finish: &FinishRecord) -> Arc<StateHandler> {
        let problem = Arc::clone(&self.problem);
        let cache = Arc::clone(&self.cache);
        let open = Arc::clone(&self.open);
        let stats = Arc::clone(&self.stats);
        let finish = Arc::clone(finish);
        Arc::new(move |cs: CompressedState| {
            let state = problem.decompress(&cs);
            #[cfg(debug_assertions)]
            {
                let back = problem.compress(&state);
                ensure!(
                    back == cs,
                    "compress/decompress round trip mismatch: {:?} vs {:?}",
                    back,
                    cs
                );
            }
            let frame = cs.frame(g);
            stats.states_processed.fetch_add(1, Ordering::Relaxed);

            if problem.is_finish(&state) {
                let mut slot = finish
                    .lock()
                    .map_err(|_| anyhow!("finish record lock poisoned"))?;
                if slot.map_or(true, |(best, _)| frame < best) {
                    *slot = Some((frame, cs));
                }
                return Ok(());
            }

            let mut failure = None;
            problem.expand(&state, &mut |_step, child, delay| {
                debug_assert!(delay > 0);
                if failure.is_some() {
                    return;
                }
                stats.children_generated.fetch_add(1, Ordering::Relaxed);
                let child_cs = problem.compress(child);
                if let Err(e) = cache.observe(child_cs, frame + delay, &open) {
                    failure = Some(e);
                }
            });
            failure.map_or(Ok(()), Err)
        })
    }

    /// The newest consolidated all-file strictly below `g`.
    pub fn last_all(&self, g: FrameGroup) -> Option<FrameGroup> {
        (0..g).rev().find(|&k| self.names.all(k).exists())
    }

    /// Consumes the stop sentinel or the ctrl-c flag.
    pub fn check_stop(&self) -> Result<bool> {
        if self.names.stop().exists() {
            std::fs::remove_file(self.names.stop()).context("removing stop file")?;
            info!("stop file found");
            return Ok(true);
        }
        if self.stop_requested.load(Ordering::Relaxed) {
            info!("stop requested");
            return Ok(true);
        }
        Ok(false)
    }

    fn open_bytes_on_disk(&self) -> Result<u64> {
        let mut total = 0;
        for g in 0..self.max_groups {
            let path = self.names.open(g);
            if let Ok(meta) = std::fs::metadata(&path) {
                total += meta.len();
            }
        }
        Ok(total)
    }

    /// Low-disk fallback: close every queue, sort and filter the open
    /// files in place, then reopen them.
    fn compact_open(&self, from: FrameGroup) -> Result<()> {
        for g in 0..self.max_groups {
            self.open.close_group(g)?;
        }
        let _ = self.sort_open(from, self.max_groups)?;
        self.filter_open()?;
        for g in from..self.max_groups {
            if self.names.open(g).exists() {
                self.open.reopen(g)?;
            }
        }
        Ok(())
    }
}
