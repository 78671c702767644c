//! K-way merging, filtering and deduplication over sorted record
//! streams.
//!
//! The input heap keeps one head record per stream. `scan_to` advances
//! lagging streams with a tight per-stream inner loop bounded by the
//! second-smallest head, so skipping a long run of records costs one
//! sift instead of one sift per record.

use anyhow::{bail, ensure, Result};

use crate::compressed::CompressedState;
use crate::disk::{BufferedInputStream, BufferedOutputStream, BufferedRewriteStream};

/// Anything that yields records in sorted order.
pub trait RecordSource {
    fn read(&mut self) -> Result<Option<CompressedState>>;
}

impl RecordSource for BufferedInputStream {
    fn read(&mut self) -> Result<Option<CompressedState>> {
        BufferedInputStream::read(self)
    }
}

impl RecordSource for BufferedRewriteStream {
    fn read(&mut self) -> Result<Option<CompressedState>> {
        BufferedRewriteStream::read(self)
    }
}

struct Entry<S> {
    head: CompressedState,
    tag: u32,
    source: S,
}

/// Min-heap over the head records of a set of sorted streams.
///
/// Each stream carries a caller-chosen tag so consumers can tell which
/// stream the current head came from (frame group, subframe index).
pub struct InputHeap<S> {
    entries: Vec<Entry<S>>,
}

impl<S: RecordSource> InputHeap<S> {
    pub fn new(sources: Vec<(u32, S)>) -> Result<Self> {
        let mut entries = Vec::with_capacity(sources.len());
        for (tag, mut source) in sources {
            if let Some(head) = source.read()? {
                entries.push(Entry { head, tag, source });
            }
        }
        entries.sort_by(|a, b| a.head.cmp(&b.head));
        Ok(Self { entries })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The smallest head across all streams, or `None` when exhausted.
    pub fn head(&self) -> Option<CompressedState> {
        self.entries.first().map(|e| e.head)
    }

    /// The smallest head together with its stream's tag.
    pub fn head_entry(&self) -> Option<(CompressedState, u32)> {
        self.entries.first().map(|e| (e.head, e.tag))
    }

    /// Replaces the head with the next record from its stream.
    pub fn next(&mut self) -> Result<bool> {
        if self.entries.is_empty() {
            return Ok(false);
        }
        match self.entries[0].source.read()? {
            Some(cs) => self.entries[0].head = cs,
            None => {
                self.entries.swap_remove(0);
                if self.entries.is_empty() {
                    return Ok(false);
                }
            }
        }
        self.sift_down();
        Ok(true)
    }

    /// Advances every stream whose head is `< target`. Returns false
    /// when all streams run dry first; on true, `head() >= target`.
    pub fn scan_to(&mut self, target: &CompressedState) -> Result<bool> {
        if self.entries.is_empty() {
            return Ok(false);
        }
        while self.entries[0].head < *target {
            let limit = match self.min_child_head() {
                Some(second) if second < *target => second,
                _ => *target,
            };
            loop {
                match self.entries[0].source.read()? {
                    Some(cs) if cs < limit => continue,
                    Some(cs) => {
                        self.entries[0].head = cs;
                        break;
                    }
                    None => {
                        self.entries.swap_remove(0);
                        if self.entries.is_empty() {
                            return Ok(false);
                        }
                        break;
                    }
                }
            }
            self.sift_down();
        }
        Ok(true)
    }

    fn min_child_head(&self) -> Option<CompressedState> {
        match (self.entries.get(1), self.entries.get(2)) {
            (Some(a), Some(b)) => Some(a.head.min(b.head)),
            (Some(a), None) => Some(a.head),
            _ => None,
        }
    }

    fn sift_down(&mut self) {
        let len = self.entries.len();
        let mut parent = 0;
        loop {
            let mut child = parent * 2 + 1;
            if child >= len {
                return;
            }
            if child + 1 < len && self.entries[child + 1].head < self.entries[child].head {
                child += 1;
            }
            if self.entries[parent].head <= self.entries[child].head {
                return;
            }
            self.entries.swap(parent, child);
            parent = child;
        }
    }
}

/// Adapts an [`InputHeap`] into a single merged [`RecordSource`]
/// (duplicates included).
pub struct HeapReader<S> {
    heap: InputHeap<S>,
    first: bool,
}

impl<S: RecordSource> HeapReader<S> {
    pub fn new(heap: InputHeap<S>) -> Self {
        Self { heap, first: true }
    }
}

impl<S: RecordSource> RecordSource for HeapReader<S> {
    fn read(&mut self) -> Result<Option<CompressedState>> {
        if self.first {
            self.first = false;
        } else if !self.heap.next()? {
            return Ok(None);
        }
        Ok(self.heap.head())
    }
}

/// K-way merge with deduplication: among equal records the smallest
/// subframe (earliest frame within the group) wins.
pub fn merge<S: RecordSource>(
    inputs: Vec<S>,
    output: &mut BufferedOutputStream,
) -> Result<()> {
    let tagged = inputs.into_iter().enumerate().map(|(i, s)| (i as u32, s));
    let mut heap = InputHeap::new(tagged.collect())?;
    let Some(mut current) = heap.head() else {
        return Ok(());
    };
    while heap.next()? {
        let Some(next) = heap.head() else { break };
        ensure!(next >= current, "merge inputs are not sorted");
        if next == current {
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

/// Streams `source` through, dropping every record present in the
/// union of the exclude streams. Kept records go to `output` and to
/// `on_kept`. All inputs must be sorted and deduplicated.
pub fn filter<S: RecordSource>(
    source: &mut impl RecordSource,
    excludes: &mut InputHeap<S>,
    output: &mut BufferedOutputStream,
    on_kept: &mut dyn FnMut(CompressedState) -> Result<()>,
) -> Result<()> {
    let mut src = source.read()?;
    while let Some(cs) = src {
        if !excludes.scan_to(&cs)? {
            // Exclude streams exhausted: the rest of the source passes.
            output.write(cs)?;
            on_kept(cs)?;
            while let Some(rest) = source.read()? {
                output.write(rest)?;
                on_kept(rest)?;
            }
            return Ok(());
        }
        let Some(head) = excludes.head() else {
            bail!("exclude heap produced no head after a scan");
        };
        if cs == head {
            src = source.read()?;
            continue;
        }
        ensure!(cs < head, "filter exclude streams are not sorted");
        output.write(cs)?;
        on_kept(cs)?;
        src = source.read()?;
        while let Some(next) = src {
            if next >= head {
                break;
            }
            output.write(next)?;
            on_kept(next)?;
            src = source.read()?;
        }
    }
    Ok(())
}

/// Two-way merge writing the union to `union_out` and the records
/// present only in `a` to `a_only_out` (and `on_a_only`). Both inputs
/// must be sorted and deduplicated.
pub fn merge_two(
    a: &mut impl RecordSource,
    b: &mut impl RecordSource,
    union_out: &mut BufferedOutputStream,
    a_only_out: &mut BufferedOutputStream,
    on_a_only: &mut dyn FnMut(CompressedState) -> Result<()>,
) -> Result<()> {
    let mut ra = a.read()?;
    let mut rb = b.read()?;
    loop {
        match (ra, rb) {
            (None, None) => return Ok(()),
            (Some(x), None) => {
                union_out.write(x)?;
                a_only_out.write(x)?;
                on_a_only(x)?;
                ra = a.read()?;
            }
            (None, Some(y)) => {
                union_out.write(y)?;
                rb = b.read()?;
            }
            (Some(x), Some(y)) => {
                if x == y {
                    union_out.write(x)?;
                    ra = a.read()?;
                    rb = b.read()?;
                } else if x < y {
                    union_out.write(x)?;
                    a_only_out.write(x)?;
                    on_a_only(x)?;
                    ra = a.read()?;
                } else {
                    union_out.write(y)?;
                    rb = b.read()?;
                }
            }
        }
    }
}

/// In-place dedup of a sorted run; among equals the smallest subframe
/// survives. Returns the new record count.
pub fn deduplicate(buf: &mut [CompressedState]) -> Result<usize> {
    if buf.is_empty() {
        return Ok(0);
    }
    let mut write = 0;
    for read in 1..buf.len() {
        let cur = buf[read];
        ensure!(cur >= buf[write], "dedup input is not sorted");
        if cur == buf[write] {
            if buf[write].subframe() > cur.subframe() {
                buf[write].set_subframe(cur.subframe());
            }
        } else {
            write += 1;
            buf[write] = cur;
        }
    }
    Ok(write + 1)
}
