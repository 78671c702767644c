//! Record-oriented file streams and the on-disk naming scheme.
//!
//! Files are bare arrays of 16-byte records, no header, no framing.
//! Three stream roles cover the pipeline's needs: sequential read,
//! sequential append (with a resume mode that seeks to the end), and
//! in-place rewrite where the write cursor trails the read cursor.
//! Each role has a buffered wrapper exposing whole-record operations.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{ensure, Context, Result};

use crate::compressed::{CompressedState, FrameGroup, Frame, FRAMES_PER_GROUP};

const RECORD: u64 = CompressedState::BYTES as u64;

/// Formats names of the working files for one problem instance.
///
/// Pattern: `<problem>-<stage>-<group>.bin`, with the group token
/// `<n>x` (ten frames per group). Legacy per-frame files use the bare
/// frame number instead of the group token.
#[derive(Debug, Clone)]
pub struct FileNames {
    dir: PathBuf,
    problem: String,
}

impl FileNames {
    pub fn new(dir: impl Into<PathBuf>, problem: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            problem: problem.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn group_token(group: FrameGroup) -> String {
        debug_assert_eq!(FRAMES_PER_GROUP, 10);
        format!("{group}x")
    }

    pub fn stage(&self, stage: &str, group: FrameGroup) -> PathBuf {
        self.dir.join(format!(
            "{}-{stage}-{}.bin",
            self.problem,
            Self::group_token(group)
        ))
    }

    pub fn open(&self, group: FrameGroup) -> PathBuf {
        self.stage("open", group)
    }

    pub fn closed(&self, group: FrameGroup) -> PathBuf {
        self.stage("closed", group)
    }

    pub fn merged(&self, group: FrameGroup) -> PathBuf {
        self.stage("merged", group)
    }

    pub fn merging(&self, group: FrameGroup) -> PathBuf {
        self.stage("merging", group)
    }

    pub fn closing(&self, group: FrameGroup) -> PathBuf {
        self.stage("closing", group)
    }

    pub fn filtering(&self, group: FrameGroup) -> PathBuf {
        self.stage("filtering", group)
    }

    pub fn all(&self, group: FrameGroup) -> PathBuf {
        self.stage("all", group)
    }

    pub fn allnew(&self, group: FrameGroup) -> PathBuf {
        self.stage("allnew", group)
    }

    pub fn openpacked(&self, group: FrameGroup) -> PathBuf {
        self.stage("openpacked", group)
    }

    pub fn converting(&self, group: FrameGroup) -> PathBuf {
        self.stage("converting", group)
    }

    pub fn chunk(&self, group: FrameGroup, chunk: usize) -> PathBuf {
        self.dir.join(format!(
            "{}-chunk-{}-{chunk}.bin",
            self.problem,
            Self::group_token(group)
        ))
    }

    /// Legacy single-frame file, as produced by `unpack`.
    pub fn frame_file(&self, stage: &str, frame: Frame) -> PathBuf {
        self.dir.join(format!("{}-{stage}-{frame}.bin", self.problem))
    }

    pub fn partial_solution(&self) -> PathBuf {
        self.dir.join(format!("{}-solution.bin", self.problem))
    }

    pub fn partial_solution_new(&self) -> PathBuf {
        self.dir.join(format!("{}-solution-new.bin", self.problem))
    }

    pub fn solution(&self) -> PathBuf {
        self.dir.join(format!("{}-solution.txt", self.problem))
    }

    pub fn stop(&self) -> PathBuf {
        self.dir.join(format!("{}-stop.txt", self.problem))
    }
}

fn records_in(file: &File, path: &Path) -> Result<u64> {
    let len = file
        .metadata()
        .with_context(|| format!("stat {}", path.display()))?
        .len();
    ensure!(
        len % RECORD == 0,
        "{} is not a whole number of records ({len} bytes)",
        path.display()
    );
    Ok(len / RECORD)
}

fn decode_records(bytes: &[u8], out: &mut [CompressedState]) {
    for (chunk, slot) in bytes.chunks_exact(CompressedState::BYTES).zip(out.iter_mut()) {
        let mut raw = [0u8; CompressedState::BYTES];
        raw.copy_from_slice(chunk);
        *slot = CompressedState::from_le_bytes(raw);
    }
}

fn encode_records(records: &[CompressedState], out: &mut Vec<u8>) {
    out.clear();
    out.reserve(records.len() * CompressedState::BYTES);
    for cs in records {
        out.extend_from_slice(&cs.to_le_bytes());
    }
}

/// Sequential reader over a record file.
pub struct InputStream {
    file: File,
    path: PathBuf,
    records: u64,
    position: u64,
    scratch: Vec<u8>,
}

impl InputStream {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).with_context(|| format!("open {}", path.display()))?;
        let records = records_in(&file, &path)?;
        Ok(Self {
            file,
            path,
            records,
            position: 0,
            scratch: Vec::new(),
        })
    }

    pub fn size(&self) -> u64 {
        self.records
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn seek(&mut self, record: u64) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(record * RECORD))
            .with_context(|| format!("seek {}", self.path.display()))?;
        self.position = record;
        Ok(())
    }

    /// Reads up to `buf.len()` records; 0 means end of file.
    pub fn read(&mut self, buf: &mut [CompressedState]) -> Result<usize> {
        let left = self.records.saturating_sub(self.position);
        let want = (buf.len() as u64).min(left) as usize;
        if want == 0 {
            return Ok(0);
        }
        self.scratch.resize(want * CompressedState::BYTES, 0);
        self.file
            .read_exact(&mut self.scratch)
            .with_context(|| format!("read {}", self.path.display()))?;
        decode_records(&self.scratch, &mut buf[..want]);
        self.position += want as u64;
        Ok(want)
    }
}

/// Sequential appender.
pub struct OutputStream {
    file: File,
    path: PathBuf,
    records: u64,
    scratch: Vec<u8>,
}

impl OutputStream {
    /// Creates the file, truncating anything already there.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path).with_context(|| format!("create {}", path.display()))?;
        Ok(Self {
            file,
            path,
            records: 0,
            scratch: Vec::new(),
        })
    }

    /// Opens for appending, positioned at the current end of file.
    pub fn append(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("append {}", path.display()))?;
        let records = records_in(&file, &path)?;
        Ok(Self {
            file,
            path,
            records,
            scratch: Vec::new(),
        })
    }

    pub fn size(&self) -> u64 {
        self.records
    }

    pub fn write(&mut self, records: &[CompressedState]) -> Result<()> {
        encode_records(records, &mut self.scratch);
        self.file
            .write_all(&self.scratch)
            .with_context(|| format!("write {}", self.path.display()))?;
        self.records += records.len() as u64;
        Ok(())
    }

    /// Forces written records to disk.
    pub fn flush(&mut self) -> Result<()> {
        self.file
            .sync_data()
            .with_context(|| format!("sync {}", self.path.display()))
    }
}

/// In-place rewriter: the write cursor must trail the read cursor.
pub struct RewriteStream {
    file: File,
    path: PathBuf,
    records: u64,
    read_pos: u64,
    write_pos: u64,
    scratch: Vec<u8>,
}

impl RewriteStream {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("open {}", path.display()))?;
        let records = records_in(&file, &path)?;
        Ok(Self {
            file,
            path,
            records,
            read_pos: 0,
            write_pos: 0,
            scratch: Vec::new(),
        })
    }

    pub fn size(&self) -> u64 {
        self.records
    }

    pub fn read(&mut self, buf: &mut [CompressedState]) -> Result<usize> {
        let left = self.records.saturating_sub(self.read_pos);
        let want = (buf.len() as u64).min(left) as usize;
        if want == 0 {
            return Ok(0);
        }
        self.scratch.resize(want * CompressedState::BYTES, 0);
        self.file
            .seek(SeekFrom::Start(self.read_pos * RECORD))
            .with_context(|| format!("seek {}", self.path.display()))?;
        self.file
            .read_exact(&mut self.scratch)
            .with_context(|| format!("read {}", self.path.display()))?;
        decode_records(&self.scratch, &mut buf[..want]);
        self.read_pos += want as u64;
        Ok(want)
    }

    pub fn write(&mut self, records: &[CompressedState]) -> Result<()> {
        ensure!(
            self.write_pos + records.len() as u64 <= self.read_pos,
            "rewrite cursor would overtake unread records in {}",
            self.path.display()
        );
        encode_records(records, &mut self.scratch);
        self.file
            .seek(SeekFrom::Start(self.write_pos * RECORD))
            .with_context(|| format!("seek {}", self.path.display()))?;
        self.file
            .write_all(&self.scratch)
            .with_context(|| format!("write {}", self.path.display()))?;
        self.write_pos += records.len() as u64;
        Ok(())
    }

    /// Cuts the file at the write cursor.
    pub fn truncate(&mut self) -> Result<()> {
        self.file
            .set_len(self.write_pos * RECORD)
            .with_context(|| format!("truncate {}", self.path.display()))?;
        self.records = self.write_pos;
        Ok(())
    }
}

/// Buffered reader yielding one record at a time.
pub struct BufferedInputStream {
    stream: InputStream,
    buf: Vec<CompressedState>,
    pos: usize,
    end: usize,
}

impl BufferedInputStream {
    pub fn open(path: impl AsRef<Path>, buffer_records: usize) -> Result<Self> {
        Ok(Self {
            stream: InputStream::open(path)?,
            buf: vec![CompressedState::default(); buffer_records.max(1)],
            pos: 0,
            end: 0,
        })
    }

    pub fn size(&self) -> u64 {
        self.stream.size()
    }

    pub fn read(&mut self) -> Result<Option<CompressedState>> {
        if self.pos == self.end {
            self.end = self.stream.read(&mut self.buf)?;
            self.pos = 0;
            if self.end == 0 {
                return Ok(None);
            }
        }
        let cs = self.buf[self.pos];
        self.pos += 1;
        Ok(Some(cs))
    }
}

/// Buffered appender; records reach the file on flush or when the
/// buffer fills.
pub struct BufferedOutputStream {
    stream: OutputStream,
    buf: Vec<CompressedState>,
    capacity: usize,
}

impl BufferedOutputStream {
    pub fn create(path: impl AsRef<Path>, buffer_records: usize) -> Result<Self> {
        Ok(Self {
            stream: OutputStream::create(path)?,
            buf: Vec::with_capacity(buffer_records.max(1)),
            capacity: buffer_records.max(1),
        })
    }

    pub fn append(path: impl AsRef<Path>, buffer_records: usize) -> Result<Self> {
        Ok(Self {
            stream: OutputStream::append(path)?,
            buf: Vec::with_capacity(buffer_records.max(1)),
            capacity: buffer_records.max(1),
        })
    }

    /// Records written so far, including the buffered tail.
    pub fn size(&self) -> u64 {
        self.stream.size() + self.buf.len() as u64
    }

    pub fn write(&mut self, cs: CompressedState) -> Result<()> {
        self.buf.push(cs);
        if self.buf.len() == self.capacity {
            self.stream.write(&self.buf)?;
            self.buf.clear();
        }
        Ok(())
    }

    /// Drains the buffer and forces the file to disk.
    pub fn flush(&mut self) -> Result<()> {
        if !self.buf.is_empty() {
            self.stream.write(&self.buf)?;
            self.buf.clear();
        }
        self.stream.flush()
    }
}

impl Drop for BufferedOutputStream {
    fn drop(&mut self) {
        if !self.buf.is_empty() {
            let _ = self.stream.write(&self.buf);
            self.buf.clear();
        }
    }
}

/// Buffered view over a [`RewriteStream`].
pub struct BufferedRewriteStream {
    stream: RewriteStream,
    rbuf: Vec<CompressedState>,
    rpos: usize,
    rend: usize,
    wbuf: Vec<CompressedState>,
    capacity: usize,
}

impl BufferedRewriteStream {
    pub fn open(path: impl AsRef<Path>, buffer_records: usize) -> Result<Self> {
        let capacity = buffer_records.max(1);
        Ok(Self {
            stream: RewriteStream::open(path)?,
            rbuf: vec![CompressedState::default(); capacity],
            rpos: 0,
            rend: 0,
            wbuf: Vec::with_capacity(capacity),
            capacity,
        })
    }

    pub fn size(&self) -> u64 {
        self.stream.size()
    }

    pub fn read(&mut self) -> Result<Option<CompressedState>> {
        if self.rpos == self.rend {
            self.rend = self.stream.read(&mut self.rbuf)?;
            self.rpos = 0;
            if self.rend == 0 {
                return Ok(None);
            }
        }
        let cs = self.rbuf[self.rpos];
        self.rpos += 1;
        Ok(Some(cs))
    }

    pub fn write(&mut self, cs: CompressedState) -> Result<()> {
        self.wbuf.push(cs);
        if self.wbuf.len() == self.capacity {
            self.stream.write(&self.wbuf)?;
            self.wbuf.clear();
        }
        Ok(())
    }

    /// Flushes pending writes and cuts the file at the write cursor.
    pub fn truncate(&mut self) -> Result<()> {
        if !self.wbuf.is_empty() {
            self.stream.write(&self.wbuf)?;
            self.wbuf.clear();
        }
        self.stream.truncate()
    }
}

/// Bulk copy with a durable flush at the end.
pub fn copy_file(from: &Path, to: &Path, buffer_records: usize) -> Result<()> {
    let mut input = InputStream::open(from)?;
    let mut output = OutputStream::create(to)?;
    let mut buf = vec![CompressedState::default(); buffer_records.max(1)];
    loop {
        let got = input.read(&mut buf)?;
        if got == 0 {
            break;
        }
        output.write(&buf[..got])?;
    }
    output.flush()
}

/// Same-directory rename; atomic on common filesystems.
pub fn rename(from: &Path, to: &Path) -> Result<()> {
    std::fs::rename(from, to)
        .with_context(|| format!("rename {} -> {}", from.display(), to.display()))
}

pub fn remove(path: &Path) -> Result<()> {
    std::fs::remove_file(path).with_context(|| format!("remove {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("kwirk_disk_{tag}_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn state(n: u64) -> CompressedState {
        CompressedState::from_data(n as u128)
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = scratch_dir("roundtrip");
        let path = dir.join("t.bin");
        {
            let mut out = BufferedOutputStream::create(&path, 4).unwrap();
            for n in 0..10 {
                out.write(state(n)).unwrap();
            }
            assert_eq!(out.size(), 10);
            out.flush().unwrap();
        }
        let mut input = BufferedInputStream::open(&path, 3).unwrap();
        assert_eq!(input.size(), 10);
        for n in 0..10 {
            assert_eq!(input.read().unwrap().unwrap().data(), n as u128);
        }
        assert!(input.read().unwrap().is_none());
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn append_resumes_at_end() {
        let dir = scratch_dir("append");
        let path = dir.join("t.bin");
        {
            let mut out = OutputStream::create(&path).unwrap();
            out.write(&[state(1), state(2)]).unwrap();
        }
        {
            let mut out = OutputStream::append(&path).unwrap();
            assert_eq!(out.size(), 2);
            out.write(&[state(3)]).unwrap();
            out.flush().unwrap();
        }
        let mut input = InputStream::open(&path).unwrap();
        let mut buf = [CompressedState::default(); 8];
        assert_eq!(input.read(&mut buf).unwrap(), 3);
        assert_eq!(buf[2].data(), 3);
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn rewrite_trails_and_truncates() {
        let dir = scratch_dir("rewrite");
        let path = dir.join("t.bin");
        {
            let mut out = OutputStream::create(&path).unwrap();
            out.write(&(0..6).map(state).collect::<Vec<_>>()).unwrap();
        }
        {
            let mut rw = BufferedRewriteStream::open(&path, 2).unwrap();
            // Keep the even records only.
            while let Some(cs) = rw.read().unwrap() {
                if cs.data() % 2 == 0 {
                    rw.write(cs).unwrap();
                }
            }
            rw.truncate().unwrap();
        }
        let mut input = InputStream::open(&path).unwrap();
        assert_eq!(input.size(), 3);
        let mut buf = [CompressedState::default(); 4];
        input.read(&mut buf).unwrap();
        assert_eq!(buf[0].data(), 0);
        assert_eq!(buf[1].data(), 2);
        assert_eq!(buf[2].data(), 4);
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn torn_file_is_an_integrity_error() {
        let dir = scratch_dir("torn");
        let path = dir.join("t.bin");
        std::fs::write(&path, [0u8; 17]).unwrap();
        assert!(InputStream::open(&path).is_err());
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn file_names_follow_the_scheme() {
        let names = FileNames::new("/tmp/work", "maze");
        assert!(names.open(3).ends_with("maze-open-3x.bin"));
        assert!(names.chunk(3, 1).ends_with("maze-chunk-3x-1.bin"));
        assert!(names.frame_file("closed", 37).ends_with("maze-closed-37.bin"));
        assert!(names.stop().ends_with("maze-stop.txt"));
    }
}
