//! The durable, offset-indexed, append-only record log underneath the
//! consensus log.
//!
//! The consensus layer only needs ordered records it can append, read back
//! by offset, and truncate from the front when a snapshot makes the prefix
//! redundant. [`MemLog`] backs tests and ephemeral nodes; [`FileLog`] is a
//! minimal single-file durable implementation: length-prefixed frames
//! behind a buffered writer, replayed on open.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

const LOG_FILE_NAME: &str = "segments.log";

/// One stored record. `offset` is assigned by the log on append; `term`
/// and `kind` mirror the consensus entry for introspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub value: Vec<u8>,
    pub term: u64,
    pub kind: u32,
    pub offset: u64,
}

impl Record {
    pub fn new(value: Vec<u8>, term: u64, kind: u32) -> Self {
        Self {
            value,
            term,
            kind,
            offset: 0,
        }
    }
}

/// An ordered, indexable record store.
///
/// Offsets are dense: the first record ever appended gets the log's
/// initial offset and each append advances by one. `truncate(offset)`
/// drops every record at or below `offset` (log compaction after a
/// snapshot); it never reorders or renumbers the remainder.
pub trait CommitLog: Send + Sync + 'static {
    /// Appends a record, assigning and returning its offset.
    fn append(&mut self, record: Record) -> Result<u64, StoreError>;

    /// Reads the record at `offset`. Fails with
    /// [`StoreError::OffsetOutOfRange`] outside the retained range.
    fn read(&self, offset: u64) -> Result<Record, StoreError>;

    /// Lowest retained offset. Equals the initial offset until the log is
    /// truncated.
    fn lowest_offset(&self) -> u64;

    /// Highest assigned offset, or one below the lowest while empty.
    fn highest_offset(&self) -> u64;

    /// Drops all records with offsets at or below `offset`.
    fn truncate(&mut self, offset: u64) -> Result<(), StoreError>;
}

/// Offsets start at 1 so they line up with consensus log indices.
const INITIAL_OFFSET: u64 = 1;

/// In-memory commit log.
#[derive(Debug)]
pub struct MemLog {
    records: VecDeque<Record>,
    lowest: u64,
    next: u64,
}

impl MemLog {
    pub fn new() -> Self {
        Self {
            records: VecDeque::new(),
            lowest: INITIAL_OFFSET,
            next: INITIAL_OFFSET,
        }
    }
}

impl CommitLog for MemLog {
    fn append(&mut self, mut record: Record) -> Result<u64, StoreError> {
        record.offset = self.next;
        self.next += 1;
        self.records.push_back(record);
        Ok(self.next - 1)
    }

    fn read(&self, offset: u64) -> Result<Record, StoreError> {
        if offset < self.lowest || offset >= self.next {
            return Err(StoreError::OffsetOutOfRange(offset));
        }
        Ok(self.records[(offset - self.lowest) as usize].clone())
    }

    fn lowest_offset(&self) -> u64 {
        self.lowest
    }

    fn highest_offset(&self) -> u64 {
        self.next - 1
    }

    fn truncate(&mut self, offset: u64) -> Result<(), StoreError> {
        while self
            .records
            .front()
            .is_some_and(|record| record.offset <= offset)
        {
            self.records.pop_front();
        }
        if offset >= self.lowest {
            self.lowest = (offset + 1).min(self.next);
        }
        Ok(())
    }
}

impl Default for MemLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Single-file durable commit log.
///
/// Frames are `u32` big-endian length + bincode [`Record`]. Appends go
/// through a buffered writer and are flushed per append; truncation
/// rewrites the retained suffix to a temporary file and renames it over
/// the original so a crash mid-truncate keeps a complete log.
#[derive(Debug)]
pub struct FileLog {
    writer: BufWriter<File>,
    path: PathBuf,
    records: VecDeque<Record>,
    lowest: u64,
    next: u64,
}

impl FileLog {
    /// Opens (or creates) the log under `dir`, replaying existing frames
    /// to rebuild the in-memory index.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(LOG_FILE_NAME);

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        let mut records = VecDeque::new();
        let mut reader = BufReader::new(file.try_clone()?);
        loop {
            match read_frame(&mut reader) {
                Ok(Some(record)) => records.push_back(record),
                Ok(None) => break,
                Err(err) => return Err(StoreError::StorageIo(err)),
            }
        }

        let lowest = records.front().map_or(INITIAL_OFFSET, |r| r.offset);
        let next = records.back().map_or(lowest, |r| r.offset + 1);

        Ok(Self {
            writer: BufWriter::new(file),
            path,
            records,
            lowest,
            next,
        })
    }

    fn write_record(writer: &mut impl Write, record: &Record) -> Result<(), StoreError> {
        let frame = bincode::serialize(record)?;
        writer.write_all(&(frame.len() as u32).to_be_bytes())?;
        writer.write_all(&frame)?;
        Ok(())
    }
}

fn read_frame(reader: &mut impl Read) -> std::io::Result<Option<Record>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut frame = vec![0u8; len];
    reader.read_exact(&mut frame)?;
    bincode::deserialize(&frame)
        .map(Some)
        .map_err(|err| std::io::Error::new(ErrorKind::InvalidData, err))
}

impl CommitLog for FileLog {
    fn append(&mut self, mut record: Record) -> Result<u64, StoreError> {
        record.offset = self.next;
        Self::write_record(&mut self.writer, &record)?;
        self.writer.flush()?;
        self.next += 1;
        self.records.push_back(record);
        Ok(self.next - 1)
    }

    fn read(&self, offset: u64) -> Result<Record, StoreError> {
        if offset < self.lowest || offset >= self.next {
            return Err(StoreError::OffsetOutOfRange(offset));
        }
        Ok(self.records[(offset - self.lowest) as usize].clone())
    }

    fn lowest_offset(&self) -> u64 {
        self.lowest
    }

    fn highest_offset(&self) -> u64 {
        self.next - 1
    }

    fn truncate(&mut self, offset: u64) -> Result<(), StoreError> {
        while self
            .records
            .front()
            .is_some_and(|record| record.offset <= offset)
        {
            self.records.pop_front();
        }
        if offset >= self.lowest {
            self.lowest = (offset + 1).min(self.next);
        }

        let tmp_path = self.path.with_extension("tmp");
        {
            let tmp = File::create(&tmp_path)?;
            let mut writer = BufWriter::new(tmp);
            for record in &self.records {
                Self::write_record(&mut writer, record)?;
            }
            writer.flush()?;
        }
        self.writer.flush()?;
        fs::rename(&tmp_path, &self.path)?;

        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        Ok(())
    }
}
