//! One contiguous offset range on disk: a data file of batch frames plus a
//! sparse offset index.
//!
//! The index maps relative offset -> byte position, one 12-byte entry per
//! `INDEX_INTERVAL_BYTES` of data. Lookups binary-search the index and scan
//! forward through batch frames from there. A segment is immutable once the
//! log rolls past it; only the active segment accepts appends.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, warn};

use super::LogError;
use crate::constants::{BATCH_LAST_OFFSET_DELTA_END, INDEX_ENTRY_SIZE};
use crate::protocol::batch;

const LOG_SUFFIX: &str = "log";
const INDEX_SUFFIX: &str = "index";

pub(super) fn log_file_name(base_offset: i64) -> String {
    format!("{:020}.{}", base_offset, LOG_SUFFIX)
}

pub struct Segment {
    base_offset: i64,
    next_offset: i64,
    /// Committed bytes in the data file. Readers never see past this.
    size: u64,
    max_bytes: u64,
    log_path: PathBuf,
    index_path: PathBuf,
    writer: File,
    /// Separate read handle so concurrent readers do not fight the writer
    /// over the file cursor.
    reader: Mutex<File>,
    index_writer: File,
    /// (relative_offset, byte_position), ascending in both components.
    index: Vec<(u32, u64)>,
    bytes_since_index: u64,
}

impl Segment {
    /// Open or create the segment rooted at `dir` with the given base
    /// offset. Existing files are recovered: the index is loaded, then the
    /// tail of the data file is scanned to rebuild next_offset. A trailing
    /// partial batch (torn write) is discarded.
    pub fn open(dir: &Path, base_offset: i64, max_bytes: u64) -> Result<Self, LogError> {
        let log_path = dir.join(log_file_name(base_offset));
        let index_path = dir.join(format!("{:020}.{}", base_offset, INDEX_SUFFIX));

        let mut writer = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&log_path)?;
        let reader = OpenOptions::new().read(true).open(&log_path)?;
        let index_writer = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&index_path)?;

        let index = load_index(&index_writer)
            .map_err(|e| match e {
                LogError::CorruptIndex(_) => LogError::CorruptIndex(index_path.clone()),
                other => other,
            })?;

        let mut segment = Self {
            base_offset,
            next_offset: base_offset,
            size: 0,
            max_bytes,
            log_path,
            index_path,
            writer,
            reader: Mutex::new(reader),
            index_writer,
            index,
            bytes_since_index: 0,
        };
        segment.recover()?;
        segment.writer.seek(SeekFrom::Start(segment.size))?;
        Ok(segment)
    }

    /// Scan batch frames from the last indexed position to the end of the
    /// data file, recovering next_offset and the committed size.
    fn recover(&mut self) -> Result<(), LogError> {
        let file_len = self.writer.metadata()?.len();
        let mut pos = self.index.last().map(|&(_, p)| p).unwrap_or(0);
        if pos > file_len {
            return Err(LogError::CorruptIndex(self.index_path.clone()));
        }

        let mut head = [0u8; BATCH_LAST_OFFSET_DELTA_END];
        loop {
            if pos + BATCH_LAST_OFFSET_DELTA_END as u64 > file_len {
                break;
            }
            self.writer.seek(SeekFrom::Start(pos))?;
            self.writer.read_exact(&mut head)?;
            let frame = match batch::frame_len_from_header(&head) {
                Some(len) if pos + len as u64 <= file_len => len as u64,
                _ => break,
            };
            self.next_offset = batch::base_offset(&head) + batch::record_count(&head) as i64;
            pos += frame;
        }

        if pos < file_len {
            warn!(
                path = %self.log_path.display(),
                committed = pos,
                file_len,
                "discarding torn tail of segment"
            );
            self.writer.set_len(pos)?;
        }
        self.size = pos;
        if self.next_offset < self.base_offset {
            self.next_offset = self.base_offset;
        }
        self.bytes_since_index = pos - self.index.last().map(|&(_, p)| p).unwrap_or(0);
        Ok(())
    }

    pub fn base_offset(&self) -> i64 {
        self.base_offset
    }

    /// Exclusive upper bound of offsets stored here.
    pub fn next_offset(&self) -> i64 {
        self.next_offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Append a record set whose batches already carry their assigned
    /// offsets. `first_offset` must equal this segment's next_offset.
    /// Returns the byte position the set was written at.
    ///
    /// An oversized set is still accepted into an empty segment so a batch
    /// larger than `max_bytes` cannot wedge the log in a roll loop.
    pub fn append(
        &mut self,
        record_set: &[u8],
        first_offset: i64,
        records: i64,
    ) -> Result<u64, LogError> {
        if !self.is_empty() && self.size + record_set.len() as u64 > self.max_bytes {
            return Err(LogError::SegmentFull);
        }

        let position = self.size;
        self.writer.write_all(record_set)?;
        self.writer.flush()?;
        self.size += record_set.len() as u64;
        self.next_offset = first_offset + records;
        self.bytes_since_index += record_set.len() as u64;

        if self.bytes_since_index >= crate::constants::INDEX_INTERVAL_BYTES {
            let relative = (first_offset - self.base_offset) as u32;
            self.index.push((relative, position));
            let mut entry = [0u8; INDEX_ENTRY_SIZE];
            entry[..4].copy_from_slice(&relative.to_be_bytes());
            entry[4..].copy_from_slice(&position.to_be_bytes());
            self.index_writer.write_all(&entry)?;
            self.index_writer.flush()?;
            self.bytes_since_index = 0;
        }
        Ok(position)
    }

    /// Copy up to `max_bytes` raw bytes starting at `position`. Reads stop
    /// at the committed size; the caller interprets batch boundaries.
    pub fn read_at(&self, position: u64, max_bytes: usize) -> Result<Vec<u8>, LogError> {
        if position >= self.size {
            return Ok(Vec::new());
        }
        let len = max_bytes.min((self.size - position) as usize);
        let mut buf = vec![0u8; len];
        let mut file = self.reader.lock().expect("segment reader poisoned");
        file.seek(SeekFrom::Start(position))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Byte position of the batch containing `offset`: binary search on the
    /// sparse index, then a forward scan through frames.
    pub fn find_position(&self, offset: i64) -> Result<u64, LogError> {
        let relative = (offset - self.base_offset).max(0) as u32;
        let start = match self.index.partition_point(|&(rel, _)| rel <= relative) {
            0 => 0,
            i => self.index[i - 1].1,
        };

        let mut pos = start;
        loop {
            let head = self.read_at(pos, BATCH_LAST_OFFSET_DELTA_END)?;
            if head.len() < BATCH_LAST_OFFSET_DELTA_END {
                return Ok(pos);
            }
            let base = batch::base_offset(&head);
            let count = batch::record_count(&head) as i64;
            if offset < base + count {
                return Ok(pos);
            }
            match batch::frame_len_from_header(&head) {
                Some(len) => pos += len as u64,
                None => return Ok(pos),
            }
        }
    }

    /// Drop every batch whose range extends past `target`. Post-condition:
    /// next_offset <= target.
    pub fn truncate_to(&mut self, target: i64) -> Result<(), LogError> {
        if self.next_offset <= target {
            return Ok(());
        }

        let mut pos = 0u64;
        let mut next = self.base_offset;
        loop {
            let head = self.read_at(pos, BATCH_LAST_OFFSET_DELTA_END)?;
            if head.len() < BATCH_LAST_OFFSET_DELTA_END {
                break;
            }
            let base = batch::base_offset(&head);
            let count = batch::record_count(&head) as i64;
            if base + count > target {
                break;
            }
            next = base + count;
            match batch::frame_len_from_header(&head) {
                Some(len) => pos += len as u64,
                None => break,
            }
        }

        debug!(
            base_offset = self.base_offset,
            target,
            cut_at = pos,
            new_next = next,
            "truncating segment"
        );
        self.writer.set_len(pos)?;
        self.writer.seek(SeekFrom::Start(pos))?;
        self.size = pos;
        self.next_offset = next;

        let keep = self.index.partition_point(|&(_, p)| p < pos);
        self.index.truncate(keep);
        self.index_writer
            .set_len((keep * INDEX_ENTRY_SIZE) as u64)?;
        self.bytes_since_index = 0;
        Ok(())
    }

    /// Delete both files. Consumes the segment.
    pub fn remove(self) -> Result<(), LogError> {
        std::fs::remove_file(&self.log_path)?;
        std::fs::remove_file(&self.index_path)?;
        Ok(())
    }
}

fn load_index(file: &File) -> Result<Vec<(u32, u64)>, LogError> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(Vec::new());
    }
    if len % INDEX_ENTRY_SIZE as u64 != 0 {
        return Err(LogError::CorruptIndex(PathBuf::new()));
    }

    let mut reader = file;
    reader.seek(SeekFrom::Start(0))?;
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf)?;

    let mut index = Vec::with_capacity(len as usize / INDEX_ENTRY_SIZE);
    for entry in buf.chunks_exact(INDEX_ENTRY_SIZE) {
        let relative = u32::from_be_bytes([entry[0], entry[1], entry[2], entry[3]]);
        let position = u64::from_be_bytes([
            entry[4], entry[5], entry[6], entry[7], entry[8], entry[9], entry[10], entry[11],
        ]);
        index.push((relative, position));
    }
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::batch::build_record_batch;
    use tempfile::TempDir;

    fn append_records(segment: &mut Segment, values: &[&[u8]]) -> u64 {
        let mut set = build_record_batch(values);
        let first = segment.next_offset();
        let records = crate::protocol::batch::assign_offsets(&mut set, first);
        segment.append(&set, first, records).unwrap()
    }

    #[test]
    fn append_advances_next_offset() {
        let dir = TempDir::new().unwrap();
        let mut segment = Segment::open(dir.path(), 0, 1 << 20).unwrap();
        assert_eq!(segment.next_offset(), 0);

        append_records(&mut segment, &[b"a", b"b"]);
        assert_eq!(segment.next_offset(), 2);

        append_records(&mut segment, &[b"c"]);
        assert_eq!(segment.next_offset(), 3);
    }

    #[test]
    fn read_back_written_bytes() {
        let dir = TempDir::new().unwrap();
        let mut segment = Segment::open(dir.path(), 0, 1 << 20).unwrap();

        let mut set = build_record_batch(&[b"hello"]);
        crate::protocol::batch::assign_offsets(&mut set, 0);
        let pos = segment.append(&set, 0, 1).unwrap();

        let got = segment.read_at(pos, set.len()).unwrap();
        assert_eq!(got, set);
    }

    #[test]
    fn segment_full_when_over_budget() {
        let dir = TempDir::new().unwrap();
        let mut segment = Segment::open(dir.path(), 0, 64).unwrap();

        // first write is always accepted
        append_records(&mut segment, &[b"0123456789"]);

        let mut set = build_record_batch(&[b"x"]);
        let first = segment.next_offset();
        let records = crate::protocol::batch::assign_offsets(&mut set, first);
        match segment.append(&set, first, records) {
            Err(LogError::SegmentFull) => {}
            other => panic!("expected SegmentFull, got {other:?}"),
        }
    }

    #[test]
    fn reopen_recovers_state() {
        let dir = TempDir::new().unwrap();
        {
            let mut segment = Segment::open(dir.path(), 10, 1 << 20).unwrap();
            append_records(&mut segment, &[b"a", b"b", b"c"]);
        }
        let segment = Segment::open(dir.path(), 10, 1 << 20).unwrap();
        assert_eq!(segment.base_offset(), 10);
        assert_eq!(segment.next_offset(), 13);
        assert!(segment.size() > 0);
    }

    #[test]
    fn reopen_discards_torn_tail() {
        let dir = TempDir::new().unwrap();
        let size_before;
        {
            let mut segment = Segment::open(dir.path(), 0, 1 << 20).unwrap();
            append_records(&mut segment, &[b"a"]);
            size_before = segment.size();
        }
        // simulate a torn write
        let path = dir.path().join(log_file_name(0));
        let file = OpenOptions::new().append(true).open(&path).unwrap();
        use std::io::Write as _;
        (&file).write_all(&[1, 2, 3]).unwrap();

        let segment = Segment::open(dir.path(), 0, 1 << 20).unwrap();
        assert_eq!(segment.size(), size_before);
        assert_eq!(segment.next_offset(), 1);
    }

    #[test]
    fn find_position_walks_batches() {
        let dir = TempDir::new().unwrap();
        let mut segment = Segment::open(dir.path(), 0, 1 << 20).unwrap();
        let p0 = append_records(&mut segment, &[b"a", b"b"]);
        let p1 = append_records(&mut segment, &[b"c"]);
        let p2 = append_records(&mut segment, &[b"d", b"e"]);

        assert_eq!(segment.find_position(0).unwrap(), p0);
        assert_eq!(segment.find_position(1).unwrap(), p0);
        assert_eq!(segment.find_position(2).unwrap(), p1);
        assert_eq!(segment.find_position(3).unwrap(), p2);
        assert_eq!(segment.find_position(4).unwrap(), p2);
    }

    #[test]
    fn truncate_drops_batches_past_target() {
        let dir = TempDir::new().unwrap();
        let mut segment = Segment::open(dir.path(), 0, 1 << 20).unwrap();
        append_records(&mut segment, &[b"a", b"b"]); // offsets 0-1
        append_records(&mut segment, &[b"c", b"d"]); // offsets 2-3

        // target 3 falls inside the second batch, so the whole batch goes
        segment.truncate_to(3).unwrap();
        assert_eq!(segment.next_offset(), 2);

        segment.truncate_to(0).unwrap();
        assert_eq!(segment.next_offset(), 0);
        assert_eq!(segment.size(), 0);
    }

    #[test]
    fn truncate_noop_at_or_past_end() {
        let dir = TempDir::new().unwrap();
        let mut segment = Segment::open(dir.path(), 0, 1 << 20).unwrap();
        append_records(&mut segment, &[b"a"]);
        let size = segment.size();

        segment.truncate_to(1).unwrap();
        assert_eq!(segment.size(), size);
        segment.truncate_to(100).unwrap();
        assert_eq!(segment.size(), size);
    }

    #[test]
    fn corrupt_index_detected() {
        let dir = TempDir::new().unwrap();
        {
            let mut segment = Segment::open(dir.path(), 0, 1 << 20).unwrap();
            append_records(&mut segment, &[b"a"]);
        }
        let index_path = dir.path().join(format!("{:020}.index", 0));
        std::fs::write(&index_path, [0u8; 5]).unwrap();

        match Segment::open(dir.path(), 0, 1 << 20) {
            Err(LogError::CorruptIndex(_)) => {}
            other => panic!("expected CorruptIndex, got {:?}", other.map(|_| ())),
        }
    }
}
