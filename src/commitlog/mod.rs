//! Per-partition commit log: ordered immutable segments plus one active
//! segment, with offset lookup, range reads and truncation.
//!
//! Offsets are dense and monotonic from [`CommitLog::oldest_offset`] to
//! [`CommitLog::newest_offset`] - 1. Appends go through a single write
//! latch; readers run concurrently with the writer and only ever observe
//! committed bytes.

mod reader;
mod segment;

pub use reader::LogReader;
pub use segment::Segment;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use thiserror::Error;
use tracing::{debug, info};

use crate::error::ErrorCode;
use crate::protocol::batch;

/// Commit log failures. Disk errors surface verbatim; the log never tries
/// to repair a corrupt segment.
#[derive(Debug, Error)]
pub enum LogError {
    #[error("io: {0}")]
    Io(#[from] io::Error),

    #[error("segment is full")]
    SegmentFull,

    #[error("index file is unreadable: {0}")]
    CorruptIndex(PathBuf),

    #[error("offset {offset} is below the oldest retained offset {oldest}")]
    OffsetOutOfRange { offset: i64, oldest: i64 },
}

impl LogError {
    /// The wire code a handler should attach for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            LogError::OffsetOutOfRange { .. } => ErrorCode::OffsetOutOfRange,
            _ => ErrorCode::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LogOptions {
    /// Segment roll threshold in bytes.
    pub max_segment_bytes: u64,
    /// Retention cap across all segments; -1 = unbounded. Trimming removes
    /// whole oldest segments and never the active one.
    pub max_log_bytes: i64,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            max_segment_bytes: crate::constants::DEFAULT_MAX_SEGMENT_BYTES,
            max_log_bytes: -1,
        }
    }
}

pub struct CommitLog {
    dir: PathBuf,
    options: LogOptions,
    /// Ascending by base offset; the last entry is the active segment.
    segments: RwLock<Vec<Segment>>,
}

impl CommitLog {
    /// Open the log rooted at `dir`, recovering any existing segments.
    pub fn open(dir: &Path, options: LogOptions) -> Result<Self, LogError> {
        std::fs::create_dir_all(dir)?;

        let mut bases = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(stem) = name.strip_suffix(".log") {
                if let Ok(base) = stem.parse::<i64>() {
                    bases.push(base);
                }
            }
        }
        bases.sort_unstable();

        let mut segments = Vec::with_capacity(bases.len().max(1));
        for base in bases {
            segments.push(Segment::open(dir, base, options.max_segment_bytes)?);
        }
        if segments.is_empty() {
            segments.push(Segment::open(dir, 0, options.max_segment_bytes)?);
        }

        info!(
            dir = %dir.display(),
            segments = segments.len(),
            oldest = segments.first().map(Segment::base_offset),
            newest = segments.last().map(Segment::next_offset),
            "opened commit log"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            options,
            segments: RwLock::new(segments),
        })
    }

    /// Append a record set. Offsets are assigned here: every batch in the
    /// set gets its base offset patched in place starting at the current
    /// log end. Returns the base offset of the set. The whole set lands or
    /// the log end is unchanged.
    pub fn append(&self, record_set: &mut [u8]) -> Result<i64, LogError> {
        let mut segments = self.segments.write().expect("commit log poisoned");
        let active = segments.last_mut().expect("log always has a segment");

        let base = active.next_offset();
        let records = batch::assign_offsets(record_set, base);
        if records == 0 {
            return Ok(base);
        }

        // only bytes covered by complete batch frames reach the disk; a
        // truncated tail from a buggy client must not poison the log
        let valid_len = batch::frames(record_set)
            .map(|(start, len)| start + len)
            .last()
            .unwrap_or(0);
        let record_set = &record_set[..valid_len];

        match active.append(record_set, base, records) {
            Ok(_) => {}
            Err(LogError::SegmentFull) => {
                let rolled = Segment::open(&self.dir, base, self.options.max_segment_bytes)?;
                debug!(base_offset = base, "rolled new segment");
                segments.push(rolled);
                let active = segments.last_mut().expect("just pushed");
                active.append(record_set, base, records)?;
            }
            Err(e) => return Err(e),
        }

        self.enforce_retention(&mut segments)?;
        Ok(base)
    }

    fn enforce_retention(&self, segments: &mut Vec<Segment>) -> Result<(), LogError> {
        if self.options.max_log_bytes < 0 {
            return Ok(());
        }
        let cap = self.options.max_log_bytes as u64;
        while segments.len() > 1 {
            let total: u64 = segments.iter().map(Segment::size).sum();
            if total <= cap {
                break;
            }
            let oldest = segments.remove(0);
            info!(base_offset = oldest.base_offset(), "retention removed segment");
            oldest.remove()?;
        }
        Ok(())
    }

    /// Log end offset, exclusive.
    pub fn newest_offset(&self) -> i64 {
        let segments = self.segments.read().expect("commit log poisoned");
        segments.last().expect("log always has a segment").next_offset()
    }

    /// Base offset of the earliest retained segment.
    pub fn oldest_offset(&self) -> i64 {
        let segments = self.segments.read().expect("commit log poisoned");
        segments.first().expect("log always has a segment").base_offset()
    }

    pub fn segment_count(&self) -> usize {
        self.segments.read().expect("commit log poisoned").len()
    }

    /// Open a reader positioned at `from_offset`, bounded to `max_bytes`.
    /// Fails with OffsetOutOfRange below the oldest offset; at or past the
    /// newest offset the reader starts caught up and yields 0 bytes.
    pub fn reader(self: &Arc<Self>, from_offset: i64, max_bytes: i32) -> Result<LogReader, LogError> {
        let (segment_base, position) = {
            let segments = self.segments.read().expect("commit log poisoned");
            let oldest = segments.first().expect("log always has a segment").base_offset();
            if from_offset < oldest {
                return Err(LogError::OffsetOutOfRange {
                    offset: from_offset,
                    oldest,
                });
            }

            // segment owning from_offset: greatest base <= from_offset
            let idx = match segments.partition_point(|s| s.base_offset() <= from_offset) {
                0 => 0,
                i => i - 1,
            };
            let segment = &segments[idx];
            (segment.base_offset(), segment.find_position(from_offset)?)
        };

        Ok(LogReader::new(
            Arc::clone(self),
            segment_base,
            position,
            max_bytes.max(0) as usize,
        ))
    }

    /// Read committed bytes from the segment with the given base. Returns
    /// the data (empty when the position is at the segment's committed end)
    /// and the base of the following segment, if one exists. Used by
    /// [`LogReader`].
    pub(crate) fn read_segment_at(
        &self,
        segment_base: i64,
        position: u64,
        max_bytes: usize,
    ) -> io::Result<(Vec<u8>, Option<i64>)> {
        let segments = self.segments.read().expect("commit log poisoned");
        let idx = segments
            .iter()
            .position(|s| s.base_offset() == segment_base)
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, "segment rotated out under reader")
            })?;

        let data = segments[idx]
            .read_at(position, max_bytes)
            .map_err(|e| io::Error::other(e.to_string()))?;
        let next = segments.get(idx + 1).map(Segment::base_offset);
        Ok((data, next))
    }

    /// Discard everything above `target`: segments based at or above it are
    /// deleted outright, and the segment containing it is cut back to its
    /// last complete batch at or before `target`. Post-condition:
    /// newest_offset <= target.
    pub fn truncate(&self, target: i64) -> Result<(), LogError> {
        let mut segments = self.segments.write().expect("commit log poisoned");

        while segments.len() > 1 {
            let last_base = segments.last().expect("non-empty").base_offset();
            if last_base < target {
                break;
            }
            let removed = segments.pop().expect("non-empty");
            debug!(base_offset = removed.base_offset(), target, "truncate removed segment");
            removed.remove()?;
        }

        let last = segments.last_mut().expect("log always has a segment");
        if last.base_offset() >= target && last.next_offset() > target {
            // the sole remaining segment starts past the target: replace it
            let removed = segments.pop().expect("non-empty");
            removed.remove()?;
            segments.push(Segment::open(
                &self.dir,
                target,
                self.options.max_segment_bytes,
            )?);
        } else {
            last.truncate_to(target)?;
        }
        Ok(())
    }
}
