//! Streaming reads across segment boundaries.

use std::io::{self, Read};
use std::sync::Arc;

use super::CommitLog;

/// A byte-level reader over a commit log.
///
/// Lazily streams committed bytes starting at the position the log resolved
/// for the requested offset, crossing segment boundaries, until `max_bytes`
/// have been emitted or the reader catches up with the log end. A caught-up
/// reader returns `Ok(0)`; re-reading after new appends yields the new
/// bytes, which is what the fetch wait loop relies on.
pub struct LogReader {
    log: Arc<CommitLog>,
    segment_base: i64,
    position: u64,
    remaining: usize,
}

impl LogReader {
    pub(super) fn new(
        log: Arc<CommitLog>,
        segment_base: i64,
        position: u64,
        max_bytes: usize,
    ) -> Self {
        Self {
            log,
            segment_base,
            position,
            remaining: max_bytes,
        }
    }
}

impl Read for LogReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }

        loop {
            let want = buf.len().min(self.remaining);
            let (data, next_segment) =
                self.log
                    .read_segment_at(self.segment_base, self.position, want)?;

            if !data.is_empty() {
                let n = data.len();
                buf[..n].copy_from_slice(&data);
                self.position += n as u64;
                self.remaining -= n;
                return Ok(n);
            }

            // End of this segment. Move on if the log has rolled past it,
            // otherwise we are caught up.
            match next_segment {
                Some(base) => {
                    self.segment_base = base;
                    self.position = 0;
                }
                None => return Ok(0),
            }
        }
    }
}
