use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use serde_json::Value;
use tracing::warn;

use tailcast_core::Result;

/// Outcome of one incremental read.
#[derive(Debug, Default)]
pub struct ReadBatch {
    pub records: Vec<Value>,
    /// Byte offset after the last complete line consumed.
    pub new_offset: u64,
    /// Complete lines consumed, including malformed ones.
    pub lines_read: usize,
    /// Lines skipped because they were not valid JSON.
    pub malformed: usize,
}

/// Read new complete lines from `path`, starting at `offset`.
///
/// A trailing partial line (no terminating newline) is not consumed and does
/// not advance the offset. Malformed JSON lines are skipped with a warning.
/// If the file is shorter than `offset` (truncation or rotation), reading
/// restarts from the beginning.
pub fn read_new_lines(path: &Path, offset: u64) -> Result<ReadBatch> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();

    let mut offset = offset;
    if len < offset {
        warn!(path = %path.display(), offset, len, "File shrank, resetting offset");
        offset = 0;
    }

    file.seek(SeekFrom::Start(offset))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;

    let mut batch = ReadBatch {
        new_offset: offset,
        ..Default::default()
    };

    let mut start = 0usize;
    while let Some(rel) = buf[start..].iter().position(|&b| b == b'\n') {
        let end = start + rel;
        let line = &buf[start..end];
        start = end + 1;
        batch.new_offset = offset + start as u64;
        batch.lines_read += 1;

        let text = String::from_utf8_lossy(line);
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(trimmed) {
            Ok(record) => batch.records.push(record),
            Err(e) => {
                batch.malformed += 1;
                warn!(path = %path.display(), line = batch.lines_read, error = %e, "Skipping malformed JSON line");
            }
        }
    }

    Ok(batch)
}

/// Byte offset of the start of the `n`-th line from the end, for catch-up
/// reads that only want the transcript tail.
pub fn seek_to_last_n_lines(path: &Path, n: usize) -> Result<u64> {
    const CHUNK: usize = 8192;

    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    if n == 0 || len == 0 {
        return Ok(len);
    }

    // Ignore a trailing newline so the last line counts once.
    let mut end = len;
    {
        let mut last = [0u8; 1];
        file.seek(SeekFrom::Start(len - 1))?;
        file.read_exact(&mut last)?;
        if last[0] == b'\n' {
            end = len - 1;
        }
    }

    let mut newlines = 0usize;
    let mut pos = end;
    let mut chunk = vec![0u8; CHUNK];

    while pos > 0 {
        let read_len = CHUNK.min(pos as usize);
        pos -= read_len as u64;
        file.seek(SeekFrom::Start(pos))?;
        let slice = &mut chunk[..read_len];
        file.read_exact(slice)?;

        for (i, &b) in slice.iter().enumerate().rev() {
            if b == b'\n' {
                newlines += 1;
                if newlines >= n {
                    return Ok(pos + i as u64 + 1);
                }
            }
        }
    }

    Ok(0)
}
