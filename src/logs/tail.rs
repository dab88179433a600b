use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use super::archive_path;

const CHUNK_SIZE: u64 = 8 * 1024;

/// The newest lines of a service log, oldest first.
///
/// A snapshot: the at most `n` lines are read when [`tail`] returns, so
/// writes that land afterwards are not seen. Reading stops as soon as `n`
/// lines are found, so the cost is bounded by `n`, not by the file size.
#[derive(Debug, Default)]
pub struct LogTail {
    lines: std::vec::IntoIter<String>,
}

impl Iterator for LogTail {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        self.lines.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.lines.size_hint()
    }
}

impl ExactSizeIterator for LogTail {}

/// Read the last `n` lines of the log at `path`, continuing into the rotated
/// archive when the active file holds fewer than `n`. A missing file yields
/// an empty tail.
pub fn tail(path: &Path, n: usize) -> io::Result<LogTail> {
    let mut lines = last_lines(path, n)?;
    if lines.len() < n {
        let mut older = last_lines(&archive_path(path), n - lines.len())?;
        older.append(&mut lines);
        lines = older;
    }
    Ok(LogTail {
        lines: lines.into_iter(),
    })
}

/// Read backwards from the end of `path` in fixed-size chunks until `n`
/// complete lines are available.
fn last_lines(path: &Path, n: usize) -> io::Result<Vec<String>> {
    if n == 0 {
        return Ok(Vec::new());
    }
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut pos = file.metadata()?.len();
    let mut buf: Vec<u8> = Vec::new();
    let mut newlines = 0usize;

    // One extra newline guarantees the oldest kept line is complete
    while pos > 0 && newlines <= n {
        let read = CHUNK_SIZE.min(pos);
        pos -= read;
        file.seek(SeekFrom::Start(pos))?;
        let mut chunk = vec![0u8; read as usize];
        file.read_exact(&mut chunk)?;
        newlines += chunk.iter().filter(|&&b| b == b'\n').count();
        chunk.extend_from_slice(&buf);
        buf = chunk;
    }

    let text = String::from_utf8_lossy(&buf);
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(n);
    Ok(all[start..].iter().map(|s| s.to_string()).collect())
}
