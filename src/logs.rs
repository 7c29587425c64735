//! Append-only per-app logs
//!
//! Every line carries a monotonic sequence number so consumers can tail
//! from an offset without re-reading the file. Logs are never truncated by
//! normal operation; only app deletion removes them. One writer per app
//! (the supervisor/orchestrator), any number of tail readers.

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Chunk size used when scanning a log file backwards
const TAIL_CHUNK: usize = 8192;

/// Single writer over an app's cumulative log file
pub struct LogWriter {
    path: PathBuf,
    inner: Mutex<Inner>,
}

struct Inner {
    file: File,
    next_seq: u64,
}

impl LogWriter {
    /// Open (or create) the log at `path` in append mode. The sequence
    /// counter resumes after the last recorded line.
    pub fn open<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let next_seq = last_sequence(&path)?.map(|s| s + 1).unwrap_or(0);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            inner: Mutex::new(Inner { file, next_seq }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one line, returning its sequence number
    pub fn append(&self, msg: &str) -> std::io::Result<u64> {
        let mut inner = self.inner.lock();
        let seq = inner.next_seq;
        let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ");
        // One record per line; embedded newlines would break tailing
        let msg = msg.trim_end_matches('\n').replace('\n', " ");
        writeln!(inner.file, "{} [{}] {}", seq, ts, msg)?;
        inner.file.flush()?;
        inner.next_seq = seq + 1;
        Ok(seq)
    }

    /// Append a "command about to run" marker line
    pub fn append_command(&self, argv: &[String]) -> std::io::Result<u64> {
        self.append(&format!("$ {}", argv.join(" ")))
    }
}

/// Read the last `n` lines of a log without loading the whole file.
///
/// Returns fewer lines when the log is shorter than `n`, and an empty
/// vector when the file does not exist yet.
pub fn tail_lines<P: AsRef<Path>>(path: P, n: usize) -> std::io::Result<Vec<String>> {
    if n == 0 {
        return Ok(Vec::new());
    }
    let mut file = match File::open(path.as_ref()) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let len = file.seek(SeekFrom::End(0))?;
    let mut pos = len;
    let mut buf: Vec<u8> = Vec::new();
    let mut newlines = 0usize;

    // Walk backwards chunk by chunk until we have seen n line breaks
    // (plus the trailing one) or hit the start of the file.
    while pos > 0 && newlines <= n {
        let chunk = TAIL_CHUNK.min(pos as usize);
        pos -= chunk as u64;
        file.seek(SeekFrom::Start(pos))?;
        let mut chunk_buf = vec![0u8; chunk];
        file.read_exact(&mut chunk_buf)?;
        newlines += chunk_buf.iter().filter(|&&b| b == b'\n').count();
        chunk_buf.extend_from_slice(&buf);
        buf = chunk_buf;
    }

    let text = String::from_utf8_lossy(&buf);
    let mut lines: Vec<String> = text.lines().map(|l| l.to_string()).collect();
    if lines.len() > n {
        lines.drain(..lines.len() - n);
    }
    Ok(lines)
}

/// Parse the sequence tag of the last line in the file, if any
fn last_sequence(path: &Path) -> std::io::Result<Option<u64>> {
    let lines = tail_lines(path, 1)?;
    Ok(lines
        .last()
        .and_then(|l| l.split_whitespace().next())
        .and_then(|tok| tok.parse::<u64>().ok()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_append_tags_monotonic_sequence() {
        let dir = tempdir().unwrap();
        let log = LogWriter::open(dir.path().join("run.log")).unwrap();
        assert_eq!(log.append("first").unwrap(), 0);
        assert_eq!(log.append("second").unwrap(), 1);
        assert_eq!(log.append("third").unwrap(), 2);

        let lines = tail_lines(log.path(), 10).unwrap();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("0 "));
        assert!(lines[2].starts_with("2 "));
        assert!(lines[2].ends_with("third"));
    }

    #[test]
    fn test_tail_returns_fewer_lines_than_requested() {
        let dir = tempdir().unwrap();
        let log = LogWriter::open(dir.path().join("run.log")).unwrap();
        log.append("a").unwrap();
        log.append("b").unwrap();
        log.append("c").unwrap();

        // tail=5 on a 3-line log returns exactly those 3 lines
        let lines = tail_lines(log.path(), 5).unwrap();
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn test_tail_last_n() {
        let dir = tempdir().unwrap();
        let log = LogWriter::open(dir.path().join("run.log")).unwrap();
        for i in 0..100 {
            log.append(&format!("line {}", i)).unwrap();
        }
        let lines = tail_lines(log.path(), 2).unwrap();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("line 98"));
        assert!(lines[1].ends_with("line 99"));
    }

    #[test]
    fn test_tail_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let lines = tail_lines(dir.path().join("absent.log"), 5).unwrap();
        assert!(lines.is_empty());
    }

    #[test]
    fn test_sequence_resumes_after_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.log");
        {
            let log = LogWriter::open(&path).unwrap();
            log.append("before restart").unwrap();
            log.append("still before").unwrap();
        }
        let log = LogWriter::open(&path).unwrap();
        assert_eq!(log.append("after restart").unwrap(), 2);
        let lines = tail_lines(&path, 10).unwrap();
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn test_embedded_newlines_are_flattened() {
        let dir = tempdir().unwrap();
        let log = LogWriter::open(dir.path().join("run.log")).unwrap();
        log.append("two\nparts").unwrap();
        let lines = tail_lines(log.path(), 10).unwrap();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].ends_with("two parts"));
    }
}
