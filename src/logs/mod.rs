pub mod level;
pub mod tail;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::registry::Service;

pub use level::{detect_log_level, is_error_line, LogLevel};
pub use tail::{tail, LogTail};

/// Longest prefix of a service name kept in its log file name.
const SAFE_NAME_MAX: usize = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
    /// Lines written by the controller itself (start, exit).
    System,
}

impl LogStream {
    pub fn tag(&self) -> &'static str {
        match self {
            LogStream::Stdout => "out",
            LogStream::Stderr => "err",
            LogStream::System => "nexus",
        }
    }

    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "out" => Some(LogStream::Stdout),
            "err" => Some(LogStream::Stderr),
            "nexus" => Some(LogStream::System),
            _ => None,
        }
    }
}

/// File-system friendly form of a service name.
pub fn safe_name(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .take(SAFE_NAME_MAX)
        .collect();
    if cleaned.is_empty() {
        "service".to_string()
    } else {
        cleaned
    }
}

pub fn log_path_for(dir: &Path, service: &Service) -> PathBuf {
    dir.join(format!("{}-{}.log", safe_name(&service.name), service.id))
}

/// The single rotated generation kept next to an active log.
pub fn archive_path(path: &Path) -> PathBuf {
    let mut archive: OsString = path.as_os_str().to_owned();
    archive.push(".1");
    PathBuf::from(archive)
}

/// A parsed line of a service log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub timestamp: Option<DateTime<Utc>>,
    pub stream: Option<LogStream>,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<LogLevel>,
}

impl LogEntry {
    /// Split `<timestamp> [tag] text`. Lines in any other shape are kept whole.
    pub fn parse(raw: &str) -> Self {
        let parsed = raw.split_once(' ').and_then(|(ts, rest)| {
            let timestamp = DateTime::parse_from_rfc3339(ts).ok()?.with_timezone(&Utc);
            let rest = rest.strip_prefix('[')?;
            let (tag, text) = rest.split_once("] ").unwrap_or((rest.trim_end_matches(']'), ""));
            let stream = LogStream::from_tag(tag)?;
            Some((timestamp, stream, text))
        });
        match parsed {
            Some((timestamp, stream, text)) => Self {
                timestamp: Some(timestamp),
                stream: Some(stream),
                text: text.to_string(),
                level: detect_log_level(text),
            },
            None => Self {
                timestamp: None,
                stream: None,
                text: raw.to_string(),
                level: detect_log_level(raw),
            },
        }
    }

    /// Whether this is program output reporting a failure.
    pub fn is_error(&self) -> bool {
        self.stream != Some(LogStream::System) && is_error_line(&self.text)
    }
}

struct SinkState {
    path: PathBuf,
    file: Option<File>,
    size: u64,
    max_bytes: u64,
    warned: bool,
}

impl SinkState {
    fn open(&mut self) -> std::io::Result<()> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.size = file.metadata()?.len();
        self.file = Some(file);
        Ok(())
    }

    fn rotate(&mut self) -> std::io::Result<()> {
        self.file = None;
        std::fs::rename(&self.path, archive_path(&self.path))?;
        debug!(path = %self.path.display(), "rotated log");
        self.open()
    }

    fn append(&mut self, line: &[u8]) -> std::io::Result<()> {
        if self.file.is_none() {
            self.open()?;
        }
        if self.max_bytes > 0 && self.size > 0 && self.size + line.len() as u64 > self.max_bytes {
            self.rotate()?;
        }
        if let Some(file) = self.file.as_mut() {
            file.write_all(line)?;
            self.size += line.len() as u64;
        }
        Ok(())
    }
}

/// Append-only writer for one service's log file.
///
/// Clones share the same file and rotation state. Write failures are
/// reported once and otherwise ignored so a full disk never takes a service
/// down.
#[derive(Clone)]
pub struct LogSink {
    state: Arc<Mutex<SinkState>>,
}

impl LogSink {
    pub fn path(&self) -> PathBuf {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.path.clone()
    }

    pub fn write(&self, stream: LogStream, text: &str) {
        let ts = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let line = format!("{} [{}] {}\n", ts, stream.tag(), text.trim_end_matches(['\r', '\n']));

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = state.append(line.as_bytes()) {
            // Drop the handle so the next write retries a fresh open
            state.file = None;
            if !state.warned {
                state.warned = true;
                warn!(path = %state.path.display(), error = %e, "failed to write service log");
            }
        }
    }

    pub fn system(&self, text: &str) {
        self.write(LogStream::System, text);
    }
}

/// Open the log sink for `service` under `dir`. Never fails: problems with
/// the file surface as a single warning on first write.
pub fn open_sink(dir: &Path, service: &Service, max_bytes: u64) -> LogSink {
    let mut state = SinkState {
        path: log_path_for(dir, service),
        file: None,
        size: 0,
        max_bytes,
        warned: false,
    };
    if let Err(e) = state.open() {
        state.warned = true;
        warn!(path = %state.path.display(), error = %e, "cannot open service log");
    }
    LogSink {
        state: Arc::new(Mutex::new(state)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::model::fixtures;
    use tempfile::TempDir;

    #[test]
    fn safe_name_replaces_and_truncates() {
        assert_eq!(safe_name("My API (dev)"), "My_API__dev_");
        assert_eq!(safe_name(""), "service");
        assert_eq!(safe_name(&"x".repeat(100)).len(), 60);
    }

    #[test]
    fn log_path_includes_name_and_id() {
        let svc = fixtures::service("abc", "web ui");
        assert_eq!(
            log_path_for(Path::new("/logs"), &svc),
            PathBuf::from("/logs/web_ui-abc.log")
        );
    }

    #[test]
    fn writes_tagged_lines() {
        let tmp = TempDir::new().unwrap();
        let svc = fixtures::service("a", "api");
        let sink = open_sink(tmp.path(), &svc, 0);
        sink.write(LogStream::Stdout, "hello\n");
        sink.write(LogStream::Stderr, "oops");
        sink.system("exited");

        let lines: Vec<String> = tail(&sink.path(), 10).unwrap().collect();
        assert_eq!(lines.len(), 3);
        let entries: Vec<LogEntry> = lines.iter().map(|l| LogEntry::parse(l)).collect();
        assert_eq!(entries[0].stream, Some(LogStream::Stdout));
        assert_eq!(entries[0].text, "hello");
        assert!(entries[0].timestamp.is_some());
        assert_eq!(entries[1].stream, Some(LogStream::Stderr));
        assert_eq!(entries[2].stream, Some(LogStream::System));
        assert!(lines[0].contains(" [out] hello"));
    }

    #[test]
    fn rotates_when_over_limit() {
        let tmp = TempDir::new().unwrap();
        let svc = fixtures::service("a", "api");
        let sink = open_sink(tmp.path(), &svc, 200);
        for i in 0..20 {
            sink.write(LogStream::Stdout, &format!("message number {i}"));
        }

        let path = sink.path();
        let archive = archive_path(&path);
        assert!(archive.exists());
        assert!(std::fs::metadata(&path).unwrap().len() <= 200);
        assert!(std::fs::metadata(&archive).unwrap().len() <= 200);

        // The newest line is always in the active file
        let newest: Vec<String> = tail(&path, 1).unwrap().collect();
        assert!(newest[0].ends_with("message number 19"));
    }

    #[test]
    fn clones_share_state() {
        let tmp = TempDir::new().unwrap();
        let svc = fixtures::service("a", "api");
        let sink = open_sink(tmp.path(), &svc, 0);
        let other = sink.clone();
        sink.write(LogStream::Stdout, "one");
        other.write(LogStream::Stdout, "two");
        assert_eq!(tail(&sink.path(), 10).unwrap().count(), 2);
    }

    #[test]
    fn unwritable_dir_does_not_panic() {
        let tmp = TempDir::new().unwrap();
        let blocker = tmp.path().join("file");
        std::fs::write(&blocker, "").unwrap();
        let svc = fixtures::service("a", "api");
        // A regular file where the directory should be
        let sink = open_sink(&blocker.join("logs"), &svc, 0);
        sink.write(LogStream::Stdout, "lost");
        sink.write(LogStream::Stdout, "lost again");
    }

    #[test]
    fn parse_keeps_foreign_lines_whole() {
        let entry = LogEntry::parse("not a nexus line ERROR");
        assert!(entry.timestamp.is_none());
        assert_eq!(entry.text, "not a nexus line ERROR");
        assert_eq!(entry.level, Some(LogLevel::Error));
    }

    #[test]
    fn system_lines_are_not_program_errors() {
        let entry = LogEntry::parse("2024-01-01T00:00:00.000Z [nexus] exited with error code 1");
        assert!(!entry.is_error());
        let entry = LogEntry::parse("2024-01-01T00:00:00.000Z [err] Error: boom");
        assert!(entry.is_error());
    }
}
