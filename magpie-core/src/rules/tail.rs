//! Follows `.log` files in the watched directories and yields each new line
//! as a rule item.
//!
//! The watched directories are re-scanned every few seconds: new files join
//! the follow set (existing files start from their current end, so old
//! content is not replayed), deleted files drop out. Lines without a
//! parseable timestamp reuse the last timestamp seen for that file; lines
//! before the first timestamped one are skipped.

use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, FixedOffset};

use crate::index::log_time::{
    detect_file_encoding, end_timestamp, start_timestamp, timestamp_from_line,
    timestamp_hint_for_file, FileEncoding,
};
use crate::rules::RuleItem;

const SCAN_INTERVAL: Duration = Duration::from_secs(5);

struct Follower {
    offset: u64,
    encoding: FileEncoding,
    hint: Option<DateTime<FixedOffset>>,
    last_ts: Option<i64>,
    /// Trailing partial line carried to the next poll.
    carry: String,
    /// Files without extractable timestamps stay registered but silent.
    supported: bool,
}

/// A blocking, infinite iterator of live log lines. Runs on its own worker
/// thread; signal `stop` to end the stream.
pub struct LogTailFollower {
    src_dirs: Vec<PathBuf>,
    followers: HashMap<PathBuf, Follower>,
    queue: VecDeque<RuleItem>,
    stop: Arc<AtomicBool>,
    scan_interval: Duration,
    last_scan: Option<Instant>,
}

impl std::fmt::Debug for LogTailFollower {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogTailFollower")
            .field("src_dirs", &self.src_dirs)
            .field("followers", &self.followers.len())
            .finish_non_exhaustive()
    }
}

impl LogTailFollower {
    pub fn new(src_dirs: Vec<PathBuf>, stop: Arc<AtomicBool>) -> Self {
        let mut follower = Self {
            src_dirs,
            followers: HashMap::new(),
            queue: VecDeque::new(),
            stop,
            scan_interval: SCAN_INTERVAL,
            last_scan: None,
        };
        follower.scan_dirs(true);
        follower
    }

    #[cfg(test)]
    fn with_scan_interval(mut self, interval: Duration) -> Self {
        self.scan_interval = interval;
        self
    }

    fn is_log_file(path: &Path) -> bool {
        path.is_file()
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(".log"))
    }

    /// Register new files. On the initial scan existing content is skipped;
    /// files appearing later are read from the start.
    fn scan_dirs(&mut self, is_init: bool) {
        for dir in self.src_dirs.clone() {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.filter_map(|e| e.ok()) {
                let path = entry.path();
                if !Self::is_log_file(&path) || self.followers.contains_key(&path) {
                    continue;
                }
                tracing::info!(path = %path.display(), is_init, "following new log file");

                let supported = matches!(start_timestamp(&path), Ok(Some(_)))
                    && matches!(end_timestamp(&path), Ok(Some(_)));
                if !supported {
                    tracing::warn!(path = %path.display(), "no extractable timestamps, not tailing");
                    self.followers.insert(
                        path,
                        Follower {
                            offset: 0,
                            encoding: FileEncoding::Utf8,
                            hint: None,
                            last_ts: None,
                            carry: String::new(),
                            supported: false,
                        },
                    );
                    continue;
                }

                let encoding = detect_file_encoding(&path).unwrap_or(FileEncoding::Utf8);
                let offset = if is_init {
                    path.metadata().map(|m| m.len()).unwrap_or(0)
                } else {
                    0
                };
                self.followers.insert(
                    path.clone(),
                    Follower {
                        offset,
                        encoding,
                        hint: timestamp_hint_for_file(&path, encoding),
                        last_ts: None,
                        carry: String::new(),
                        supported: true,
                    },
                );
            }
        }
        self.last_scan = Some(Instant::now());
    }

    /// Pull new bytes from every followed file into the line queue.
    fn poll_files(&mut self) {
        let mut dropped = Vec::new();
        let mut new_items = Vec::new();

        for (path, follower) in self.followers.iter_mut() {
            if !follower.supported {
                if !path.exists() {
                    dropped.push(path.clone());
                }
                continue;
            }

            let mut file = match File::open(path) {
                Ok(file) => file,
                Err(_) => {
                    tracing::warn!(path = %path.display(), "file vanished, dropping follower");
                    dropped.push(path.clone());
                    continue;
                }
            };
            let len = file.metadata().map(|m| m.len()).unwrap_or(0);
            if len < follower.offset {
                // truncated/rotated in place: start over
                follower.offset = 0;
                follower.carry.clear();
            }
            if len == follower.offset {
                continue;
            }

            if file.seek(SeekFrom::Start(follower.offset)).is_err() {
                continue;
            }
            let mut buf = Vec::with_capacity((len - follower.offset) as usize);
            if file.read_to_end(&mut buf).is_err() {
                continue;
            }
            follower.offset = len;

            let text = match follower.encoding {
                FileEncoding::Utf8 => String::from_utf8_lossy(&buf).into_owned(),
                FileEncoding::Gb2312 => encoding_rs::GBK.decode(&buf).0.into_owned(),
            };
            let mut pending = std::mem::take(&mut follower.carry);
            pending.push_str(&text);

            let complete_up_to = pending.rfind('\n').map(|idx| idx + 1).unwrap_or(0);
            follower.carry = pending[complete_up_to..].to_string();

            let source = path.to_string_lossy().into_owned();
            for line in pending[..complete_up_to].lines() {
                if let Some(ts) = timestamp_from_line(line, follower.hint) {
                    follower.last_ts = Some(ts.timestamp());
                }
                let Some(ts) = follower.last_ts else {
                    continue;
                };
                new_items.push(RuleItem::from_log_line(&source, line, ts));
            }
        }

        self.queue.extend(new_items);
        for path in dropped {
            self.followers.remove(&path);
        }
    }

    fn scan_due(&self) -> bool {
        self.last_scan
            .map(|at| at.elapsed() >= self.scan_interval)
            .unwrap_or(true)
    }
}

impl Iterator for LogTailFollower {
    type Item = RuleItem;

    fn next(&mut self) -> Option<RuleItem> {
        loop {
            if let Some(item) = self.queue.pop_front() {
                return Some(item);
            }
            if self.stop.load(Ordering::Relaxed) {
                return None;
            }
            if self.scan_due() {
                self.scan_dirs(false);
            }
            self.poll_files();
            if self.queue.is_empty() {
                // nothing new; wait in short slices so stop stays responsive
                let deadline = Instant::now() + self.scan_interval;
                while Instant::now() < deadline {
                    if self.stop.load(Ordering::Relaxed) {
                        return None;
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use std::io::Write;

    fn append(path: &Path, text: &str) {
        let mut file = OpenOptions::new().append(true).create(true).open(path).unwrap();
        file.write_all(text.as_bytes()).unwrap();
    }

    #[test]
    fn existing_content_is_skipped_new_lines_flow() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("svc.log");
        append(&log, "2024-01-15 12:00:00.000 INFO old line\n");

        let stop = Arc::new(AtomicBool::new(false));
        let mut follower = LogTailFollower::new(vec![dir.path().to_path_buf()], Arc::clone(&stop))
            .with_scan_interval(Duration::from_millis(10));

        append(&log, "2024-01-15 12:00:01.000 ERROR new line\n");
        let item = follower.next().unwrap();
        assert!(item.msg["message"].as_str().unwrap().contains("new line"));
        assert_eq!(item.msgtype, "foxglove.Log");
        assert_eq!(item.ts, 1_705_291_201);
    }

    #[test]
    fn lines_without_timestamp_reuse_last_seen() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("svc.log");
        append(&log, "2024-01-15 12:00:00.000 INFO bootstrap\n");

        let stop = Arc::new(AtomicBool::new(false));
        let mut follower = LogTailFollower::new(vec![dir.path().to_path_buf()], Arc::clone(&stop))
            .with_scan_interval(Duration::from_millis(10));

        append(
            &log,
            "2024-01-15 12:00:05.000 WARN first\nbare continuation line\n",
        );
        let first = follower.next().unwrap();
        let second = follower.next().unwrap();
        assert_eq!(first.ts, 1_705_291_205);
        assert_eq!(second.ts, 1_705_291_205);
        assert_eq!(second.msg["message"], "bare continuation line");
    }

    #[test]
    fn partial_lines_wait_for_newline() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("svc.log");
        append(&log, "2024-01-15 12:00:00.000 INFO start\n");

        let stop = Arc::new(AtomicBool::new(false));
        let mut follower = LogTailFollower::new(vec![dir.path().to_path_buf()], Arc::clone(&stop))
            .with_scan_interval(Duration::from_millis(10));

        append(&log, "2024-01-15 12:00:01.000 half");
        follower.poll_files();
        assert!(follower.queue.is_empty());

        append(&log, " now complete\n");
        follower.poll_files();
        let item = follower.queue.pop_front().unwrap();
        assert_eq!(item.msg["message"], "2024-01-15 12:00:01.000 half now complete");
    }

    #[test]
    fn deleted_files_drop_their_follower() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("svc.log");
        append(&log, "2024-01-15 12:00:00.000 INFO start\n");

        let stop = Arc::new(AtomicBool::new(false));
        let mut follower = LogTailFollower::new(vec![dir.path().to_path_buf()], Arc::clone(&stop))
            .with_scan_interval(Duration::from_millis(10));
        assert_eq!(follower.followers.len(), 1);

        std::fs::remove_file(&log).unwrap();
        follower.poll_files();
        assert!(follower.followers.is_empty());
    }

    #[test]
    fn stop_ends_the_stream() {
        let dir = tempfile::tempdir().unwrap();
        let stop = Arc::new(AtomicBool::new(true));
        let mut follower = LogTailFollower::new(vec![dir.path().to_path_buf()], stop)
            .with_scan_interval(Duration::from_millis(10));
        assert!(follower.next().is_none());
    }
}
