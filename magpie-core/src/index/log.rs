//! Plain text log classifier.
//!
//! Logs keep growing, so they are never diagnosed as static files; live
//! lines reach the rule engine through the tail follower instead. Coverage
//! comes from the timestamp scan in [`log_time`](super::log_time).

use std::path::Path;

use super::log_time;
use super::{Classifier, FileState, MessageStream};
use crate::error::{AgentError, Result};

#[derive(Debug, Clone, Copy, Default)]
pub struct LogClassifier;

impl Classifier for LogClassifier {
    fn name(&self) -> &'static str {
        "log"
    }

    fn is_static(&self) -> bool {
        false
    }

    fn matches(&self, path: &Path) -> bool {
        path.is_file()
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(".log"))
    }

    fn compute_state(&self, path: &Path) -> Result<FileState> {
        let size = path.metadata()?.len();
        let Some(start) = log_time::start_timestamp(path)? else {
            return Ok(FileState::unsupported(size));
        };
        let Some(end) = log_time::end_timestamp(path)? else {
            return Ok(FileState::unsupported(size));
        };
        Ok(FileState::covered(size, start, end))
    }

    fn messages(&self, path: &Path) -> Result<MessageStream> {
        Err(AgentError::UnsupportedFile(path.to_path_buf()))
    }
}

/// Copy/transcode a log into the cut directory; see
/// [`log_time::prepare_cut`].
pub fn prepare_cut(
    src: &Path,
    target_dir: &Path,
    start_secs: i64,
    end_secs: i64,
) -> Result<std::path::PathBuf> {
    log_time::prepare_cut(src, target_dir, start_secs, end_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn matches_only_log_files() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("a.log");
        let bag = dir.path().join("a.bag");
        fs::write(&log, "x").unwrap();
        fs::write(&bag, "x").unwrap();

        let classifier = LogClassifier;
        assert!(classifier.matches(&log));
        assert!(!classifier.matches(&bag));
        assert!(!classifier.matches(dir.path()));
    }

    #[test]
    fn coverage_or_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let classifier = LogClassifier;

        let good = dir.path().join("good.log");
        fs::write(&good, "2024-01-15 12:00:00.000 a\n2024-01-15 12:00:01.000 b\n").unwrap();
        let state = classifier.compute_state(&good).unwrap();
        assert!(!state.unsupported);
        assert_eq!(
            state.end_time.unwrap() - state.start_time.unwrap(),
            1
        );

        let bad = dir.path().join("bad.log");
        fs::write(&bad, "no timestamps\n").unwrap();
        assert!(classifier.compute_state(&bad).unwrap().unsupported);
    }
}
