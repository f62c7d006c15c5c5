//! A local file destined for upload.
//!
//! Files on a robot may still be growing while an upload is in flight. The
//! hash therefore covers only the first `size` bytes: once a `FileInfo` is
//! completed, appending to the underlying file leaves the frozen segment
//! hash-stable.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{AgentError, Result};

const HASH_BLOCK_SIZE: usize = 4096;

/// SHA-256 of the first `limit` bytes of `path` (the whole file when `None`).
pub fn sha256_file(path: &Path, limit: Option<u64>) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; HASH_BLOCK_SIZE];
    let mut remaining = limit;

    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        let take = match remaining {
            Some(0) => break,
            Some(rem) => (rem.min(n as u64)) as usize,
            None => n,
        };
        hasher.update(&buf[..take]);
        if let Some(rem) = remaining.as_mut() {
            *rem -= take as u64;
            if *rem == 0 {
                break;
            }
        }
    }
    Ok(hex::encode(hasher.finalize()))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CompleteOptions {
    /// Re-read `stat().size` and rehash even when both are already set.
    pub force_rehash: bool,
    /// Fill size only, leaving the hash for later.
    pub skip_sha256: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub filepath: PathBuf,
    /// Display/relative name; may differ from the basename (e.g. `log/x.log`).
    pub filename: String,
    pub size: Option<u64>,
    pub sha256: Option<String>,
}

impl FileInfo {
    pub fn new(filepath: impl Into<PathBuf>) -> Self {
        let filepath = filepath.into();
        let filename = filepath
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            filepath,
            filename,
            size: None,
            sha256: None,
        }
    }

    pub fn with_filename(filepath: impl Into<PathBuf>, filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            ..Self::new(filepath)
        }
    }

    pub fn is_completed(&self) -> bool {
        !self.filename.is_empty() && self.size.is_some() && self.sha256.is_some()
    }

    /// Fill in the missing attributes from the file on disk.
    pub fn complete(&mut self, opts: CompleteOptions) -> Result<&mut Self> {
        if !self.filepath.is_file() {
            return Err(AgentError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("file {} not found", self.filepath.display()),
            )));
        }
        if self.filename.is_empty() {
            self.filename = self
                .filepath
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
        }

        if self.size.is_none() || opts.force_rehash {
            self.size = Some(self.filepath.metadata()?.len());
        }
        if !opts.skip_sha256 && (self.sha256.is_none() || opts.force_rehash) {
            tracing::debug!(path = %self.filepath.display(), "hashing file");
            self.sha256 = Some(sha256_file(&self.filepath, self.size)?);
        }
        Ok(self)
    }

    /// Non-mutating variant, handy when the original must stay partial.
    pub fn completed(&self, opts: CompleteOptions) -> Result<FileInfo> {
        let mut copy = self.clone();
        copy.complete(opts)?;
        Ok(copy)
    }

    /// Platform resource name of this file under `record_name`.
    pub fn resource_name(&self, record_name: &str) -> String {
        format!("{record_name}/files/{}", self.filename)
    }
}

pub(crate) fn is_image(filename: &str) -> bool {
    let lower = filename.to_ascii_lowercase();
    lower.ends_with(".jpg") || lower.ends_with(".jpeg") || lower.ends_with(".png")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn digest(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    #[test]
    fn complete_fills_size_and_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.txt");
        fs::write(&path, "local").unwrap();

        let mut info = FileInfo::new(&path);
        assert!(!info.is_completed());

        info.complete(CompleteOptions::default()).unwrap();
        assert!(info.is_completed());
        assert_eq!(info.size, Some(5));
        assert_eq!(info.sha256.as_deref(), Some(digest(b"local").as_str()));
        assert_eq!(info.filename, "test.txt");
    }

    #[test]
    fn hash_is_stable_across_appends_until_forced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.txt");
        fs::write(&path, "local").unwrap();

        let mut info = FileInfo::new(&path);
        info.complete(CompleteOptions::default()).unwrap();
        let frozen = info.sha256.clone();

        // the file grows, the frozen prefix does not change
        fs::write(&path, "local & global").unwrap();
        let unchanged = info.completed(CompleteOptions::default()).unwrap();
        assert_eq!(unchanged.sha256, frozen);
        assert_eq!(unchanged.size, Some(5));

        let rehashed = info
            .completed(CompleteOptions {
                force_rehash: true,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(rehashed.size, Some(14));
        assert_eq!(
            rehashed.sha256.as_deref(),
            Some(digest(b"local & global").as_str())
        );
    }

    #[test]
    fn skip_sha256_fills_size_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.txt");
        fs::write(&path, "payload").unwrap();

        let mut info = FileInfo::new(&path);
        info.complete(CompleteOptions {
            skip_sha256: true,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(info.size, Some(7));
        assert_eq!(info.sha256, None);
    }

    #[test]
    fn custom_filename_and_size_prefix_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.txt");
        fs::write(&path, "local & global").unwrap();

        let mut info = FileInfo::with_filename(&path, "result/test.txt");
        info.size = Some(5);
        info.complete(CompleteOptions::default()).unwrap();
        assert_eq!(info.filename, "result/test.txt");
        assert_eq!(info.sha256.as_deref(), Some(digest(b"local").as_str()));
        assert_eq!(
            info.resource_name("projects/p/records/r"),
            "projects/p/records/r/files/result/test.txt"
        );
    }

    #[test]
    fn missing_file_errors() {
        let mut info = FileInfo::new("does-not-exist.txt");
        assert!(info.complete(CompleteOptions::default()).is_err());
    }
}
