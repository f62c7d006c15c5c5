//! Process-wide accounting of bytes moved over the network.
//!
//! Every platform RPC and every object-store part upload reports its
//! request/response sizes here. The heartbeat snapshots the counters and
//! resets them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

#[derive(Debug, Default)]
pub struct NetworkMeter {
    upload_bytes: AtomicU64,
    download_bytes: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct NetworkUsage {
    pub upload_bytes: u64,
    pub download_bytes: u64,
}

impl NetworkMeter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_upload(&self, bytes: u64) {
        self.upload_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_download(&self, bytes: u64) {
        self.download_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> NetworkUsage {
        NetworkUsage {
            upload_bytes: self.upload_bytes.load(Ordering::Relaxed),
            download_bytes: self.download_bytes.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.upload_bytes.store(0, Ordering::Relaxed);
        self.download_bytes.store(0, Ordering::Relaxed);
    }
}
