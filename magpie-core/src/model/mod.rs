//! On-disk data model of the agent: upload file manifests, per-record cache
//! directories, and the small JSON state files the components persist.

mod file_info;
mod record;
mod state;

pub use file_info::{sha256_file, CompleteOptions, FileInfo};
pub(crate) use file_info::is_image;
pub use record::{Moment, MomentTask, RecordCache, RECORD_STATE_RELATIVE_PATH};
pub use state::{load_json, save_json};

use serde::{Deserialize, Serialize};

/// Device identity as discovered on the robot, before registration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawDevice {
    pub serial_number: String,
    pub display_name: String,
    pub description: String,
    pub labels: Vec<serde_json::Value>,
}

/// Self-updater bookkeeping. The updater itself lives outside the core.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdaterState {
    pub last_update_time: i64,
}
