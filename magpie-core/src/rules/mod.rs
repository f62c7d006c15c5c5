//! The rule-driven trigger pipeline: remote diagnosis rules evaluated over
//! decoded message streams and tailed log lines.

pub mod engine;
pub mod executor;
pub mod tail;

pub use engine::{build_engine, validate_rule_set, Engine, RuleContext};
pub use executor::{RuleExecutor, UploadFn, UploadWindow};
pub use tail::LogTailFollower;

use serde_json::{json, Value};

/// One item flowing through the rule engine: a decoded message from a data
/// file, or a tailed log line.
#[derive(Debug, Clone)]
pub struct RuleItem {
    pub topic: String,
    pub msg: Value,
    /// Log time in seconds since epoch.
    pub ts: i64,
    pub msgtype: String,
}

impl RuleItem {
    /// Tailed log lines enter the pipeline shaped like `foxglove.Log`
    /// messages so the same rules match live logs and recorded data.
    pub fn from_log_line(source: &str, line: &str, ts: i64) -> Self {
        Self {
            topic: source.to_string(),
            msg: json!({"message": line}),
            ts,
            msgtype: "foxglove.Log".to_string(),
        }
    }
}
