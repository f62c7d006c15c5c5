use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// 401-equivalent from the platform. Escapes the sweep so the outer auth
    /// cycle can clear the token and re-run.
    #[error("Unauthorized")]
    Unauthorized,

    /// The robot's serial-number source is missing; retried next tick.
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Sha256 mismatch: {0}")]
    Sha256Mismatch(String),

    #[error("Invalid configuration: {0}")]
    ConfigValidation(String),

    /// Endpoint-level failure from the object store; the record stays in its
    /// current state and is retried on the next sweep.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Transient platform RPC failure.
    #[error("API error: {0}")]
    Api(String),

    #[error("Corrupt state file: {0}")]
    CorruptState(PathBuf),

    #[error("Invalid resource name: {0}")]
    InvalidName(String),

    #[error("Unsupported file: {0}")]
    UnsupportedFile(PathBuf),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, AgentError>;
