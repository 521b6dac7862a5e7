// src/core/errors.rs

//! Defines the primary error type for the entire application.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the
/// supervisor. Using `thiserror` allows for clean error definitions and
/// automatic `From` trait implementations.
#[derive(Error, Debug, Clone)]
pub enum MewldError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Gateway rejected the request with status {0}")]
    Auth(u16),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Timed out waiting for a response")]
    Timeout,

    #[error("Cluster {cluster_id} is locked ({reason})")]
    LockedInstance { cluster_id: u64, reason: String },

    #[error("Config error: {0}")]
    Config(String),

    #[error("reshard not enabled")]
    ReshardDisabled,

    #[error("reshard rejected: {0}")]
    ReshardUnsafe(String),

    #[error("IPC error: {0}")]
    Ipc(String),

    #[error("Failed to spawn child process: {0}")]
    ProcessSpawn(String),
}

/// The outcome of a stop request. Not an error: a stop that finds no
/// running child is an expected state, not a failure to report upward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCode {
    Normal,
    RestartFailed,
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for MewldError {
    fn from(e: std::io::Error) -> Self {
        MewldError::Io(Arc::new(e))
    }
}

impl From<reqwest::Error> for MewldError {
    fn from(e: reqwest::Error) -> Self {
        MewldError::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for MewldError {
    fn from(e: serde_json::Error) -> Self {
        MewldError::Decode(e.to_string())
    }
}

impl From<redis::RedisError> for MewldError {
    fn from(e: redis::RedisError) -> Self {
        MewldError::Ipc(e.to_string())
    }
}
