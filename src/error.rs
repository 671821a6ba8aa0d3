//! Error types for the orchestrator

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Key tool error: {0}")]
    KeyTool(String),

    #[error("Unknown node: {0}")]
    UnknownNode(String),

    #[error("Node {0} already has a consensus process")]
    AlreadyStarted(String),

    #[error("Node {0} did not become ready within {1:?}")]
    StartTimeout(String, Duration),

    #[error("Quorum threshold {threshold} exceeds member count {members}")]
    QuorumThreshold { threshold: u32, members: usize },

    #[error("Failed to spawn {bin:?}: {source}")]
    Spawn {
        bin: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid peer URI: {0}")]
    InvalidPeerUri(String),
}

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, OrchestratorError>;
