//! Error types for Ampelnetz nodes
//!
//! Only configuration errors are fatal, and only at startup. Every other
//! error is logged by the component that sees it and the node keeps running.

use std::path::PathBuf;
use thiserror::Error;

/// Invalid or unreadable node configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse TOML config: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Missing node identifier")]
    MissingNodeId,

    #[error("Invalid interval: {name} must be positive")]
    ZeroInterval { name: &'static str },

    #[error("Invalid overload factor: must be in (0, 1], got {0}")]
    InvalidOverloadFactor(f64),

    #[error("No peers configured for broadcast")]
    NoPeers,

    #[error("Invalid socket address format: {0}")]
    InvalidSocketAddr(String),
}

/// Durable store failures
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Storage encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

impl StorageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Broadcast medium failures
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Transport closed")]
    Closed,
}

/// Undecodable incoming frame
#[derive(Debug, Error)]
#[error("Malformed frame: {0}")]
pub struct DecodeError(#[from] pub serde_json::Error);

/// Unrecognized operator input
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandParseError {
    #[error("Empty command")]
    Empty,

    #[error("Unknown command: {0}")]
    Unknown(String),

    #[error("Unknown road: {0} (expected main or side)")]
    UnknownRoad(String),

    #[error("Missing road (usage: overload main|side)")]
    MissingRoad,
}

/// Umbrella error for node setup and runtime
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Node runtime stopped")]
    Stopped,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
