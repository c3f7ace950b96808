// src/errors.rs

//! Crate-wide error types.
//!
//! One node's failure never takes the engine down; only configuration errors
//! (before anything is spawned) are fatal. The remaining variants exist so
//! that render/spawn/supervisor failures can be told apart when they are
//! converted into synthetic node exits.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SynthError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("template rendering failed for node '{node}': {message}")]
    Render { node: String, message: String },

    #[error("failed to spawn process for node '{node}': {source}")]
    Spawn {
        node: String,
        #[source]
        source: std::io::Error,
    },

    #[error("supervisor error for node '{node}': {message}")]
    Supervisor { node: String, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, SynthError>;
