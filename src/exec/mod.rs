// src/exec/mod.rs

//! Process execution layer.
//!
//! Responsible for actually running node commands with
//! `tokio::process::Command`, streaming their output onto the event channel,
//! and enforcing the graceful-then-forced termination protocol.

pub mod supervisor;

pub use supervisor::{RunHandle, SpawnSpec, Supervisor, DEFAULT_GRACE, LINE_CAP};
