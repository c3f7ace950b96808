// src/engine/mod.rs

//! The flow execution engine: event vocabulary, trigger state machines, the
//! scheduler that owns node state, and the runtime loop that wires them to
//! the supervisor, watcher and renderer.

pub mod events;
pub mod runtime;
pub mod scheduler;
pub mod triggers;

pub use events::{Event, EventTx, ExitReport, FireCause, Lifecycle, OutputStream, ShutdownReason};
pub use runtime::{Engine, EngineHandle, EngineOptions, EngineReport};
pub use scheduler::{Action, NodeState, Scheduler};
