// src/engine/events.rs

//! The engine's event vocabulary and the channel that carries it.
//!
//! Every component publishes into one bounded mpsc channel; the runtime task
//! consumes it, applies each event to the scheduler, and forwards each event
//! in order to the renderer's own bounded queue. Sends await on a full queue,
//! so slow consumers exert backpressure instead of dropping events.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Local};
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::model::NodeId;

/// Which pipe of a child a line was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// How one run of a node ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitReport {
    /// The exit code, or -1 when the process was killed by a signal or never
    /// ran (spawn/render failure).
    pub code: i32,
    /// The terminating signal, if any.
    pub signal: Option<i32>,
    pub duration: Duration,
}

impl ExitReport {
    pub fn success(&self) -> bool {
        self.code == 0 && self.signal.is_none()
    }
}

/// Why a trigger fired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FireCause {
    /// A one-shot trigger firing at engine start.
    FlowStarted,
    /// All predecessors of an `after` trigger completed a successful run.
    PredecessorsSucceeded,
    /// A restart delay elapsed.
    RestartDelay,
    /// Watched paths changed.
    PathsChanged(Vec<PathBuf>),
    /// A fire arrived while the node was running and was coalesced into a
    /// restart after the run exited.
    PendingRestart,
}

/// Why the engine is shutting down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// No node is running and no remaining trigger can ever fire again.
    Quiescent,
    /// SIGINT/SIGTERM, or a programmatic interrupt.
    UserInterrupt,
}

/// The lifecycle of a node, as tracked by the scheduler and displayed by the
/// renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Waiting,
    Ready,
    Running,
    Terminating,
    Succeeded,
    Failed,
    Cancelled,
}

impl Lifecycle {
    pub fn display(&self) -> &'static str {
        match self {
            Lifecycle::Waiting => "waiting",
            Lifecycle::Ready => "ready",
            Lifecycle::Running => "running",
            Lifecycle::Terminating => "terminating",
            Lifecycle::Succeeded => "succeeded",
            Lifecycle::Failed => "failed",
            Lifecycle::Cancelled => "cancelled",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Lifecycle::Ready | Lifecycle::Running | Lifecycle::Terminating
        )
    }
}

/// Events flowing through the engine.
#[derive(Debug, Clone)]
pub enum Event {
    NodeStarted {
        node: NodeId,
        run: u64,
        pid: u32,
    },
    NodeOutput {
        node: NodeId,
        stream: OutputStream,
        line: Vec<u8>,
        timestamp: DateTime<Local>,
    },
    NodeExited {
        node: NodeId,
        run: u64,
        exit: ExitReport,
    },
    TriggerFired {
        node: NodeId,
        /// Index into the node's trigger list; `None` for the synthetic fire
        /// emitted when a coalesced restart is released.
        trigger: Option<usize>,
        cause: FireCause,
    },
    WatchEvent {
        paths: Vec<PathBuf>,
    },
    /// A node's lifecycle changed; consumed by the renderer only.
    NodePhase {
        node: NodeId,
        lifecycle: Lifecycle,
    },
    EngineShuttingDown {
        reason: ShutdownReason,
    },
    EngineStopped,
}

/// Cloneable publisher handle for the engine's event channel.
#[derive(Debug, Clone)]
pub struct EventTx {
    tx: mpsc::Sender<Event>,
}

impl EventTx {
    pub async fn publish(&self, event: Event) {
        if self.tx.send(event).await.is_err() {
            debug!("event channel closed; dropping event");
        }
    }
}

/// Create the engine's event channel.
pub fn channel(capacity: usize) -> (EventTx, mpsc::Receiver<Event>) {
    let (tx, rx) = mpsc::channel(capacity);
    (EventTx { tx }, rx)
}
