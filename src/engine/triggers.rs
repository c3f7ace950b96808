// src/engine/triggers.rs

//! Per-trigger state machines.
//!
//! Each `(node, trigger_index)` pair owns one small tagged state; the
//! scheduler switches on the tag and asks the state whether it wants to fire.
//! Restart delays and watch debouncing live outside (timer tasks and the
//! watcher); the states here only decide *whether* a fire is due.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::model::{NodeId, Trigger};

#[derive(Debug)]
pub enum TriggerState {
    /// Fires exactly once, at engine start.
    Once { fired: bool },

    /// Fires when every predecessor has completed a successful run since the
    /// last fire. A failing predecessor simply never leaves `remaining`, so
    /// the downstream node stays unreachable rather than failed.
    After {
        predecessors: BTreeSet<NodeId>,
        remaining: BTreeSet<NodeId>,
    },

    /// Fires `delay` after flow start and after each exit of its node; the
    /// timers themselves are armed by the runtime.
    Restart { delay: Duration },

    /// Fires when a changed path falls under one of the watched roots.
    Watch {
        paths: Vec<PathBuf>,
        debounce: Duration,
    },
}

impl TriggerState {
    pub fn new(trigger: &Trigger) -> Self {
        match trigger {
            Trigger::Once => TriggerState::Once { fired: false },
            Trigger::After { after } => {
                let predecessors: BTreeSet<NodeId> = after.iter().cloned().collect();
                TriggerState::After {
                    remaining: predecessors.clone(),
                    predecessors,
                }
            }
            Trigger::Restart { delay } => TriggerState::Restart {
                delay: Duration::from_secs_f64(*delay),
            },
            Trigger::Watch { watch, debounce_ms } => TriggerState::Watch {
                paths: watch.iter().map(|p| normalize(Path::new(p))).collect(),
                debounce: Duration::from_millis(*debounce_ms),
            },
        }
    }

    /// One-shot fire at engine start. Returns true at most once.
    pub fn fire_at_start(&mut self) -> bool {
        match self {
            TriggerState::Once { fired } if !*fired => {
                *fired = true;
                true
            }
            _ => false,
        }
    }

    /// Record a successful run of `predecessor`. Returns true when this
    /// completes the predecessor set; the set is then re-armed so the trigger
    /// can fire again on the next round of successes.
    pub fn on_predecessor_success(&mut self, predecessor: &str) -> bool {
        match self {
            TriggerState::After {
                predecessors,
                remaining,
            } => {
                remaining.remove(predecessor);
                if remaining.is_empty() {
                    *remaining = predecessors.clone();
                    true
                } else {
                    false
                }
            }
            _ => false,
        }
    }

    /// The delay to re-arm after an exit, for restart triggers.
    pub fn restart_delay(&self) -> Option<Duration> {
        match self {
            TriggerState::Restart { delay } => Some(*delay),
            _ => None,
        }
    }

    /// Whether any of the changed paths falls under this watch trigger's
    /// roots (prefix match on normalized paths).
    pub fn matches_paths(&self, changed: &[PathBuf]) -> bool {
        match self {
            TriggerState::Watch { paths, .. } => changed.iter().any(|c| {
                let c = normalize(c);
                paths.iter().any(|root| c.starts_with(root))
            }),
            _ => false,
        }
    }

    /// Predecessor ids of an `after` trigger.
    pub fn predecessor_ids(&self) -> Box<dyn Iterator<Item = &NodeId> + '_> {
        match self {
            TriggerState::After { predecessors, .. } => Box::new(predecessors.iter()),
            _ => Box::new(std::iter::empty()),
        }
    }
}

/// Best-effort canonicalization: symlinks and relative components resolved
/// when the path exists, the literal path otherwise.
fn normalize(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}
