// src/engine/scheduler.rs

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::model::{NodeId, ResolvedFlow};
use crate::dag::FlowGraph;
use crate::engine::events::{Event, ExitReport, FireCause, Lifecycle, ShutdownReason};
use crate::engine::triggers::TriggerState;

/// Engine-internal state, one per node. Mutated exclusively by the scheduler.
#[derive(Debug, Clone)]
pub struct NodeState {
    pub lifecycle: Lifecycle,
    pub run_count: u64,
    pub last_exit: Option<ExitReport>,
}

impl NodeState {
    fn new() -> Self {
        Self {
            lifecycle: Lifecycle::Waiting,
            run_count: 0,
            last_exit: None,
        }
    }
}

/// What the runtime should do in response to a scheduler decision.
#[derive(Debug)]
pub enum Action {
    /// Render and spawn the node's command.
    Start { node: NodeId, run: u64 },
    /// Begin the graceful-then-forced termination of the node's process.
    Stop { node: NodeId },
    /// Arm a one-shot timer that fires the given restart trigger.
    ArmRestart {
        node: NodeId,
        trigger_index: usize,
        delay: Duration,
    },
    /// Forward an event to the renderer (trigger fires, phase changes).
    Notify(Event),
    /// Ask the runtime to begin engine shutdown.
    RequestShutdown { reason: ShutdownReason },
}

/// Single owner of the `NodeState` table.
///
/// The scheduler is synchronous: it consumes trigger fires, exits, watch
/// batches and the shutdown signal, mutates node state, and returns the
/// actions the runtime should carry out. All asynchrony (spawning, timers,
/// pipes) lives in the runtime and supervisor.
pub struct Scheduler {
    graph: FlowGraph,
    states: BTreeMap<NodeId, NodeState>,
    triggers: BTreeMap<NodeId, Vec<TriggerState>>,
    /// Single restart bit per node; fires while running collapse into it.
    restart_pending: BTreeSet<NodeId>,
    shutdown: Option<ShutdownReason>,
    saw_failing_exit: bool,
}

impl Scheduler {
    pub fn new(flow: &ResolvedFlow) -> Self {
        let graph = FlowGraph::from_flow(flow);

        let mut states = BTreeMap::new();
        let mut triggers = BTreeMap::new();
        for (id, node) in &flow.nodes {
            states.insert(id.clone(), NodeState::new());
            triggers.insert(
                id.clone(),
                node.triggers.iter().map(TriggerState::new).collect(),
            );
        }

        Self {
            graph,
            states,
            triggers,
            restart_pending: BTreeSet::new(),
            shutdown: None,
            saw_failing_exit: false,
        }
    }

    /// Fire all one-shot triggers and arm the initial restart delays.
    pub fn start(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        let mut fires = Vec::new();

        for (id, states) in self.triggers.iter_mut() {
            for (index, trigger) in states.iter_mut().enumerate() {
                if trigger.fire_at_start() {
                    fires.push((id.clone(), index));
                } else if let Some(delay) = trigger.restart_delay() {
                    actions.push(Action::ArmRestart {
                        node: id.clone(),
                        trigger_index: index,
                        delay,
                    });
                }
            }
        }

        for (id, index) in fires {
            self.fire(&id, Some(index), FireCause::FlowStarted, true, &mut actions);
        }

        self.check_quiescence(&mut actions);
        actions
    }

    /// The supervisor reported a pid for a started run.
    pub fn on_started(&mut self, node: &str, _pid: u32) -> Vec<Action> {
        let mut actions = Vec::new();
        match self.states.get(node).map(|s| s.lifecycle) {
            Some(Lifecycle::Ready) => {
                self.set_lifecycle(node, Lifecycle::Running, &mut actions);
            }
            Some(Lifecycle::Terminating) | None => {}
            Some(other) => {
                debug!(node = %node, state = ?other, "started event in unexpected state");
            }
        }
        actions
    }

    /// A trigger fired from outside the scheduler (restart timer).
    pub fn on_trigger_fired(
        &mut self,
        node: &str,
        trigger: Option<usize>,
        cause: FireCause,
    ) -> Vec<Action> {
        let mut actions = Vec::new();
        // The originating event was already forwarded to the renderer by the
        // runtime, so don't announce it a second time.
        self.fire(node, trigger, cause, false, &mut actions);
        actions
    }

    /// A debounced batch of filesystem changes arrived.
    pub fn on_watch_event(&mut self, paths: &[std::path::PathBuf]) -> Vec<Action> {
        let mut actions = Vec::new();

        let mut fires = Vec::new();
        for (id, states) in &self.triggers {
            for (index, trigger) in states.iter().enumerate() {
                if trigger.matches_paths(paths) {
                    fires.push((id.clone(), index));
                }
            }
        }

        for (id, index) in fires {
            self.fire(
                &id,
                Some(index),
                FireCause::PathsChanged(paths.to_vec()),
                true,
                &mut actions,
            );
        }

        actions
    }

    /// One run of a node ended; apply the exit policy.
    pub fn on_exited(&mut self, node: &str, exit: ExitReport) -> Vec<Action> {
        let mut actions = Vec::new();

        let Some(state) = self.states.get_mut(node) else {
            warn!(node = %node, "exit for unknown node; ignoring");
            return actions;
        };

        state.run_count += 1;
        state.last_exit = Some(exit);
        // Transient: out of Running/Terminating before anything else so that
        // a released pending restart starts instead of re-coalescing.
        state.lifecycle = Lifecycle::Waiting;

        if !exit.success() {
            self.saw_failing_exit = true;
        }

        if self.shutdown.is_some() {
            self.set_lifecycle(node, Lifecycle::Cancelled, &mut actions);
            return actions;
        }

        if exit.success() {
            let mut fires = Vec::new();
            for dependent in self.graph.dependents_of(node).to_vec() {
                if let Some(states) = self.triggers.get_mut(&dependent) {
                    for (index, trigger) in states.iter_mut().enumerate() {
                        if trigger.on_predecessor_success(node) {
                            fires.push((dependent.clone(), index));
                        }
                    }
                }
            }
            for (dependent, index) in fires {
                self.fire(
                    &dependent,
                    Some(index),
                    FireCause::PredecessorsSucceeded,
                    true,
                    &mut actions,
                );
            }
        }

        // Restart triggers re-arm on every exit, successful or not.
        if let Some(states) = self.triggers.get(node) {
            for (index, trigger) in states.iter().enumerate() {
                if let Some(delay) = trigger.restart_delay() {
                    actions.push(Action::ArmRestart {
                        node: node.to_string(),
                        trigger_index: index,
                        delay,
                    });
                }
            }
        }

        if self.restart_pending.remove(node) {
            info!(node = %node, "releasing coalesced restart");
            self.fire(node, None, FireCause::PendingRestart, true, &mut actions);
        } else {
            let refire = self.node_can_fire_again(node);
            let next = if refire {
                Lifecycle::Waiting
            } else if exit.success() {
                Lifecycle::Succeeded
            } else {
                Lifecycle::Failed
            };
            // Announce even when the node stays Waiting: the renderer last
            // saw it Running, and the transient assignment above is silent.
            if let Some(state) = self.states.get_mut(node) {
                state.lifecycle = next;
            }
            actions.push(Action::Notify(Event::NodePhase {
                node: node.to_string(),
                lifecycle: next,
            }));
        }

        self.check_quiescence(&mut actions);
        actions
    }

    /// Begin shutdown: stop every active node. Idempotent.
    pub fn on_shutdown(&mut self, reason: ShutdownReason) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.shutdown.is_some() {
            return actions;
        }

        info!(?reason, "scheduler entering shutdown");
        self.shutdown = Some(reason);
        self.restart_pending.clear();

        let active: Vec<NodeId> = self
            .states
            .iter()
            .filter(|(_, s)| matches!(s.lifecycle, Lifecycle::Ready | Lifecycle::Running))
            .map(|(id, _)| id.clone())
            .collect();

        for id in active {
            self.set_lifecycle(&id, Lifecycle::Terminating, &mut actions);
            actions.push(Action::Stop { node: id });
        }

        actions
    }

    pub fn shutdown_reason(&self) -> Option<ShutdownReason> {
        self.shutdown
    }

    /// True once no node is `Ready`/`Running`/`Terminating`.
    pub fn drained(&self) -> bool {
        !self.states.values().any(|s| s.lifecycle.is_active())
    }

    pub fn state(&self, node: &str) -> Option<&NodeState> {
        self.states.get(node)
    }

    /// Snapshot of all node states, for the final report.
    pub fn report(&self) -> BTreeMap<NodeId, NodeState> {
        self.states.clone()
    }

    /// The engine exit code.
    ///
    /// Any failing exit anywhere (including a child killed by the shutdown
    /// SIGTERM) forces 1. Otherwise every node must have succeeded, except
    /// that on user interrupt the nodes driven by restart/watch triggers are
    /// excluded: they can never be "complete", so an interrupt that did not
    /// cut one of them short is still a clean exit.
    pub fn exit_code(&self) -> i32 {
        if self.saw_failing_exit {
            return 1;
        }

        let interrupted = matches!(self.shutdown, Some(ShutdownReason::UserInterrupt));
        let all_ok = self.states.iter().all(|(id, state)| {
            match state.lifecycle {
                Lifecycle::Succeeded => true,
                Lifecycle::Waiting | Lifecycle::Cancelled => {
                    interrupted && self.has_repeating_trigger(id)
                }
                _ => false,
            }
        });

        if all_ok {
            0
        } else {
            1
        }
    }

    /// A trigger wants its node to run: start it, or coalesce the request
    /// into a pending restart while a run is in flight.
    fn fire(
        &mut self,
        node: &str,
        trigger: Option<usize>,
        cause: FireCause,
        announce: bool,
        actions: &mut Vec<Action>,
    ) {
        if announce {
            actions.push(Action::Notify(Event::TriggerFired {
                node: node.to_string(),
                trigger,
                cause: cause.clone(),
            }));
        }

        if self.shutdown.is_some() {
            debug!(node = %node, "ignoring trigger fire during shutdown");
            return;
        }

        let Some(state) = self.states.get(node) else {
            warn!(node = %node, "trigger fire for unknown node; ignoring");
            return;
        };

        if state.lifecycle.is_active() {
            // Coalesce: one pending restart, however many fires arrive.
            self.restart_pending.insert(node.to_string());
            debug!(node = %node, ?cause, "node busy; coalescing fire into pending restart");
            return;
        }

        self.set_lifecycle(node, Lifecycle::Ready, actions);
        let run = self.states[node].run_count + 1;
        debug!(node = %node, run, ?cause, "starting node");
        actions.push(Action::Start {
            node: node.to_string(),
            run,
        });
    }

    fn set_lifecycle(&mut self, node: &str, lifecycle: Lifecycle, actions: &mut Vec<Action>) {
        if let Some(state) = self.states.get_mut(node) {
            if state.lifecycle != lifecycle {
                state.lifecycle = lifecycle;
                actions.push(Action::Notify(Event::NodePhase {
                    node: node.to_string(),
                    lifecycle,
                }));
            }
        }
    }

    /// No-more-work detection: quiescent when nothing is active, no restart
    /// is pending, and no trigger can ever fire again.
    fn check_quiescence(&self, actions: &mut Vec<Action>) {
        if self.shutdown.is_some() {
            return;
        }
        if !self.drained() || !self.restart_pending.is_empty() {
            return;
        }
        if self.states.keys().any(|id| self.node_can_fire_again(id)) {
            return;
        }

        info!("no node running and no trigger can fire again; requesting shutdown");
        actions.push(Action::RequestShutdown {
            reason: ShutdownReason::Quiescent,
        });
    }

    /// Whether any trigger of `node` could still fire.
    fn node_can_fire_again(&self, node: &str) -> bool {
        self.node_can_fire_again_from(node, &mut BTreeSet::new())
    }

    fn node_can_fire_again_from(&self, node: &str, visiting: &mut BTreeSet<NodeId>) -> bool {
        self.triggers
            .get(node)
            .map(|states| {
                states
                    .iter()
                    .any(|t| self.trigger_can_fire_again(t, visiting))
            })
            .unwrap_or(false)
    }

    fn trigger_can_fire_again(&self, trigger: &TriggerState, visiting: &mut BTreeSet<NodeId>) -> bool {
        match trigger {
            TriggerState::Once { fired } => !*fired,
            TriggerState::Restart { .. } | TriggerState::Watch { .. } => true,
            // An `after` can fire again iff some predecessor could run again.
            // The `after` edges are validated acyclic; the visiting set keeps
            // a malformed flow from recursing forever.
            TriggerState::After { .. } => trigger
                .predecessor_ids()
                .any(|pred| self.node_can_run_again(pred, visiting)),
        }
    }

    fn node_can_run_again(&self, node: &str, visiting: &mut BTreeSet<NodeId>) -> bool {
        if !visiting.insert(node.to_string()) {
            return false;
        }
        let Some(state) = self.states.get(node) else {
            visiting.remove(node);
            return false;
        };
        let again = state.lifecycle.is_active()
            || self.restart_pending.contains(node)
            || self.node_can_fire_again_from(node, visiting);
        visiting.remove(node);
        again
    }

    fn has_repeating_trigger(&self, node: &str) -> bool {
        self.triggers
            .get(node)
            .map(|states| {
                states.iter().any(|t| {
                    matches!(t, TriggerState::Restart { .. } | TriggerState::Watch { .. })
                })
            })
            .unwrap_or(false)
    }
}
