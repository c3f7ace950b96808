// tests/scheduler_flow.rs
//
// Drives the scheduler directly, simulating supervisor exits, to pin down
// the start/exit policies: topological ordering over `after` edges, failure
// blocking, restart coalescing, and no-more-work detection.

mod common;
use crate::common::{after_node, flow_of, init_tracing, once_node, shell_node};

use std::error::Error;
use std::time::Duration;

use synthesize::config::model::Trigger;
use synthesize::engine::{
    Action, ExitReport, FireCause, Lifecycle, Scheduler, ShutdownReason,
};

type TestResult = Result<(), Box<dyn Error>>;

fn ok_exit() -> ExitReport {
    ExitReport {
        code: 0,
        signal: None,
        duration: Duration::from_millis(5),
    }
}

fn failed_exit(code: i32) -> ExitReport {
    ExitReport {
        code,
        signal: None,
        duration: Duration::from_millis(5),
    }
}

fn signal_exit(signal: i32) -> ExitReport {
    ExitReport {
        code: -1,
        signal: Some(signal),
        duration: Duration::from_millis(5),
    }
}

fn starts(actions: &[Action]) -> Vec<String> {
    actions
        .iter()
        .filter_map(|a| match a {
            Action::Start { node, .. } => Some(node.clone()),
            _ => None,
        })
        .collect()
}

fn stops(actions: &[Action]) -> Vec<String> {
    actions
        .iter()
        .filter_map(|a| match a {
            Action::Stop { node } => Some(node.clone()),
            _ => None,
        })
        .collect()
}

fn requests_quiescent_shutdown(actions: &[Action]) -> bool {
    actions.iter().any(|a| {
        matches!(
            a,
            Action::RequestShutdown {
                reason: ShutdownReason::Quiescent
            }
        )
    })
}

#[test]
fn linear_after_chain_runs_in_topological_order() -> TestResult {
    init_tracing();

    let flow = flow_of(vec![
        once_node("a", "echo ok"),
        after_node("b", "echo ok", &["a"]),
        after_node("c", "echo ok", &["b"]),
    ]);
    let mut scheduler = Scheduler::new(&flow);
    let mut started = Vec::new();

    let actions = scheduler.start();
    started.extend(starts(&actions));
    assert_eq!(started, ["a"]);

    scheduler.on_started("a", 100);
    let actions = scheduler.on_exited("a", ok_exit());
    started.extend(starts(&actions));
    assert_eq!(started, ["a", "b"]);

    scheduler.on_started("b", 101);
    let actions = scheduler.on_exited("b", ok_exit());
    started.extend(starts(&actions));
    assert_eq!(started, ["a", "b", "c"]);

    scheduler.on_started("c", 102);
    let actions = scheduler.on_exited("c", ok_exit());
    assert!(starts(&actions).is_empty());
    assert!(requests_quiescent_shutdown(&actions));

    for id in ["a", "b", "c"] {
        let state = scheduler.state(id).unwrap();
        assert_eq!(state.lifecycle, Lifecycle::Succeeded, "node {id}");
        assert_eq!(state.run_count, 1, "node {id}");
    }
    assert_eq!(scheduler.exit_code(), 0);

    Ok(())
}

#[test]
fn failing_predecessor_blocks_all_downstream_nodes() -> TestResult {
    init_tracing();

    let flow = flow_of(vec![
        once_node("a", "exit 2"),
        after_node("b", "echo ok", &["a"]),
        after_node("c", "echo ok", &["b"]),
    ]);
    let mut scheduler = Scheduler::new(&flow);

    let actions = scheduler.start();
    assert_eq!(starts(&actions), ["a"]);

    scheduler.on_started("a", 100);
    let actions = scheduler.on_exited("a", failed_exit(2));

    // Nothing downstream starts, and the engine can wind down on its own.
    assert!(starts(&actions).is_empty());
    assert!(requests_quiescent_shutdown(&actions));

    assert_eq!(scheduler.state("a").unwrap().lifecycle, Lifecycle::Failed);
    assert_eq!(scheduler.state("b").unwrap().lifecycle, Lifecycle::Waiting);
    assert_eq!(scheduler.state("b").unwrap().run_count, 0);
    assert_eq!(scheduler.state("c").unwrap().run_count, 0);
    assert_eq!(scheduler.exit_code(), 1);

    Ok(())
}

#[test]
fn fires_while_running_collapse_into_one_restart() -> TestResult {
    init_tracing();

    let dir = tempfile::tempdir()?;
    let root = dir.path().canonicalize()?;

    let flow = flow_of(vec![shell_node(
        "worker",
        "echo tick",
        vec![Trigger::Watch {
            watch: vec![root.to_string_lossy().into_owned()],
            debounce_ms: 50,
        }],
    )]);
    let mut scheduler = Scheduler::new(&flow);

    // Watch triggers do not fire at flow start.
    let actions = scheduler.start();
    assert!(starts(&actions).is_empty());
    assert!(!requests_quiescent_shutdown(&actions));

    let changed = vec![root.join("file.txt")];
    let actions = scheduler.on_watch_event(&changed);
    assert_eq!(starts(&actions), ["worker"]);
    scheduler.on_started("worker", 100);

    // Three more batches while the node is running: all coalesce.
    for _ in 0..3 {
        let actions = scheduler.on_watch_event(&changed);
        assert!(starts(&actions).is_empty());
    }

    let actions = scheduler.on_exited("worker", ok_exit());
    assert_eq!(starts(&actions), ["worker"], "exactly one restart");
    scheduler.on_started("worker", 101);

    // No further fires are pending after the coalesced one.
    let actions = scheduler.on_exited("worker", ok_exit());
    assert!(starts(&actions).is_empty());
    assert_eq!(
        scheduler.state("worker").unwrap().lifecycle,
        Lifecycle::Waiting
    );
    assert_eq!(scheduler.state("worker").unwrap().run_count, 2);

    Ok(())
}

#[test]
fn restarting_predecessor_refires_downstream_and_coalesces() -> TestResult {
    init_tracing();

    let flow = flow_of(vec![
        shell_node("server", "run-server", vec![Trigger::Restart { delay: 0.0 }]),
        after_node("notify", "echo up", &["server"]),
    ]);
    let mut scheduler = Scheduler::new(&flow);

    // Restart triggers arm a timer at flow start instead of firing directly.
    let actions = scheduler.start();
    assert!(starts(&actions).is_empty());
    assert!(actions
        .iter()
        .any(|a| matches!(a, Action::ArmRestart { node, .. } if node == "server")));

    let actions = scheduler.on_trigger_fired("server", Some(0), FireCause::RestartDelay);
    assert_eq!(starts(&actions), ["server"]);
    scheduler.on_started("server", 100);

    // First successful run of the predecessor releases the dependent.
    let actions = scheduler.on_exited("server", ok_exit());
    assert_eq!(starts(&actions), ["notify"]);
    scheduler.on_started("notify", 101);

    // Second round: the dependent is still running, so its fire coalesces.
    let actions = scheduler.on_trigger_fired("server", Some(0), FireCause::RestartDelay);
    assert_eq!(starts(&actions), ["server"]);
    scheduler.on_started("server", 102);
    let actions = scheduler.on_exited("server", ok_exit());
    assert!(starts(&actions).is_empty());

    // When the dependent exits, the pending restart is released: one run.
    let actions = scheduler.on_exited("notify", ok_exit());
    assert_eq!(starts(&actions), ["notify"]);
    assert!(!requests_quiescent_shutdown(&actions));

    Ok(())
}

#[test]
fn shutdown_stops_running_nodes_and_cancels_them() -> TestResult {
    init_tracing();

    let flow = flow_of(vec![shell_node(
        "loop",
        "sleep 30",
        vec![Trigger::Restart { delay: 0.0 }],
    )]);
    let mut scheduler = Scheduler::new(&flow);

    scheduler.start();
    scheduler.on_trigger_fired("loop", Some(0), FireCause::RestartDelay);
    scheduler.on_started("loop", 100);

    let actions = scheduler.on_shutdown(ShutdownReason::UserInterrupt);
    assert_eq!(stops(&actions), ["loop"]);
    assert_eq!(
        scheduler.state("loop").unwrap().lifecycle,
        Lifecycle::Terminating
    );
    assert!(!scheduler.drained());

    // The SIGTERM'd child reports a signal exit.
    scheduler.on_exited("loop", signal_exit(15));
    assert_eq!(
        scheduler.state("loop").unwrap().lifecycle,
        Lifecycle::Cancelled
    );
    assert!(scheduler.drained());

    // A run was cut short: not a clean exit.
    assert_eq!(scheduler.exit_code(), 1);

    Ok(())
}

#[test]
fn interrupting_an_idle_watch_flow_exits_cleanly() -> TestResult {
    init_tracing();

    let dir = tempfile::tempdir()?;
    let root = dir.path().canonicalize()?;

    let flow = flow_of(vec![shell_node(
        "worker",
        "echo tick",
        vec![Trigger::Watch {
            watch: vec![root.to_string_lossy().into_owned()],
            debounce_ms: 50,
        }],
    )]);
    let mut scheduler = Scheduler::new(&flow);

    scheduler.start();
    scheduler.on_watch_event(&[root.join("file.txt")]);
    scheduler.on_started("worker", 100);
    scheduler.on_exited("worker", ok_exit());

    // Idle between runs; an interrupt cuts nothing short.
    let actions = scheduler.on_shutdown(ShutdownReason::UserInterrupt);
    assert!(stops(&actions).is_empty());
    assert!(scheduler.drained());
    assert_eq!(scheduler.exit_code(), 0);

    Ok(())
}

#[test]
fn diamond_dependency_fires_join_node_once_per_round() -> TestResult {
    init_tracing();

    let flow = flow_of(vec![
        once_node("a", "echo ok"),
        after_node("left", "echo ok", &["a"]),
        after_node("right", "echo ok", &["a"]),
        after_node("join", "echo ok", &["left", "right"]),
    ]);
    let mut scheduler = Scheduler::new(&flow);

    let actions = scheduler.start();
    assert_eq!(starts(&actions), ["a"]);
    scheduler.on_started("a", 100);

    let actions = scheduler.on_exited("a", ok_exit());
    let mut branches = starts(&actions);
    branches.sort();
    assert_eq!(branches, ["left", "right"]);
    scheduler.on_started("left", 101);
    scheduler.on_started("right", 102);

    // The join waits for both branches.
    let actions = scheduler.on_exited("left", ok_exit());
    assert!(starts(&actions).is_empty());

    let actions = scheduler.on_exited("right", ok_exit());
    assert_eq!(starts(&actions), ["join"]);
    scheduler.on_started("join", 103);

    let actions = scheduler.on_exited("join", ok_exit());
    assert!(requests_quiescent_shutdown(&actions));
    assert_eq!(scheduler.exit_code(), 0);

    Ok(())
}
