// tests/engine_integration.rs
//
// Runs the whole engine against real shell processes: quiescent completion,
// failure propagation, restart loops bounded by interrupt, watch-triggered
// reruns, and templating of commands and environment.

mod common;
use crate::common::{after_node, flow_of, init_tracing, once_node, shell_node};

use std::error::Error;
use std::time::Duration;

use tokio::time::{sleep, timeout};

use synthesize::config::model::Trigger;
use synthesize::engine::{Engine, EngineOptions, EngineReport, Lifecycle};

type TestResult = Result<(), Box<dyn Error>>;

fn quiet() -> EngineOptions {
    EngineOptions {
        quiet: true,
        ..EngineOptions::default()
    }
}

async fn run_to_completion(flow: synthesize::config::model::ResolvedFlow) -> EngineReport {
    let (engine, _handle) = Engine::new(flow, quiet());
    timeout(Duration::from_secs(30), engine.run())
        .await
        .expect("engine should finish within the timeout")
        .expect("engine run should not error")
}

#[tokio::test]
async fn independent_once_nodes_finish_quiescent_with_code_zero() -> TestResult {
    init_tracing();

    let flow = flow_of(vec![
        once_node("alpha", "true"),
        once_node("beta", "echo done"),
    ]);
    let report = run_to_completion(flow).await;

    assert_eq!(report.exit_code, 0);
    for id in ["alpha", "beta"] {
        let node = &report.nodes[id];
        assert_eq!(node.lifecycle, Lifecycle::Succeeded, "node {id}");
        assert_eq!(node.run_count, 1, "node {id}");
        assert!(node.last_exit.unwrap().success(), "node {id}");
    }

    Ok(())
}

#[tokio::test]
async fn after_chain_executes_in_dependency_order() -> TestResult {
    init_tracing();

    let dir = tempfile::tempdir()?;
    let log = dir.path().join("order.log");
    let path = log.display();

    let flow = flow_of(vec![
        once_node("a", &format!("echo a >> {path}")),
        after_node("b", &format!("echo b >> {path}"), &["a"]),
        after_node("c", &format!("echo c >> {path}"), &["b"]),
    ]);
    let report = run_to_completion(flow).await;

    assert_eq!(report.exit_code, 0);
    let contents = std::fs::read_to_string(&log)?;
    assert_eq!(contents, "a\nb\nc\n");

    Ok(())
}

#[tokio::test]
async fn failing_node_blocks_downstream_and_fails_the_flow() -> TestResult {
    init_tracing();

    let flow = flow_of(vec![
        once_node("a", "exit 2"),
        after_node("b", "echo unreachable", &["a"]),
        after_node("c", "echo unreachable", &["b"]),
    ]);
    let report = run_to_completion(flow).await;

    assert_eq!(report.exit_code, 1);
    assert_eq!(report.nodes["a"].lifecycle, Lifecycle::Failed);
    assert_eq!(report.nodes["a"].last_exit.unwrap().code, 2);
    assert_eq!(report.nodes["b"].run_count, 0);
    assert_eq!(report.nodes["c"].run_count, 0);

    Ok(())
}

#[tokio::test]
async fn restart_loop_is_bounded_by_interrupt() -> TestResult {
    init_tracing();

    let flow = flow_of(vec![shell_node(
        "ticker",
        "sleep 0.2",
        vec![Trigger::Restart { delay: 0.0 }],
    )]);

    let (engine, handle) = Engine::new(flow, quiet());
    let running = tokio::spawn(engine.run());

    sleep(Duration::from_millis(500)).await;
    handle.interrupt().await;

    let report = timeout(Duration::from_secs(15), running).await???;

    let ticker = &report.nodes["ticker"];
    assert!(ticker.run_count >= 2, "run_count = {}", ticker.run_count);
    assert_eq!(ticker.lifecycle, Lifecycle::Cancelled);
    assert_eq!(report.exit_code, 1);

    Ok(())
}

#[tokio::test]
async fn watch_trigger_batches_changes_into_one_rerun() -> TestResult {
    init_tracing();

    let dir = tempfile::tempdir()?;
    let watched = dir.path().join("t");
    std::fs::create_dir(&watched)?;

    let flow = flow_of(vec![shell_node(
        "reactor",
        "echo tick",
        vec![Trigger::Watch {
            watch: vec![watched.to_string_lossy().into_owned()],
            debounce_ms: 100,
        }],
    )]);

    let (engine, handle) = Engine::new(flow, quiet());
    let running = tokio::spawn(engine.run());

    // Watch does not fire at start; give the watcher a moment to settle,
    // then burst three changes inside one debounce window.
    sleep(Duration::from_millis(300)).await;
    for name in ["one", "two", "three"] {
        std::fs::write(watched.join(name), name)?;
    }

    sleep(Duration::from_millis(700)).await;
    handle.interrupt().await;

    let report = timeout(Duration::from_secs(15), running).await???;

    let reactor = &report.nodes["reactor"];
    assert_eq!(reactor.run_count, 1, "the burst collapses to one run");
    assert_eq!(reactor.lifecycle, Lifecycle::Waiting);
    assert_eq!(report.exit_code, 0);

    Ok(())
}

#[tokio::test]
async fn once_rewrite_lets_a_watch_flow_finish_on_its_own() -> TestResult {
    init_tracing();

    let dir = tempfile::tempdir()?;

    let flow = flow_of(vec![shell_node(
        "reactor",
        "echo tick",
        vec![Trigger::Watch {
            watch: vec![dir.path().to_string_lossy().into_owned()],
            debounce_ms: 100,
        }],
    )]);

    // With --once the watch trigger becomes a one-shot: the node runs once
    // and the engine goes quiescent instead of watching forever.
    let report = run_to_completion(flow.rewrite_once()).await;

    assert_eq!(report.exit_code, 0);
    assert_eq!(report.nodes["reactor"].run_count, 1);
    assert_eq!(report.nodes["reactor"].lifecycle, Lifecycle::Succeeded);

    Ok(())
}

#[tokio::test]
async fn commands_and_env_are_rendered_with_effective_bindings() -> TestResult {
    init_tracing();

    let dir = tempfile::tempdir()?;
    let out = dir.path().join("rendered.log");
    let path = out.display();

    let command = format!(
        "echo \"hello {} from {}\" > {path}\necho \"$GREETING\" >> {path}\necho \"$SYNTH_NODE_ID\" >> {path}",
        "{{ name }}", "{{ id }}",
    );

    let mut node = shell_node("greet", &command, vec![Trigger::Once]);
    node.env
        .insert("GREETING".to_string(), "{{ name }}!".to_string());

    let mut flow = flow_of(vec![node]);
    flow.args.insert("name".to_string(), "world".to_string());

    let report = run_to_completion(flow).await;
    assert_eq!(report.exit_code, 0);

    let contents = std::fs::read_to_string(&out)?;
    assert_eq!(contents, "hello world from greet\nworld!\ngreet\n");

    Ok(())
}

#[tokio::test]
async fn render_failure_fails_the_node_without_spawning() -> TestResult {
    init_tracing();

    let flow = flow_of(vec![once_node("broken", "echo {{ unclosed")]);
    let report = run_to_completion(flow).await;

    assert_eq!(report.exit_code, 1);
    let broken = &report.nodes["broken"];
    assert_eq!(broken.lifecycle, Lifecycle::Failed);
    assert_eq!(broken.last_exit.unwrap().code, -1);
    assert_eq!(broken.last_exit.unwrap().signal, None);

    Ok(())
}

#[tokio::test]
async fn empty_flow_finishes_immediately() -> TestResult {
    init_tracing();

    let report = run_to_completion(flow_of(vec![])).await;
    assert_eq!(report.exit_code, 0);
    assert!(report.nodes.is_empty());

    Ok(())
}
