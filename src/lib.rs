// src/lib.rs

pub mod cli;
pub mod config;
pub mod dag;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod logging;
pub mod render;
pub mod template;
pub mod watch;

use anyhow::{anyhow, Result};
use tracing::info;

use crate::cli::{CliArgs, Command};
use crate::config::model::{ResolvedFlow, Trigger};
use crate::config::validate::validate_watch_roots;
use crate::config::{find_config_file, load_and_validate};
use crate::engine::{Engine, EngineOptions};

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config loading, resolution and validation
/// - the `--once` rewrite
/// - the engine (scheduler / supervisor / watcher / renderer)
///
/// Returns the engine's exit code.
pub async fn run(args: CliArgs) -> Result<i32> {
    let Command::Run {
        flow,
        config,
        once,
        dry_run,
        mermaid,
    } = args.command;

    let config_path = match config {
        Some(path) => path,
        None => find_config_file()?,
    };

    let flows = load_and_validate(&config_path)?;

    let selected = flows.get(&flow).ok_or_else(|| {
        let available = flows
            .keys()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(", ");
        anyhow!("no flow named '{flow}' in {}; available flows: {available}", config_path.display())
    })?;

    if mermaid {
        println!("{}", selected.mermaid());
        return Ok(0);
    }

    if dry_run {
        print_dry_run(&flow, selected);
        return Ok(0);
    }

    // Pre-processing, not a runtime flag: the scheduler never learns that
    // `--once` existed.
    let selected = if once {
        selected.rewrite_once()
    } else {
        selected.clone()
    };

    validate_watch_roots(&selected)?;

    let options = EngineOptions {
        install_signal_handlers: true,
        ..EngineOptions::default()
    };
    let (engine, _handle) = Engine::new(selected, options);
    let report = engine.run().await?;

    info!(exit_code = report.exit_code, "flow finished");
    Ok(report.exit_code)
}

/// Simple dry-run output: print nodes, triggers and commands.
fn print_dry_run(flow_id: &str, flow: &ResolvedFlow) {
    println!("flow '{flow_id}' ({} nodes):", flow.nodes.len());

    for (id, node) in &flow.nodes {
        println!("  - {id}");
        for line in node.target.commands.lines() {
            println!("      cmd: {line}");
        }
        for trigger in &node.triggers {
            match trigger {
                Trigger::Once => println!("      trigger: once"),
                Trigger::After { after } => println!("      trigger: after {after:?}"),
                Trigger::Restart { delay } => {
                    println!("      trigger: restart (delay {delay}s)")
                }
                Trigger::Watch { watch, debounce_ms } => {
                    println!("      trigger: watch {watch:?} (debounce {debounce_ms}ms)")
                }
            }
        }
        if !node.args.is_empty() {
            println!("      args: {:?}", node.args);
        }
        if !node.env.is_empty() {
            println!("      env: {:?}", node.env.keys().collect::<Vec<_>>());
        }
    }
}
