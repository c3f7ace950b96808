#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Once;

use tracing_subscriber::{fmt, EnvFilter};

use synthesize::config::model::{
    Bindings, EnvMap, NodeId, ResolvedFlow, ResolvedNode, Target, Trigger,
};

static INIT: Once = Once::new();

/// Initialise tracing for tests.
///
/// - Uses `with_test_writer()`, so logs are captured per-test.
/// - The Rust test harness only prints captured output for **failing** tests
///   (unless you run with `-- --nocapture`).
///
/// Enable levels with e.g.:
/// `RUST_LOG=debug cargo test`
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(true)
            .init();
    });
}

/// Build a node running `commands` under the given triggers.
pub fn shell_node(id: &str, commands: &str, triggers: Vec<Trigger>) -> ResolvedNode {
    ResolvedNode {
        id: id.to_string(),
        target: Target {
            commands: commands.to_string(),
            args: Bindings::new(),
            env: EnvMap::new(),
        },
        args: Bindings::new(),
        env: EnvMap::new(),
        triggers,
    }
}

/// A node that runs once at flow start.
pub fn once_node(id: &str, commands: &str) -> ResolvedNode {
    shell_node(id, commands, vec![Trigger::Once])
}

/// A node that runs after all of `after` completed a successful run.
pub fn after_node(id: &str, commands: &str, after: &[&str]) -> ResolvedNode {
    shell_node(
        id,
        commands,
        vec![Trigger::After {
            after: after.iter().map(|s| s.to_string()).collect(),
        }],
    )
}

/// Assemble nodes into a flow.
pub fn flow_of(nodes: Vec<ResolvedNode>) -> ResolvedFlow {
    ResolvedFlow {
        nodes: nodes
            .into_iter()
            .map(|n| (n.id.clone(), n))
            .collect::<BTreeMap<NodeId, ResolvedNode>>(),
        args: Bindings::new(),
        env: EnvMap::new(),
    }
}
