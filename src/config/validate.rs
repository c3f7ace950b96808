// src/config/validate.rs

use std::path::Path;

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::config::model::{ResolvedFlow, Trigger};
use crate::errors::{Result, SynthError};

/// Run semantic validation against a resolved flow.
///
/// This checks:
/// - every node has at least one trigger
/// - `after` predecessors refer to existing nodes, and not to the node itself
/// - restart delays are not negative
/// - watch triggers name at least one path
/// - the graph induced by `after` triggers has no cycles
///
/// Watch-root existence is checked separately by [`validate_watch_roots`],
/// after any `--once` rewrite has been applied.
pub fn validate_flow(flow_id: &str, flow: &ResolvedFlow) -> Result<()> {
    validate_triggers(flow_id, flow)?;
    validate_predecessors(flow_id, flow)?;
    validate_dag(flow_id, flow)?;
    Ok(())
}

/// Watch roots must exist when the engine starts; roots that disappear later
/// are tolerated by the watcher.
pub fn validate_watch_roots(flow: &ResolvedFlow) -> Result<()> {
    for root in flow.watch_roots() {
        if !Path::new(&root).exists() {
            return Err(SynthError::Config(format!(
                "watch root '{}' does not exist",
                root.display()
            )));
        }
    }
    Ok(())
}

fn validate_triggers(flow_id: &str, flow: &ResolvedFlow) -> Result<()> {
    for (id, node) in &flow.nodes {
        if node.triggers.is_empty() {
            return Err(SynthError::Config(format!(
                "node '{id}' in flow '{flow_id}' has no triggers"
            )));
        }

        for trigger in &node.triggers {
            match trigger {
                Trigger::Restart { delay } if *delay < 0.0 => {
                    return Err(SynthError::Config(format!(
                        "node '{id}' in flow '{flow_id}' has a negative restart delay ({delay})"
                    )));
                }
                Trigger::Watch { watch, .. } if watch.is_empty() => {
                    return Err(SynthError::Config(format!(
                        "node '{id}' in flow '{flow_id}' has a watch trigger with no paths"
                    )));
                }
                Trigger::After { after } if after.is_empty() => {
                    return Err(SynthError::Config(format!(
                        "node '{id}' in flow '{flow_id}' has an after trigger with no predecessors"
                    )));
                }
                _ => {}
            }
        }
    }
    Ok(())
}

fn validate_predecessors(flow_id: &str, flow: &ResolvedFlow) -> Result<()> {
    for (id, node) in &flow.nodes {
        for trigger in &node.triggers {
            if let Trigger::After { after } = trigger {
                for predecessor in after {
                    if !flow.nodes.contains_key(predecessor) {
                        return Err(SynthError::Config(format!(
                            "node '{id}' in flow '{flow_id}' waits for unknown node '{predecessor}'"
                        )));
                    }
                    if predecessor == id {
                        return Err(SynthError::Config(format!(
                            "node '{id}' in flow '{flow_id}' cannot wait for itself"
                        )));
                    }
                }
            }
        }
    }
    Ok(())
}

fn validate_dag(flow_id: &str, flow: &ResolvedFlow) -> Result<()> {
    // Edge direction: predecessor -> node declaring the `after`.
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();

    for id in flow.nodes.keys() {
        graph.add_node(id.as_str());
    }

    for (id, node) in &flow.nodes {
        for trigger in &node.triggers {
            if let Trigger::After { after } = trigger {
                for predecessor in after {
                    graph.add_edge(predecessor.as_str(), id.as_str(), ());
                }
            }
        }
    }

    // A topological sort fails iff there is a cycle.
    match toposort(&graph, None) {
        Ok(_order) => Ok(()),
        Err(cycle) => Err(SynthError::Config(format!(
            "cycle detected in flow '{}' involving node '{}'",
            flow_id,
            cycle.node_id()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::config::model::{Bindings, EnvMap, ResolvedNode, Target};

    fn node_after(id: &str, after: &[&str]) -> ResolvedNode {
        let triggers = if after.is_empty() {
            vec![Trigger::Once]
        } else {
            vec![Trigger::After {
                after: after.iter().map(|s| s.to_string()).collect(),
            }]
        };
        ResolvedNode {
            id: id.to_string(),
            target: Target {
                commands: "true".to_string(),
                ..Target::default()
            },
            args: Bindings::new(),
            env: EnvMap::new(),
            triggers,
        }
    }

    fn flow_of(nodes: Vec<ResolvedNode>) -> ResolvedFlow {
        ResolvedFlow {
            nodes: nodes
                .into_iter()
                .map(|n| (n.id.clone(), n))
                .collect::<BTreeMap<_, _>>(),
            ..ResolvedFlow::default()
        }
    }

    #[test]
    fn accepts_a_linear_chain() {
        let flow = flow_of(vec![
            node_after("a", &[]),
            node_after("b", &["a"]),
            node_after("c", &["b"]),
        ]);
        assert!(validate_flow("default", &flow).is_ok());
    }

    #[test]
    fn rejects_a_cycle() {
        let flow = flow_of(vec![node_after("a", &["b"]), node_after("b", &["a"])]);
        let err = validate_flow("default", &flow).unwrap_err();
        assert!(err.to_string().contains("cycle"), "got: {err}");
    }

    #[test]
    fn rejects_unknown_predecessors() {
        let flow = flow_of(vec![node_after("a", &["ghost"])]);
        let err = validate_flow("default", &flow).unwrap_err();
        assert!(err.to_string().contains("unknown node 'ghost'"), "got: {err}");
    }

    #[test]
    fn rejects_self_dependency() {
        let flow = flow_of(vec![node_after("a", &["a"])]);
        assert!(validate_flow("default", &flow).is_err());
    }

    #[test]
    fn rejects_missing_watch_roots() {
        let mut flow = flow_of(vec![node_after("a", &[])]);
        flow.nodes.get_mut("a").unwrap().triggers = vec![Trigger::Watch {
            watch: vec!["definitely/not/a/real/path".to_string()],
            debounce_ms: 150,
        }];
        assert!(validate_watch_roots(&flow).is_err());
    }
}
