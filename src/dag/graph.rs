// src/dag/graph.rs

use std::collections::BTreeMap;

use crate::config::model::{NodeId, ResolvedFlow, Trigger};

/// Dependent adjacency over the `after` edges of a flow, keyed by node id:
/// for each node, the nodes whose `after` triggers wait on it.
///
/// Acyclicity is enforced by `config::validate` before execution; here we
/// only keep the adjacency the scheduler needs to notify dependents when a
/// predecessor completes a successful run.
#[derive(Debug, Clone, Default)]
pub struct FlowGraph {
    dependents: BTreeMap<NodeId, Vec<NodeId>>,
}

impl FlowGraph {
    /// Build the graph from a validated [`ResolvedFlow`].
    pub fn from_flow(flow: &ResolvedFlow) -> Self {
        let mut dependents: BTreeMap<NodeId, Vec<NodeId>> = BTreeMap::new();

        for id in flow.nodes.keys() {
            dependents.insert(id.clone(), Vec::new());
        }

        for (id, node) in &flow.nodes {
            for trigger in &node.triggers {
                if let Trigger::After { after } = trigger {
                    for predecessor in after {
                        if let Some(entry) = dependents.get_mut(predecessor) {
                            if !entry.contains(id) {
                                entry.push(id.clone());
                            }
                        }
                    }
                }
            }
        }

        Self { dependents }
    }

    /// Immediate dependents of a node (nodes that list it in an `after`).
    pub fn dependents_of(&self, id: &str) -> &[NodeId] {
        self.dependents
            .get(id)
            .map(|d| d.as_slice())
            .unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::config::model::{ResolvedNode, Target};

    fn chain() -> ResolvedFlow {
        let mut nodes = BTreeMap::new();
        for (id, after) in [("a", vec![]), ("b", vec!["a"]), ("c", vec!["b"])] {
            let triggers = if after.is_empty() {
                vec![Trigger::Once]
            } else {
                vec![Trigger::After {
                    after: after.into_iter().map(String::from).collect(),
                }]
            };
            nodes.insert(
                id.to_string(),
                ResolvedNode {
                    id: id.to_string(),
                    target: Target::default(),
                    args: Default::default(),
                    env: Default::default(),
                    triggers,
                },
            );
        }
        ResolvedFlow {
            nodes,
            ..ResolvedFlow::default()
        }
    }

    #[test]
    fn tracks_dependents() {
        let graph = FlowGraph::from_flow(&chain());

        assert_eq!(graph.dependents_of("a"), ["b".to_string()]);
        assert_eq!(graph.dependents_of("b"), ["c".to_string()]);
        assert!(graph.dependents_of("c").is_empty());
    }
}
