// src/config/model.rs

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Public type alias for node identifiers throughout the engine.
pub type NodeId = String;

/// Template arguments: name -> default string.
pub type Bindings = BTreeMap<String, String>;

/// Environment variable overlay: name -> value (pre-templating).
pub type EnvMap = BTreeMap<String, String>;

/// Top-level configuration as read from a YAML file.
///
/// ```yaml
/// targets:
///   build:
///     commands: cargo build
///
/// triggers:
///   sources:
///     type: watch
///     watch: ["src"]
///
/// flows:
///   default:
///     nodes:
///       build:
///         target: build
///         triggers: [sources]
/// ```
///
/// Nodes may reference pre-defined targets/triggers by id, or define them
/// inline.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// A mapping of IDs to flows.
    #[serde(default)]
    pub flows: BTreeMap<String, Flow>,

    /// A mapping of IDs to reusable targets.
    #[serde(default)]
    pub targets: BTreeMap<String, Target>,

    /// A mapping of IDs to reusable triggers.
    #[serde(default)]
    pub triggers: BTreeMap<String, Trigger>,
}

/// A named, templatable shell-command recipe.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Target {
    /// The commands to run, executed by a POSIX shell as one script.
    #[serde(default)]
    pub commands: String,

    /// Template arguments this target provides defaults for.
    #[serde(default)]
    pub args: Bindings,

    /// Environment variables overlaid on the engine environment.
    #[serde(default)]
    pub env: EnvMap,
}

/// A condition that requests a node run.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// Fires exactly once, when the engine starts.
    Once,

    /// Fires when every named predecessor has completed a successful run.
    After { after: Vec<NodeId> },

    /// Fires after a delay at flow start, then again after each exit of its
    /// node.
    Restart {
        #[serde(default = "default_restart_delay")]
        delay: f64,
    },

    /// Fires when a path under one of the watched roots changes.
    Watch {
        watch: Vec<String>,

        #[serde(default = "default_debounce_ms")]
        debounce_ms: u64,
    },
}

fn default_restart_delay() -> f64 {
    1.0
}

fn default_debounce_ms() -> u64 {
    150
}

impl Trigger {
    /// True for triggers that can fire an unbounded number of times.
    pub fn is_repeating(&self) -> bool {
        matches!(self, Trigger::Restart { .. } | Trigger::Watch { .. })
    }
}

/// Either a reference to a pre-defined target, or an inline definition.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum TargetRef {
    Id(String),
    Inline(Target),
}

/// Either a reference to a pre-defined trigger, or an inline definition.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum TriggerRef {
    Id(String),
    Inline(Trigger),
}

/// One vertex of a flow: a target bound to one or more triggers, with
/// optional binding overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Node {
    /// The target to run for this node.
    pub target: TargetRef,

    /// Template arguments overriding the target's defaults.
    #[serde(default)]
    pub args: Bindings,

    /// Environment variables overriding the target's.
    #[serde(default)]
    pub env: EnvMap,

    /// The triggers for this node.
    #[serde(default = "default_triggers")]
    pub triggers: Vec<TriggerRef>,
}

fn default_triggers() -> Vec<TriggerRef> {
    vec![TriggerRef::Inline(Trigger::Once)]
}

/// A set of nodes executed as a single engine invocation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Flow {
    /// Mapping of IDs to nodes.
    #[serde(default)]
    pub nodes: BTreeMap<NodeId, Node>,

    /// Template arguments applied to all nodes in this flow.
    #[serde(default)]
    pub args: Bindings,

    /// Environment variables applied to all nodes in this flow.
    #[serde(default)]
    pub env: EnvMap,
}

/// A node with its target and triggers fully dereferenced. This is what the
/// engine consumes; it never sees a name indirection.
#[derive(Debug, Clone)]
pub struct ResolvedNode {
    pub id: NodeId,
    pub target: Target,
    pub args: Bindings,
    pub env: EnvMap,
    pub triggers: Vec<Trigger>,
}

/// A fully dereferenced flow: the in-memory value the engine executes.
#[derive(Debug, Clone, Default)]
pub struct ResolvedFlow {
    pub nodes: BTreeMap<NodeId, ResolvedNode>,
    pub args: Bindings,
    pub env: EnvMap,
}

impl ResolvedFlow {
    /// Effective template bindings for a node: flow-wide arguments, then the
    /// target's defaults, then the node's overrides. The node id is always
    /// available as `id`.
    pub fn bindings_for(&self, node: &ResolvedNode) -> Bindings {
        let mut bindings = self.args.clone();
        bindings.extend(node.target.args.clone());
        bindings.extend(node.args.clone());
        bindings.insert("id".to_string(), node.id.clone());
        bindings
    }

    /// Effective environment overlay for a node (values still templated):
    /// flow-wide, then target, then node.
    pub fn env_for(&self, node: &ResolvedNode) -> EnvMap {
        let mut env = self.env.clone();
        env.extend(node.target.env.clone());
        env.extend(node.env.clone());
        env
    }

    /// Replace every `Restart`/`Watch` trigger with `Once`, so the flow runs
    /// to completion and the engine exits on its own. Node identities are
    /// preserved.
    pub fn rewrite_once(&self) -> ResolvedFlow {
        let mut flow = self.clone();
        for node in flow.nodes.values_mut() {
            for trigger in node.triggers.iter_mut() {
                if trigger.is_repeating() {
                    *trigger = Trigger::Once;
                }
            }
        }
        flow
    }

    /// The distinct set of watch roots declared by this flow's triggers.
    pub fn watch_roots(&self) -> BTreeSet<PathBuf> {
        let mut roots = BTreeSet::new();
        for node in self.nodes.values() {
            for trigger in &node.triggers {
                if let Trigger::Watch { watch, .. } = trigger {
                    roots.extend(watch.iter().map(PathBuf::from));
                }
            }
        }
        roots
    }

    /// The smallest debounce window any watch trigger asked for, so no
    /// trigger observes a coarser batch than it configured.
    pub fn min_debounce(&self) -> Option<Duration> {
        self.nodes
            .values()
            .flat_map(|n| n.triggers.iter())
            .filter_map(|t| match t {
                Trigger::Watch { debounce_ms, .. } => Some(Duration::from_millis(*debounce_ms)),
                _ => None,
            })
            .min()
    }

    /// Render the flow as a Mermaid flowchart.
    pub fn mermaid(&self) -> String {
        let mut lines = vec!["flowchart TD".to_string()];
        let mut seen_watches: BTreeMap<String, usize> = BTreeMap::new();

        for (id, node) in &self.nodes {
            lines.push(format!("{id}({id})"));

            for trigger in &node.triggers {
                match trigger {
                    Trigger::Once => {}
                    Trigger::After { after } => {
                        for predecessor in after {
                            lines.push(format!("{predecessor} --> {id}"));
                        }
                    }
                    Trigger::Restart { delay } => {
                        lines.push(format!("{id} -->|restart {delay:.3}s| {id}"));
                    }
                    Trigger::Watch { watch, .. } => {
                        let text = watch.join("\n");
                        let next = seen_watches.len();
                        let key = *seen_watches.entry(text.clone()).or_insert(next);
                        if key == next {
                            lines.push(format!("w_{key}[(\"{text}\")]"));
                        }
                        lines.push(format!("w_{key} -->|watch| {id}"));
                    }
                }
            }
        }

        lines.join("\n  ").trim().to_string()
    }
}
