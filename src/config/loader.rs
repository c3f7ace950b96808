// src/config/loader.rs

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::model::{
    Config, Flow, NodeId, ResolvedFlow, ResolvedNode, TargetRef, TriggerRef,
};
use crate::config::validate::validate_flow;
use crate::errors::{Result, SynthError};

/// Load a YAML config file, resolve all name indirections, and validate each
/// flow. The result maps flow ids to engine-ready [`ResolvedFlow`]s.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<BTreeMap<String, ResolvedFlow>> {
    let path = path.as_ref();
    debug!(path = %path.display(), "loading config");

    let text = std::fs::read_to_string(path)?;
    let config: Config = serde_yaml::from_str(&text)?;

    resolve_and_validate(&config)
}

/// Resolve and validate an already-parsed [`Config`].
pub fn resolve_and_validate(config: &Config) -> Result<BTreeMap<String, ResolvedFlow>> {
    let mut flows = BTreeMap::new();
    for (id, flow) in &config.flows {
        let resolved = resolve_flow(config, id, flow)?;
        validate_flow(id, &resolved)?;
        flows.insert(id.clone(), resolved);
    }
    Ok(flows)
}

/// Walk upwards from the current directory looking for `synth.yaml`,
/// stopping at the first directory that contains a `.git` entry.
pub fn find_config_file() -> Result<PathBuf> {
    let cwd = std::env::current_dir()?;

    for dir in std::iter::once(cwd.as_path()).chain(cwd.ancestors().skip(1)) {
        let candidate = dir.join("synth.yaml");
        if candidate.is_file() {
            return Ok(candidate);
        }
        if dir.join(".git").exists() {
            break;
        }
    }

    Err(SynthError::Config(
        "failed to find a synth.yaml config file; pass one with --config".to_string(),
    ))
}

fn resolve_flow(config: &Config, flow_id: &str, flow: &Flow) -> Result<ResolvedFlow> {
    let mut nodes: BTreeMap<NodeId, ResolvedNode> = BTreeMap::new();

    for (id, node) in &flow.nodes {
        let target = match &node.target {
            TargetRef::Inline(target) => target.clone(),
            TargetRef::Id(target_id) => config
                .targets
                .get(target_id)
                .cloned()
                .ok_or_else(|| {
                    SynthError::Config(format!(
                        "node '{id}' in flow '{flow_id}' references unknown target '{target_id}'"
                    ))
                })?,
        };

        let mut triggers = Vec::with_capacity(node.triggers.len());
        for trigger in &node.triggers {
            let resolved = match trigger {
                TriggerRef::Inline(trigger) => trigger.clone(),
                TriggerRef::Id(trigger_id) => config
                    .triggers
                    .get(trigger_id)
                    .cloned()
                    .ok_or_else(|| {
                        SynthError::Config(format!(
                            "node '{id}' in flow '{flow_id}' references unknown trigger '{trigger_id}'"
                        ))
                    })?,
            };
            triggers.push(resolved);
        }

        nodes.insert(
            id.clone(),
            ResolvedNode {
                id: id.clone(),
                target,
                args: node.args.clone(),
                env: node.env.clone(),
                triggers,
            },
        );
    }

    Ok(ResolvedFlow {
        nodes,
        args: flow.args.clone(),
        env: flow.env.clone(),
    })
}
