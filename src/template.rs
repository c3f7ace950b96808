// src/template.rs

//! Templating collaborator.
//!
//! The engine treats rendering as a pure function over string bindings; the
//! Jinja-style surface itself is `minijinja`'s concern. A render failure is
//! reported on the node (synthetic exit code -1), never on the engine.

use thiserror::Error;

use crate::config::model::Bindings;

#[derive(Debug, Error)]
#[error("{0}")]
pub struct RenderError(String);

/// Render a command or environment-value template against the effective
/// bindings of a node.
pub fn render(template: &str, bindings: &Bindings) -> Result<String, RenderError> {
    let env = minijinja::Environment::new();
    env.render_str(template, bindings)
        .map_err(|err| RenderError(err.to_string()))
}
