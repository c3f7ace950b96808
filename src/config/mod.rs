// src/config/mod.rs

//! Configuration surface: serde models for the YAML file, name-indirection
//! resolution, and semantic validation. The engine itself only ever sees a
//! [`model::ResolvedFlow`].

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{find_config_file, load_and_validate, resolve_and_validate};
pub use model::{
    Bindings, Config, EnvMap, Flow, Node, NodeId, ResolvedFlow, ResolvedNode, Target, Trigger,
};
pub use validate::{validate_flow, validate_watch_roots};
