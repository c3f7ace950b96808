// src/watch/mod.rs

pub mod watcher;

pub use watcher::{spawn_watcher, WatcherHandle};
