// src/watch/watcher.rs

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::engine::events::{Event, EventTx};
use crate::errors::{Result, SynthError};

/// Handle for the filesystem watcher.
///
/// Keeps the underlying `RecommendedWatcher` alive; dropping the handle
/// stops file watching, which is how the engine cancels the subscription on
/// shutdown.
pub struct WatcherHandle {
    _inner: RecommendedWatcher,
}

impl std::fmt::Debug for WatcherHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatcherHandle").finish()
    }
}

/// Watch the given roots recursively and publish one `WatchEvent` per
/// debounce window, carrying the distinct set of changed paths.
///
/// Roots must exist when the watcher starts; roots that disappear later just
/// stop producing events.
pub fn spawn_watcher(
    roots: Vec<PathBuf>,
    debounce: Duration,
    events: EventTx,
) -> Result<WatcherHandle> {
    // Channel from the synchronous notify callback into the async world.
    let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<notify::Event>();

    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<notify::Event>| match res {
            Ok(event) => {
                let _ = raw_tx.send(event);
            }
            Err(err) => {
                warn!(error = %err, "file watch error");
            }
        },
        Config::default(),
    )
    .map_err(|err| SynthError::Config(format!("failed to create file watcher: {err}")))?;

    for root in &roots {
        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(|err| {
                SynthError::Config(format!("failed to watch '{}': {err}", root.display()))
            })?;
    }

    info!(?roots, ?debounce, "file watcher started");

    tokio::spawn(async move {
        let mut pending: BTreeSet<PathBuf> = BTreeSet::new();

        loop {
            if pending.is_empty() {
                match raw_rx.recv().await {
                    Some(event) => pending.extend(event.paths),
                    None => break,
                }
            } else {
                // The window restarts on every change: one batch per
                // debounce-length stretch of quiet.
                tokio::select! {
                    event = raw_rx.recv() => match event {
                        Some(event) => pending.extend(event.paths),
                        None => {
                            flush(&mut pending, &events).await;
                            break;
                        }
                    },
                    _ = sleep(debounce) => {
                        flush(&mut pending, &events).await;
                    }
                }
            }
        }

        debug!("file watcher loop ended");
    });

    Ok(WatcherHandle { _inner: watcher })
}

async fn flush(pending: &mut BTreeSet<PathBuf>, events: &EventTx) {
    if pending.is_empty() {
        return;
    }
    let paths: Vec<PathBuf> = std::mem::take(pending).into_iter().collect();
    debug!(changed = paths.len(), "debounce window closed");
    events.publish(Event::WatchEvent { paths }).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::events;

    #[tokio::test]
    async fn batches_changes_into_one_event() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = events::channel(16);

        let _handle = spawn_watcher(
            vec![dir.path().to_path_buf()],
            Duration::from_millis(100),
            tx,
        )
        .unwrap();

        // Three changes inside one window.
        for name in ["a", "b", "c"] {
            std::fs::write(dir.path().join(name), name).unwrap();
        }

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("watcher should emit within the timeout")
            .expect("channel open");

        let Event::WatchEvent { paths } = event else {
            panic!("expected a watch event");
        };
        assert!(!paths.is_empty());

        // The batch collapsed: nothing else is pending immediately after.
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn missing_root_is_an_error() {
        let (tx, _rx) = events::channel(4);
        let result = spawn_watcher(
            vec![PathBuf::from("definitely/not/a/real/root")],
            Duration::from_millis(100),
            tx,
        );
        assert!(result.is_err());
    }
}
