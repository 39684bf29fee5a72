//! Filesystem watching for rebuild-on-change.
//!
//! Raw notify events are coalesced with a short quiet period (~100 ms) so
//! editor write bursts trigger a single rebuild.

use std::path::PathBuf;
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::error::Result;

/// Keeps the underlying watcher alive.
pub struct WatchHandle {
    _watcher: RecommendedWatcher,
}

/// Watches `paths` recursively and emits one tick per coalesced burst of
/// changes.
pub fn watch_paths(
    paths: &[PathBuf],
    debounce: Duration,
) -> Result<(WatchHandle, mpsc::Receiver<()>)> {
    let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<()>();
    let (tick_tx, tick_rx) = mpsc::channel(8);

    let mut watcher = notify::recommended_watcher(move |outcome: notify::Result<notify::Event>| {
        match outcome {
            Ok(event) => {
                if is_relevant(&event) {
                    let _ = raw_tx.send(());
                }
            }
            Err(err) => {
                tracing::warn!(target: "wp", error = %err, "watch error");
            }
        }
    })?;
    for path in paths {
        watcher.watch(path, RecursiveMode::Recursive)?;
    }

    tokio::spawn(async move {
        while raw_rx.recv().await.is_some() {
            // Absorb the burst until it goes quiet.
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(debounce) => break,
                    more = raw_rx.recv() => {
                        if more.is_none() {
                            break;
                        }
                    }
                }
            }
            if tick_tx.send(()).await.is_err() {
                break;
            }
        }
    });

    Ok((WatchHandle { _watcher: watcher }, tick_rx))
}

fn is_relevant(event: &notify::Event) -> bool {
    matches!(
        event.kind,
        notify::EventKind::Create(_) | notify::EventKind::Modify(_) | notify::EventKind::Remove(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bursts_coalesce_into_one_tick() {
        let dir = tempfile::tempdir().unwrap();
        let (_handle, mut ticks) =
            watch_paths(&[dir.path().to_owned()], Duration::from_millis(50)).unwrap();

        for i in 0..5 {
            std::fs::write(dir.path().join("file.js"), format!("// {i}")).unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        tokio::time::timeout(Duration::from_secs(2), ticks.recv())
            .await
            .expect("no tick arrived")
            .expect("tick channel closed");

        // The burst produced exactly one tick.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(ticks.try_recv().is_err());
    }
}
