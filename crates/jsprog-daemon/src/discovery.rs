//! `/dev/input` hotplug discovery.
//!
//! Scans the device directory once at startup and then watches it for
//! created, changed and removed `event*` nodes. An attribute change
//! re-offers the node: permissions usually land after creation.

use std::path::{Path, PathBuf};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::daemon::DaemonEvent;
use crate::error::DaemonError;

/// Keeps the directory watch alive.
pub struct DeviceWatch {
    _watcher: RecommendedWatcher,
}

fn is_event_node(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with("event"))
}

/// Start watching the device directory; existing nodes are offered
/// immediately.
pub async fn start(
    dir: PathBuf,
    events: mpsc::Sender<DaemonEvent>,
) -> Result<DeviceWatch, DaemonError> {
    let tx = events.clone();
    let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
        let event = match result {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "device watch error");
                return;
            }
        };
        let mapped = match event.kind {
            EventKind::Create(_) | EventKind::Modify(_) => DaemonEvent::DeviceCandidate,
            EventKind::Remove(_) => DaemonEvent::DeviceVanished,
            _ => return,
        };
        for path in event.paths.into_iter().filter(|p| is_event_node(p)) {
            debug!(path = %path.display(), "device node notice");
            if tx.blocking_send(mapped(path)).is_err() {
                return;
            }
        }
    })?;
    watcher.watch(&dir, RecursiveMode::NonRecursive)?;

    let scan_dir = dir.clone();
    let existing: Vec<PathBuf> = tokio::task::spawn_blocking(move || {
        let mut nodes = Vec::new();
        match std::fs::read_dir(&scan_dir) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    let path = entry.path();
                    if is_event_node(&path) {
                        nodes.push(path);
                    }
                }
            }
            Err(e) => warn!(dir = %scan_dir.display(), error = %e, "could not scan device directory"),
        }
        nodes.sort();
        nodes
    })
    .await
    .unwrap_or_default();

    info!(dir = %dir.display(), nodes = existing.len(), "watching for joystick devices");
    for path in existing {
        let _ = events.send(DaemonEvent::DeviceCandidate(path)).await;
    }

    Ok(DeviceWatch { _watcher: watcher })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_node_filter() {
        assert!(is_event_node(Path::new("/dev/input/event3")));
        assert!(is_event_node(Path::new("/dev/input/event12")));
        assert!(!is_event_node(Path::new("/dev/input/js0")));
        assert!(!is_event_node(Path::new("/dev/input/by-id")));
    }
}
