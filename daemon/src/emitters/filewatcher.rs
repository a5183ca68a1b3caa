//! File watcher emitter: polls watched paths on a tick and diffs mod-time
//! snapshots into created/modified/deleted events.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use anyhow::Result;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use alfred_protocol::{Event, Params};

use crate::config::WatchSpec;

use super::{Emitter, Manager};

const SCAN_INTERVAL: Duration = Duration::from_secs(5);

/// A compiled watch target.
struct Watch {
    path: PathBuf,
    recursive: bool,
    pattern: Option<glob::Pattern>,
}

type Snapshot = HashMap<PathBuf, SystemTime>;

pub struct FileWatcher {
    source: String,
    interval: Duration,
    watches: Vec<Watch>,
    /// Owned by the emitter's own task; the mutex only satisfies `Sync`.
    state: Mutex<Option<Snapshot>>,
}

impl FileWatcher {
    pub fn new(daemon_name: &str, specs: &[WatchSpec]) -> Result<Self> {
        let mut watches = Vec::with_capacity(specs.len());
        for spec in specs {
            let pattern = spec
                .pattern
                .as_deref()
                .map(glob::Pattern::new)
                .transpose()
                .map_err(|e| anyhow::anyhow!("invalid watch pattern for {:?}: {e}", spec.path))?;
            info!(
                path = %spec.path.display(),
                recursive = spec.recursive,
                pattern = spec.pattern.as_deref().unwrap_or(""),
                "watching path"
            );
            watches.push(Watch {
                path: spec.path.clone(),
                recursive: spec.recursive,
                pattern,
            });
        }
        Ok(Self {
            source: format!("daemon:{daemon_name}"),
            interval: SCAN_INTERVAL,
            watches,
            state: Mutex::new(None),
        })
    }

    /// Take a snapshot, diff it against the previous one, and emit the
    /// changes. The first scan establishes the baseline silently.
    fn scan(&self, manager: &Manager) {
        let snapshot = self.snapshot();
        let previous = self.state.lock().unwrap().replace(snapshot.clone());
        let Some(previous) = previous else {
            debug!(files = snapshot.len(), "file watcher baseline established");
            return;
        };

        for (event_type, path) in diff_snapshots(&previous, &snapshot) {
            let mut payload = Params::new();
            payload.insert("path".into(), json!(path.to_string_lossy()));
            manager.emit(Event::now(self.source.clone(), event_type, payload));
        }
    }

    fn snapshot(&self) -> Snapshot {
        let mut states = Snapshot::new();
        for watch in &self.watches {
            // Stat errors are swallowed; the watcher tries again next tick.
            scan_path(watch, &mut states);
        }
        states
    }
}

/// Compare two snapshots, yielding (event type, path) for every change.
fn diff_snapshots(old: &Snapshot, new: &Snapshot) -> Vec<(&'static str, PathBuf)> {
    let mut changes = Vec::new();
    for (path, mod_time) in new {
        match old.get(path) {
            None => changes.push(("file_created", path.clone())),
            Some(old_time) if mod_time > old_time => {
                changes.push(("file_modified", path.clone()))
            }
            Some(_) => {}
        }
    }
    for path in old.keys() {
        if !new.contains_key(path) {
            changes.push(("file_deleted", path.clone()));
        }
    }
    changes
}

fn scan_path(watch: &Watch, states: &mut Snapshot) {
    let Ok(meta) = std::fs::metadata(&watch.path) else {
        return;
    };
    if meta.is_dir() {
        scan_dir(&watch.path, watch.recursive, watch.pattern.as_ref(), states);
    } else if name_matches(&watch.path, watch.pattern.as_ref()) {
        if let Ok(modified) = meta.modified() {
            states.insert(watch.path.clone(), modified);
        }
    }
}

fn scan_dir(
    dir: &Path,
    recursive: bool,
    pattern: Option<&glob::Pattern>,
    states: &mut Snapshot,
) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(meta) = entry.metadata() else { continue };
        if meta.is_dir() {
            if recursive {
                scan_dir(&path, recursive, pattern, states);
            }
            continue;
        }
        if !name_matches(&path, pattern) {
            continue;
        }
        if let Ok(modified) = meta.modified() {
            states.insert(path, modified);
        }
    }
}

fn name_matches(path: &Path, pattern: Option<&glob::Pattern>) -> bool {
    match pattern {
        Some(pattern) => path
            .file_name()
            .map(|name| pattern.matches(&name.to_string_lossy()))
            .unwrap_or(false),
        None => true,
    }
}

impl Emitter for FileWatcher {
    fn name(&self) -> &'static str {
        "file_watcher"
    }

    fn run(
        self: Arc<Self>,
        manager: Arc<Manager>,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => self.scan(&manager),
                }
            }
        })
    }
}
