//! Agent file modification tracking
//!
//! Watches the directories the registry discovered agents in and drives
//! cache invalidation when files change. The native backend is a `notify`
//! watcher; when one cannot be created the tracker degrades to periodic
//! re-hashing of known sources. Either way the registry stays correct,
//! because prompt loads verify content hashes themselves; the tracker only
//! shortens the time to observe a change.

use std::{
    collections::{BTreeSet, HashMap},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::json;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::JoinHandle;

use crate::config::CoreConfig;
use crate::registry::AgentRegistry;
use crate::reporter::{ActivityRecord, ActivityReporter, EventKind};
use crate::scanner;

/// Observes agent directories and invalidates cached state on change
pub struct ModificationTracker {
    watcher: Option<RecommendedWatcher>,
    tasks: Vec<JoinHandle<()>>,
}

impl ModificationTracker {
    /// Start watching every directory the registry has walked
    ///
    /// Falls back to polling when the platform notifier cannot be created.
    #[must_use]
    pub fn start(
        registry: Arc<AgentRegistry>,
        reporter: Arc<ActivityReporter>,
        config: &CoreConfig,
    ) -> Self {
        let debounce = Duration::from_millis(config.tracker_debounce_ms);
        let poll_every = Duration::from_secs(config.tracker_poll_fallback_seconds.max(1));

        let (tx, rx) = mpsc::unbounded_channel::<PathBuf>();
        let watcher_result = notify::recommended_watcher(move |res: notify::Result<Event>| {
            if let Ok(event) = res {
                for path in event.paths {
                    if scanner::default_candidate(&path) {
                        let _ = tx.send(path);
                    }
                }
            }
        });

        match watcher_result {
            Ok(mut watcher) => {
                for (_root, dirs) in registry.watched_roots() {
                    for dir in dirs {
                        if let Err(e) = watcher.watch(&dir, RecursiveMode::NonRecursive) {
                            tracing::warn!(dir = %dir.display(), error = %e, "cannot watch agents directory");
                        }
                    }
                }
                let task = tokio::spawn(debounce_loop(rx, registry, reporter, debounce));
                Self {
                    watcher: Some(watcher),
                    tasks: vec![task],
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "filesystem notifier unavailable; falling back to polling");
                Self::start_polling_with(registry, reporter, poll_every)
            }
        }
    }

    /// Poll-only tracker; the fallback when no notifier exists
    #[must_use]
    pub(crate) fn start_polling_with(
        registry: Arc<AgentRegistry>,
        reporter: Arc<ActivityReporter>,
        every: Duration,
    ) -> Self {
        let task = tokio::spawn(poll_loop(registry, reporter, every));
        Self {
            watcher: None,
            tasks: vec![task],
        }
    }

    /// Stop watching and cancel background tasks
    pub fn stop(&mut self) {
        self.watcher = None;
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for ModificationTracker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Coalesce bursts of events within the debounce window, then apply them
async fn debounce_loop(
    mut rx: UnboundedReceiver<PathBuf>,
    registry: Arc<AgentRegistry>,
    reporter: Arc<ActivityReporter>,
    window: Duration,
) {
    while let Some(first) = rx.recv().await {
        let mut batch = BTreeSet::new();
        batch.insert(first);

        loop {
            match tokio::time::timeout(window, rx.recv()).await {
                Ok(Some(path)) => {
                    batch.insert(path);
                }
                // Channel closed or the window went quiet.
                Ok(None) | Err(_) => break,
            }
        }

        apply_changes(&registry, &reporter, &batch);
    }
}

/// Re-stat known sources on a fixed cadence
async fn poll_loop(registry: Arc<AgentRegistry>, reporter: Arc<ActivityReporter>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    interval.tick().await;

    loop {
        interval.tick().await;

        let mut changed = BTreeSet::new();
        for (path, old_hash) in registry.known_sources() {
            match std::fs::read(&path) {
                Ok(bytes) => {
                    if scanner::hash_content(&bytes) != old_hash {
                        changed.insert(path);
                    }
                }
                Err(_) => {
                    changed.insert(path);
                }
            }
        }

        if !changed.is_empty() {
            apply_changes(&registry, &reporter, &changed);
        }
    }
}

/// Invalidate prompts and views affected by a batch of changed paths
fn apply_changes(
    registry: &AgentRegistry,
    reporter: &ActivityReporter,
    batch: &BTreeSet<PathBuf>,
) {
    let known: HashMap<PathBuf, String> = registry.known_sources().into_iter().collect();
    let roots = registry.watched_roots();

    for path in batch {
        let kind = if path.exists() {
            if known.contains_key(path) {
                "modified"
            } else {
                "created"
            }
        } else {
            "removed"
        };

        if let Some(old_hash) = known.get(path) {
            registry.invalidate_hash(old_hash);
        }

        for (root, dirs) in &roots {
            if path.parent().is_some_and(|parent| dirs.iter().any(|d| d == parent)) {
                registry.invalidate_root(root);
            }
        }

        tracing::debug!(path = %path.display(), kind, "agent source changed");
        reporter.emit(
            ActivityRecord::new(EventKind::Modification)
                .path(path.clone())
                .details(json!({ "kind": kind })),
        );
    }
}
