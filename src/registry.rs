//! Agent registry
//!
//! Composes the walker, scanner, and cache into the canonical
//! `list_agents` / `load_agent` surface. Discovery produces an immutable
//! [`RegistryView`] per root with precedence already resolved; prompt loads
//! go through the shared cache keyed by content hash, so a stale prompt is
//! never served after the underlying file changes.

use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use dashmap::DashMap;
use serde_json::json;
use tokio::sync::Mutex as AsyncMutex;

use crate::cache::{CacheKey, CacheValue, PromptCache};
use crate::config::CoreConfig;
use crate::error::{PmError, Result};
use crate::reporter::{ActivityRecord, ActivityReporter, EventKind};
use crate::scanner::{self, AgentMetadata, AgentPrompt, AgentSource, ScannedAgent};
use crate::walker::{self, Tier};

/// A source that lost precedence resolution, kept for diagnostics
#[derive(Debug, Clone)]
pub struct ShadowedSource {
    pub id: String,
    pub source: AgentSource,
    /// Tier of the source that won
    pub shadowed_by: Tier,
}

/// Immutable snapshot of resolved agents for one root
#[derive(Debug, Clone)]
pub struct RegistryView {
    /// Monotonically increasing across the process
    pub generation: u64,
    pub root: PathBuf,
    /// Winner per id after precedence resolution
    pub winners: BTreeMap<String, AgentMetadata>,
    /// Every source known per id, winner first
    pub sources: BTreeMap<String, Vec<AgentSource>>,
    pub shadowed: Vec<ShadowedSource>,
}

impl RegistryView {
    /// Winning metadata for an id, if present
    #[must_use]
    pub fn winner(&self, id: &str) -> Option<&AgentMetadata> {
        self.winners.get(id)
    }

    /// All resolved agent ids, in lexicographic order
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.winners.keys().map(String::as_str)
    }

    /// Approximate heap footprint, used for cache accounting
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        let winners: usize = self
            .winners
            .values()
            .map(|m| m.role_summary.len() + 256)
            .sum();
        winners + self.shadowed.len() * 128 + 512
    }
}

/// Per-root bookkeeping refreshed on every build
struct RootWatch {
    dirs: Vec<PathBuf>,
    sources: HashMap<PathBuf, String>,
}

/// Discovery and prompt-loading surface
pub struct AgentRegistry {
    config: Arc<CoreConfig>,
    cache: Arc<PromptCache>,
    reporter: Arc<ActivityReporter>,
    /// One in-flight build per root; concurrent callers await the same build
    build_locks: DashMap<PathBuf, Arc<AsyncMutex<()>>>,
    generation: AtomicU64,
    watched: DashMap<PathBuf, RootWatch>,
}

impl AgentRegistry {
    #[must_use]
    pub fn new(
        config: Arc<CoreConfig>,
        cache: Arc<PromptCache>,
        reporter: Arc<ActivityReporter>,
    ) -> Self {
        Self {
            config,
            cache,
            reporter,
            build_locks: DashMap::new(),
            generation: AtomicU64::new(0),
            watched: DashMap::new(),
        }
    }

    /// Latest view generation handed out by this registry
    #[must_use]
    pub fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Build or return the cached view for `root`
    ///
    /// # Errors
    ///
    /// Build failures below the directory level are recovered and recorded;
    /// the view always reflects the surviving agents.
    pub async fn list_agents(&self, root: &Path) -> Result<Arc<RegistryView>> {
        let root = normalize_root(root);
        let key = CacheKey::View(root.clone());

        if let Some(CacheValue::View(view)) = self.cache.get(&key) {
            return Ok(view);
        }

        let lock = self
            .build_locks
            .entry(root.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // A concurrent caller may have finished the build while we waited.
        if let Some(CacheValue::View(view)) = self.cache.get(&key) {
            return Ok(view);
        }

        let view = self.build_view(&root).await;
        self.cache
            .put(key, CacheValue::View(Arc::clone(&view)), view.size_bytes());
        Ok(view)
    }

    /// Resolve the winner for `agent_id` and return its parsed prompt
    ///
    /// Lock-free on a cache hit. The prompt key is the hash of the file's
    /// current bytes, so a hit can never hand back stale content. A vanished
    /// source or a hash that no longer matches the view triggers one view
    /// rebuild before the error surfaces.
    ///
    /// # Errors
    ///
    /// `AgentNotFound`, `SourceVanished` (after the rebuild retry), and
    /// `ParseFailed` surface to the caller.
    pub async fn load_agent(&self, agent_id: &str, root: &Path) -> Result<Arc<AgentPrompt>> {
        let mut rebuilt = false;
        loop {
            let view = self.list_agents(root).await?;
            let Some(meta) = view.winner(agent_id) else {
                let err = PmError::AgentNotFound(agent_id.to_string());
                self.emit_error(&err, Some(agent_id), None, Some(view.generation));
                return Err(err);
            };

            let bytes = match scanner::read_source(&meta.source_path) {
                Ok(bytes) => bytes,
                Err(err @ PmError::SourceVanished { .. }) => {
                    if rebuilt {
                        self.emit_error(
                            &err,
                            Some(agent_id),
                            Some(&meta.source_path),
                            Some(view.generation),
                        );
                        return Err(err);
                    }
                    rebuilt = true;
                    self.invalidate_root(&view.root);
                    continue;
                }
                Err(err) => {
                    self.emit_error(
                        &err,
                        Some(agent_id),
                        Some(&meta.source_path),
                        Some(view.generation),
                    );
                    return Err(err);
                }
            };

            let content_hash = scanner::hash_content(&bytes);
            if content_hash != meta.content_hash && !rebuilt {
                // The file changed under a stale view; rebuild once so the
                // served metadata matches the bytes on disk.
                rebuilt = true;
                self.invalidate_root(&view.root);
                continue;
            }

            let key = CacheKey::Prompt(content_hash);
            if let Some(CacheValue::Prompt(prompt)) = self.cache.get(&key) {
                self.reporter.emit(
                    ActivityRecord::new(EventKind::CacheHit)
                        .agent(agent_id)
                        .path(meta.source_path.clone())
                        .generation(view.generation),
                );
                return Ok(prompt);
            }

            let scanned = match scanner::scan_bytes(&meta.source_path, meta.tier, bytes) {
                Ok(scanned) => scanned,
                Err(err) => {
                    self.emit_error(
                        &err,
                        Some(agent_id),
                        Some(&meta.source_path),
                        Some(view.generation),
                    );
                    return Err(err);
                }
            };

            let prompt = Arc::new(AgentPrompt {
                id: scanned.metadata.id.clone(),
                prompt: scanned.body,
                metadata: scanned.metadata,
            });
            self.cache.put(
                key,
                CacheValue::Prompt(Arc::clone(&prompt)),
                prompt.size_bytes(),
            );

            self.reporter.emit(
                ActivityRecord::new(EventKind::CacheMiss)
                    .agent(agent_id)
                    .path(meta.source_path.clone())
                    .generation(view.generation),
            );
            self.reporter.emit(
                ActivityRecord::new(EventKind::Load)
                    .agent(agent_id)
                    .path(meta.source_path.clone())
                    .generation(view.generation)
                    .details(json!({ "content_hash": prompt.metadata.content_hash })),
            );
            return Ok(prompt);
        }
    }

    /// Drop the cached view for `root`; the next `list_agents` rebuilds
    pub fn invalidate_root(&self, root: &Path) {
        let root = normalize_root(root);
        if self.cache.invalidate(&CacheKey::View(root.clone())) {
            self.reporter.emit(
                ActivityRecord::new(EventKind::Invalidation)
                    .path(root)
                    .details(json!({ "target": "view" })),
            );
        }
    }

    /// Drop the cached prompt for a content hash
    pub fn invalidate_hash(&self, hash: &str) {
        if self.cache.invalidate(&CacheKey::Prompt(hash.to_string())) {
            self.reporter.emit(
                ActivityRecord::new(EventKind::Invalidation)
                    .details(json!({ "target": "prompt", "content_hash": hash })),
            );
        }
    }

    /// Roots this registry has built views for, with their walked dirs
    #[must_use]
    pub fn watched_roots(&self) -> Vec<(PathBuf, Vec<PathBuf>)> {
        self.watched
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().dirs.clone()))
            .collect()
    }

    /// Every known `(source_path, content_hash)` pair, for poll fallback
    #[must_use]
    pub fn known_sources(&self) -> Vec<(PathBuf, String)> {
        let mut out = Vec::new();
        for entry in &self.watched {
            for (path, hash) in &entry.value().sources {
                out.push((path.clone(), hash.clone()));
            }
        }
        out
    }

    async fn build_view(&self, root: &Path) -> Arc<RegistryView> {
        let outcome = walker::walk(root, &self.config);
        let mut error_count = outcome.errors.len();
        for err in &outcome.errors {
            self.reporter.emit(
                ActivityRecord::new(EventKind::Error)
                    .path(err.path.clone())
                    .details(json!({ "kind": err.kind.label(), "message": err.message })),
            );
        }

        // Directories scan concurrently; each scan is a short burst of file
        // reads and hashing.
        let scans = futures::future::join_all(outcome.dirs.iter().map(|dir| {
            let config = Arc::clone(&self.config);
            let dir = dir.clone();
            async move { scanner::scan_dir(&dir.path, dir.tier, &config) }
        }))
        .await;

        let mut grouped: BTreeMap<String, Vec<ScannedAgent>> = BTreeMap::new();
        for scan in scans {
            for failure in scan.failures {
                error_count += 1;
                self.reporter.emit(
                    ActivityRecord::new(EventKind::Error)
                        .path(failure.path.clone())
                        .details(json!({ "kind": "parse_failed", "message": failure.message })),
                );
            }
            if scan.truncated > 0 {
                self.reporter.emit(ActivityRecord::new(EventKind::Error).details(
                    json!({ "kind": "scanner_truncated", "skipped": scan.truncated }),
                ));
            }
            for agent in scan.agents {
                grouped
                    .entry(agent.metadata.id.clone())
                    .or_default()
                    .push(agent);
            }
        }

        let mut winners = BTreeMap::new();
        let mut sources: BTreeMap<String, Vec<AgentSource>> = BTreeMap::new();
        let mut shadowed = Vec::new();
        let mut watch_sources = HashMap::new();

        for (id, mut group) in grouped {
            // Lowest tier rank wins; within a tier the lexicographically
            // smaller path wins, so same-tier duplicates stay deterministic.
            group.sort_by(|a, b| {
                a.source
                    .tier
                    .rank()
                    .cmp(&b.source.tier.rank())
                    .then_with(|| a.source.path.cmp(&b.source.path))
            });

            for agent in &group {
                watch_sources.insert(agent.source.path.clone(), agent.source.content_hash.clone());
            }

            let winner_tier = group[0].source.tier;
            winners.insert(id.clone(), group[0].metadata.clone());
            sources.insert(id.clone(), group.iter().map(|a| a.source.clone()).collect());
            for loser in &group[1..] {
                shadowed.push(ShadowedSource {
                    id: id.clone(),
                    source: loser.source.clone(),
                    shadowed_by: winner_tier,
                });
            }
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let view = Arc::new(RegistryView {
            generation,
            root: root.to_path_buf(),
            winners,
            sources,
            shadowed,
        });

        self.watched.insert(
            root.to_path_buf(),
            RootWatch {
                dirs: outcome.dirs.iter().map(|d| d.path.clone()).collect(),
                sources: watch_sources,
            },
        );

        tracing::debug!(
            root = %root.display(),
            generation,
            agents = view.winners.len(),
            "registry view built"
        );
        self.reporter.emit(
            ActivityRecord::new(EventKind::Discovery)
                .path(root.to_path_buf())
                .generation(generation)
                .details(json!({
                    "agents": view.winners.len(),
                    "dirs": outcome.dirs.len(),
                    "shadowed": view.shadowed.len(),
                    "errors": error_count,
                })),
        );

        view
    }

    fn emit_error(
        &self,
        err: &PmError,
        agent_id: Option<&str>,
        path: Option<&Path>,
        generation: Option<u64>,
    ) {
        let mut record = ActivityRecord::new(EventKind::Error)
            .details(json!({ "kind": err.kind(), "message": err.to_string() }));
        if let Some(id) = agent_id {
            record = record.agent(id);
        }
        if let Some(path) = path {
            record = record.path(path.to_path_buf());
        }
        if let Some(generation) = generation {
            record = record.generation(generation);
        }
        self.reporter.emit(record);
    }
}

/// Canonicalize when possible so spellings of the same root share a view
fn normalize_root(root: &Path) -> PathBuf {
    std::fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf())
}
