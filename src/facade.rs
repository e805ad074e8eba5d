//! Core facade
//!
//! The single surface the PM orchestrator depends on. Owns the cache,
//! registry, reporter, and tracker, enforces the lifecycle state machine,
//! and applies per-operation deadlines. Build work is spawned, so a caller
//! hitting its deadline abandons only its own wait; the build completes for
//! everyone else.

use std::{path::Path, sync::Arc, time::Duration};

use serde::Serialize;
use serde_json::json;

use crate::cache::{CacheStats, PromptCache};
use crate::config::CoreConfig;
use crate::error::{PmError, Result};
use crate::registry::{AgentRegistry, RegistryView};
use crate::reporter::{ActivityRecord, ActivityReporter, EventKind, TicketSink};
use crate::scanner::AgentPrompt;
use crate::selector::{self, SelectionHints, SelectionOutcome};
use crate::tracker::ModificationTracker;

/// Facade lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CoreState {
    New,
    Starting,
    Running,
    Stopped,
}

/// Snapshot of core health counters
#[derive(Debug, Clone, Serialize)]
pub struct CoreStats {
    pub state: CoreState,
    pub cache: CacheStats,
    pub view_generation: u64,
    pub reporter_queue_depth: usize,
}

struct CoreRuntime {
    registry: Arc<AgentRegistry>,
    reporter: Arc<ActivityReporter>,
    tracker: ModificationTracker,
}

/// Entry point for agent discovery, loading, and selection
///
/// `NEW → RUNNING → STOPPED`; only [`PmCore::stats`] is callable before
/// `start`, and a stopped core cannot be restarted.
pub struct PmCore {
    config: Arc<CoreConfig>,
    cache: Arc<PromptCache>,
    sink: Arc<dyn TicketSink>,
    state: parking_lot::Mutex<CoreState>,
    runtime: parking_lot::Mutex<Option<CoreRuntime>>,
}

impl PmCore {
    /// Create an unstarted core
    ///
    /// # Errors
    ///
    /// Returns a validation error for out-of-range configuration.
    pub fn new(config: CoreConfig, sink: Arc<dyn TicketSink>) -> Result<Self> {
        config.validate()?;
        let cache = Arc::new(PromptCache::new(
            config.cache_byte_cap,
            Duration::from_secs(config.cache_ttl_seconds),
        ));
        Ok(Self {
            config: Arc::new(config),
            cache,
            sink,
            state: parking_lot::Mutex::new(CoreState::New),
            runtime: parking_lot::Mutex::new(None),
        })
    }

    /// Start the reporter and tracker and prime discovery for `root`
    ///
    /// # Errors
    ///
    /// Fails when called twice or after `stop`.
    pub async fn start(&self, root: &Path) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                CoreState::New => *state = CoreState::Starting,
                CoreState::Starting | CoreState::Running => {
                    return Err(PmError::Other("core already started".to_string()))
                }
                CoreState::Stopped => return Err(PmError::Stopped),
            }
        }

        let reporter = Arc::new(ActivityReporter::start(
            Arc::clone(&self.sink),
            self.config.reporter_queue_cap,
        ));
        let registry = Arc::new(AgentRegistry::new(
            Arc::clone(&self.config),
            Arc::clone(&self.cache),
            Arc::clone(&reporter),
        ));

        // Prime the view so the tracker knows which directories to watch.
        if let Err(e) = registry.list_agents(root).await {
            reporter
                .stop(Duration::from_millis(self.config.stop_flush_ms))
                .await;
            *self.state.lock() = CoreState::New;
            return Err(e);
        }

        let tracker = ModificationTracker::start(
            Arc::clone(&registry),
            Arc::clone(&reporter),
            &self.config,
        );

        *self.runtime.lock() = Some(CoreRuntime {
            registry,
            reporter,
            tracker,
        });
        *self.state.lock() = CoreState::Running;
        tracing::debug!(root = %root.display(), "core started");
        Ok(())
    }

    /// Stop the tracker and drain the reporter; idempotent
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock();
            if *state == CoreState::Stopped {
                return;
            }
            *state = CoreState::Stopped;
        }

        let runtime = self.runtime.lock().take();
        if let Some(mut runtime) = runtime {
            runtime.tracker.stop();
            runtime
                .reporter
                .stop(Duration::from_millis(self.config.stop_flush_ms))
                .await;
        }
    }

    /// Build or fetch the registry view for `root`
    ///
    /// # Errors
    ///
    /// `NotStarted`/`Stopped` outside the running state; `Timeout` past the
    /// configured deadline.
    pub async fn list_agents(&self, root: &Path) -> Result<Arc<RegistryView>> {
        let (registry, reporter) = self.handles()?;
        let deadline = Duration::from_millis(self.config.list_deadline_ms);

        let root_buf = root.to_path_buf();
        let task =
            tokio::spawn(async move { registry.list_agents(&root_buf).await });

        match tokio::time::timeout(deadline, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(PmError::Other(format!("discovery task failed: {join_err}"))),
            Err(_) => Err(self.timeout("list_agents", &reporter)),
        }
    }

    /// Resolve and load one agent's prompt
    ///
    /// # Errors
    ///
    /// Propagates `AgentNotFound`, `ParseFailed`, `SourceVanished`, and
    /// `Timeout`.
    pub async fn load_agent(&self, agent_id: &str, root: &Path) -> Result<Arc<AgentPrompt>> {
        let (registry, reporter) = self.handles()?;
        let deadline = Duration::from_millis(self.config.load_deadline_ms);

        let agent_id_buf = agent_id.to_string();
        let root_buf = root.to_path_buf();
        let task =
            tokio::spawn(async move { registry.load_agent(&agent_id_buf, &root_buf).await });

        match tokio::time::timeout(deadline, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(PmError::Other(format!("load task failed: {join_err}"))),
            Err(_) => Err(self.timeout("load_agent", &reporter)),
        }
    }

    /// Score a task against the current view and load the chosen prompt
    ///
    /// A no-match outcome is not an error: `chosen` is `None`, the prompt is
    /// `None`, and the caller decides whether a generic fallback applies.
    ///
    /// # Errors
    ///
    /// `NotStarted`/`Stopped`, `Timeout`, or a load failure for the chosen
    /// agent.
    pub async fn select_agent(
        &self,
        task_description: &str,
        root: &Path,
        hints: Option<SelectionHints>,
    ) -> Result<(SelectionOutcome, Option<Arc<AgentPrompt>>)> {
        let (registry, reporter) = self.handles()?;
        let deadline = Duration::from_millis(self.config.select_deadline_ms);
        let hints = hints.unwrap_or_default();

        let config = Arc::clone(&self.config);
        let task_buf = task_description.to_string();
        let root_buf = root.to_path_buf();
        let select_registry = Arc::clone(&registry);
        let select_reporter = Arc::clone(&reporter);

        let task = tokio::spawn(async move {
            let view = select_registry.list_agents(&root_buf).await?;
            let outcome = selector::select(&view, &task_buf, &hints, &config.selector_weights);

            match outcome.chosen.clone() {
                Some(chosen) => {
                    select_reporter.emit(
                        ActivityRecord::new(EventKind::Selection)
                            .agent(chosen.clone())
                            .generation(view.generation)
                            .details(json!({
                                "score": outcome.score,
                                "matched_keywords": outcome.matched_keywords,
                                "matched_capabilities": outcome.matched_capabilities,
                            })),
                    );
                    let prompt = select_registry.load_agent(&chosen, &root_buf).await?;
                    Ok::<_, PmError>((outcome, Some(prompt)))
                }
                None => {
                    select_reporter.emit(
                        ActivityRecord::new(EventKind::SelectionFallback)
                            .generation(view.generation)
                            .details(json!({ "task": task_buf })),
                    );
                    Ok((outcome, None))
                }
            }
        });

        match tokio::time::timeout(deadline, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => {
                Err(PmError::Other(format!("selection task failed: {join_err}")))
            }
            Err(_) => Err(self.timeout("select_agent", &reporter)),
        }
    }

    /// Cache, generation, and queue counters; callable in every state
    #[must_use]
    pub fn stats(&self) -> CoreStats {
        let state = *self.state.lock();
        let runtime = self.runtime.lock();
        let (view_generation, reporter_queue_depth) = runtime
            .as_ref()
            .map_or((0, 0), |rt| {
                (rt.registry.current_generation(), rt.reporter.queue_depth())
            });

        CoreStats {
            state,
            cache: self.cache.stats(),
            view_generation,
            reporter_queue_depth,
        }
    }

    fn handles(&self) -> Result<(Arc<AgentRegistry>, Arc<ActivityReporter>)> {
        match *self.state.lock() {
            CoreState::Running => {}
            CoreState::New | CoreState::Starting => return Err(PmError::NotStarted),
            CoreState::Stopped => return Err(PmError::Stopped),
        }

        let runtime = self.runtime.lock();
        runtime
            .as_ref()
            .map(|rt| (Arc::clone(&rt.registry), Arc::clone(&rt.reporter)))
            .ok_or(PmError::NotStarted)
    }

    fn timeout(&self, operation: &'static str, reporter: &ActivityReporter) -> PmError {
        let err = PmError::Timeout { operation };
        reporter.emit(
            ActivityRecord::new(EventKind::Error)
                .details(json!({ "kind": err.kind(), "operation": operation })),
        );
        err
    }
}
