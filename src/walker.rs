//! Tier ordering and the agent directory walk
//!
//! The walker turns a starting path into the ordered list of directories the
//! scanner should consult. Emission order defines precedence: the current
//! project's agents directory first, then ancestors by ascending depth, then
//! the user directory, then the bundled system directory.

use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::config::CoreConfig;

/// Precedence class of an agent source
///
/// Lower order means higher precedence. Ancestors compare by depth from the
/// starting path; a closer ancestor wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// `<root>/<framework-dir>/agents`
    ProjectCurrent,
    /// `<ancestor>/<framework-dir>/agents`, at the given depth above the root
    ProjectAncestor(u32),
    /// `<user-home>/<framework-dir>/agents`
    User,
    /// Bundled system agents directory
    System,
}

impl Tier {
    /// Sort key: class rank, then ancestor depth
    #[must_use]
    pub const fn rank(self) -> (u8, u32) {
        match self {
            Tier::ProjectCurrent => (0, 0),
            Tier::ProjectAncestor(depth) => (1, depth),
            Tier::User => (2, 0),
            Tier::System => (3, 0),
        }
    }

    /// Short label used in activity records
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Tier::ProjectCurrent => "project_current",
            Tier::ProjectAncestor(_) => "project_ancestor",
            Tier::User => "user",
            Tier::System => "system",
        }
    }
}

impl Ord for Tier {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl PartialOrd for Tier {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// One directory the scanner should visit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkedDir {
    pub tier: Tier,
    pub path: PathBuf,
}

/// Failure observed during the walk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkError {
    pub path: PathBuf,
    pub kind: WalkErrorKind,
    pub message: String,
}

/// Walk failure classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkErrorKind {
    /// Directory exists but cannot be opened
    Unreadable,
    /// A symlink loop revisited an already-walked ancestor
    SymlinkCycle,
}

impl WalkErrorKind {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            WalkErrorKind::Unreadable => "directory_unreadable",
            WalkErrorKind::SymlinkCycle => "symlink_cycle",
        }
    }
}

/// Result of a walk: directories in precedence order plus recoverable errors
#[derive(Debug, Clone, Default)]
pub struct WalkOutcome {
    pub dirs: Vec<WalkedDir>,
    pub errors: Vec<WalkError>,
}

/// Produce the ordered directory list for `root`
///
/// Nonexistent directories are skipped silently. A directory that exists but
/// cannot be opened is reported in `errors` and skipped. Symlink cycles in
/// the ancestor chain terminate the upward walk with an error entry.
#[must_use]
pub fn walk(root: &Path, config: &CoreConfig) -> WalkOutcome {
    let mut outcome = WalkOutcome::default();
    let subdir = config.agents_subdir();

    push_if_present(root.join(&subdir), Tier::ProjectCurrent, &mut outcome);

    // Ancestor walk, cycle-safe via resolved-path set.
    let mut seen: HashSet<PathBuf> = HashSet::new();
    if let Ok(canonical) = fs::canonicalize(root) {
        seen.insert(canonical);
    }

    let mut current = root.to_path_buf();
    for depth in 1..=config.ancestor_walk_cap {
        let Some(parent) = current.parent().map(Path::to_path_buf) else {
            break;
        };

        match fs::canonicalize(&parent) {
            Ok(resolved) => {
                if !seen.insert(resolved) {
                    outcome.errors.push(WalkError {
                        path: parent.clone(),
                        kind: WalkErrorKind::SymlinkCycle,
                        message: format!("ancestor walk revisited {}", parent.display()),
                    });
                    break;
                }
            }
            // Canonicalization failing means the ancestor itself is gone;
            // stop walking upward.
            Err(_) => break,
        }

        push_if_present(
            parent.join(&subdir),
            Tier::ProjectAncestor(depth),
            &mut outcome,
        );
        current = parent;
    }

    if let Some(home) = dirs::home_dir() {
        push_if_present(home.join(&subdir), Tier::User, &mut outcome);
    }

    if let Some(system_dir) = &config.system_agents_dir {
        push_if_present(system_dir.clone(), Tier::System, &mut outcome);
    }

    outcome
}

fn push_if_present(path: PathBuf, tier: Tier, outcome: &mut WalkOutcome) {
    if !path.is_dir() {
        return;
    }

    // Probe readability here so precedence holds even when a tier directory
    // is skipped: the error is recorded and lower tiers still scan.
    if let Err(e) = fs::read_dir(&path) {
        tracing::warn!(path = %path.display(), error = %e, "skipping unreadable agents directory");
        outcome.errors.push(WalkError {
            path,
            kind: WalkErrorKind::Unreadable,
            message: e.to_string(),
        });
        return;
    }

    outcome.dirs.push(WalkedDir { tier, path });
}
