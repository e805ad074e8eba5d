//! Agent file scanning and metadata extraction
//!
//! Agent definitions are markdown files with a YAML front-matter header
//! between `---` fences, followed by the free-form prompt body. The scanner
//! enumerates one directory's immediate children, hashes candidate files,
//! and extracts [`AgentMetadata`]. Parse failures are collected per file;
//! one bad agent never aborts a scan.

use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::{Path, PathBuf},
    time::UNIX_EPOCH,
};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::CoreConfig;
use crate::error::{PmError, Result};
use crate::walker::Tier;

/// Where an agent definition came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSource {
    pub tier: Tier,
    pub path: PathBuf,
    /// Hex SHA-256 of the raw file bytes; the cache key discriminator
    pub content_hash: String,
    /// Modification time in nanoseconds since the Unix epoch
    pub last_modified_ns: u128,
}

/// Metadata extracted from an agent file header at scan time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMetadata {
    pub id: String,
    pub tier: Tier,
    pub source_path: PathBuf,
    pub capabilities: BTreeSet<String>,
    pub keywords: BTreeSet<String>,
    pub role_summary: String,
    pub specializations: BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Unrecognized header keys, preserved as-is
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_yaml::Value>,
    pub content_hash: String,
}

/// A parsed, ready-to-dispatch agent prompt
#[derive(Debug, Clone, PartialEq)]
pub struct AgentPrompt {
    pub id: String,
    pub prompt: String,
    pub metadata: AgentMetadata,
}

impl AgentPrompt {
    /// Approximate heap footprint, used for cache accounting
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.prompt.len() + self.metadata.role_summary.len() + 256
    }
}

/// One successfully scanned agent file
#[derive(Debug, Clone)]
pub struct ScannedAgent {
    pub source: AgentSource,
    pub metadata: AgentMetadata,
    pub body: String,
}

/// One per-file scan failure
#[derive(Debug, Clone)]
pub struct ScanFailure {
    pub path: PathBuf,
    pub message: String,
}

/// Result of scanning a single directory
#[derive(Debug, Clone, Default)]
pub struct ScanOutcome {
    pub agents: Vec<ScannedAgent>,
    pub failures: Vec<ScanFailure>,
    /// Candidate files skipped because the per-scan entry bound was hit
    pub truncated: usize,
}

/// Hex SHA-256 of raw bytes
#[must_use]
pub fn hash_content(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Default candidate predicate: `.md` files not starting with `_`
#[must_use]
pub fn default_candidate(path: &Path) -> bool {
    if path.extension().and_then(|s| s.to_str()) != Some("md") {
        return false;
    }
    path.file_name()
        .and_then(|s| s.to_str())
        .is_some_and(|name| !name.starts_with('_'))
}

/// Scan a directory with the default candidate predicate
#[must_use]
pub fn scan_dir(dir: &Path, tier: Tier, config: &CoreConfig) -> ScanOutcome {
    scan_dir_with(dir, tier, config, &default_candidate)
}

/// Scan a directory's immediate children for agent definitions
///
/// Entries are visited in file-name order so truncation and duplicate
/// resolution stay deterministic across runs.
#[must_use]
pub fn scan_dir_with(
    dir: &Path,
    tier: Tier,
    config: &CoreConfig,
    candidate: &dyn Fn(&Path) -> bool,
) -> ScanOutcome {
    let mut outcome = ScanOutcome::default();

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            outcome.failures.push(ScanFailure {
                path: dir.to_path_buf(),
                message: e.to_string(),
            });
            return outcome;
        }
    };

    let mut paths: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && candidate(path))
        .collect();
    paths.sort();

    if paths.len() > config.scanner_max_entries {
        outcome.truncated = paths.len() - config.scanner_max_entries;
        tracing::warn!(
            dir = %dir.display(),
            truncated = outcome.truncated,
            "scanner entry bound hit"
        );
        paths.truncate(config.scanner_max_entries);
    }

    for path in paths {
        match scan_file(&path, tier) {
            Ok(agent) => outcome.agents.push(agent),
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "agent file rejected");
                outcome.failures.push(ScanFailure {
                    path,
                    message: e.to_string(),
                });
            }
        }
    }

    outcome
}

/// Read a file's raw bytes, mapping a missing file to `SourceVanished`
///
/// # Errors
///
/// Returns [`PmError::SourceVanished`] when the file disappeared and an IO
/// error otherwise.
pub fn read_source(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            PmError::SourceVanished {
                path: path.to_path_buf(),
            }
        } else {
            PmError::Io(e)
        }
    })
}

/// Read, hash, and parse a single agent file
///
/// # Errors
///
/// Returns [`PmError::SourceVanished`] when the file disappeared and
/// [`PmError::ParseFailed`] on a malformed header.
pub fn scan_file(path: &Path, tier: Tier) -> Result<ScannedAgent> {
    let bytes = read_source(path)?;
    scan_bytes(path, tier, bytes)
}

/// Parse already-read file bytes into a scanned agent
///
/// # Errors
///
/// Returns [`PmError::ParseFailed`] on a malformed header.
pub fn scan_bytes(path: &Path, tier: Tier, bytes: Vec<u8>) -> Result<ScannedAgent> {
    let content_hash = hash_content(&bytes);
    let last_modified_ns = fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_nanos());

    let text = String::from_utf8(bytes).map_err(|e| PmError::ParseFailed {
        path: path.to_path_buf(),
        message: format!("not valid UTF-8: {e}"),
    })?;

    let (header, body) = split_front_matter(&text, path)?;
    let metadata = metadata_from_header(header, path, tier, &content_hash)?;

    Ok(ScannedAgent {
        source: AgentSource {
            tier,
            path: path.to_path_buf(),
            content_hash: content_hash.clone(),
            last_modified_ns,
        },
        metadata,
        body,
    })
}

/// Split a file into its YAML header map and prompt body
fn split_front_matter(
    text: &str,
    path: &Path,
) -> Result<(BTreeMap<String, serde_yaml::Value>, String)> {
    let lines: Vec<&str> = text.lines().collect();

    if lines.first().map(|l| l.trim()) != Some("---") {
        return Err(PmError::ParseFailed {
            path: path.to_path_buf(),
            message: "missing front-matter header".to_string(),
        });
    }

    let end_idx = lines[1..]
        .iter()
        .position(|line| line.trim() == "---")
        .ok_or_else(|| PmError::ParseFailed {
            path: path.to_path_buf(),
            message: "unclosed front-matter header".to_string(),
        })?
        + 1;

    let header_str = lines[1..end_idx].join("\n");
    let header: BTreeMap<String, serde_yaml::Value> = if header_str.trim().is_empty() {
        BTreeMap::new()
    } else {
        serde_yaml::from_str(&header_str).map_err(|e| PmError::ParseFailed {
            path: path.to_path_buf(),
            message: format!("invalid front-matter YAML: {e}"),
        })?
    };

    let body = lines[end_idx + 1..].join("\n").trim().to_string();
    Ok((header, body))
}

/// Build [`AgentMetadata`] from a parsed header map
fn metadata_from_header(
    mut header: BTreeMap<String, serde_yaml::Value>,
    path: &Path,
    tier: Tier,
    content_hash: &str,
) -> Result<AgentMetadata> {
    let id = match header.remove("id") {
        Some(serde_yaml::Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        Some(other) => {
            return Err(PmError::ParseFailed {
                path: path.to_path_buf(),
                message: format!("id must be a non-empty string, got {other:?}"),
            })
        }
        // Defaults to the filename stem when absent.
        None => path
            .file_stem()
            .and_then(|s| s.to_str())
            .map(str::to_string)
            .ok_or_else(|| PmError::ParseFailed {
                path: path.to_path_buf(),
                message: "cannot derive id from filename".to_string(),
            })?,
    };

    let capabilities = take_string_set(&mut header, "capabilities");
    let keywords = take_string_set(&mut header, "keywords");
    let specializations = take_string_set(&mut header, "specializations");

    let role_summary = match header.remove("role_summary") {
        Some(serde_yaml::Value::String(s)) => s,
        Some(other) => yaml_scalar_to_string(&other).unwrap_or_default(),
        None => String::new(),
    };

    let version = header
        .remove("version")
        .as_ref()
        .and_then(yaml_scalar_to_string);

    Ok(AgentMetadata {
        id,
        tier,
        source_path: path.to_path_buf(),
        capabilities,
        keywords,
        role_summary,
        specializations,
        version,
        extra: header,
        content_hash: content_hash.to_string(),
    })
}

/// Pull a list-valued key; accepts a YAML sequence or a single scalar
fn take_string_set(
    header: &mut BTreeMap<String, serde_yaml::Value>,
    key: &str,
) -> BTreeSet<String> {
    match header.remove(key) {
        Some(serde_yaml::Value::Sequence(seq)) => seq
            .iter()
            .filter_map(yaml_scalar_to_string)
            .map(|s| s.to_lowercase())
            .collect(),
        Some(value) => yaml_scalar_to_string(&value)
            .map(|s| s.to_lowercase())
            .into_iter()
            .collect(),
        None => BTreeSet::new(),
    }
}

fn yaml_scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
