//! Task-to-agent selection
//!
//! Scores every agent in a [`RegistryView`] against a free-text task
//! description and optional structured hints. The candidate set is the view
//! itself: user-declared agents participate on exactly the same footing as
//! the stock ones, and nothing here knows a built-in id list.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::config::SelectorWeights;
use crate::registry::RegistryView;
use crate::scanner::AgentMetadata;

/// Scores within this distance tie and fall through to tier, then id
const SCORE_EPSILON: f64 = 1e-9;

/// Structured hints accompanying a task description
#[derive(Debug, Clone, Default)]
pub struct SelectionHints {
    /// Explicit agent choice; wins unconditionally when present in the view
    pub agent_id: Option<String>,
    /// Capability tags the task requires
    pub required_capabilities: BTreeSet<String>,
    /// Specialization tags that should attract matching agents
    pub specializations: BTreeSet<String>,
}

/// Result of scoring a task against a view
#[derive(Debug, Clone, Serialize)]
pub struct SelectionOutcome {
    pub chosen: Option<String>,
    pub score: f64,
    pub matched_keywords: BTreeSet<String>,
    pub matched_capabilities: BTreeSet<String>,
    /// Every candidate with its score, best first
    pub considered: Vec<(String, f64)>,
    pub fallback_used: bool,
}

struct Candidate<'a> {
    metadata: &'a AgentMetadata,
    score: f64,
    matched_keywords: BTreeSet<String>,
    matched_capabilities: BTreeSet<String>,
}

/// Select the best agent for a task
///
/// Deterministic for identical `(view, task, hints, weights)`. Returns
/// `chosen = None` with `fallback_used = true` when no candidate scores
/// above zero; the caller decides what a fallback means.
#[must_use]
pub fn select(
    view: &RegistryView,
    task: &str,
    hints: &SelectionHints,
    weights: &SelectorWeights,
) -> SelectionOutcome {
    let tokens = tokenize(task);
    let required: BTreeSet<String> = hints
        .required_capabilities
        .iter()
        .map(|s| s.to_lowercase())
        .collect();
    let wanted_specs: BTreeSet<String> = hints
        .specializations
        .iter()
        .map(|s| s.to_lowercase())
        .collect();

    let mut candidates: Vec<Candidate<'_>> = view
        .winners
        .values()
        .map(|metadata| score_candidate(metadata, &tokens, &required, &wanted_specs, weights))
        .collect();

    candidates.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.metadata.tier.rank().cmp(&b.metadata.tier.rank()))
            .then_with(|| a.metadata.id.cmp(&b.metadata.id))
    });

    // An explicit hint that resolves in the view short-circuits scoring.
    if let Some(hinted) = hints.agent_id.as_deref() {
        if let Some(candidate) = candidates.iter().find(|c| c.metadata.id == hinted) {
            let considered = vec![(hinted.to_string(), f64::INFINITY)];
            return SelectionOutcome {
                chosen: Some(hinted.to_string()),
                score: f64::INFINITY,
                matched_keywords: candidate.matched_keywords.clone(),
                matched_capabilities: candidate.matched_capabilities.clone(),
                considered,
                fallback_used: false,
            };
        }
    }

    let considered: Vec<(String, f64)> = candidates
        .iter()
        .map(|c| (c.metadata.id.clone(), c.score))
        .collect();

    let winner = best_candidate(&candidates);
    match winner {
        Some(candidate) if candidate.score > 0.0 => SelectionOutcome {
            chosen: Some(candidate.metadata.id.clone()),
            score: candidate.score,
            matched_keywords: candidate.matched_keywords.clone(),
            matched_capabilities: candidate.matched_capabilities.clone(),
            considered,
            fallback_used: false,
        },
        _ => SelectionOutcome {
            chosen: None,
            score: 0.0,
            matched_keywords: BTreeSet::new(),
            matched_capabilities: BTreeSet::new(),
            considered,
            fallback_used: true,
        },
    }
}

/// Lowercase alphanumeric tokens of a task description
#[must_use]
pub fn tokenize(task: &str) -> BTreeSet<String> {
    task.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn score_candidate<'a>(
    metadata: &'a AgentMetadata,
    tokens: &BTreeSet<String>,
    required: &BTreeSet<String>,
    wanted_specs: &BTreeSet<String>,
    weights: &SelectorWeights,
) -> Candidate<'a> {
    let matched_capabilities: BTreeSet<String> = metadata
        .capabilities
        .intersection(required)
        .cloned()
        .collect();

    let matched_keywords: BTreeSet<String> =
        metadata.keywords.intersection(tokens).cloned().collect();

    let matched_specs = metadata
        .specializations
        .intersection(wanted_specs)
        .count();

    let mut score = weights.w_cap * matched_capabilities.len() as f64;
    if !matched_keywords.is_empty() {
        // Ratio of this agent's keywords the task hit; a single match still
        // counts because the ratio floor is one keyword.
        score += weights.w_kw * matched_keywords.len() as f64 / metadata.keywords.len() as f64;
    }
    score += weights.w_spec * matched_specs as f64;

    Candidate {
        metadata,
        score,
        matched_keywords,
        matched_capabilities,
    }
}

/// Pick the winner from sorted candidates, applying tie-breaks within epsilon
fn best_candidate<'a, 'b>(candidates: &'b [Candidate<'a>]) -> Option<&'b Candidate<'a>> {
    let first = candidates.first()?;
    let mut best = first;
    for candidate in &candidates[1..] {
        if (first.score - candidate.score).abs() > SCORE_EPSILON {
            break;
        }
        // Same score band: higher-precedence tier wins, then smaller id.
        let better = candidate
            .metadata
            .tier
            .rank()
            .cmp(&best.metadata.tier.rank())
            .then_with(|| candidate.metadata.id.cmp(&best.metadata.id))
            .is_lt();
        if better {
            best = candidate;
        }
    }
    Some(best)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::walker::Tier;
    use pretty_assertions::assert_eq;
    use std::collections::{BTreeMap, BTreeSet};
    use std::path::PathBuf;

    fn metadata(id: &str, tier: Tier) -> AgentMetadata {
        AgentMetadata {
            id: id.to_string(),
            tier,
            source_path: PathBuf::from(format!("/agents/{id}.md")),
            capabilities: BTreeSet::new(),
            keywords: BTreeSet::new(),
            role_summary: String::new(),
            specializations: BTreeSet::new(),
            version: None,
            extra: BTreeMap::new(),
            content_hash: format!("hash-{id}"),
        }
    }

    fn view(agents: Vec<AgentMetadata>) -> RegistryView {
        let mut winners = BTreeMap::new();
        for agent in agents {
            winners.insert(agent.id.clone(), agent);
        }
        RegistryView {
            generation: 1,
            root: PathBuf::from("/project"),
            winners,
            sources: BTreeMap::new(),
            shadowed: Vec::new(),
        }
    }

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn keyword_match_chooses_the_right_agent() {
        let mut qa = metadata("qa", Tier::User);
        qa.keywords = set(&["regression", "test"]);
        let mut docs = metadata("documentation", Tier::User);
        docs.keywords = set(&["docs", "readme"]);

        let outcome = select(
            &view(vec![qa, docs]),
            "run regression tests",
            &SelectionHints::default(),
            &SelectorWeights::default(),
        );
        assert_eq!(outcome.chosen.as_deref(), Some("qa"));
        assert!(outcome.matched_keywords.contains("regression"));
        assert!(!outcome.fallback_used);
    }

    #[test]
    fn capability_hints_outweigh_partial_keywords() {
        let mut analyzer = metadata("custom_analyzer", Tier::User);
        analyzer.capabilities = set(&["analyze", "metrics"]);
        let mut engineer = metadata("engineer", Tier::System);
        engineer.keywords = set(&["module"]);

        let hints = SelectionHints {
            required_capabilities: set(&["analyze"]),
            ..SelectionHints::default()
        };
        let outcome = select(
            &view(vec![analyzer, engineer]),
            "analyze metrics for module X",
            &hints,
            &SelectorWeights::default(),
        );
        assert_eq!(outcome.chosen.as_deref(), Some("custom_analyzer"));
        assert!(outcome.matched_capabilities.contains("analyze"));
    }

    #[test]
    fn explicit_hint_wins_unconditionally() {
        let mut qa = metadata("qa", Tier::User);
        qa.keywords = set(&["everything"]);
        let ops = metadata("ops", Tier::User);

        let hints = SelectionHints {
            agent_id: Some("ops".to_string()),
            ..SelectionHints::default()
        };
        let outcome = select(
            &view(vec![qa, ops]),
            "everything everywhere",
            &hints,
            &SelectorWeights::default(),
        );
        assert_eq!(outcome.chosen.as_deref(), Some("ops"));
        assert!(outcome.score.is_infinite());
    }

    #[test]
    fn hint_for_unknown_agent_falls_through_to_scoring() {
        let mut qa = metadata("qa", Tier::User);
        qa.keywords = set(&["test"]);

        let hints = SelectionHints {
            agent_id: Some("ghost".to_string()),
            ..SelectionHints::default()
        };
        let outcome = select(
            &view(vec![qa]),
            "test the build",
            &hints,
            &SelectorWeights::default(),
        );
        assert_eq!(outcome.chosen.as_deref(), Some("qa"));
        assert!(outcome.score.is_finite());
    }

    #[test]
    fn no_overlap_returns_null_with_fallback_flag() {
        let mut qa = metadata("qa", Tier::User);
        qa.keywords = set(&["test"]);

        let outcome = select(
            &view(vec![qa]),
            "arbitrary text with zero overlap",
            &SelectionHints::default(),
            &SelectorWeights::default(),
        );
        assert_eq!(outcome.chosen, None);
        assert!(outcome.fallback_used);
        assert_eq!(outcome.score, 0.0);
        assert_eq!(outcome.considered.len(), 1);
    }

    #[test]
    fn tier_breaks_score_ties() {
        let mut user_qa = metadata("aaa", Tier::User);
        user_qa.keywords = set(&["deploy"]);
        let mut project_qa = metadata("zzz", Tier::ProjectCurrent);
        project_qa.keywords = set(&["deploy"]);

        let outcome = select(
            &view(vec![user_qa, project_qa]),
            "deploy the service",
            &SelectionHints::default(),
            &SelectorWeights::default(),
        );
        // Equal scores; the project-current tier outranks user despite the
        // lexicographically larger id.
        assert_eq!(outcome.chosen.as_deref(), Some("zzz"));
    }

    #[test]
    fn id_breaks_full_ties() {
        let mut a = metadata("alpha", Tier::User);
        a.keywords = set(&["deploy"]);
        let mut b = metadata("beta", Tier::User);
        b.keywords = set(&["deploy"]);

        let outcome = select(
            &view(vec![a, b]),
            "deploy",
            &SelectionHints::default(),
            &SelectorWeights::default(),
        );
        assert_eq!(outcome.chosen.as_deref(), Some("alpha"));
    }

    #[test]
    fn specialization_hints_score() {
        let mut data = metadata("data_engineer", Tier::User);
        data.specializations = set(&["etl"]);
        let mut generic = metadata("engineer", Tier::User);
        generic.keywords = set(&["pipeline"]);

        let hints = SelectionHints {
            specializations: set(&["etl"]),
            ..SelectionHints::default()
        };
        let outcome = select(
            &view(vec![data, generic]),
            "build the pipeline",
            &hints,
            &SelectorWeights::default(),
        );
        // w_spec (4) beats a full keyword ratio (2).
        assert_eq!(outcome.chosen.as_deref(), Some("data_engineer"));
    }

    #[test]
    fn every_agent_is_reachable_by_some_task() {
        let ids = ["documentation", "qa", "engineer", "research", "ops", "custom_widget"];
        let agents: Vec<AgentMetadata> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| {
                let mut m = metadata(id, Tier::User);
                m.keywords = set(&[&format!("topic{i}")]);
                m
            })
            .collect();
        let view = view(agents);

        for (i, id) in ids.iter().enumerate() {
            let outcome = select(
                &view,
                &format!("please handle topic{i} now"),
                &SelectionHints::default(),
                &SelectorWeights::default(),
            );
            assert_eq!(outcome.chosen.as_deref(), Some(*id));
        }
    }

    #[test]
    fn considered_lists_every_candidate_best_first() {
        let mut qa = metadata("qa", Tier::User);
        qa.keywords = set(&["test", "coverage"]);
        let mut eng = metadata("engineer", Tier::User);
        eng.keywords = set(&["build"]);
        let idle = metadata("ops", Tier::User);

        let outcome = select(
            &view(vec![qa, eng, idle]),
            "test coverage report",
            &SelectionHints::default(),
            &SelectorWeights::default(),
        );
        assert_eq!(outcome.considered.len(), 3);
        assert_eq!(outcome.considered[0].0, "qa");
        assert!(outcome.considered[0].1 > outcome.considered[1].1);
        assert_eq!(outcome.considered[2].1, 0.0);
    }

    #[test]
    fn determinism_for_identical_inputs() {
        let mut qa = metadata("qa", Tier::User);
        qa.keywords = set(&["test", "coverage"]);
        let mut eng = metadata("engineer", Tier::User);
        eng.keywords = set(&["test", "build"]);
        let v = view(vec![qa, eng]);

        let first = select(
            &v,
            "test coverage for the build",
            &SelectionHints::default(),
            &SelectorWeights::default(),
        );
        let second = select(
            &v,
            "test coverage for the build",
            &SelectionHints::default(),
            &SelectorWeights::default(),
        );
        assert_eq!(first.chosen, second.chosen);
        assert_eq!(first.score, second.score);
        assert_eq!(first.considered, second.considered);
    }

    #[test]
    fn tokenizer_strips_punctuation_and_case() {
        let tokens = tokenize("Run, Regression-Tests! (now)");
        assert_eq!(tokens, set(&["run", "regression", "tests", "now"]));
    }
}
