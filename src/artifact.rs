//! Core artifact types exchanged between pipeline stages.
//!
//! Three artifacts flow through a run:
//! - [`Checklist`] — Researcher output, immutable once produced
//! - [`Draft`] — Writer output, re-created every round
//! - [`Scorecard`] — Critic output, re-created every round
//!
//! The optional Gatekeeper stage produces a [`GateVerdict`]. A successful
//! run persists an [`OptimizedArtifact`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Researcher,
    Writer,
    Critic,
    Gatekeeper,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Researcher => "researcher",
            Stage::Writer => "writer",
            Stage::Critic => "critic",
            Stage::Gatekeeper => "gatekeeper",
        };
        write!(f, "{}", s)
    }
}

/// A cluster of related keywords the Writer should work into the draft.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeywordCluster {
    pub name: String,
    /// Priority rank; lower is more important.
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub terms: Vec<String>,
}

/// A formatting rule with a severity classifying how strictly it applies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormattingRule {
    pub rule: String,
    #[serde(default)]
    pub severity: RuleSeverity,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleSeverity {
    Required,
    #[default]
    Recommended,
    Optional,
}

/// Machine-readable requirements the Writer must satisfy.
///
/// Produced once per run by the Researcher (or loaded from a continuation)
/// and consumed by every later stage. Never re-derived within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checklist {
    pub target_role: String,
    /// Ordered list of sections the final document must contain.
    pub required_sections: Vec<String>,
    #[serde(default)]
    pub keyword_clusters: Vec<KeywordCluster>,
    #[serde(default)]
    pub formatting_rules: Vec<FormattingRule>,
    /// Patterns known to get documents rejected for this role.
    #[serde(default)]
    pub rejection_risks: Vec<String>,
    /// Facts the source document does not provide but the role needs.
    #[serde(default)]
    pub data_requests: Vec<String>,
}

/// Generation metadata attached to a [`Draft`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DraftMeta {
    #[serde(default)]
    pub round: u32,
    #[serde(default)]
    pub placeholders_used: u32,
    #[serde(default)]
    pub edits_applied: u32,
    #[serde(default)]
    pub edits_skipped: u32,
}

/// A candidate document produced by the Writer for one round.
///
/// Only the current draft is retained; history survives only in the
/// change log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Draft {
    pub plain_text: String,
    pub rich_text: String,
    #[serde(default)]
    pub change_log: Vec<String>,
    #[serde(default)]
    pub meta: DraftMeta,
}

/// The Critic's declared decision for a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Pass,
    Revise,
    StopDataNeeded,
    StopUnfixableTruth,
}

impl Decision {
    /// Whether this decision terminates the run without further Writer calls.
    pub fn is_fatal_stop(&self) -> bool {
        matches!(self, Decision::StopDataNeeded | Decision::StopUnfixableTruth)
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Decision::Pass => "pass",
            Decision::Revise => "revise",
            Decision::StopDataNeeded => "stop_data_needed",
            Decision::StopUnfixableTruth => "stop_unfixable_truth",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for Decision {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pass" => Ok(Decision::Pass),
            "revise" => Ok(Decision::Revise),
            "stop_data_needed" => Ok(Decision::StopDataNeeded),
            "stop_unfixable_truth" => Ok(Decision::StopUnfixableTruth),
            _ => anyhow::bail!(
                "Invalid decision '{}'. Valid values: pass, revise, stop_data_needed, stop_unfixable_truth",
                s
            ),
        }
    }
}

/// A claim in the draft that the source input does not support.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TruthViolation {
    pub claim: String,
    pub reason: String,
    #[serde(default)]
    pub fix: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EditKind {
    Remove,
    Replace,
    Add,
    Rewrite,
}

/// A concrete edit the Critic requires before the draft can pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequiredEdit {
    pub kind: EditKind,
    #[serde(default)]
    pub before: Option<String>,
    #[serde(default)]
    pub after: Option<String>,
    pub location: String,
}

/// The Critic's adversarial evaluation of a [`Draft`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scorecard {
    /// Per-dimension scores, each 0-100.
    pub overall: u8,
    pub truthfulness: u8,
    pub domain_compliance: u8,
    pub alignment: u8,
    pub clarity: u8,
    pub keyword_coverage: u8,
    pub decision: Decision,
    #[serde(default)]
    pub blocking_issues: Vec<String>,
    #[serde(default)]
    pub non_blocking_issues: Vec<String>,
    /// Required sections the draft does not contain.
    #[serde(default)]
    pub missing_sections: Vec<String>,
    #[serde(default)]
    pub truth_violations: Vec<TruthViolation>,
    #[serde(default)]
    pub required_edits: Vec<RequiredEdit>,
    /// Facts the Critic needs from the user to proceed.
    #[serde(default)]
    pub data_requests: Vec<String>,
    /// Passages the next round must preserve.
    #[serde(default)]
    pub praise: Vec<String>,
}

/// The optional Gatekeeper stage's verdict over a passing round.
///
/// `proceed` (serialized as `continue`) may only be true when `complete` is
/// true and the verdict itself passed schema validation; a verdict that
/// could not be parsed never becomes a forced pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateVerdict {
    pub complete: bool,
    #[serde(rename = "continue")]
    pub proceed: bool,
    #[serde(default)]
    pub blocking_issues: Vec<String>,
    #[serde(default)]
    pub evidence: Vec<String>,
    #[serde(default)]
    pub next_step: Option<String>,
}

impl GateVerdict {
    /// Enforce the `proceed => complete` invariant after deserialization.
    pub fn normalized(mut self) -> Self {
        if !self.complete {
            self.proceed = false;
        }
        self
    }
}

/// The persisted result of a completed run, consumed by external
/// collaborators (UI / storage layer).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizedArtifact {
    pub checklist: Checklist,
    pub scorecard: Scorecard,
    pub rendered_plain_text: String,
    pub rendered_rich_text: String,
    pub change_log: Vec<String>,
    pub rounds_completed: u32,
    pub target_role: String,
    pub optimized_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_serialization() {
        assert_eq!(serde_json::to_string(&Decision::Pass).unwrap(), "\"pass\"");
        assert_eq!(
            serde_json::to_string(&Decision::StopDataNeeded).unwrap(),
            "\"stop_data_needed\""
        );
    }

    #[test]
    fn test_decision_from_str() {
        assert_eq!("revise".parse::<Decision>().unwrap(), Decision::Revise);
        assert_eq!(
            "stop_unfixable_truth".parse::<Decision>().unwrap(),
            Decision::StopUnfixableTruth
        );
        assert!("maybe".parse::<Decision>().is_err());
    }

    #[test]
    fn test_decision_fatal_stops() {
        assert!(Decision::StopDataNeeded.is_fatal_stop());
        assert!(Decision::StopUnfixableTruth.is_fatal_stop());
        assert!(!Decision::Pass.is_fatal_stop());
        assert!(!Decision::Revise.is_fatal_stop());
    }

    #[test]
    fn test_checklist_optional_fields_default() {
        let json = r#"{
            "target_role": "Backend Engineer",
            "required_sections": ["Header", "Summary"]
        }"#;
        let checklist: Checklist = serde_json::from_str(json).unwrap();
        assert_eq!(checklist.target_role, "Backend Engineer");
        assert_eq!(checklist.required_sections.len(), 2);
        assert!(checklist.keyword_clusters.is_empty());
        assert!(checklist.data_requests.is_empty());
    }

    #[test]
    fn test_scorecard_deserialization() {
        let json = r#"{
            "overall": 95,
            "truthfulness": 98,
            "domain_compliance": 90,
            "alignment": 92,
            "clarity": 94,
            "keyword_coverage": 88,
            "decision": "pass",
            "missing_sections": []
        }"#;
        let scorecard: Scorecard = serde_json::from_str(json).unwrap();
        assert_eq!(scorecard.overall, 95);
        assert_eq!(scorecard.decision, Decision::Pass);
        assert!(scorecard.truth_violations.is_empty());
    }

    #[test]
    fn test_gate_verdict_continue_field_name() {
        let json = r#"{"complete": true, "continue": true}"#;
        let verdict: GateVerdict = serde_json::from_str(json).unwrap();
        assert!(verdict.complete);
        assert!(verdict.proceed);

        let out = serde_json::to_value(&verdict).unwrap();
        assert_eq!(out["continue"], true);
    }

    #[test]
    fn test_gate_verdict_normalized_forces_proceed_false() {
        let verdict = GateVerdict {
            complete: false,
            proceed: true,
            blocking_issues: vec![],
            evidence: vec![],
            next_step: None,
        };
        let normalized = verdict.normalized();
        assert!(!normalized.proceed);
    }

    #[test]
    fn test_stage_display() {
        assert_eq!(Stage::Researcher.to_string(), "researcher");
        assert_eq!(Stage::Gatekeeper.to_string(), "gatekeeper");
    }

    #[test]
    fn test_draft_round_trip() {
        let draft = Draft {
            plain_text: "Jane Doe\nBackend Engineer".to_string(),
            rich_text: "<h1>Jane Doe</h1>".to_string(),
            change_log: vec!["Tightened summary".to_string()],
            meta: DraftMeta {
                round: 2,
                placeholders_used: 0,
                edits_applied: 3,
                edits_skipped: 1,
            },
        };
        let json = serde_json::to_string(&draft).unwrap();
        let back: Draft = serde_json::from_str(&json).unwrap();
        assert_eq!(back, draft);
    }
}
