//! Decision policy over Critic scorecards.
//!
//! The Critic declares a decision, but the orchestrator never trusts a single
//! unverified signal for termination: a declared `pass` is cross-checked
//! against the numeric quality gate and downgraded to `revise` when it fails.
//! Stops and revisions pass through unchanged — the policy only ever makes
//! the pipeline more conservative, never less.

use crate::artifact::{Decision, Scorecard};
use serde::{Deserialize, Serialize};

/// The numeric quality gate a passing round must clear.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QualityGate {
    /// Minimum acceptable overall score.
    #[serde(default = "default_min_overall")]
    pub min_overall: u8,
    /// Minimum acceptable truthfulness score.
    #[serde(default = "default_min_truthfulness")]
    pub min_truthfulness: u8,
}

fn default_min_overall() -> u8 {
    90
}

fn default_min_truthfulness() -> u8 {
    92
}

impl Default for QualityGate {
    fn default() -> Self {
        Self {
            min_overall: default_min_overall(),
            min_truthfulness: default_min_truthfulness(),
        }
    }
}

/// The policy's resolved decision for a round.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyVerdict {
    pub decision: Decision,
    /// True when a Critic-declared `pass` was downgraded to `revise`.
    pub downgraded: bool,
    /// The specific gate checks that failed, for the progress stream.
    pub failures: Vec<String>,
}

/// Check a scorecard against the quality gate, returning every failure.
pub fn gate_failures(scorecard: &Scorecard, gate: &QualityGate) -> Vec<String> {
    let mut failures = Vec::new();

    if !scorecard.truth_violations.is_empty() {
        failures.push(format!(
            "{} unresolved truth violation(s)",
            scorecard.truth_violations.len()
        ));
    }
    if !scorecard.missing_sections.is_empty() {
        failures.push(format!(
            "missing required section(s): {}",
            scorecard.missing_sections.join(", ")
        ));
    }
    if scorecard.overall < gate.min_overall {
        failures.push(format!(
            "overall score {} below minimum {}",
            scorecard.overall, gate.min_overall
        ));
    }
    if scorecard.truthfulness < gate.min_truthfulness {
        failures.push(format!(
            "truthfulness score {} below minimum {}",
            scorecard.truthfulness, gate.min_truthfulness
        ));
    }

    failures
}

/// Map a scorecard to the pipeline decision.
///
/// Pure function of its inputs; the orchestrator switches on the result.
pub fn decide(scorecard: &Scorecard, gate: &QualityGate) -> PolicyVerdict {
    match scorecard.decision {
        Decision::Pass => {
            let failures = gate_failures(scorecard, gate);
            if failures.is_empty() {
                PolicyVerdict {
                    decision: Decision::Pass,
                    downgraded: false,
                    failures,
                }
            } else {
                PolicyVerdict {
                    decision: Decision::Revise,
                    downgraded: true,
                    failures,
                }
            }
        }
        declared => PolicyVerdict {
            decision: declared,
            downgraded: false,
            failures: gate_failures(scorecard, gate),
        },
    }
}
