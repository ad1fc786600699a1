//! Pipeline run state.
//!
//! [`PipelineState`] is owned exclusively by the orchestrator for the
//! duration of a run and externalized only through the continuation store.
//! The round counter starts at 1, increases monotonically, and is never
//! reset on resume.

use crate::artifact::{Checklist, Draft, Scorecard};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a resumed run should pick up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextStep {
    /// The Researcher has not run yet.
    Research,
    /// Write is pending for the saved round.
    WriteCritiqueLoop,
    /// A draft exists for the saved round; critique is pending.
    Critique,
    /// The run passed; only finalization remains.
    Finalize,
}

impl fmt::Display for NextStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NextStep::Research => "research",
            NextStep::WriteCritiqueLoop => "write_critique_loop",
            NextStep::Critique => "critique",
            NextStep::Finalize => "finalize",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for NextStep {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "research" => Ok(NextStep::Research),
            "write_critique_loop" => Ok(NextStep::WriteCritiqueLoop),
            "critique" => Ok(NextStep::Critique),
            "finalize" => Ok(NextStep::Finalize),
            _ => anyhow::bail!(
                "Invalid next step '{}'. Valid values: research, write_critique_loop, critique, finalize",
                s
            ),
        }
    }
}

/// The highest-scoring draft seen so far, kept for best-effort finalization
/// when the round budget runs out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestDraft {
    pub overall: u8,
    pub draft: Draft,
    pub scorecard: Scorecard,
}

/// Full state of one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    pub subject_id: String,
    pub target_role: String,
    /// The original document text; the ground truth every draft is judged
    /// against.
    pub source_text: String,
    #[serde(default)]
    pub location_hint: Option<String>,
    /// Current round, starting at 1. Monotonically increasing; continues
    /// from the saved value on resume.
    pub round: u32,
    #[serde(default)]
    pub checklist: Option<Checklist>,
    #[serde(default)]
    pub draft: Option<Draft>,
    #[serde(default)]
    pub scorecard: Option<Scorecard>,
    #[serde(default)]
    pub best: Option<BestDraft>,
}

impl PipelineState {
    /// Fresh state for a new run.
    pub fn new(
        subject_id: impl Into<String>,
        target_role: impl Into<String>,
        source_text: impl Into<String>,
        location_hint: Option<String>,
    ) -> Self {
        Self {
            subject_id: subject_id.into(),
            target_role: target_role.into(),
            source_text: source_text.into(),
            location_hint,
            round: 1,
            checklist: None,
            draft: None,
            scorecard: None,
            best: None,
        }
    }

    /// Record a scored draft, keeping it as best if it beats the incumbent.
    pub fn record_round(&mut self, draft: Draft, scorecard: Scorecard) {
        let beats_best = self
            .best
            .as_ref()
            .is_none_or(|b| scorecard.overall > b.overall);
        if beats_best {
            self.best = Some(BestDraft {
                overall: scorecard.overall,
                draft: draft.clone(),
                scorecard: scorecard.clone(),
            });
        }
        self.draft = Some(draft);
        self.scorecard = Some(scorecard);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{Decision, DraftMeta};

    fn draft(text: &str) -> Draft {
        Draft {
            plain_text: text.to_string(),
            rich_text: format!("<p>{}</p>", text),
            change_log: vec![],
            meta: DraftMeta::default(),
        }
    }

    fn scorecard(overall: u8) -> Scorecard {
        Scorecard {
            overall,
            truthfulness: 90,
            domain_compliance: 90,
            alignment: 90,
            clarity: 90,
            keyword_coverage: 90,
            decision: Decision::Revise,
            blocking_issues: vec![],
            non_blocking_issues: vec![],
            missing_sections: vec![],
            truth_violations: vec![],
            required_edits: vec![],
            data_requests: vec![],
            praise: vec![],
        }
    }

    #[test]
    fn test_next_step_round_trip() {
        for step in [
            NextStep::Research,
            NextStep::WriteCritiqueLoop,
            NextStep::Critique,
            NextStep::Finalize,
        ] {
            let parsed: NextStep = step.to_string().parse().unwrap();
            assert_eq!(parsed, step);
        }
        assert!("teleport".parse::<NextStep>().is_err());
    }

    #[test]
    fn test_new_state_starts_at_round_one() {
        let state = PipelineState::new("doc-1", "Backend Engineer", "source", None);
        assert_eq!(state.round, 1);
        assert!(state.checklist.is_none());
        assert!(state.best.is_none());
    }

    #[test]
    fn test_record_round_tracks_best() {
        let mut state = PipelineState::new("doc-1", "role", "source", None);
        state.record_round(draft("first"), scorecard(60));
        assert_eq!(state.best.as_ref().unwrap().overall, 60);

        state.record_round(draft("second"), scorecard(80));
        assert_eq!(state.best.as_ref().unwrap().overall, 80);
        assert_eq!(state.best.as_ref().unwrap().draft.plain_text, "second");

        // A worse round updates the current draft but not the best.
        state.record_round(draft("third"), scorecard(40));
        assert_eq!(state.best.as_ref().unwrap().overall, 80);
        assert_eq!(state.draft.as_ref().unwrap().plain_text, "third");
    }

    #[test]
    fn test_state_serialization_round_trip() {
        let mut state = PipelineState::new("doc-9", "Data Engineer", "text", Some("Berlin".into()));
        state.round = 4;
        state.record_round(draft("body"), scorecard(77));

        let json = serde_json::to_string(&state).unwrap();
        let back: PipelineState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }
}
