//! Prompt templates for the pipeline stages.
//!
//! Each stage's system prompt is a pure, stateless template bound into a
//! [`StageContract`](super::StageContract) at construction. Payload builders
//! assemble the per-call input from the artifacts the stage consumes.
//!
//! Every prompt demands a single JSON object back and names the exact
//! fields, because the schema validator rejects anything else and a rejected
//! response costs a full model round trip.

use crate::artifact::{Checklist, Draft, Scorecard};

pub const RESEARCHER_SYSTEM: &str = r#"You are a hiring-domain researcher. Given a target role and a source document, produce the requirements checklist a revised document must satisfy.

You MUST respond with valid JSON only (no markdown, no explanation) matching this schema:
{
  "target_role": "the role, normalized",
  "required_sections": ["Header", "Summary", "..."],
  "keyword_clusters": [
    {"name": "cluster name", "priority": 1, "terms": ["term", "..."]}
  ],
  "formatting_rules": [
    {"rule": "description", "severity": "required" | "recommended" | "optional"}
  ],
  "rejection_risks": ["patterns that get documents rejected for this role"],
  "data_requests": ["facts the source does not provide but the role needs"]
}

Rules:
- required_sections is ordered; the document must contain them in that order.
- Lower priority numbers are more important.
- Only list data_requests for facts that genuinely block the rewrite.
- If the source text is empty or unusable, respond with {"error": {"code": "missing_input", "message": "..."}} instead.
"#;

pub const WRITER_SYSTEM: &str = r#"You are a document writer. Rewrite the source document for the target role so that it satisfies the checklist. Every claim in your draft MUST be supported by the source document — never invent facts, dates, employers, or credentials.

You MUST respond with valid JSON only matching this schema:
{
  "plain_text": "the full revised document as plain text",
  "rich_text": "the same document as minimal HTML",
  "change_log": ["one entry per meaningful change"],
  "meta": {"round": 1, "placeholders_used": 0, "edits_applied": 0, "edits_skipped": 0}
}

Rules:
- Include every required section from the checklist, in order.
- Work in keyword cluster terms only where the source supports them.
- When a required fact is missing, insert an explicit [PLACEHOLDER: what is needed] and count it in meta.placeholders_used.
- When critic edits are provided, apply each one or record it as skipped in the change log with a reason; count both in meta.
"#;

pub const CRITIC_SYSTEM: &str = r#"You are an adversarial reviewer. Evaluate the draft against the checklist and the ORIGINAL source document. Your job is to find problems, not to be agreeable. Assume the writer has overclaimed until the source proves otherwise.

You MUST respond with valid JSON only matching this schema:
{
  "overall": 0-100,
  "truthfulness": 0-100,
  "domain_compliance": 0-100,
  "alignment": 0-100,
  "clarity": 0-100,
  "keyword_coverage": 0-100,
  "decision": "pass" | "revise" | "stop_data_needed" | "stop_unfixable_truth",
  "blocking_issues": ["..."],
  "non_blocking_issues": ["..."],
  "missing_sections": ["required sections absent from the draft"],
  "truth_violations": [
    {"claim": "the unsupported claim", "reason": "why the source does not support it", "fix": "suggested correction"}
  ],
  "required_edits": [
    {"kind": "remove" | "replace" | "add" | "rewrite", "before": "...", "after": "...", "location": "where"}
  ],
  "data_requests": ["facts needed from the user before the draft can improve"],
  "praise": ["passages the next round must preserve"]
}

Rules:
- decision "pass" requires: zero truth violations, zero missing sections, and no blocking issues.
- decision "stop_data_needed" when no rewrite can succeed without facts the user has not provided; list them in data_requests.
- decision "stop_unfixable_truth" when the draft's central claims cannot be grounded in the source at all.
- Otherwise decision "revise" with concrete required_edits.
"#;

pub const GATEKEEPER_SYSTEM: &str = r#"You are the final gatekeeper. A draft has passed critique; independently verify that it is complete and safe to publish.

You MUST respond with valid JSON only matching this schema:
{
  "complete": true | false,
  "continue": true | false,
  "blocking_issues": ["..."],
  "evidence": ["observations supporting the verdict"],
  "next_step": "optional name of the step that should run next"
}

Rules:
- "continue": true is permitted ONLY when "complete" is true.
- When uncertain, set both to false and say why in blocking_issues.
"#;

fn to_pretty_json<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string())
}

/// Build the Researcher payload from the run input.
pub fn build_researcher_payload(
    target_role: &str,
    source_text: &str,
    location_hint: Option<&str>,
) -> String {
    let mut payload = format!(
        "## Target Role\n{}\n\n## Source Document\n{}\n",
        target_role, source_text
    );
    if let Some(location) = location_hint {
        payload.push_str(&format!("\n## Location\n{}\n", location));
    }
    payload
}

/// Build the Writer payload for one round.
///
/// Round 1 sees only the checklist and source; later rounds also carry the
/// previous draft and the Critic's scorecard so edits can be applied.
pub fn build_writer_payload(
    checklist: &Checklist,
    source_text: &str,
    round: u32,
    previous: Option<(&Draft, &Scorecard)>,
) -> String {
    let mut payload = format!(
        "## Round\n{}\n\n## Checklist\n{}\n\n## Source Document\n{}\n",
        round,
        to_pretty_json(checklist),
        source_text
    );

    if let Some((draft, scorecard)) = previous {
        payload.push_str(&format!(
            "\n## Previous Draft\n{}\n\n## Critic Scorecard\n{}\n\nApply the required edits, fix every truth violation and missing section, and preserve the praised passages.\n",
            draft.plain_text,
            to_pretty_json(scorecard)
        ));
    }

    payload
}

/// Build the Critic payload for one round.
pub fn build_critic_payload(
    checklist: &Checklist,
    source_text: &str,
    draft: &Draft,
    round: u32,
) -> String {
    format!(
        "## Round\n{}\n\n## Checklist\n{}\n\n## Original Source Document\n{}\n\n## Draft Under Review\n{}\n",
        round,
        to_pretty_json(checklist),
        source_text,
        draft.plain_text
    )
}

/// Build the Gatekeeper payload over a passing round.
pub fn build_gatekeeper_payload(
    checklist: &Checklist,
    draft: &Draft,
    scorecard: &Scorecard,
) -> String {
    format!(
        "## Checklist\n{}\n\n## Final Draft\n{}\n\n## Critic Scorecard\n{}\n",
        to_pretty_json(checklist),
        draft.plain_text,
        to_pretty_json(scorecard)
    )
}
