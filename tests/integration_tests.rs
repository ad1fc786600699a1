//! Integration tests for Anvil
//!
//! The pipeline scenarios run the real orchestrator against a scripted
//! model client, one queue of canned responses per stage. The CLI tests
//! exercise the binary surface.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use anvil::artifact::Stage;
use anvil::config::PipelineConfig;
use anvil::continuation::ContinuationStore;
use anvil::errors::ModelError;
use anvil::model::ModelClient;
use anvil::orchestrator::{NextStep, Orchestrator, PipelineState, RunOutcome, RunRequest};
use anvil::progress::{OverflowPolicy, PipelineEvent, ProgressEmitter};
use anvil::stages::{StageContracts, prompts};
use anvil::subject::MemorySubjectStore;

// =============================================================================
// Scripted model client
// =============================================================================

#[derive(Default)]
struct Script {
    researcher: VecDeque<Result<String, ModelError>>,
    writer: VecDeque<Result<String, ModelError>>,
    critic: VecDeque<Result<String, ModelError>>,
    gatekeeper: VecDeque<Result<String, ModelError>>,
}

/// Model client double that replays per-stage response queues and counts
/// invocations. Stages are identified by their bound system prompt.
#[derive(Default)]
struct ScriptedClient {
    script: std::sync::Mutex<Script>,
    researcher_calls: AtomicU32,
    writer_calls: AtomicU32,
    critic_calls: AtomicU32,
    gatekeeper_calls: AtomicU32,
}

impl ScriptedClient {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push(&self, stage: Stage, response: Result<String, ModelError>) {
        let mut script = self.script.lock().unwrap();
        match stage {
            Stage::Researcher => script.researcher.push_back(response),
            Stage::Writer => script.writer.push_back(response),
            Stage::Critic => script.critic.push_back(response),
            Stage::Gatekeeper => script.gatekeeper.push_back(response),
        }
    }

    fn push_ok(&self, stage: Stage, body: impl Into<String>) {
        self.push(stage, Ok(body.into()));
    }

    fn calls(&self, stage: Stage) -> u32 {
        match stage {
            Stage::Researcher => self.researcher_calls.load(Ordering::SeqCst),
            Stage::Writer => self.writer_calls.load(Ordering::SeqCst),
            Stage::Critic => self.critic_calls.load(Ordering::SeqCst),
            Stage::Gatekeeper => self.gatekeeper_calls.load(Ordering::SeqCst),
        }
    }

    fn stage_for(system: &str) -> Stage {
        if system == prompts::RESEARCHER_SYSTEM {
            Stage::Researcher
        } else if system == prompts::WRITER_SYSTEM {
            Stage::Writer
        } else if system == prompts::CRITIC_SYSTEM {
            Stage::Critic
        } else if system == prompts::GATEKEEPER_SYSTEM {
            Stage::Gatekeeper
        } else {
            panic!("unknown system prompt");
        }
    }
}

#[async_trait]
impl ModelClient for ScriptedClient {
    async fn invoke(&self, system: &str, _payload: &str, _: f32) -> Result<String, ModelError> {
        let stage = Self::stage_for(system);
        let mut script = self.script.lock().unwrap();
        let (queue, counter) = match stage {
            Stage::Researcher => (&mut script.researcher, &self.researcher_calls),
            Stage::Writer => (&mut script.writer, &self.writer_calls),
            Stage::Critic => (&mut script.critic, &self.critic_calls),
            Stage::Gatekeeper => (&mut script.gatekeeper, &self.gatekeeper_calls),
        };
        counter.fetch_add(1, Ordering::SeqCst);
        queue
            .pop_front()
            .unwrap_or_else(|| Err(ModelError::Other(format!("script exhausted for {}", stage))))
    }
}

// =============================================================================
// Fixtures and harness
// =============================================================================

fn checklist_json(sections: &[&str]) -> String {
    json!({
        "target_role": "Backend Engineer",
        "required_sections": sections,
        "keyword_clusters": [{"name": "languages", "priority": 1, "terms": ["Python"]}],
        "formatting_rules": [{"rule": "One page max", "severity": "recommended"}],
        "rejection_risks": [],
        "data_requests": []
    })
    .to_string()
}

fn draft_json(text: &str) -> String {
    json!({
        "plain_text": text,
        "rich_text": format!("<p>{}</p>", text),
        "change_log": ["rewrote for target role"],
        "meta": {"round": 1, "placeholders_used": 0, "edits_applied": 0, "edits_skipped": 0}
    })
    .to_string()
}

fn scorecard(overall: u8, truthfulness: u8, decision: &str) -> serde_json::Value {
    json!({
        "overall": overall,
        "truthfulness": truthfulness,
        "domain_compliance": 85,
        "alignment": 85,
        "clarity": 85,
        "keyword_coverage": 85,
        "decision": decision,
        "blocking_issues": [],
        "non_blocking_issues": [],
        "missing_sections": [],
        "truth_violations": [],
        "required_edits": [],
        "data_requests": [],
        "praise": []
    })
}

fn gate_verdict(complete: bool, proceed: bool) -> String {
    json!({
        "complete": complete,
        "continue": proceed,
        "blocking_issues": if complete { json!([]) } else { json!(["summary overstates scope"]) },
        "evidence": []
    })
    .to_string()
}

fn test_config() -> PipelineConfig {
    PipelineConfig {
        time_budget_secs: 300,
        ..Default::default()
    }
}

struct Harness {
    client: Arc<ScriptedClient>,
    continuations: ContinuationStore,
    subjects: Arc<MemorySubjectStore>,
    orchestrator: Orchestrator,
}

fn harness(config: PipelineConfig) -> Harness {
    let client = ScriptedClient::new();
    let continuations = ContinuationStore::in_memory().unwrap();
    let subjects = Arc::new(MemorySubjectStore::new());
    let orchestrator = Orchestrator::new(
        Arc::clone(&client) as Arc<dyn ModelClient>,
        StageContracts::default(),
        continuations.clone(),
        Arc::clone(&subjects) as Arc<dyn anvil::subject::SubjectStore>,
        config,
    );
    Harness {
        client,
        continuations,
        subjects,
        orchestrator,
    }
}

fn request(raw_text: &str) -> RunRequest {
    RunRequest {
        subject_id: "doc-1".to_string(),
        target_role: "Backend Engineer".to_string(),
        raw_text: Some(raw_text.to_string()),
        location_hint: None,
        continuation_id: None,
        manual_mode: false,
    }
}

async fn run_collect(
    orchestrator: &Orchestrator,
    req: RunRequest,
) -> (RunOutcome, Vec<PipelineEvent>) {
    let (emitter, mut rx) = ProgressEmitter::channel(256, OverflowPolicy::Block);
    let outcome = orchestrator.run(req, &emitter).await;
    drop(emitter);

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    (outcome, events)
}

fn count_matching(events: &[PipelineEvent], f: impl Fn(&PipelineEvent) -> bool) -> usize {
    events.iter().filter(|e| f(e)).count()
}

fn assert_single_terminal(events: &[PipelineEvent]) {
    let terminals = count_matching(events, |e| e.is_terminal());
    assert_eq!(terminals, 1, "expected exactly one terminal event: {:?}", events);
    assert!(
        events.last().is_some_and(|e| e.is_terminal()),
        "terminal event must be last: {:?}",
        events
    );
}

// =============================================================================
// End-to-end scenarios
// =============================================================================

mod scenarios {
    use super::*;

    /// Scenario A: round 1 misses a section, round 2 passes.
    #[tokio::test]
    async fn test_revise_then_pass_completes_after_two_rounds() {
        let h = harness(test_config());
        h.client.push_ok(
            Stage::Researcher,
            checklist_json(&["Header", "Summary", "Skills", "Experience", "Education"]),
        );
        h.client.push_ok(Stage::Writer, draft_json("Jane Doe, no education section"));
        let mut revise = scorecard(70, 95, "revise");
        revise["missing_sections"] = json!(["Education"]);
        h.client.push_ok(Stage::Critic, revise.to_string());
        h.client
            .push_ok(Stage::Writer, draft_json("Jane Doe, with Education"));
        h.client
            .push_ok(Stage::Critic, scorecard(95, 97, "pass").to_string());

        let (outcome, events) =
            run_collect(&h.orchestrator, request("Jane Doe, 5 years Python")).await;

        let artifact = match outcome {
            RunOutcome::Complete(artifact) => artifact,
            other => panic!("expected completion, got {:?}", other),
        };
        assert_eq!(artifact.rounds_completed, 2);
        assert_eq!(artifact.rendered_plain_text, "Jane Doe, with Education");

        assert_eq!(h.client.calls(Stage::Researcher), 1);
        assert_eq!(h.client.calls(Stage::Writer), 2);
        assert_eq!(h.client.calls(Stage::Critic), 2);

        // Exactly one revise gate event, then a pass.
        assert_eq!(
            count_matching(&events, |e| matches!(e, PipelineEvent::GateFail { .. })),
            1
        );
        assert_eq!(
            count_matching(&events, |e| matches!(e, PipelineEvent::GatePass { .. })),
            1
        );
        assert_single_terminal(&events);

        // The artifact was persisted exactly at finalize.
        assert!(h.subjects.artifact("doc-1").await.is_some());
    }

    /// Scenario B: critic stops for missing data; no further writer calls,
    /// and the halt carries the data request verbatim.
    #[tokio::test]
    async fn test_stop_data_needed_halts_without_more_writer_calls() {
        let h = harness(test_config());
        h.client
            .push_ok(Stage::Researcher, checklist_json(&["Header", "Summary"]));
        h.client.push_ok(Stage::Writer, draft_json("Jane Doe"));
        let mut stop = scorecard(50, 80, "stop_data_needed");
        stop["data_requests"] = json!(["Exact dates of employment at Acme Corp"]);
        h.client.push_ok(Stage::Critic, stop.to_string());

        let (outcome, events) = run_collect(&h.orchestrator, request("Jane Doe")).await;

        match &outcome {
            RunOutcome::Halted { details, .. } => {
                assert!(details.contains(&"Exact dates of employment at Acme Corp".to_string()));
            }
            other => panic!("expected halt, got {:?}", other),
        }
        assert_eq!(h.client.calls(Stage::Writer), 1);
        assert!(events.iter().any(|e| matches!(
            e,
            PipelineEvent::Halted { details, .. }
                if details.iter().any(|d| d == "Exact dates of employment at Acme Corp")
        )));
        assert_single_terminal(&events);
        assert!(h.subjects.artifact("doc-1").await.is_none());
    }

    /// Scenario C: rate limit on the researcher surfaces immediately.
    #[tokio::test]
    async fn test_rate_limit_fails_before_any_writer_call() {
        let h = harness(test_config());
        h.client.push(Stage::Researcher, Err(ModelError::RateLimited));

        let (outcome, events) = run_collect(&h.orchestrator, request("Jane Doe")).await;

        assert!(matches!(outcome, RunOutcome::Failed { .. }));
        assert_eq!(h.client.calls(Stage::Writer), 0);
        assert_eq!(h.client.calls(Stage::Critic), 0);
        assert!(matches!(events.last(), Some(PipelineEvent::Error { .. })));
        assert_single_terminal(&events);
    }

    #[tokio::test]
    async fn test_unfixable_truth_halts_with_violations() {
        let h = harness(test_config());
        h.client
            .push_ok(Stage::Researcher, checklist_json(&["Header"]));
        h.client.push_ok(Stage::Writer, draft_json("Jane Doe, CTO of Acme"));
        let mut stop = scorecard(40, 10, "stop_unfixable_truth");
        stop["truth_violations"] = json!([{
            "claim": "CTO of Acme",
            "reason": "source shows an internship only",
            "fix": null
        }]);
        h.client.push_ok(Stage::Critic, stop.to_string());

        let (outcome, _) = run_collect(&h.orchestrator, request("Jane Doe, intern at Acme")).await;

        match outcome {
            RunOutcome::Halted { details, .. } => {
                assert!(details.iter().any(|d| d.contains("CTO of Acme")));
            }
            other => panic!("expected halt, got {:?}", other),
        }
        assert_eq!(h.client.calls(Stage::Writer), 1);
    }
}

// =============================================================================
// Round budget, retries, and the quality gate
// =============================================================================

mod budgets_and_gates {
    use super::*;

    #[tokio::test]
    async fn test_loop_never_exceeds_max_rounds() {
        let config = PipelineConfig {
            max_rounds: 3,
            ..test_config()
        };
        let h = harness(config);
        h.client
            .push_ok(Stage::Researcher, checklist_json(&["Header"]));
        for round in 1..=3 {
            h.client
                .push_ok(Stage::Writer, draft_json(&format!("draft {}", round)));
            h.client
                .push_ok(Stage::Critic, scorecard(50, 95, "revise").to_string());
        }

        let (outcome, events) = run_collect(&h.orchestrator, request("Jane Doe")).await;

        // Budget exhausted: the best draft so far ships as-is.
        let artifact = match outcome {
            RunOutcome::Complete(artifact) => artifact,
            other => panic!("expected best-effort completion, got {:?}", other),
        };
        assert_eq!(artifact.rounds_completed, 3);
        assert_eq!(h.client.calls(Stage::Writer), 3);
        assert_eq!(
            count_matching(&events, |e| matches!(e, PipelineEvent::GateFail { .. })),
            3
        );
    }

    #[tokio::test]
    async fn test_best_scored_draft_wins_on_round_exhaustion() {
        let config = PipelineConfig {
            max_rounds: 3,
            ..test_config()
        };
        let h = harness(config);
        h.client
            .push_ok(Stage::Researcher, checklist_json(&["Header"]));
        h.client.push_ok(Stage::Writer, draft_json("mediocre"));
        h.client
            .push_ok(Stage::Critic, scorecard(55, 95, "revise").to_string());
        h.client.push_ok(Stage::Writer, draft_json("strongest"));
        h.client
            .push_ok(Stage::Critic, scorecard(80, 95, "revise").to_string());
        h.client.push_ok(Stage::Writer, draft_json("regression"));
        h.client
            .push_ok(Stage::Critic, scorecard(60, 95, "revise").to_string());

        let (outcome, _) = run_collect(&h.orchestrator, request("Jane Doe")).await;

        match outcome {
            RunOutcome::Complete(artifact) => {
                assert_eq!(artifact.rendered_plain_text, "strongest");
                assert_eq!(artifact.scorecard.overall, 80);
            }
            other => panic!("expected completion, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_schema_failure_retries_same_stage_then_recovers() {
        let h = harness(test_config());
        h.client
            .push_ok(Stage::Researcher, checklist_json(&["Header"]));
        h.client.push_ok(Stage::Writer, "this is not JSON at all");
        h.client.push_ok(Stage::Writer, draft_json("valid on retry"));
        h.client
            .push_ok(Stage::Critic, scorecard(95, 97, "pass").to_string());

        let (outcome, _) = run_collect(&h.orchestrator, request("Jane Doe")).await;

        assert!(matches!(outcome, RunOutcome::Complete(_)));
        assert_eq!(h.client.calls(Stage::Writer), 2);
    }

    #[tokio::test]
    async fn test_schema_retry_exhaustion_fails_without_fabrication() {
        let config = PipelineConfig {
            schema_retries: 1,
            ..test_config()
        };
        let h = harness(config);
        h.client
            .push_ok(Stage::Researcher, checklist_json(&["Header"]));
        h.client.push_ok(Stage::Writer, draft_json("draft"));
        h.client.push_ok(Stage::Critic, "garbage");
        h.client.push_ok(Stage::Critic, "more garbage");

        let (outcome, events) = run_collect(&h.orchestrator, request("Jane Doe")).await;

        match outcome {
            RunOutcome::Failed { message } => assert!(message.contains("critic")),
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(h.client.calls(Stage::Critic), 2);
        // No fabricated artifact reached the store.
        assert!(h.subjects.artifact("doc-1").await.is_none());
        assert_single_terminal(&events);
    }

    #[tokio::test]
    async fn test_declared_pass_failing_gate_is_downgraded() {
        let h = harness(test_config());
        h.client
            .push_ok(Stage::Researcher, checklist_json(&["Header", "Education"]));
        h.client.push_ok(Stage::Writer, draft_json("draft one"));
        // The critic says pass but admits a missing section; the policy
        // must not trust it.
        let mut lying_pass = scorecard(95, 97, "pass");
        lying_pass["missing_sections"] = json!(["Education"]);
        h.client.push_ok(Stage::Critic, lying_pass.to_string());
        h.client.push_ok(Stage::Writer, draft_json("draft two"));
        h.client
            .push_ok(Stage::Critic, scorecard(95, 97, "pass").to_string());

        let (outcome, events) = run_collect(&h.orchestrator, request("Jane Doe")).await;

        match outcome {
            RunOutcome::Complete(artifact) => assert_eq!(artifact.rounds_completed, 2),
            other => panic!("expected completion, got {:?}", other),
        }
        assert!(events.iter().any(|e| matches!(
            e,
            PipelineEvent::GateFail { round: 1, blocking }
                if blocking.iter().any(|b| b.contains("Education"))
        )));
    }

    #[tokio::test]
    async fn test_early_accept_above_threshold_despite_revise() {
        let h = harness(test_config());
        h.client
            .push_ok(Stage::Researcher, checklist_json(&["Header"]));
        h.client.push_ok(Stage::Writer, draft_json("nearly perfect"));
        h.client
            .push_ok(Stage::Critic, scorecard(98, 99, "revise").to_string());

        let (outcome, _) = run_collect(&h.orchestrator, request("Jane Doe")).await;

        match outcome {
            RunOutcome::Complete(artifact) => {
                assert_eq!(artifact.rounds_completed, 1);
                assert_eq!(artifact.scorecard.overall, 98);
            }
            other => panic!("expected early-accept completion, got {:?}", other),
        }
        assert_eq!(h.client.calls(Stage::Writer), 1);
    }

    #[tokio::test]
    async fn test_pass_with_truth_violations_never_completes_clean() {
        // Testable property: whenever a run completes through a pass, the
        // scorecard has no truth violations (the gate downgrades otherwise).
        let h = harness(test_config());
        h.client
            .push_ok(Stage::Researcher, checklist_json(&["Header"]));
        h.client.push_ok(Stage::Writer, draft_json("draft"));
        let mut tainted = scorecard(95, 97, "pass");
        tainted["truth_violations"] =
            json!([{"claim": "x", "reason": "unsupported", "fix": null}]);
        h.client.push_ok(Stage::Critic, tainted.to_string());
        h.client.push_ok(Stage::Writer, draft_json("clean draft"));
        h.client
            .push_ok(Stage::Critic, scorecard(95, 97, "pass").to_string());

        let (outcome, _) = run_collect(&h.orchestrator, request("Jane Doe")).await;

        match outcome {
            RunOutcome::Complete(artifact) => {
                assert!(artifact.scorecard.truth_violations.is_empty());
            }
            other => panic!("expected completion, got {:?}", other),
        }
    }
}

// =============================================================================
// Checkpoint and resume
// =============================================================================

mod checkpointing {
    use super::*;

    #[tokio::test]
    async fn test_zero_budget_checkpoints_before_first_write() {
        let config = PipelineConfig {
            time_budget_secs: 0,
            ..Default::default()
        };
        let h = harness(config);
        h.client
            .push_ok(Stage::Researcher, checklist_json(&["Header"]));

        let (outcome, events) = run_collect(&h.orchestrator, request("Jane Doe")).await;

        let continuation_id = match outcome {
            RunOutcome::Checkpointed { continuation_id } => continuation_id,
            other => panic!("expected checkpoint, got {:?}", other),
        };
        // The budget check precedes the expensive call.
        assert_eq!(h.client.calls(Stage::Writer), 0);
        assert!(events.iter().any(
            |e| matches!(e, PipelineEvent::Checkpointed { continuation_id: id } if *id == continuation_id)
        ));
        assert_single_terminal(&events);
    }

    #[tokio::test]
    async fn test_resume_completes_without_rerunning_research() {
        let config = PipelineConfig {
            time_budget_secs: 0,
            ..Default::default()
        };
        let h = harness(config);
        h.client
            .push_ok(Stage::Researcher, checklist_json(&["Header"]));

        let (outcome, _) = run_collect(&h.orchestrator, request("Jane Doe")).await;
        let continuation_id = match outcome {
            RunOutcome::Checkpointed { continuation_id } => continuation_id,
            other => panic!("expected checkpoint, got {:?}", other),
        };

        // Second invocation with a sane budget resumes from the loop.
        let resumed = Orchestrator::new(
            Arc::clone(&h.client) as Arc<dyn ModelClient>,
            StageContracts::default(),
            h.continuations.clone(),
            Arc::clone(&h.subjects) as Arc<dyn anvil::subject::SubjectStore>,
            test_config(),
        );
        h.client.push_ok(Stage::Writer, draft_json("resumed draft"));
        h.client
            .push_ok(Stage::Critic, scorecard(95, 97, "pass").to_string());

        let mut req = request("ignored on resume");
        req.raw_text = None;
        req.continuation_id = Some(continuation_id);
        let (outcome, _) = run_collect(&resumed, req).await;

        match outcome {
            RunOutcome::Complete(artifact) => {
                assert_eq!(artifact.rounds_completed, 1);
                assert_eq!(artifact.rendered_plain_text, "resumed draft");
            }
            other => panic!("expected completion, got {:?}", other),
        }
        // Research ran exactly once across both invocations.
        assert_eq!(h.client.calls(Stage::Researcher), 1);
    }

    #[tokio::test]
    async fn test_resume_continues_round_counter() {
        let h = harness(test_config());

        // Save a continuation frozen at round 3, as if two rounds already ran.
        let mut state = PipelineState::new("doc-1", "Backend Engineer", "Jane Doe", None);
        state.round = 3;
        state.checklist = Some(
            serde_json::from_str(&checklist_json(&["Header"])).unwrap(),
        );
        let continuation_id = h
            .continuations
            .save(
                "doc-1".to_string(),
                NextStep::WriteCritiqueLoop,
                state,
                Duration::from_secs(600),
            )
            .await
            .unwrap();

        h.client.push_ok(Stage::Writer, draft_json("round three draft"));
        h.client
            .push_ok(Stage::Critic, scorecard(95, 97, "pass").to_string());

        let mut req = request("ignored");
        req.raw_text = None;
        req.continuation_id = Some(continuation_id);
        let (outcome, events) = run_collect(&h.orchestrator, req).await;

        match outcome {
            RunOutcome::Complete(artifact) => assert_eq!(artifact.rounds_completed, 3),
            other => panic!("expected completion, got {:?}", other),
        }
        // The writer event carries the resumed round, not round 1.
        assert!(events.iter().any(|e| matches!(
            e,
            PipelineEvent::StageDone { stage: Stage::Writer, round: Some(3), .. }
        )));
        assert!(!events.iter().any(|e| matches!(
            e,
            PipelineEvent::StageDone { stage: Stage::Writer, round: Some(1), .. }
        )));
    }

    #[tokio::test]
    async fn test_consumed_continuation_cannot_be_resumed_twice() {
        let h = harness(test_config());
        let mut state = PipelineState::new("doc-1", "Backend Engineer", "Jane Doe", None);
        state.checklist = Some(
            serde_json::from_str(&checklist_json(&["Header"])).unwrap(),
        );
        let continuation_id = h
            .continuations
            .save(
                "doc-1".to_string(),
                NextStep::WriteCritiqueLoop,
                state,
                Duration::from_secs(600),
            )
            .await
            .unwrap();

        h.client.push_ok(Stage::Writer, draft_json("draft"));
        h.client
            .push_ok(Stage::Critic, scorecard(95, 97, "pass").to_string());

        let mut req = request("ignored");
        req.raw_text = None;
        req.continuation_id = Some(continuation_id.clone());
        let (first, _) = run_collect(&h.orchestrator, req.clone()).await;
        assert!(matches!(first, RunOutcome::Complete(_)));

        let (second, events) = run_collect(&h.orchestrator, req).await;
        match second {
            RunOutcome::Failed { message } => assert!(message.contains("consumed")),
            other => panic!("expected failure on double resume, got {:?}", other),
        }
        assert!(matches!(events.last(), Some(PipelineEvent::Error { .. })));
    }

    #[tokio::test]
    async fn test_fresh_run_invalidates_pending_continuation() {
        let config = PipelineConfig {
            time_budget_secs: 0,
            ..Default::default()
        };
        let h = harness(config);
        h.client
            .push_ok(Stage::Researcher, checklist_json(&["Header"]));
        let (outcome, _) = run_collect(&h.orchestrator, request("Jane Doe")).await;
        let stale_id = match outcome {
            RunOutcome::Checkpointed { continuation_id } => continuation_id,
            other => panic!("expected checkpoint, got {:?}", other),
        };

        // A fresh run for the same subject cancels the pending continuation.
        let fresh = Orchestrator::new(
            Arc::clone(&h.client) as Arc<dyn ModelClient>,
            StageContracts::default(),
            h.continuations.clone(),
            Arc::clone(&h.subjects) as Arc<dyn anvil::subject::SubjectStore>,
            test_config(),
        );
        h.client
            .push_ok(Stage::Researcher, checklist_json(&["Header"]));
        h.client.push_ok(Stage::Writer, draft_json("fresh draft"));
        h.client
            .push_ok(Stage::Critic, scorecard(95, 97, "pass").to_string());
        let (outcome, _) = run_collect(&fresh, request("Jane Doe")).await;
        assert!(matches!(outcome, RunOutcome::Complete(_)));

        // The stale continuation is no longer redeemable.
        let mut req = request("ignored");
        req.raw_text = None;
        req.continuation_id = Some(stale_id);
        let (outcome, _) = run_collect(&fresh, req).await;
        match outcome {
            RunOutcome::Failed { message } => assert!(message.contains("expired")),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_manual_mode_pauses_after_research() {
        let h = harness(test_config());
        h.client
            .push_ok(Stage::Researcher, checklist_json(&["Header"]));

        let mut req = request("Jane Doe");
        req.manual_mode = true;
        let (outcome, events) = run_collect(&h.orchestrator, req).await;

        let continuation_id = match outcome {
            RunOutcome::AwaitingContinue { continuation_id } => continuation_id,
            other => panic!("expected manual pause, got {:?}", other),
        };
        assert_eq!(h.client.calls(Stage::Writer), 0);
        assert!(events.iter().any(|e| matches!(
            e,
            PipelineEvent::AwaitUserContinue { continuation_id: id } if *id == continuation_id
        )));

        // Resuming drives the loop to completion.
        h.client.push_ok(Stage::Writer, draft_json("after pause"));
        h.client
            .push_ok(Stage::Critic, scorecard(95, 97, "pass").to_string());
        let mut resume = request("ignored");
        resume.raw_text = None;
        resume.continuation_id = Some(continuation_id);
        let (outcome, _) = run_collect(&h.orchestrator, resume).await;
        assert!(matches!(outcome, RunOutcome::Complete(_)));
        assert_eq!(h.client.calls(Stage::Researcher), 1);
    }
}

// =============================================================================
// Gatekeeper
// =============================================================================

mod gatekeeper {
    use super::*;

    fn gated_config() -> PipelineConfig {
        PipelineConfig {
            gatekeeper: true,
            ..test_config()
        }
    }

    #[tokio::test]
    async fn test_gatekeeper_confirms_pass() {
        let h = harness(gated_config());
        h.client
            .push_ok(Stage::Researcher, checklist_json(&["Header"]));
        h.client.push_ok(Stage::Writer, draft_json("final draft"));
        h.client
            .push_ok(Stage::Critic, scorecard(95, 97, "pass").to_string());
        h.client.push_ok(Stage::Gatekeeper, gate_verdict(true, true));

        let (outcome, events) = run_collect(&h.orchestrator, request("Jane Doe")).await;

        assert!(matches!(outcome, RunOutcome::Complete(_)));
        assert_eq!(h.client.calls(Stage::Gatekeeper), 1);
        assert_eq!(
            count_matching(&events, |e| matches!(e, PipelineEvent::GatePass { .. })),
            1
        );
    }

    #[tokio::test]
    async fn test_malformed_gatekeeper_output_never_forces_a_pass() {
        let config = PipelineConfig {
            schema_retries: 1,
            ..gated_config()
        };
        let h = harness(config);
        h.client
            .push_ok(Stage::Researcher, checklist_json(&["Header"]));
        h.client.push_ok(Stage::Writer, draft_json("draft"));
        h.client
            .push_ok(Stage::Critic, scorecard(95, 97, "pass").to_string());
        h.client.push_ok(Stage::Gatekeeper, "not a verdict");
        h.client.push_ok(Stage::Gatekeeper, "still not a verdict");

        let (outcome, events) = run_collect(&h.orchestrator, request("Jane Doe")).await;

        // The run halts with an error or retries; it never proceeds.
        assert!(matches!(outcome, RunOutcome::Failed { .. }));
        assert_eq!(h.client.calls(Stage::Gatekeeper), 2);
        assert!(
            !events
                .iter()
                .any(|e| matches!(e, PipelineEvent::Complete { .. }))
        );
        assert!(h.subjects.artifact("doc-1").await.is_none());
    }

    #[tokio::test]
    async fn test_gatekeeper_incomplete_verdict_triggers_another_round() {
        let h = harness(gated_config());
        h.client
            .push_ok(Stage::Researcher, checklist_json(&["Header"]));
        h.client.push_ok(Stage::Writer, draft_json("draft one"));
        h.client
            .push_ok(Stage::Critic, scorecard(95, 97, "pass").to_string());
        h.client.push_ok(Stage::Gatekeeper, gate_verdict(false, false));
        h.client.push_ok(Stage::Writer, draft_json("draft two"));
        h.client
            .push_ok(Stage::Critic, scorecard(96, 97, "pass").to_string());
        h.client.push_ok(Stage::Gatekeeper, gate_verdict(true, true));

        let (outcome, events) = run_collect(&h.orchestrator, request("Jane Doe")).await;

        match outcome {
            RunOutcome::Complete(artifact) => assert_eq!(artifact.rounds_completed, 2),
            other => panic!("expected completion, got {:?}", other),
        }
        assert_eq!(
            count_matching(&events, |e| matches!(e, PipelineEvent::GateFail { .. })),
            1
        );
    }
}

// =============================================================================
// CLI surface
// =============================================================================

mod cli_basics {
    use assert_cmd::Command;
    use assert_cmd::cargo::cargo_bin_cmd;
    use predicates::prelude::*;
    use tempfile::TempDir;

    fn anvil() -> Command {
        cargo_bin_cmd!("anvil")
    }

    #[test]
    fn test_anvil_help() {
        anvil().arg("--help").assert().success();
    }

    #[test]
    fn test_anvil_version() {
        anvil().arg("--version").assert().success();
    }

    #[test]
    fn test_config_init_creates_file() {
        let dir = TempDir::new().unwrap();
        anvil()
            .current_dir(dir.path())
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Wrote default configuration"));
        assert!(dir.path().join(".anvil/anvil.toml").exists());
    }

    #[test]
    fn test_config_init_refuses_overwrite() {
        let dir = TempDir::new().unwrap();
        anvil()
            .current_dir(dir.path())
            .args(["config", "init"])
            .assert()
            .success();
        anvil()
            .current_dir(dir.path())
            .args(["config", "init"])
            .assert()
            .failure();
    }

    #[test]
    fn test_config_show_without_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        anvil()
            .current_dir(dir.path())
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("max_rounds"));
    }

    #[test]
    fn test_config_validate_default() {
        let dir = TempDir::new().unwrap();
        anvil()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("valid"));
    }

    #[test]
    fn test_run_missing_input_file_fails() {
        let dir = TempDir::new().unwrap();
        anvil()
            .current_dir(dir.path())
            .args(["run", "does-not-exist.txt", "--role", "Backend Engineer"])
            .assert()
            .failure();
    }

    #[test]
    fn test_run_empty_input_fails() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("empty.txt"), "   \n").unwrap();
        anvil()
            .current_dir(dir.path())
            .args(["run", "empty.txt", "--role", "Backend Engineer"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("empty"));
    }
}
