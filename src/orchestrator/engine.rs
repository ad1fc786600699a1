//! The pipeline state machine.
//!
//! One run walks `INIT → RESEARCH → WRITE(r) → CRITIQUE(r) → DECISION(r)`
//! and loops the write/critique pair until the decision policy ends it. The
//! orchestrator owns all retry, budget, and checkpoint decisions; stages and
//! the model client stay policy-free.
//!
//! Terminal outcomes and their side effects:
//! - `Complete` — the artifact was persisted via the subject store
//! - `Checkpointed` / `AwaitingContinue` — state was saved as a continuation
//! - `Halted` / `Failed` — nothing was persisted
//!
//! Each side effect happens at most once per run; there is no rollback.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::de::DeserializeOwned;
use tracing::{info, warn};

use crate::artifact::{
    Checklist, Decision, Draft, GateVerdict, OptimizedArtifact, Scorecard, Stage,
};
use crate::config::PipelineConfig;
use crate::continuation::ContinuationStore;
use crate::errors::{PipelineError, SchemaError};
use crate::model::ModelClient;
use crate::orchestrator::state::{NextStep, PipelineState};
use crate::policy;
use crate::progress::{PipelineEvent, ProgressEmitter};
use crate::schema::StageParseError;
use crate::stages::{StageContract, StageContracts, prompts};
use crate::subject::SubjectStore;

/// A request to run (or resume) the pipeline for one subject.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub subject_id: String,
    pub target_role: String,
    /// Inline source text. When absent, the subject store must resolve it.
    pub raw_text: Option<String>,
    pub location_hint: Option<String>,
    /// Resume from a previously saved continuation.
    pub continuation_id: Option<String>,
    /// Pause for user confirmation between stages.
    pub manual_mode: bool,
}

/// How a run ended. Mirrors the terminal event already emitted.
#[derive(Debug)]
pub enum RunOutcome {
    Complete(Box<OptimizedArtifact>),
    Halted { reason: String, details: Vec<String> },
    Checkpointed { continuation_id: String },
    AwaitingContinue { continuation_id: String },
    Failed { message: String },
}

/// What the Gatekeeper decided about a passing round.
enum GateOutcome {
    Proceed,
    Revise(Vec<String>),
    Blocked(Vec<String>),
}

/// Drives one pipeline run end to end.
pub struct Orchestrator {
    client: Arc<dyn ModelClient>,
    contracts: StageContracts,
    continuations: ContinuationStore,
    subjects: Arc<dyn SubjectStore>,
    config: PipelineConfig,
}

impl Orchestrator {
    pub fn new(
        client: Arc<dyn ModelClient>,
        contracts: StageContracts,
        continuations: ContinuationStore,
        subjects: Arc<dyn SubjectStore>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            client,
            contracts,
            continuations,
            subjects,
            config,
        }
    }

    /// Run the pipeline, emitting events as it goes.
    ///
    /// Every path emits exactly one terminal event; the returned outcome
    /// mirrors it.
    pub async fn run(&self, request: RunRequest, emitter: &ProgressEmitter) -> RunOutcome {
        match self.drive(request, emitter).await {
            Ok(outcome) => outcome,
            Err(err) => {
                let message = err.to_string();
                warn!(%message, "pipeline run failed");
                emitter
                    .emit(PipelineEvent::Error {
                        message: message.clone(),
                    })
                    .await;
                RunOutcome::Failed { message }
            }
        }
    }

    async fn drive(
        &self,
        request: RunRequest,
        emitter: &ProgressEmitter,
    ) -> Result<RunOutcome, PipelineError> {
        let started = Instant::now();

        let (mut state, mut step) = match &request.continuation_id {
            Some(id) => {
                let loaded = self
                    .continuations
                    .load(id.clone(), request.subject_id.clone())
                    .await?;
                info!(
                    continuation_id = %id,
                    round = loaded.state.round,
                    next_step = %loaded.next_step,
                    "resuming from continuation"
                );
                (loaded.state, loaded.next_step)
            }
            None => {
                let source_text = self.resolve_source_text(&request).await?;
                // One active run per subject: a fresh start cancels any
                // pending continuation so two writers cannot race.
                self.continuations
                    .invalidate_subject(request.subject_id.clone())
                    .await?;
                let state = PipelineState::new(
                    request.subject_id.clone(),
                    request.target_role.clone(),
                    source_text,
                    request.location_hint.clone(),
                );
                (state, NextStep::Research)
            }
        };

        if step == NextStep::Research {
            emitter
                .emit(PipelineEvent::Progress {
                    stage: Stage::Researcher,
                    message: format!("Deriving requirements for {}", state.target_role),
                })
                .await;

            let payload = prompts::build_researcher_payload(
                &state.target_role,
                &state.source_text,
                state.location_hint.as_deref(),
            );
            let checklist: Checklist = self
                .execute_stage(&self.contracts.researcher, &payload)
                .await?;

            emitter
                .emit(PipelineEvent::StageDone {
                    stage: Stage::Researcher,
                    round: None,
                    summary: format!(
                        "Checklist with {} required sections, {} keyword clusters",
                        checklist.required_sections.len(),
                        checklist.keyword_clusters.len()
                    ),
                })
                .await;

            state.checklist = Some(checklist);
            step = NextStep::WriteCritiqueLoop;

            if request.manual_mode {
                return self.pause_for_user(state, step, emitter).await;
            }
        }

        if step == NextStep::Finalize {
            return self.finalize(state, emitter).await;
        }

        let checklist = state
            .checklist
            .clone()
            .ok_or_else(|| anyhow::anyhow!("pipeline state has no checklist"))?;

        loop {
            if step != NextStep::Critique {
                // Budget check happens before the expensive call, never
                // after a half-completed one.
                if started.elapsed() >= self.config.time_budget() {
                    return self
                        .checkpoint(state, NextStep::WriteCritiqueLoop, emitter)
                        .await;
                }

                emitter
                    .emit(PipelineEvent::Progress {
                        stage: Stage::Writer,
                        message: format!("Writing draft, round {}", state.round),
                    })
                    .await;

                let payload = {
                    let previous = match (&state.draft, &state.scorecard) {
                        (Some(draft), Some(scorecard)) => Some((draft, scorecard)),
                        _ => None,
                    };
                    prompts::build_writer_payload(
                        &checklist,
                        &state.source_text,
                        state.round,
                        previous,
                    )
                };
                let draft: Draft = self.execute_stage(&self.contracts.writer, &payload).await?;

                emitter
                    .emit(PipelineEvent::StageDone {
                        stage: Stage::Writer,
                        round: Some(state.round),
                        summary: format!(
                            "Draft with {} change log entries",
                            draft.change_log.len()
                        ),
                    })
                    .await;

                state.draft = Some(draft);
                step = NextStep::Critique;
            }

            if started.elapsed() >= self.config.time_budget() {
                return self.checkpoint(state, NextStep::Critique, emitter).await;
            }

            emitter
                .emit(PipelineEvent::Progress {
                    stage: Stage::Critic,
                    message: format!("Critiquing draft, round {}", state.round),
                })
                .await;

            let draft = state
                .draft
                .clone()
                .ok_or_else(|| anyhow::anyhow!("pipeline state has no draft to critique"))?;
            let payload =
                prompts::build_critic_payload(&checklist, &state.source_text, &draft, state.round);
            let scorecard: Scorecard = self.execute_stage(&self.contracts.critic, &payload).await?;

            emitter
                .emit(PipelineEvent::StageDone {
                    stage: Stage::Critic,
                    round: Some(state.round),
                    summary: format!(
                        "overall {}, truthfulness {}, decision {}",
                        scorecard.overall, scorecard.truthfulness, scorecard.decision
                    ),
                })
                .await;

            let verdict = policy::decide(&scorecard, &self.config.quality);
            if verdict.downgraded {
                warn!(
                    round = state.round,
                    failures = ?verdict.failures,
                    "critic declared pass but quality gate failed; downgraded to revise"
                );
            }
            state.record_round(draft, scorecard.clone());

            match verdict.decision {
                Decision::Pass => {
                    if self.config.gatekeeper {
                        match self.run_gatekeeper(&mut state, &checklist, emitter).await? {
                            GateOutcome::Proceed => {
                                emitter
                                    .emit(PipelineEvent::GatePass { round: state.round })
                                    .await;
                                return self.finalize(state, emitter).await;
                            }
                            GateOutcome::Revise(issues) => {
                                emitter
                                    .emit(PipelineEvent::GateFail {
                                        round: state.round,
                                        blocking: issues.clone(),
                                    })
                                    .await;
                                if state.round >= self.config.max_rounds {
                                    return self.finalize_best(state, emitter).await;
                                }
                                if let Some(card) = state.scorecard.as_mut() {
                                    card.blocking_issues.extend(issues);
                                }
                                state.round += 1;
                                step = NextStep::WriteCritiqueLoop;
                                if request.manual_mode {
                                    return self.pause_for_user(state, step, emitter).await;
                                }
                                continue;
                            }
                            GateOutcome::Blocked(issues) => {
                                emitter
                                    .emit(PipelineEvent::GateBlocked {
                                        round: state.round,
                                        reason: "gatekeeper refused to continue".to_string(),
                                    })
                                    .await;
                                let reason =
                                    "The gatekeeper found the draft complete but blocked publication"
                                        .to_string();
                                emitter
                                    .emit(PipelineEvent::Halted {
                                        reason: reason.clone(),
                                        details: issues.clone(),
                                    })
                                    .await;
                                return Ok(RunOutcome::Halted {
                                    reason,
                                    details: issues,
                                });
                            }
                        }
                    }

                    emitter
                        .emit(PipelineEvent::GatePass { round: state.round })
                        .await;
                    return self.finalize(state, emitter).await;
                }
                Decision::Revise => {
                    if scorecard.overall >= self.config.early_accept_overall {
                        // Accept-best-effort: good enough to ship, logged as
                        // non-ideal because the critic still wanted changes.
                        warn!(
                            round = state.round,
                            overall = scorecard.overall,
                            threshold = self.config.early_accept_overall,
                            "early-accepting draft above threshold despite revise decision"
                        );
                        emitter
                            .emit(PipelineEvent::GatePass { round: state.round })
                            .await;
                        return self.finalize(state, emitter).await;
                    }

                    emitter
                        .emit(PipelineEvent::GateFail {
                            round: state.round,
                            blocking: verdict.failures.clone(),
                        })
                        .await;

                    if state.round >= self.config.max_rounds {
                        info!(
                            max_rounds = self.config.max_rounds,
                            "round budget exhausted; finalizing best draft"
                        );
                        return self.finalize_best(state, emitter).await;
                    }

                    state.round += 1;
                    step = NextStep::WriteCritiqueLoop;
                    if request.manual_mode {
                        return self.pause_for_user(state, step, emitter).await;
                    }
                }
                Decision::StopDataNeeded => {
                    emitter
                        .emit(PipelineEvent::GateBlocked {
                            round: state.round,
                            reason: "required data missing".to_string(),
                        })
                        .await;
                    let reason =
                        "The document cannot improve without additional information".to_string();
                    let details = scorecard.data_requests.clone();
                    emitter
                        .emit(PipelineEvent::Halted {
                            reason: reason.clone(),
                            details: details.clone(),
                        })
                        .await;
                    return Ok(RunOutcome::Halted { reason, details });
                }
                Decision::StopUnfixableTruth => {
                    emitter
                        .emit(PipelineEvent::GateBlocked {
                            round: state.round,
                            reason: "unfixable truth violations".to_string(),
                        })
                        .await;
                    let reason =
                        "The draft's claims cannot be grounded in the source document".to_string();
                    let details: Vec<String> = scorecard
                        .truth_violations
                        .iter()
                        .map(|v| format!("{}: {}", v.claim, v.reason))
                        .collect();
                    emitter
                        .emit(PipelineEvent::Halted {
                            reason: reason.clone(),
                            details: details.clone(),
                        })
                        .await;
                    return Ok(RunOutcome::Halted { reason, details });
                }
            }
        }
    }

    /// Resolve the source text from the request or the subject store.
    async fn resolve_source_text(&self, request: &RunRequest) -> Result<String, PipelineError> {
        if let Some(text) = &request.raw_text
            && !text.trim().is_empty()
        {
            return Ok(text.clone());
        }

        let subject = self
            .subjects
            .load_subject(&request.subject_id)
            .await
            .map_err(PipelineError::Store)?;

        match subject {
            Some(s) if !s.raw_text.trim().is_empty() => Ok(s.raw_text),
            _ => Err(PipelineError::Other(anyhow::anyhow!(
                "no usable input text for subject '{}': provide raw text or upload the document first",
                request.subject_id
            ))),
        }
    }

    /// Invoke one stage with bounded same-payload retries on schema failures.
    ///
    /// Model failures and stage-declared errors surface immediately; only
    /// extraction/validation failures are retried, and exhausting the budget
    /// fails the run rather than fabricating a default artifact.
    async fn execute_stage<T: DeserializeOwned>(
        &self,
        contract: &StageContract,
        payload: &str,
    ) -> Result<T, PipelineError> {
        let attempts = self.config.schema_retries + 1;
        let mut last: Option<SchemaError> = None;

        for attempt in 1..=attempts {
            let raw = self
                .client
                .invoke(&contract.system_prompt, payload, contract.temperature)
                .await?;

            match crate::schema::parse_stage::<T>(&raw, &contract.schema) {
                Ok(artifact) => return Ok(artifact),
                Err(StageParseError::Declared(err)) => return Err(err.into()),
                Err(StageParseError::Schema(err)) => {
                    warn!(
                        stage = %contract.stage,
                        attempt,
                        attempts,
                        reason = %err.reason,
                        "stage output failed schema validation"
                    );
                    last = Some(err);
                }
            }
        }

        Err(PipelineError::Schema(last.unwrap_or_else(|| {
            SchemaError::new(contract.stage, "stage produced no output")
        })))
    }

    /// Run the optional Gatekeeper over a passing round.
    ///
    /// An unparseable verdict propagates as an error from `execute_stage`
    /// after retries — a conservative failure, never a forced pass.
    async fn run_gatekeeper(
        &self,
        state: &mut PipelineState,
        checklist: &Checklist,
        emitter: &ProgressEmitter,
    ) -> Result<GateOutcome, PipelineError> {
        let (draft, scorecard) = match (&state.draft, &state.scorecard) {
            (Some(d), Some(s)) => (d, s),
            _ => {
                return Err(PipelineError::Other(anyhow::anyhow!(
                    "gatekeeper invoked without a scored draft"
                )));
            }
        };

        emitter
            .emit(PipelineEvent::Progress {
                stage: Stage::Gatekeeper,
                message: format!("Verifying draft, round {}", state.round),
            })
            .await;

        let payload = prompts::build_gatekeeper_payload(checklist, draft, scorecard);
        let verdict: GateVerdict = self
            .execute_stage(&self.contracts.gatekeeper, &payload)
            .await?;
        let verdict = verdict.normalized();

        emitter
            .emit(PipelineEvent::StageDone {
                stage: Stage::Gatekeeper,
                round: Some(state.round),
                summary: format!(
                    "complete: {}, continue: {}",
                    verdict.complete, verdict.proceed
                ),
            })
            .await;

        if verdict.complete && verdict.proceed {
            Ok(GateOutcome::Proceed)
        } else if !verdict.complete {
            Ok(GateOutcome::Revise(verdict.blocking_issues))
        } else {
            Ok(GateOutcome::Blocked(verdict.blocking_issues))
        }
    }

    async fn checkpoint(
        &self,
        state: PipelineState,
        next_step: NextStep,
        emitter: &ProgressEmitter,
    ) -> Result<RunOutcome, PipelineError> {
        let subject_id = state.subject_id.clone();
        let round = state.round;
        let continuation_id = self
            .continuations
            .save(subject_id, next_step, state, self.config.continuation_ttl())
            .await?;

        info!(%continuation_id, round, next_step = %next_step, "time budget exceeded, checkpointed");
        emitter
            .emit(PipelineEvent::Checkpointed {
                continuation_id: continuation_id.clone(),
            })
            .await;

        Ok(RunOutcome::Checkpointed { continuation_id })
    }

    async fn pause_for_user(
        &self,
        state: PipelineState,
        next_step: NextStep,
        emitter: &ProgressEmitter,
    ) -> Result<RunOutcome, PipelineError> {
        let subject_id = state.subject_id.clone();
        let continuation_id = self
            .continuations
            .save(subject_id, next_step, state, self.config.continuation_ttl())
            .await?;

        emitter
            .emit(PipelineEvent::AwaitUserContinue {
                continuation_id: continuation_id.clone(),
            })
            .await;

        Ok(RunOutcome::AwaitingContinue { continuation_id })
    }

    /// Swap the best-scored draft back in before finalizing.
    async fn finalize_best(
        &self,
        mut state: PipelineState,
        emitter: &ProgressEmitter,
    ) -> Result<RunOutcome, PipelineError> {
        if let Some(best) = state.best.take() {
            state.draft = Some(best.draft);
            state.scorecard = Some(best.scorecard);
        }
        self.finalize(state, emitter).await
    }

    async fn finalize(
        &self,
        state: PipelineState,
        emitter: &ProgressEmitter,
    ) -> Result<RunOutcome, PipelineError> {
        let (checklist, draft, scorecard) = match (state.checklist, state.draft, state.scorecard) {
            (Some(c), Some(d), Some(s)) => (c, d, s),
            _ => {
                return Err(PipelineError::Other(anyhow::anyhow!(
                    "cannot finalize an incomplete pipeline state"
                )));
            }
        };

        let artifact = OptimizedArtifact {
            target_role: checklist.target_role.clone(),
            checklist,
            scorecard,
            rendered_plain_text: draft.plain_text,
            rendered_rich_text: draft.rich_text,
            change_log: draft.change_log,
            rounds_completed: state.round,
            optimized_at: Utc::now(),
        };

        self.subjects
            .save_artifact(&state.subject_id, &artifact)
            .await
            .map_err(PipelineError::Store)?;

        info!(
            subject_id = %state.subject_id,
            rounds = artifact.rounds_completed,
            overall = artifact.scorecard.overall,
            "run complete, artifact persisted"
        );

        let artifact = Box::new(artifact);
        emitter
            .emit(PipelineEvent::Complete {
                artifact: artifact.clone(),
            })
            .await;

        Ok(RunOutcome::Complete(artifact))
    }
}

// Scenario-level coverage for the orchestrator lives in
// tests/integration_tests.rs, where the model client is scripted per stage.
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_request_default_is_fresh_start() {
        let request = RunRequest::default();
        assert!(request.continuation_id.is_none());
        assert!(!request.manual_mode);
        assert!(request.raw_text.is_none());
    }
}
