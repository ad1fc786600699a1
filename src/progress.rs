//! Progress streaming for pipeline runs.
//!
//! The orchestrator reports its transitions as an ordered, append-only
//! stream of typed events over a bounded channel. Backpressure is explicit:
//! the emitter either blocks the pipeline until the consumer catches up or
//! drops non-terminal events on a full buffer, per [`OverflowPolicy`].
//!
//! Terminal events seal the stream — nothing is ever emitted after
//! `complete`, `error`, `halted`, `checkpointed`, or `await_user_continue`
//! for a given run.

use crate::artifact::{OptimizedArtifact, Stage};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tracing::debug;

/// Events emitted during a pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    /// A stage is about to run.
    Progress { stage: Stage, message: String },
    /// A stage finished and produced a validated artifact.
    StageDone {
        stage: Stage,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        round: Option<u32>,
        summary: String,
    },
    /// The round cleared the quality gate.
    GatePass { round: u32 },
    /// The round needs revision; another Writer round follows if budget remains.
    GateFail { round: u32, blocking: Vec<String> },
    /// The gate stopped the run outright.
    GateBlocked { round: u32, reason: String },
    /// The time budget was exceeded; state is saved under the continuation id.
    Checkpointed { continuation_id: String },
    /// Manual mode pause; resume with the continuation id to proceed.
    AwaitUserContinue { continuation_id: String },
    /// The pipeline stopped for an expected domain reason, not a system error.
    Halted { reason: String, details: Vec<String> },
    /// The pipeline failed.
    Error { message: String },
    /// The pipeline finished and the artifact was persisted.
    Complete { artifact: Box<OptimizedArtifact> },
}

impl PipelineEvent {
    /// Terminal events end the stream; nothing may follow them.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineEvent::Checkpointed { .. }
                | PipelineEvent::AwaitUserContinue { .. }
                | PipelineEvent::Halted { .. }
                | PipelineEvent::Error { .. }
                | PipelineEvent::Complete { .. }
        )
    }

    /// The event's wire name, as used for the SSE `event:` field.
    pub fn name(&self) -> &'static str {
        match self {
            PipelineEvent::Progress { .. } => "progress",
            PipelineEvent::StageDone { .. } => "stage_done",
            PipelineEvent::GatePass { .. } => "gate_pass",
            PipelineEvent::GateFail { .. } => "gate_fail",
            PipelineEvent::GateBlocked { .. } => "gate_blocked",
            PipelineEvent::Checkpointed { .. } => "checkpointed",
            PipelineEvent::AwaitUserContinue { .. } => "await_user_continue",
            PipelineEvent::Halted { .. } => "halted",
            PipelineEvent::Error { .. } => "error",
            PipelineEvent::Complete { .. } => "complete",
        }
    }
}

/// What to do when the event buffer is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Suspend the pipeline until the consumer catches up.
    #[default]
    Block,
    /// Drop the newest non-terminal event. Terminal events always block.
    DropNewest,
}

/// Ordered, sealed event sender for one pipeline run.
pub struct ProgressEmitter {
    tx: mpsc::Sender<PipelineEvent>,
    policy: OverflowPolicy,
    sealed: AtomicBool,
}

impl ProgressEmitter {
    /// Create an emitter/receiver pair over a bounded channel.
    pub fn channel(
        capacity: usize,
        policy: OverflowPolicy,
    ) -> (Self, mpsc::Receiver<PipelineEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx,
                policy,
                sealed: AtomicBool::new(false),
            },
            rx,
        )
    }

    /// Emit one event.
    ///
    /// After a terminal event the emitter is sealed; later calls are dropped
    /// and logged at debug. A dropped receiver is tolerated — a disconnected
    /// caller must not abort the pipeline's committed side effects.
    pub async fn emit(&self, event: PipelineEvent) {
        if self.sealed.load(Ordering::Acquire) {
            debug!(event = event.name(), "emitter sealed, dropping event");
            return;
        }

        let terminal = event.is_terminal();
        if terminal {
            self.sealed.store(true, Ordering::Release);
        }

        match (self.policy, terminal) {
            // Terminal events are always delivered, regardless of policy.
            (OverflowPolicy::Block, _) | (OverflowPolicy::DropNewest, true) => {
                if self.tx.send(event).await.is_err() {
                    debug!("event receiver dropped");
                }
            }
            (OverflowPolicy::DropNewest, false) => {
                if let Err(mpsc::error::TrySendError::Full(dropped)) = self.tx.try_send(event) {
                    debug!(event = dropped.name(), "event buffer full, dropping event");
                }
            }
        }
    }

    /// Whether a terminal event has been emitted.
    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }
}
