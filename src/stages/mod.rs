//! Stage contracts for the pipeline.
//!
//! A [`StageContract`] binds everything one stage needs — its system prompt,
//! its output schema, and its sampling temperature — as an immutable value
//! constructed up front and handed to the orchestrator. Swapping a stage's
//! behavior (including substituting a test double's prompt) never touches
//! orchestrator code.

pub mod prompts;

use crate::artifact::Stage;
use crate::schema::{
    CRITIC_SCHEMA, GATEKEEPER_SCHEMA, RESEARCHER_SCHEMA, StageSchema, WRITER_SCHEMA,
};

/// Everything one stage needs, bound at construction.
#[derive(Debug, Clone)]
pub struct StageContract {
    pub stage: Stage,
    pub system_prompt: String,
    pub schema: StageSchema,
    pub temperature: f32,
}

impl StageContract {
    pub fn new(
        stage: Stage,
        system_prompt: impl Into<String>,
        schema: StageSchema,
        temperature: f32,
    ) -> Self {
        Self {
            stage,
            system_prompt: system_prompt.into(),
            schema,
            temperature,
        }
    }
}

/// Per-stage sampling temperatures.
///
/// The Writer runs warm; the evaluating stages run cold so that scores and
/// verdicts are reproducible.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct StageTemperatures {
    #[serde(default = "default_researcher_temp")]
    pub researcher: f32,
    #[serde(default = "default_writer_temp")]
    pub writer: f32,
    #[serde(default = "default_critic_temp")]
    pub critic: f32,
    #[serde(default = "default_gatekeeper_temp")]
    pub gatekeeper: f32,
}

fn default_researcher_temp() -> f32 {
    0.2
}

fn default_writer_temp() -> f32 {
    0.7
}

fn default_critic_temp() -> f32 {
    0.1
}

fn default_gatekeeper_temp() -> f32 {
    0.0
}

impl Default for StageTemperatures {
    fn default() -> Self {
        Self {
            researcher: default_researcher_temp(),
            writer: default_writer_temp(),
            critic: default_critic_temp(),
            gatekeeper: default_gatekeeper_temp(),
        }
    }
}

/// The full set of contracts the orchestrator runs with.
#[derive(Debug, Clone)]
pub struct StageContracts {
    pub researcher: StageContract,
    pub writer: StageContract,
    pub critic: StageContract,
    pub gatekeeper: StageContract,
}

impl StageContracts {
    /// Build the production contracts from the built-in prompt templates.
    pub fn standard(temperatures: StageTemperatures) -> Self {
        Self {
            researcher: StageContract::new(
                Stage::Researcher,
                prompts::RESEARCHER_SYSTEM,
                RESEARCHER_SCHEMA,
                temperatures.researcher,
            ),
            writer: StageContract::new(
                Stage::Writer,
                prompts::WRITER_SYSTEM,
                WRITER_SCHEMA,
                temperatures.writer,
            ),
            critic: StageContract::new(
                Stage::Critic,
                prompts::CRITIC_SYSTEM,
                CRITIC_SCHEMA,
                temperatures.critic,
            ),
            gatekeeper: StageContract::new(
                Stage::Gatekeeper,
                prompts::GATEKEEPER_SYSTEM,
                GATEKEEPER_SCHEMA,
                temperatures.gatekeeper,
            ),
        }
    }
}

impl Default for StageContracts {
    fn default() -> Self {
        Self::standard(StageTemperatures::default())
    }
}
