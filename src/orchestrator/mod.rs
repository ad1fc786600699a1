pub mod engine;
pub mod state;

pub use engine::{Orchestrator, RunOutcome, RunRequest};
pub use state::{NextStep, PipelineState};
