//! Unified configuration for Anvil.
//!
//! Configuration is layered: built-in defaults → `.anvil/anvil.toml` →
//! environment variables. The numeric pipeline knobs deliberately live here
//! rather than in code — the quality bar and round budget are product
//! decisions, not implementation constants.
//!
//! # Configuration File Format
//!
//! ```toml
//! [pipeline]
//! max_rounds = 6
//! early_accept_overall = 97
//! schema_retries = 2
//! time_budget_secs = 55
//! continuation_ttl_secs = 600
//! gatekeeper = false
//!
//! [pipeline.quality]
//! min_overall = 90
//! min_truthfulness = 92
//!
//! [pipeline.temperatures]
//! researcher = 0.2
//! writer = 0.7
//! critic = 0.1
//! gatekeeper = 0.0
//!
//! [model]
//! base_url = "http://localhost:8811"
//! model = "default"
//! timeout_secs = 120
//!
//! [server]
//! port = 8460
//! event_buffer = 64
//! ```
//!
//! The API key is never read from the file; set `ANVIL_API_KEY` in the
//! environment.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::model::ModelSettings;
use crate::policy::QualityGate;
use crate::stages::StageTemperatures;

/// Knobs governing one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Maximum WRITE↔CRITIQUE rounds before the best draft is used as-is.
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
    /// The numeric quality gate a passing round must clear.
    #[serde(default)]
    pub quality: QualityGate,
    /// Accept a `revise` round anyway once its overall score reaches this.
    #[serde(default = "default_early_accept_overall")]
    pub early_accept_overall: u8,
    /// Same-stage retries after a schema validation failure.
    #[serde(default = "default_schema_retries")]
    pub schema_retries: u32,
    /// Wall-clock budget per invocation; exceeding it checkpoints the run.
    #[serde(default = "default_time_budget_secs")]
    pub time_budget_secs: u64,
    /// How long a saved continuation stays redeemable.
    #[serde(default = "default_continuation_ttl_secs")]
    pub continuation_ttl_secs: u64,
    /// Run the Gatekeeper as a second verification layer over passing rounds.
    #[serde(default)]
    pub gatekeeper: bool,
    #[serde(default)]
    pub temperatures: StageTemperatures,
}

fn default_max_rounds() -> u32 {
    6
}

fn default_early_accept_overall() -> u8 {
    97
}

fn default_schema_retries() -> u32 {
    2
}

fn default_time_budget_secs() -> u64 {
    55
}

fn default_continuation_ttl_secs() -> u64 {
    600
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_rounds: default_max_rounds(),
            quality: QualityGate::default(),
            early_accept_overall: default_early_accept_overall(),
            schema_retries: default_schema_retries(),
            time_budget_secs: default_time_budget_secs(),
            continuation_ttl_secs: default_continuation_ttl_secs(),
            gatekeeper: false,
            temperatures: StageTemperatures::default(),
        }
    }
}

impl PipelineConfig {
    pub fn time_budget(&self) -> Duration {
        Duration::from_secs(self.time_budget_secs)
    }

    pub fn continuation_ttl(&self) -> Duration {
        Duration::from_secs(self.continuation_ttl_secs)
    }
}

/// HTTP surface settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Capacity of the per-run event buffer.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_port() -> u16 {
    8460
}

fn default_event_buffer() -> usize {
    64
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            port: default_port(),
            event_buffer: default_event_buffer(),
        }
    }
}

/// The complete Anvil configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnvilConfig {
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub model: ModelSettings,
    #[serde(default)]
    pub server: ServerSettings,
}

impl AnvilConfig {
    /// Path of the config file under a project directory.
    pub fn config_path(project_dir: &Path) -> std::path::PathBuf {
        project_dir.join(".anvil").join("anvil.toml")
    }

    /// Load configuration: file (if present) layered under env overrides.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let path = Self::config_path(project_dir);
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?
        } else {
            Self::default()
        };
        config.apply_env();
        Ok(config)
    }

    /// Apply environment overrides on top of the file values.
    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("ANVIL_MODEL_URL") {
            self.model.base_url = url;
        }
        if let Ok(model) = std::env::var("ANVIL_MODEL") {
            self.model.model = model;
        }
        if let Ok(key) = std::env::var("ANVIL_API_KEY")
            && !key.is_empty()
        {
            self.model.api_key = Some(key);
        }
        if let Ok(value) = std::env::var("ANVIL_MAX_ROUNDS")
            && let Ok(parsed) = value.parse()
        {
            self.pipeline.max_rounds = parsed;
        }
        if let Ok(value) = std::env::var("ANVIL_TIME_BUDGET_SECS")
            && let Ok(parsed) = value.parse()
        {
            self.pipeline.time_budget_secs = parsed;
        }
        if let Ok(value) = std::env::var("ANVIL_PORT")
            && let Ok(parsed) = value.parse()
        {
            self.server.port = parsed;
        }
    }

    /// Validate the configuration, returning human-readable warnings.
    ///
    /// Warnings do not prevent a run; hard errors (a zero round budget)
    /// come back as `Err`.
    pub fn validate(&self) -> Result<Vec<String>> {
        let mut warnings = Vec::new();

        if self.pipeline.max_rounds == 0 {
            anyhow::bail!("pipeline.max_rounds must be at least 1");
        }
        if self.pipeline.early_accept_overall < self.pipeline.quality.min_overall {
            warnings.push(format!(
                "early_accept_overall ({}) is below quality.min_overall ({}); early accept will fire before the gate can pass",
                self.pipeline.early_accept_overall, self.pipeline.quality.min_overall
            ));
        }
        if self.pipeline.quality.min_overall > 100 || self.pipeline.early_accept_overall > 100 {
            warnings.push("score thresholds above 100 can never be met".to_string());
        }
        if self.pipeline.time_budget_secs == 0 {
            warnings.push(
                "time_budget_secs is 0; every run will checkpoint before its first write"
                    .to_string(),
            );
        }
        if self.pipeline.continuation_ttl_secs < self.pipeline.time_budget_secs {
            warnings.push(
                "continuation_ttl_secs is shorter than time_budget_secs; resumed runs may find their continuation expired".to_string(),
            );
        }

        Ok(warnings)
    }

    /// Default config file content for `anvil config init`.
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}
