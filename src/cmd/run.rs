//! Pipeline execution — `anvil run` and `anvil resume`.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;

use anvil::config::AnvilConfig;
use anvil::continuation::ContinuationStore;
use anvil::model::HttpModelClient;
use anvil::orchestrator::{Orchestrator, RunOutcome, RunRequest};
use anvil::progress::{OverflowPolicy, ProgressEmitter};
use anvil::stages::StageContracts;
use anvil::subject::MemorySubjectStore;
use anvil::ui::PipelineUI;

fn build_orchestrator(project_dir: &Path, config: &AnvilConfig) -> Result<Orchestrator> {
    let client = HttpModelClient::new(config.model.clone())
        .map_err(|e| anyhow::anyhow!("failed to build model client: {}", e))?;
    let db_path = project_dir.join(".anvil").join("continuations.db");
    let continuations = ContinuationStore::open(&db_path)
        .map_err(|e| anyhow::anyhow!("failed to open continuation store: {}", e))?;

    Ok(Orchestrator::new(
        Arc::new(client),
        StageContracts::standard(config.pipeline.temperatures),
        continuations,
        Arc::new(MemorySubjectStore::new()),
        config.pipeline.clone(),
    ))
}

fn load_config(project_dir: &Path) -> Result<AnvilConfig> {
    let config = AnvilConfig::load(project_dir)?;
    for warning in config.validate()? {
        eprintln!("Warning: {}", warning);
    }
    Ok(config)
}

async fn execute(
    orchestrator: Orchestrator,
    request: RunRequest,
    out: Option<&Path>,
    verbose: bool,
) -> Result<()> {
    let subject_id = request.subject_id.clone();
    let (emitter, mut rx) = ProgressEmitter::channel(64, OverflowPolicy::Block);

    let orchestrator = Arc::new(orchestrator);
    let runner = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move { orchestrator.run(request, &emitter).await })
    };

    let ui = PipelineUI::new(verbose);
    while let Some(event) = rx.recv().await {
        ui.handle(&event);
    }
    ui.finish();

    let outcome = runner.await.context("pipeline task panicked")?;
    match outcome {
        RunOutcome::Complete(artifact) => {
            match out {
                Some(path) => {
                    std::fs::write(path, &artifact.rendered_plain_text)
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    println!("Optimized document written to {}", path.display());
                }
                None => {
                    println!();
                    println!("{}", artifact.rendered_plain_text);
                }
            }
            Ok(())
        }
        RunOutcome::Checkpointed { continuation_id }
        | RunOutcome::AwaitingContinue { continuation_id } => {
            println!(
                "Resume with: anvil resume {} --subject {}",
                continuation_id, subject_id
            );
            Ok(())
        }
        RunOutcome::Halted { .. } => Ok(()),
        RunOutcome::Failed { message } => anyhow::bail!(message),
    }
}

pub async fn cmd_run(
    project_dir: &Path,
    input: &Path,
    role: &str,
    location: Option<&str>,
    manual: bool,
    out: Option<&Path>,
    verbose: bool,
) -> Result<()> {
    let raw_text = std::fs::read_to_string(input)
        .with_context(|| format!("Failed to read {}", input.display()))?;
    if raw_text.trim().is_empty() {
        anyhow::bail!("{} is empty; nothing to optimize", input.display());
    }

    let config = load_config(project_dir)?;
    let orchestrator = build_orchestrator(project_dir, &config)?;

    let stem = input
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("document");
    let subject_id = format!("{}-{}", stem, &uuid::Uuid::new_v4().to_string()[..8]);

    let request = RunRequest {
        subject_id,
        target_role: role.to_string(),
        raw_text: Some(raw_text),
        location_hint: location.map(|s| s.to_string()),
        continuation_id: None,
        manual_mode: manual,
    };

    execute(orchestrator, request, out, verbose).await
}

pub async fn cmd_resume(
    project_dir: &Path,
    continuation_id: &str,
    subject: &str,
    out: Option<&Path>,
    verbose: bool,
) -> Result<()> {
    let config = load_config(project_dir)?;
    let orchestrator = build_orchestrator(project_dir, &config)?;

    let request = RunRequest {
        subject_id: subject.to_string(),
        target_role: String::new(),
        raw_text: None,
        location_hint: None,
        continuation_id: Some(continuation_id.to_string()),
        manual_mode: false,
    };

    execute(orchestrator, request, out, verbose).await
}
