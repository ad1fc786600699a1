//! Subject persistence seam.
//!
//! The document being optimized lives in an external storage layer. The
//! pipeline only needs two operations from it, expressed as a trait so the
//! host application (or a test) supplies the implementation. The in-memory
//! store backs the CLI and the test suite.

use crate::artifact::OptimizedArtifact;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// A document under optimization.
#[derive(Debug, Clone, PartialEq)]
pub struct Subject {
    pub id: String,
    pub raw_text: String,
    /// Verified owner identity, supplied by the host's auth layer.
    pub owner: Option<String>,
}

/// Storage operations the pipeline requires from its host.
#[async_trait]
pub trait SubjectStore: Send + Sync {
    async fn load_subject(&self, id: &str) -> Result<Option<Subject>>;

    /// Persist the finished artifact. Called exactly once per completed run,
    /// at FINALIZE.
    async fn save_artifact(&self, id: &str, artifact: &OptimizedArtifact) -> Result<()>;
}

#[derive(Default)]
struct SubjectRecord {
    subject: Option<Subject>,
    artifact: Option<OptimizedArtifact>,
}

/// In-memory subject store for the CLI and tests.
#[derive(Default)]
pub struct MemorySubjectStore {
    records: RwLock<HashMap<String, SubjectRecord>>,
}

impl MemorySubjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_subject(&self, subject: Subject) {
        let mut records = self.records.write().await;
        let id = subject.id.clone();
        records.entry(id).or_default().subject = Some(subject);
    }

    /// The saved artifact for a subject, if a run has completed.
    pub async fn artifact(&self, id: &str) -> Option<OptimizedArtifact> {
        let records = self.records.read().await;
        records.get(id).and_then(|r| r.artifact.clone())
    }
}

#[async_trait]
impl SubjectStore for MemorySubjectStore {
    async fn load_subject(&self, id: &str) -> Result<Option<Subject>> {
        let records = self.records.read().await;
        Ok(records.get(id).and_then(|r| r.subject.clone()))
    }

    async fn save_artifact(&self, id: &str, artifact: &OptimizedArtifact) -> Result<()> {
        let mut records = self.records.write().await;
        records.entry(id.to_string()).or_default().artifact = Some(artifact.clone());
        Ok(())
    }
}
