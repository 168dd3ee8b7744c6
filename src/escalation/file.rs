//! File-polling escalation backend.
//!
//! An escalation becomes `{id}.yaml` in the escalations directory; a human
//! (or tooling) answers by writing the sibling `{id}.resolution.yaml`. The
//! backend polls for the sibling at a fixed interval and marks the record
//! resolved or timed out. Approvals use the same file pair with an
//! `approval` marker in the record and `{approved, feedback}` in the
//! answer.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::sleep;
use tracing::info;

use super::{
    ApprovalResult, Escalation, EscalationManager, EscalationStatus, Resolution,
};
use crate::ids::new_escalation_id;
use crate::stage::{ArtifactBody, Stage};

/// Answer file shape. Escalations read `abort`/`context`; approvals read
/// `approved`/`feedback`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ResolutionFile {
    #[serde(default)]
    abort: bool,
    #[serde(default)]
    context: Option<ArtifactBody>,
    #[serde(default)]
    approved: Option<bool>,
    #[serde(default)]
    feedback: Option<String>,
}

pub struct FileEscalationBackend {
    escalations_dir: PathBuf,
    timeout: Duration,
    poll_interval: Duration,
}

impl FileEscalationBackend {
    pub fn new(escalations_dir: PathBuf, timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            escalations_dir,
            timeout,
            poll_interval,
        }
    }

    fn escalation_file(&self, id: &str) -> PathBuf {
        self.escalations_dir.join(format!("{id}.yaml"))
    }

    fn resolution_file(&self, id: &str) -> PathBuf {
        self.escalations_dir.join(format!("{id}.resolution.yaml"))
    }

    fn write_record(&self, escalation: &Escalation) -> Result<()> {
        std::fs::create_dir_all(&self.escalations_dir)
            .context("Failed to create escalations directory")?;
        let yaml = serde_yaml::to_string(escalation).context("Failed to serialize escalation")?;
        std::fs::write(self.escalation_file(&escalation.id), yaml)
            .context("Failed to write escalation record")?;
        Ok(())
    }

    fn update_status(&self, escalation: &mut Escalation, status: EscalationStatus) -> Result<()> {
        escalation.status = status;
        self.write_record(escalation)
    }

    async fn poll_for_answer(&self, id: &str) -> Result<Option<ResolutionFile>> {
        let path = self.resolution_file(id);
        let mut waited = Duration::ZERO;
        loop {
            if path.exists() {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read resolution {}", path.display()))?;
                let answer: ResolutionFile = serde_yaml::from_str(&raw)
                    .with_context(|| format!("Failed to parse resolution {}", path.display()))?;
                return Ok(Some(answer));
            }
            if waited >= self.timeout {
                return Ok(None);
            }
            sleep(self.poll_interval).await;
            waited += self.poll_interval;
        }
    }

    fn make_record(
        &self,
        pipeline_id: &str,
        stage: Stage,
        issue: &str,
        context: Option<ArtifactBody>,
    ) -> Escalation {
        Escalation {
            id: new_escalation_id(),
            pipeline_id: pipeline_id.to_string(),
            stage,
            issue: issue.to_string(),
            context,
            created_at: Utc::now(),
            status: EscalationStatus::Pending,
        }
    }
}

#[async_trait]
impl EscalationManager for FileEscalationBackend {
    async fn wait_for_resolution(
        &self,
        pipeline_id: &str,
        stage: Stage,
        issue: &str,
        context: Option<ArtifactBody>,
    ) -> Result<Resolution> {
        let mut escalation = self.make_record(pipeline_id, stage, issue, context);
        self.write_record(&escalation)?;
        info!(
            pipeline = pipeline_id,
            escalation = %escalation.id,
            %stage,
            "escalation recorded, waiting for resolution"
        );

        match self.poll_for_answer(&escalation.id).await? {
            Some(answer) => {
                self.update_status(&mut escalation, EscalationStatus::Resolved)?;
                Ok(Resolution {
                    abort: answer.abort,
                    context: answer.context,
                })
            }
            None => {
                // Unanswered past the deadline: ambiguity becomes a
                // controlled stop.
                self.update_status(&mut escalation, EscalationStatus::TimedOut)?;
                Ok(Resolution::aborted())
            }
        }
    }

    async fn request_approval(
        &self,
        pipeline_id: &str,
        stage: Stage,
        artifact: &ArtifactBody,
    ) -> Result<ApprovalResult> {
        let mut context = ArtifactBody::new();
        context.insert("approval_request".into(), serde_json::json!(true));
        context.insert(
            "artifact".into(),
            serde_json::Value::Object(artifact.clone()),
        );
        let mut escalation = self.make_record(
            pipeline_id,
            stage,
            &format!("approval requested for stage {stage}"),
            Some(context),
        );
        self.write_record(&escalation)?;

        match self.poll_for_answer(&escalation.id).await? {
            Some(answer) => {
                self.update_status(&mut escalation, EscalationStatus::Resolved)?;
                Ok(ApprovalResult {
                    approved: answer.approved.unwrap_or(false),
                    feedback: answer.feedback,
                })
            }
            None => {
                self.update_status(&mut escalation, EscalationStatus::TimedOut)?;
                Ok(ApprovalResult {
                    approved: false,
                    feedback: None,
                })
            }
        }
    }
}

/// List persisted escalation records, newest first.
pub fn list_escalations(escalations_dir: &Path) -> Result<Vec<Escalation>> {
    if !escalations_dir.exists() {
        return Ok(Vec::new());
    }
    let mut records = Vec::new();
    for entry in std::fs::read_dir(escalations_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.ends_with(".yaml") || name.ends_with(".resolution.yaml") {
            continue;
        }
        let raw = std::fs::read_to_string(entry.path())?;
        if let Ok(record) = serde_yaml::from_str::<Escalation>(&raw) {
            records.push(record);
        }
    }
    records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn fast_backend(dir: &Path) -> FileEscalationBackend {
        FileEscalationBackend::new(
            dir.to_path_buf(),
            Duration::from_millis(200),
            Duration::from_millis(10),
        )
    }

    fn find_escalation_id(dir: &Path) -> String {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().to_str().map(String::from))
            .find(|n| n.ends_with(".yaml") && !n.ends_with(".resolution.yaml"))
            .unwrap()
            .trim_end_matches(".yaml")
            .to_string()
    }

    #[tokio::test]
    async fn test_timeout_returns_abort() {
        let dir = tempdir().unwrap();
        let backend = fast_backend(dir.path());
        let resolution = backend
            .wait_for_resolution("PL-1", Stage::Clarify, "stuck", None)
            .await
            .unwrap();
        assert!(resolution.abort);

        // The record reflects the timeout.
        let records = list_escalations(dir.path()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, EscalationStatus::TimedOut);
    }

    #[tokio::test]
    async fn test_resolution_file_unblocks_wait() {
        let dir = tempdir().unwrap();
        let backend = FileEscalationBackend::new(
            dir.path().to_path_buf(),
            Duration::from_secs(5),
            Duration::from_millis(10),
        );

        let dir_path = dir.path().to_path_buf();
        let answer_task = tokio::spawn(async move {
            // Wait for the escalation record to appear, then answer it.
            for _ in 0..200 {
                if std::fs::read_dir(&dir_path).map(|mut d| d.next().is_some()).unwrap_or(false) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            let id = find_escalation_id(&dir_path);
            std::fs::write(
                dir_path.join(format!("{id}.resolution.yaml")),
                "abort: false\ncontext:\n  question_answers:\n    q1: authorization code flow\n",
            )
            .unwrap();
        });

        let resolution = backend
            .wait_for_resolution("PL-1", Stage::Clarify, "two blocking questions", None)
            .await
            .unwrap();
        answer_task.await.unwrap();

        assert!(!resolution.abort);
        let context = resolution.context.unwrap();
        assert_eq!(
            context["question_answers"]["q1"],
            json!("authorization code flow")
        );

        let records = list_escalations(dir.path()).unwrap();
        assert_eq!(records[0].status, EscalationStatus::Resolved);
    }

    #[tokio::test]
    async fn test_approval_round_trip() {
        let dir = tempdir().unwrap();
        let backend = FileEscalationBackend::new(
            dir.path().to_path_buf(),
            Duration::from_secs(5),
            Duration::from_millis(10),
        );

        let dir_path = dir.path().to_path_buf();
        let answer_task = tokio::spawn(async move {
            for _ in 0..200 {
                if std::fs::read_dir(&dir_path).map(|mut d| d.next().is_some()).unwrap_or(false) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            let id = find_escalation_id(&dir_path);
            std::fs::write(
                dir_path.join(format!("{id}.resolution.yaml")),
                "approved: false\nfeedback: include rate limiting\n",
            )
            .unwrap();
        });

        let mut artifact = ArtifactBody::new();
        artifact.insert("components".into(), json!([{"name": "TokenService"}]));
        let approval = backend
            .request_approval("PL-1", Stage::Spec, &artifact)
            .await
            .unwrap();
        answer_task.await.unwrap();

        assert!(!approval.approved);
        assert_eq!(approval.feedback.as_deref(), Some("include rate limiting"));
    }

    #[tokio::test]
    async fn test_approval_timeout_is_rejection() {
        let dir = tempdir().unwrap();
        let backend = fast_backend(dir.path());
        let approval = backend
            .request_approval("PL-1", Stage::Spec, &ArtifactBody::new())
            .await
            .unwrap();
        assert!(!approval.approved);
        assert!(approval.feedback.is_none());
    }
}
