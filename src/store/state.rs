//! Two-bucket pipeline state store.
//!
//! Non-terminal states live in `active/`, terminal states in `completed/`,
//! and `index.yaml` holds one summary per pipeline for cheap listing. A
//! save routes the file to the right bucket, removes the opposite-bucket
//! copy, and refreshes the index — all with atomic rename writes so
//! concurrent readers never see partial files. Single writer per pipeline
//! is assumed (one controller owns a pipeline id at a time).

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::debug;

use super::atomic_write;
use crate::pipeline::{PipelineState, PipelineStatus, PipelineSummary};

#[derive(Debug, Clone)]
pub struct StateStore {
    base_dir: PathBuf,
}

impl StateStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn active_dir(&self) -> PathBuf {
        self.base_dir.join("active")
    }

    fn completed_dir(&self) -> PathBuf {
        self.base_dir.join("completed")
    }

    fn index_file(&self) -> PathBuf {
        self.base_dir.join("index.yaml")
    }

    fn state_file(&self, bucket: &PathBuf, id: &str) -> PathBuf {
        bucket.join(format!("{id}.yaml"))
    }

    /// Persist a state snapshot: bucket routing, opposite-bucket cleanup,
    /// index refresh.
    pub fn save(&self, state: &PipelineState) -> Result<()> {
        let yaml = serde_yaml::to_string(state).context("Failed to serialize pipeline state")?;

        let (target, other) = if state.is_terminal() {
            (self.completed_dir(), self.active_dir())
        } else {
            (self.active_dir(), self.completed_dir())
        };
        atomic_write(&self.state_file(&target, &state.id), yaml.as_bytes())?;

        let stale = self.state_file(&other, &state.id);
        if stale.exists() {
            std::fs::remove_file(&stale)
                .with_context(|| format!("Failed to remove stale state {}", stale.display()))?;
        }

        self.update_index(state.summary())?;
        debug!(pipeline = %state.id, status = %state.status, "state saved");
        Ok(())
    }

    /// Load a pipeline's state, checking `active/` first.
    pub fn load(&self, pipeline_id: &str) -> Result<Option<PipelineState>> {
        for bucket in [self.active_dir(), self.completed_dir()] {
            let path = self.state_file(&bucket, pipeline_id);
            if path.exists() {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read state {}", path.display()))?;
                let state: PipelineState = serde_yaml::from_str(&raw)
                    .with_context(|| format!("Failed to parse state {}", path.display()))?;
                return Ok(Some(state));
            }
        }
        Ok(None)
    }

    /// Summaries sorted newest-first, optionally filtered by status.
    pub fn list(
        &self,
        status_filter: Option<PipelineStatus>,
        limit: usize,
    ) -> Result<Vec<PipelineSummary>> {
        let mut summaries: Vec<PipelineSummary> = self
            .load_index()?
            .into_values()
            .filter(|s| status_filter.is_none_or(|f| s.status == f))
            .collect();
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        summaries.truncate(limit);
        Ok(summaries)
    }

    /// The most recently created pipeline, if any.
    pub fn latest(&self) -> Result<Option<PipelineSummary>> {
        Ok(self.list(None, 1)?.into_iter().next())
    }

    fn load_index(&self) -> Result<BTreeMap<String, PipelineSummary>> {
        let path = self.index_file();
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read index {}", path.display()))?;
        serde_yaml::from_str(&raw)
            .with_context(|| format!("Failed to parse index {}", path.display()))
    }

    fn update_index(&self, summary: PipelineSummary) -> Result<()> {
        let mut index = self.load_index()?;
        index.insert(summary.id.clone(), summary);
        let yaml = serde_yaml::to_string(&index).context("Failed to serialize index")?;
        atomic_write(&self.index_file(), yaml.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::{ArtifactBody, Stage};
    use crate::template::{PipelineConfig, RunOverrides, builtin};
    use tempfile::tempdir;

    fn make_state(id: &str) -> PipelineState {
        let template = builtin("implement").unwrap();
        let config = PipelineConfig::from_template(&template, &RunOverrides::default(), None);
        PipelineState::new(
            id.to_string(),
            "request".to_string(),
            ArtifactBody::new(),
            config,
        )
    }

    #[test]
    fn test_save_nonterminal_routes_to_active() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let state = make_state("PL-20250101000000-aaaa0001");
        store.save(&state).unwrap();
        assert!(dir.path().join("active/PL-20250101000000-aaaa0001.yaml").exists());
        assert!(!dir.path().join("completed/PL-20250101000000-aaaa0001.yaml").exists());
    }

    #[test]
    fn test_terminal_save_moves_between_buckets() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let mut state = make_state("PL-20250101000000-aaaa0002");
        store.save(&state).unwrap();

        state.transition(PipelineStatus::Running).unwrap();
        state.transition(PipelineStatus::Completed).unwrap();
        store.save(&state).unwrap();

        assert!(!dir.path().join("active/PL-20250101000000-aaaa0002.yaml").exists());
        assert!(dir.path().join("completed/PL-20250101000000-aaaa0002.yaml").exists());
    }

    #[test]
    fn test_load_round_trips_all_resumption_fields() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let mut state = make_state("PL-20250101000000-aaaa0003");
        state.transition(PipelineStatus::Running).unwrap();
        state.mark_stage_completed(Stage::Intake, "00-intake.yaml".to_string());
        state.bump_iteration(Stage::Clarify);
        state.pending_feedback = Some("answer the second question".to_string());
        state.add_usage(1234, 0.05);
        store.save(&state).unwrap();

        let loaded = store.load("PL-20250101000000-aaaa0003").unwrap().unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn test_save_load_save_identical_bytes() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let mut state = make_state("PL-20250101000000-aaaa0004");
        state.transition(PipelineStatus::Running).unwrap();
        store.save(&state).unwrap();
        let path = dir.path().join("active/PL-20250101000000-aaaa0004.yaml");
        let first = std::fs::read(&path).unwrap();

        let loaded = store.load("PL-20250101000000-aaaa0004").unwrap().unwrap();
        store.save(&loaded).unwrap();
        let second = std::fs::read(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_load_unknown_is_none() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        assert!(store.load("PL-nope").unwrap().is_none());
    }

    #[test]
    fn test_list_sorts_newest_first_and_filters() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());

        let mut older = make_state("PL-20250101000000-aaaa0005");
        older.created_at = chrono::Utc::now() - chrono::Duration::hours(2);
        store.save(&older).unwrap();

        let mut failed = make_state("PL-20250101000000-aaaa0006");
        failed.created_at = chrono::Utc::now() - chrono::Duration::hours(1);
        failed.transition(PipelineStatus::Failed).unwrap();
        store.save(&failed).unwrap();

        let newest = make_state("PL-20250101000000-aaaa0007");
        store.save(&newest).unwrap();

        let all = store.list(None, 10).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].id, "PL-20250101000000-aaaa0007");
        assert_eq!(all[2].id, "PL-20250101000000-aaaa0005");

        let only_failed = store.list(Some(PipelineStatus::Failed), 10).unwrap();
        assert_eq!(only_failed.len(), 1);
        assert_eq!(only_failed[0].id, "PL-20250101000000-aaaa0006");

        let limited = store.list(None, 1).unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn test_latest_returns_most_recent() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        assert!(store.latest().unwrap().is_none());

        let mut a = make_state("PL-20250101000000-aaaa0008");
        a.created_at = chrono::Utc::now() - chrono::Duration::minutes(5);
        store.save(&a).unwrap();
        let b = make_state("PL-20250101000000-aaaa0009");
        store.save(&b).unwrap();

        assert_eq!(store.latest().unwrap().unwrap().id, b.id);
    }
}
