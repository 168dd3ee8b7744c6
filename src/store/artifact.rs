//! Content-addressed artifact store.
//!
//! One directory per pipeline, one YAML file per completed stage iteration:
//! `{pipeline_id}/{index:02}-{stage}.yaml`, with `.iterN` inserted for
//! re-runs of the same stage. Files are written atomically, hashed at write
//! time, and never modified in place — history stays intact for the audit
//! log. A `snapshots/` subdirectory holds before/after copies of the
//! project workspace around mutating stages.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use super::{atomic_write, content_hash};
use crate::stage::{Stage, StoredArtifact};

/// Receipt for a persisted artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct WrittenArtifact {
    /// File name relative to the pipeline's artifact directory.
    pub file_name: String,
    /// SHA-256 of the serialized bytes, recorded in the audit log.
    pub hash: String,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    base_dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn pipeline_dir(&self, pipeline_id: &str) -> PathBuf {
        self.base_dir.join(pipeline_id)
    }

    /// Deterministic artifact file name for a (stage index, stage,
    /// iteration) triple. Iteration 1 is the bare name; re-runs get an
    /// iteration tag so earlier files survive.
    pub fn file_name(index: usize, stage: Stage, iteration: u32) -> String {
        if iteration <= 1 {
            format!("{index:02}-{stage}.yaml")
        } else {
            format!("{index:02}-{stage}.iter{iteration}.yaml")
        }
    }

    /// Persist an artifact. Writing the same (pipeline, index, iteration)
    /// twice is a fault: history is append-only.
    pub fn write(
        &self,
        pipeline_id: &str,
        index: usize,
        iteration: u32,
        artifact: &StoredArtifact,
    ) -> Result<WrittenArtifact> {
        let file_name = Self::file_name(index, artifact.meta.stage, iteration);
        let path = self.pipeline_dir(pipeline_id).join(&file_name);
        if path.exists() {
            anyhow::bail!(
                "Artifact {} already exists for pipeline {}; artifacts are write-once",
                file_name,
                pipeline_id
            );
        }

        let yaml = serde_yaml::to_string(artifact).context("Failed to serialize artifact")?;
        atomic_write(&path, yaml.as_bytes())?;
        Ok(WrittenArtifact {
            file_name,
            hash: content_hash(yaml.as_bytes()),
        })
    }

    pub fn read(&self, pipeline_id: &str, file_name: &str) -> Result<StoredArtifact> {
        let path = self.pipeline_dir(pipeline_id).join(file_name);
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read artifact {}", path.display()))?;
        serde_yaml::from_str(&raw)
            .with_context(|| format!("Failed to parse artifact {}", path.display()))
    }

    /// All artifact file names for a pipeline, sorted (stage order falls
    /// out of the numeric prefix).
    pub fn list(&self, pipeline_id: &str) -> Result<Vec<String>> {
        let dir = self.pipeline_dir(pipeline_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut names: Vec<String> = std::fs::read_dir(&dir)
            .with_context(|| format!("Failed to read artifact directory {}", dir.display()))?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "yaml"))
            .filter_map(|e| e.file_name().to_str().map(String::from))
            .collect();
        names.sort();
        Ok(names)
    }

    /// Copy the project workspace into
    /// `{pipeline_id}/snapshots/{label}/`, skipping VCS metadata, build
    /// output, and the `.agentforge` tree itself.
    pub fn snapshot_workspace(
        &self,
        pipeline_id: &str,
        label: &str,
        project_dir: &Path,
    ) -> Result<PathBuf> {
        let dest_root = self.pipeline_dir(pipeline_id).join("snapshots").join(label);
        std::fs::create_dir_all(&dest_root)
            .with_context(|| format!("Failed to create snapshot dir {}", dest_root.display()))?;

        for entry in WalkDir::new(project_dir)
            .into_iter()
            .filter_entry(|e| !is_excluded(e.file_name().to_str().unwrap_or("")))
        {
            let entry = entry.context("Failed to walk project directory")?;
            let rel = entry
                .path()
                .strip_prefix(project_dir)
                .context("Walked path escaped project directory")?;
            if rel.as_os_str().is_empty() {
                continue;
            }
            let dest = dest_root.join(rel);
            if entry.file_type().is_dir() {
                std::fs::create_dir_all(&dest)?;
            } else if entry.file_type().is_file() {
                if let Some(parent) = dest.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::copy(entry.path(), &dest).with_context(|| {
                    format!("Failed to copy {} into snapshot", entry.path().display())
                })?;
            }
        }
        Ok(dest_root)
    }
}

fn is_excluded(name: &str) -> bool {
    matches!(name, ".git" | ".agentforge" | "target" | "node_modules")
}
