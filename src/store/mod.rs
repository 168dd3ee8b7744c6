//! Persistence layer: artifact store, state store, and the workspace lock.

pub mod artifact;
pub mod lock;
pub mod state;

pub use artifact::{ArtifactStore, WrittenArtifact};
pub use lock::WorkspaceLock;
pub use state::StateStore;

use anyhow::{Context, Result};
use std::path::Path;

/// Write `bytes` to `path` atomically: write a sibling temp file, then
/// rename over the target. Readers either see the old content or the new,
/// never a partial write.
pub(crate) fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("Path {} has no parent directory", path.display()))?;
    std::fs::create_dir_all(parent)
        .with_context(|| format!("Failed to create directory {}", parent.display()))?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("artifact");
    let tmp = parent.join(format!(".{file_name}.tmp"));
    std::fs::write(&tmp, bytes)
        .with_context(|| format!("Failed to write temp file {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to rename {} into place", tmp.display()))?;
    Ok(())
}

/// SHA-256 content hash, lowercase hex.
pub(crate) fn content_hash(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
