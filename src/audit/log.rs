//! Per-pipeline append-only JSONL writer.
//!
//! One file per pipeline under `audit/<pipeline_id>.log`, one JSON record
//! per line. Step numbers are assigned at append time from an in-memory
//! counter seeded by scanning the existing file, so a resumed process
//! continues the numbering where the previous one stopped.

use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::debug;

use super::{ActionRecord, NewAction};

pub struct AuditLog {
    audit_dir: PathBuf,
    next_steps: Mutex<BTreeMap<String, u64>>,
}

impl AuditLog {
    pub fn new(audit_dir: impl Into<PathBuf>) -> Self {
        Self {
            audit_dir: audit_dir.into(),
            next_steps: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn log_file(&self, pipeline_id: &str) -> PathBuf {
        self.audit_dir.join(format!("{pipeline_id}.log"))
    }

    /// Append an action, assigning the next step number. Returns the full
    /// record as written.
    pub fn append(&self, pipeline_id: &str, action: NewAction) -> Result<ActionRecord> {
        let step = self.reserve_step(pipeline_id)?;
        let record = ActionRecord {
            step,
            timestamp: Utc::now(),
            stage: action.stage,
            kind: action.kind,
            summary: action.summary,
            input_hash: action.input_hash,
            output_hash: action.output_hash,
            detail: action.detail,
            tokens: action.tokens,
            cost_usd: action.cost_usd,
        };

        std::fs::create_dir_all(&self.audit_dir)
            .context("Failed to create audit directory")?;
        let line = serde_json::to_string(&record).context("Failed to serialize audit record")?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_file(pipeline_id))
            .context("Failed to open audit log")?;
        writeln!(file, "{line}").context("Failed to append audit record")?;

        debug!(pipeline = pipeline_id, step, kind = ?record.kind, "audit appended");
        Ok(record)
    }

    /// All records for a pipeline, in step order.
    pub fn load(&self, pipeline_id: &str) -> Result<Vec<ActionRecord>> {
        let path = self.log_file(pipeline_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read audit log {}", path.display()))?;
        let mut records = Vec::new();
        for (n, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record: ActionRecord = serde_json::from_str(line)
                .with_context(|| format!("Corrupt audit record at line {}", n + 1))?;
            records.push(record);
        }
        Ok(records)
    }

    /// The last `n` records, oldest first.
    pub fn tail(&self, pipeline_id: &str, n: usize) -> Result<Vec<ActionRecord>> {
        let mut records = self.load(pipeline_id)?;
        let skip = records.len().saturating_sub(n);
        Ok(records.split_off(skip))
    }

    fn reserve_step(&self, pipeline_id: &str) -> Result<u64> {
        let mut counters = self
            .next_steps
            .lock()
            .map_err(|_| anyhow::anyhow!("Audit step counter lock poisoned"))?;
        let next = match counters.get(pipeline_id) {
            Some(n) => *n,
            None => self
                .load(pipeline_id)?
                .last()
                .map(|r| r.step + 1)
                .unwrap_or(1),
        };
        counters.insert(pipeline_id.to_string(), next + 1);
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::ActionKind;
    use crate::stage::Stage;
    use tempfile::tempdir;

    #[test]
    fn test_append_assigns_monotone_steps() {
        let dir = tempdir().unwrap();
        let log = AuditLog::new(dir.path());
        let a = log
            .append("PL-1", NewAction::new(ActionKind::LlmCall, "intake call"))
            .unwrap();
        let b = log
            .append("PL-1", NewAction::new(ActionKind::Verification, "intake->clarify"))
            .unwrap();
        assert_eq!(a.step, 1);
        assert_eq!(b.step, 2);
    }

    #[test]
    fn test_steps_are_per_pipeline() {
        let dir = tempdir().unwrap();
        let log = AuditLog::new(dir.path());
        log.append("PL-1", NewAction::new(ActionKind::LlmCall, "x")).unwrap();
        let other = log
            .append("PL-2", NewAction::new(ActionKind::LlmCall, "y"))
            .unwrap();
        assert_eq!(other.step, 1);
    }

    #[test]
    fn test_new_writer_continues_numbering_from_disk() {
        let dir = tempdir().unwrap();
        {
            let log = AuditLog::new(dir.path());
            log.append("PL-1", NewAction::new(ActionKind::ToolCall, "write_file a"))
                .unwrap();
            log.append("PL-1", NewAction::new(ActionKind::ToolCall, "write_file b"))
                .unwrap();
        }
        // Fresh writer, same directory — simulates a process restart.
        let log = AuditLog::new(dir.path());
        let c = log
            .append("PL-1", NewAction::new(ActionKind::ToolCall, "write_file c"))
            .unwrap();
        assert_eq!(c.step, 3);
    }

    #[test]
    fn test_load_round_trips_records() {
        let dir = tempdir().unwrap();
        let log = AuditLog::new(dir.path());
        log.append(
            "PL-1",
            NewAction::new(ActionKind::ToolCall, "run_tests")
                .stage(Stage::Green)
                .detail(serde_json::json!({"tool": "run_tests", "params": {}}))
                .usage(0, 0.0),
        )
        .unwrap();

        let records = log.load("PL-1").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].stage, Some(Stage::Green));
        assert_eq!(records[0].detail.as_ref().unwrap()["tool"], "run_tests");
    }

    #[test]
    fn test_load_missing_log_is_empty() {
        let dir = tempdir().unwrap();
        let log = AuditLog::new(dir.path());
        assert!(log.load("PL-none").unwrap().is_empty());
    }

    #[test]
    fn test_tail_returns_last_n_oldest_first() {
        let dir = tempdir().unwrap();
        let log = AuditLog::new(dir.path());
        for i in 0..5 {
            log.append("PL-1", NewAction::new(ActionKind::LlmCall, format!("call {i}")))
                .unwrap();
        }
        let tail = log.tail("PL-1", 2).unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].summary, "call 3");
        assert_eq!(tail[1].summary, "call 4");
    }
}
