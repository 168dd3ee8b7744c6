//! Tool bridge: uniform `run(name, params)` dispatch over pluggable
//! handlers.
//!
//! Executors never call the tool layer directly. The bridge looks up the
//! handler, enforces a per-call timeout, converts handler failures into
//! structured outcomes, and records every call in the audit log — full
//! payload in the record's detail, a one-line summary everywhere else.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use walkdir::WalkDir;

use crate::audit::{ActionKind, AuditLog, NewAction};
use crate::errors::ToolError;
use crate::stage::Stage;

const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 120;

/// Result of one tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub ok: bool,
    pub value: Option<Value>,
    pub error: Option<String>,
}

impl ToolOutcome {
    pub fn success(value: Value) -> Self {
        Self {
            ok: true,
            value: Some(value),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            value: None,
            error: Some(error.into()),
        }
    }

    /// One-line rendering used for the audit summary and context window.
    pub fn summary(&self) -> String {
        fn clip(text: &str) -> String {
            let flat = text.replace('\n', " ");
            flat.chars().take(200).collect()
        }
        match (&self.value, &self.error) {
            (_, Some(error)) => format!("error: {}", clip(error)),
            (Some(value), None) => format!("ok: {}", clip(&value.to_string())),
            (None, None) => "ok".to_string(),
        }
    }
}

/// One tool the bridge can dispatch to.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, params: &Value, project_dir: &Path) -> Result<Value, ToolError>;
}

pub struct ToolBridge {
    handlers: BTreeMap<String, Arc<dyn ToolHandler>>,
    timeout: Duration,
    audit: Arc<AuditLog>,
    project_dir: PathBuf,
}

impl ToolBridge {
    pub fn new(project_dir: PathBuf, audit: Arc<AuditLog>) -> Self {
        Self {
            handlers: BTreeMap::new(),
            timeout: Duration::from_secs(DEFAULT_TOOL_TIMEOUT_SECS),
            audit,
            project_dir,
        }
    }

    /// Bridge with the reference handler set registered.
    pub fn with_default_handlers(project_dir: PathBuf, audit: Arc<AuditLog>) -> Self {
        let mut bridge = Self::new(project_dir, audit);
        bridge.register(Arc::new(ReadFileHandler));
        bridge.register(Arc::new(WriteFileHandler));
        bridge.register(Arc::new(EditFileHandler));
        bridge.register(Arc::new(SearchCodeHandler));
        bridge.register(Arc::new(RunTestsHandler));
        bridge.register(Arc::new(GitHandler));
        bridge
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn register(&mut self, handler: Arc<dyn ToolHandler>) {
        self.handlers.insert(handler.name().to_string(), handler);
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    /// Dispatch one call: lookup, timeout, structured error conversion,
    /// audit append.
    pub async fn run(
        &self,
        pipeline_id: &str,
        stage: Option<Stage>,
        name: &str,
        params: Value,
    ) -> ToolOutcome {
        let outcome = match self.handlers.get(name) {
            None => ToolOutcome::failure(
                ToolError::UnknownTool {
                    name: name.to_string(),
                }
                .to_string(),
            ),
            Some(handler) => {
                match tokio::time::timeout(
                    self.timeout,
                    handler.run(&params, &self.project_dir),
                )
                .await
                {
                    Err(_) => ToolOutcome::failure(
                        ToolError::Timeout {
                            name: name.to_string(),
                            timeout_secs: self.timeout.as_secs(),
                        }
                        .to_string(),
                    ),
                    Ok(Err(err)) => ToolOutcome::failure(err.to_string()),
                    Ok(Ok(value)) => ToolOutcome::success(value),
                }
            }
        };

        let mut action = NewAction::new(
            ActionKind::ToolCall,
            format!("{name}: {}", outcome.summary()),
        )
        .detail(json!({
            "tool": name,
            "params": params,
            "result": outcome.value,
            "error": outcome.error,
        }));
        if let Some(stage) = stage {
            action = action.stage(stage);
        }
        if let Err(err) = self.audit.append(pipeline_id, action) {
            warn!(pipeline = pipeline_id, tool = name, %err, "failed to audit tool call");
        }

        outcome
    }
}

fn require_str<'a>(params: &'a Value, key: &str, tool: &str) -> Result<&'a str, ToolError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::InvalidParams {
            name: tool.to_string(),
            message: format!("missing string field '{key}'"),
        })
}

fn handler_failed(tool: &str, err: impl std::fmt::Display) -> ToolError {
    ToolError::HandlerFailed {
        name: tool.to_string(),
        message: err.to_string(),
    }
}

/// `read_file {path}` → `{content}`
pub struct ReadFileHandler;

#[async_trait]
impl ToolHandler for ReadFileHandler {
    fn name(&self) -> &'static str {
        "read_file"
    }

    async fn run(&self, params: &Value, project_dir: &Path) -> Result<Value, ToolError> {
        let path = project_dir.join(require_str(params, "path", self.name())?);
        let content =
            std::fs::read_to_string(&path).map_err(|e| handler_failed(self.name(), e))?;
        Ok(json!({"content": content}))
    }
}

/// `write_file {path, content}` → `{bytes_written}`
pub struct WriteFileHandler;

#[async_trait]
impl ToolHandler for WriteFileHandler {
    fn name(&self) -> &'static str {
        "write_file"
    }

    async fn run(&self, params: &Value, project_dir: &Path) -> Result<Value, ToolError> {
        let path = project_dir.join(require_str(params, "path", self.name())?);
        let content = require_str(params, "content", self.name())?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| handler_failed(self.name(), e))?;
        }
        std::fs::write(&path, content).map_err(|e| handler_failed(self.name(), e))?;
        Ok(json!({"bytes_written": content.len()}))
    }
}

/// `edit_file {path, find, replace}` → `{replacements}`
pub struct EditFileHandler;

#[async_trait]
impl ToolHandler for EditFileHandler {
    fn name(&self) -> &'static str {
        "edit_file"
    }

    async fn run(&self, params: &Value, project_dir: &Path) -> Result<Value, ToolError> {
        let path = project_dir.join(require_str(params, "path", self.name())?);
        let find = require_str(params, "find", self.name())?;
        let replace = require_str(params, "replace", self.name())?;

        let content =
            std::fs::read_to_string(&path).map_err(|e| handler_failed(self.name(), e))?;
        let count = content.matches(find).count();
        if count == 0 {
            return Err(handler_failed(self.name(), "find text not present in file"));
        }
        std::fs::write(&path, content.replace(find, replace))
            .map_err(|e| handler_failed(self.name(), e))?;
        Ok(json!({"replacements": count}))
    }
}

/// `search_code {query, max_results?}` → `{matches: [{file, line, text}]}`
pub struct SearchCodeHandler;

#[async_trait]
impl ToolHandler for SearchCodeHandler {
    fn name(&self) -> &'static str {
        "search_code"
    }

    async fn run(&self, params: &Value, project_dir: &Path) -> Result<Value, ToolError> {
        let query = require_str(params, "query", self.name())?;
        let max_results = params
            .get("max_results")
            .and_then(Value::as_u64)
            .unwrap_or(50) as usize;

        let mut matches = Vec::new();
        'outer: for entry in WalkDir::new(project_dir)
            .into_iter()
            .filter_entry(|e| {
                let name = e.file_name().to_str().unwrap_or("");
                !matches!(name, ".git" | ".agentforge" | "target" | "node_modules")
            })
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let Ok(content) = std::fs::read_to_string(entry.path()) else {
                continue; // binary or unreadable
            };
            for (line_no, line) in content.lines().enumerate() {
                if line.contains(query) {
                    matches.push(json!({
                        "file": entry
                            .path()
                            .strip_prefix(project_dir)
                            .unwrap_or(entry.path())
                            .to_string_lossy(),
                        "line": line_no + 1,
                        "text": line.trim(),
                    }));
                    if matches.len() >= max_results {
                        break 'outer;
                    }
                }
            }
        }
        Ok(json!({"matches": matches}))
    }
}

/// `run_tests {command?, args?}` → `{exit_code, passed, output}`
///
/// Defaults to `cargo test`. Output is capped to its tail so a verbose
/// run cannot bloat the audit detail.
pub struct RunTestsHandler;

#[async_trait]
impl ToolHandler for RunTestsHandler {
    fn name(&self) -> &'static str {
        "run_tests"
    }

    async fn run(&self, params: &Value, project_dir: &Path) -> Result<Value, ToolError> {
        let command = params
            .get("command")
            .and_then(Value::as_str)
            .unwrap_or("cargo");
        let args: Vec<String> = match params.get("args").and_then(Value::as_array) {
            Some(items) => items
                .iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect(),
            None => vec!["test".to_string()],
        };

        let output = tokio::process::Command::new(command)
            .args(&args)
            .current_dir(project_dir)
            .output()
            .await
            .map_err(|e| handler_failed(self.name(), e))?;

        let exit_code = output.status.code().unwrap_or(-1);
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        let tail: String = combined
            .lines()
            .rev()
            .take(100)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect::<Vec<_>>()
            .join("\n");

        Ok(json!({
            "exit_code": exit_code,
            "passed": exit_code == 0,
            "output": tail,
        }))
    }
}

/// `git {args}` → `{exit_code, stdout, stderr}`
pub struct GitHandler;

#[async_trait]
impl ToolHandler for GitHandler {
    fn name(&self) -> &'static str {
        "git"
    }

    async fn run(&self, params: &Value, project_dir: &Path) -> Result<Value, ToolError> {
        let args: Vec<String> = params
            .get("args")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .ok_or_else(|| ToolError::InvalidParams {
                name: self.name().to_string(),
                message: "missing array field 'args'".to_string(),
            })?;

        let output = tokio::process::Command::new("git")
            .args(&args)
            .current_dir(project_dir)
            .output()
            .await
            .map_err(|e| handler_failed(self.name(), e))?;

        Ok(json!({
            "exit_code": output.status.code().unwrap_or(-1),
            "stdout": String::from_utf8_lossy(&output.stdout),
            "stderr": String::from_utf8_lossy(&output.stderr),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_bridge(project_dir: &Path) -> (ToolBridge, Arc<AuditLog>) {
        let audit = Arc::new(AuditLog::new(project_dir.join("audit")));
        let bridge = ToolBridge::with_default_handlers(project_dir.to_path_buf(), audit.clone());
        (bridge, audit)
    }

    #[tokio::test]
    async fn test_unknown_tool_is_structured_failure() {
        let dir = tempdir().unwrap();
        let (bridge, _) = make_bridge(dir.path());
        let outcome = bridge.run("PL-1", None, "teleport", json!({})).await;
        assert!(!outcome.ok);
        assert!(outcome.error.unwrap().contains("Unknown tool"));
    }

    #[tokio::test]
    async fn test_write_then_read_file() {
        let dir = tempdir().unwrap();
        let (bridge, _) = make_bridge(dir.path());

        let write = bridge
            .run(
                "PL-1",
                Some(Stage::Green),
                "write_file",
                json!({"path": "src/lib.rs", "content": "pub fn f() {}"}),
            )
            .await;
        assert!(write.ok, "{:?}", write.error);

        let read = bridge
            .run("PL-1", Some(Stage::Green), "read_file", json!({"path": "src/lib.rs"}))
            .await;
        assert_eq!(
            read.value.unwrap()["content"],
            json!("pub fn f() {}")
        );
    }

    #[tokio::test]
    async fn test_edit_file_counts_replacements() {
        let dir = tempdir().unwrap();
        let (bridge, _) = make_bridge(dir.path());
        std::fs::write(dir.path().join("a.txt"), "foo bar foo").unwrap();

        let outcome = bridge
            .run(
                "PL-1",
                None,
                "edit_file",
                json!({"path": "a.txt", "find": "foo", "replace": "baz"}),
            )
            .await;
        assert_eq!(outcome.value.unwrap()["replacements"], json!(2));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("a.txt")).unwrap(),
            "baz bar baz"
        );
    }

    #[tokio::test]
    async fn test_edit_file_missing_text_fails() {
        let dir = tempdir().unwrap();
        let (bridge, _) = make_bridge(dir.path());
        std::fs::write(dir.path().join("a.txt"), "nothing here").unwrap();
        let outcome = bridge
            .run(
                "PL-1",
                None,
                "edit_file",
                json!({"path": "a.txt", "find": "absent", "replace": "x"}),
            )
            .await;
        assert!(!outcome.ok);
    }

    #[tokio::test]
    async fn test_search_code_finds_matches() {
        let dir = tempdir().unwrap();
        let (bridge, _) = make_bridge(dir.path());
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/auth.rs"), "fn oauth_login() {}\n").unwrap();

        let outcome = bridge
            .run("PL-1", None, "search_code", json!({"query": "oauth_login"}))
            .await;
        let matches = outcome.value.unwrap()["matches"].as_array().unwrap().clone();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0]["line"], json!(1));
    }

    #[tokio::test]
    async fn test_missing_params_is_invalid_params() {
        let dir = tempdir().unwrap();
        let (bridge, _) = make_bridge(dir.path());
        let outcome = bridge.run("PL-1", None, "read_file", json!({})).await;
        assert!(!outcome.ok);
        assert!(outcome.error.unwrap().contains("invalid parameters"));
    }

    #[tokio::test]
    async fn test_every_call_is_audited_with_detail() {
        let dir = tempdir().unwrap();
        let (bridge, audit) = make_bridge(dir.path());
        bridge
            .run(
                "PL-1",
                Some(Stage::Green),
                "write_file",
                json!({"path": "x.txt", "content": "hi"}),
            )
            .await;
        bridge.run("PL-1", None, "teleport", json!({})).await;

        let records = audit.load("PL-1").unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].kind, ActionKind::ToolCall);
        assert_eq!(records[0].detail.as_ref().unwrap()["tool"], "write_file");
        assert!(records[1].summary.contains("error"));
    }

    #[tokio::test]
    async fn test_timeout_converts_to_failure() {
        struct SlowHandler;

        #[async_trait]
        impl ToolHandler for SlowHandler {
            fn name(&self) -> &'static str {
                "slow"
            }
            async fn run(&self, _: &Value, _: &Path) -> Result<Value, ToolError> {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(json!({}))
            }
        }

        let dir = tempdir().unwrap();
        let audit = Arc::new(AuditLog::new(dir.path().join("audit")));
        let mut bridge = ToolBridge::new(dir.path().to_path_buf(), audit)
            .with_timeout(Duration::from_millis(50));
        bridge.register(Arc::new(SlowHandler));

        let outcome = bridge.run("PL-1", None, "slow", json!({})).await;
        assert!(!outcome.ok);
        assert!(outcome.error.unwrap().contains("timed out"));
    }

    #[test]
    fn test_outcome_summary_is_one_line_and_capped() {
        let outcome = ToolOutcome::success(json!({"output": "line1\nline2".repeat(100)}));
        let summary = outcome.summary();
        assert!(!summary.contains('\n'));
        assert!(summary.len() <= 210);
    }
}
