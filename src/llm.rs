//! LLM provider contract.
//!
//! The kernel never speaks a wire protocol; it consumes a provider as
//! `chat(system, messages, tools) -> {text, tool_calls, usage}`. Adapter
//! crates normalize provider-specific shapes into these records at their
//! boundary. The `ScriptedProvider` here replays canned responses for tests
//! and offline smoke runs.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;

/// One conversation turn handed to the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A tool the provider may ask the executor to invoke.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON schema of the tool parameters.
    pub parameters: serde_json::Value,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub params: serde_json::Value,
}

/// Token and cost accounting for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

impl TokenUsage {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Normalized provider response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmResponse {
    pub text: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub usage: TokenUsage,
}

impl LlmResponse {
    pub fn text_only(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tool_calls: Vec::new(),
            usage: TokenUsage::default(),
        }
    }
}

/// The single operation the kernel requires of a provider.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn chat(
        &self,
        system: &str,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
    ) -> Result<LlmResponse>;
}

/// Deterministic provider that replays a fixed queue of responses.
///
/// Each `chat` call pops the next response; an exhausted queue is an error
/// so a test that makes more calls than scripted fails loudly.
pub struct ScriptedProvider {
    responses: Mutex<VecDeque<LlmResponse>>,
}

impl ScriptedProvider {
    pub fn new(responses: Vec<LlmResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
        }
    }

    /// Convenience constructor from plain response texts.
    pub fn with_texts<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(texts.into_iter().map(LlmResponse::text_only).collect())
    }

    pub fn remaining(&self) -> usize {
        self.responses.lock().map(|q| q.len()).unwrap_or(0)
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn chat(
        &self,
        _system: &str,
        _messages: &[ChatMessage],
        _tools: &[ToolSpec],
    ) -> Result<LlmResponse> {
        let mut queue = self
            .responses
            .lock()
            .map_err(|_| anyhow::anyhow!("Scripted provider lock poisoned"))?;
        queue
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("Scripted provider exhausted: no more responses"))
    }
}

/// Provider that shells out to an agent CLI (e.g. `claude --print`),
/// writing the composed prompt on stdin and reading the reply from
/// stdout. Token accounting is unavailable through this transport, so
/// usage stays zero and cost caps bind only on providers that report it.
pub struct CommandProvider {
    command: String,
    args: Vec<String>,
}

impl CommandProvider {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }
}

#[async_trait]
impl LlmProvider for CommandProvider {
    async fn chat(
        &self,
        system: &str,
        messages: &[ChatMessage],
        _tools: &[ToolSpec],
    ) -> Result<LlmResponse> {
        use tokio::io::AsyncWriteExt;

        let mut prompt = format!("{system}\n\n");
        for message in messages {
            prompt.push_str(&message.content);
            prompt.push('\n');
        }

        let mut child = tokio::process::Command::new(&self.command)
            .args(&self.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to spawn provider command '{}'", self.command))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(prompt.as_bytes()).await?;
            stdin.shutdown().await.context("Failed to close provider stdin")?;
        }

        let output = child
            .wait_with_output()
            .await
            .context("Provider command failed")?;
        if !output.status.success() {
            anyhow::bail!(
                "Provider command '{}' exited with {}",
                self.command,
                output.status.code().unwrap_or(-1)
            );
        }

        Ok(LlmResponse::text_only(
            String::from_utf8_lossy(&output.stdout).into_owned(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_provider_replays_in_order() {
        let provider = ScriptedProvider::with_texts(["first", "second"]);
        let a = provider.chat("sys", &[], &[]).await.unwrap();
        let b = provider.chat("sys", &[], &[]).await.unwrap();
        assert_eq!(a.text, "first");
        assert_eq!(b.text, "second");
        assert_eq!(provider.remaining(), 0);
    }

    #[tokio::test]
    async fn test_scripted_provider_errors_when_exhausted() {
        let provider = ScriptedProvider::with_texts(["only"]);
        provider.chat("sys", &[], &[]).await.unwrap();
        let err = provider.chat("sys", &[], &[]).await.unwrap_err();
        assert!(err.to_string().contains("exhausted"));
    }

    #[test]
    fn test_usage_total() {
        let usage = TokenUsage {
            input_tokens: 1200,
            output_tokens: 300,
            cost_usd: 0.02,
        };
        assert_eq!(usage.total_tokens(), 1500);
    }

    #[test]
    fn test_response_serde_round_trip() {
        let response = LlmResponse {
            text: "done".to_string(),
            tool_calls: vec![ToolCall {
                name: "run_tests".to_string(),
                params: serde_json::json!({"path": "tests/"}),
            }],
            usage: TokenUsage {
                input_tokens: 10,
                output_tokens: 5,
                cost_usd: 0.001,
            },
        };
        let json = serde_json::to_string(&response).unwrap();
        let back: LlmResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(back.tool_calls[0].name, "run_tests");
        assert_eq!(back.usage.total_tokens(), 15);
    }
}
