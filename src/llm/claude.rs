//! Model client backed by the `claude` command-line tool.
//!
//! The prompt is written to stdin and the CLI is asked for its JSON output
//! format, which carries the answer text and a usage block.

use super::{Completion, CompletionRequest, LlmClient, TokenCounter, estimate_tokens};
use crate::errors::LlmError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Default timeout for a single model call.
const DEFAULT_TIMEOUT_SECS: u64 = 300; // 5 minutes

/// Default Claude command.
const DEFAULT_CLAUDE_CMD: &str = "claude";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClaudeCliConfig {
    /// CLI command (default: "claude").
    pub command: String,
    /// Model override passed as `--model`.
    pub model: Option<String>,
    /// Per-call timeout.
    pub timeout: Duration,
    /// Extra arguments appended to every invocation.
    pub extra_args: Vec<String>,
}

impl Default for ClaudeCliConfig {
    fn default() -> Self {
        Self {
            command: DEFAULT_CLAUDE_CMD.to_string(),
            model: None,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            extra_args: Vec::new(),
        }
    }
}

impl ClaudeCliConfig {
    pub fn with_command(mut self, cmd: &str) -> Self {
        self.command = cmd.to_string();
        self
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Arguments for one invocation, excluding the prompt itself.
    pub fn args(&self, request: &CompletionRequest) -> Vec<String> {
        let mut args = vec![
            "--print".to_string(),
            "--output-format".to_string(),
            "json".to_string(),
        ];
        if let Some(ref model) = self.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        if !request.system.is_empty() {
            args.push("--system-prompt".to_string());
            args.push(request.system.clone());
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }

    /// Request options the CLI has no flag for.
    pub fn dropped_options(request: &CompletionRequest) -> Vec<&'static str> {
        let mut dropped = Vec::new();
        if request.temperature.is_some() {
            dropped.push("temperature");
        }
        if request.max_tokens.is_some() {
            dropped.push("max_tokens");
        }
        dropped
    }
}

pub struct ClaudeCliClient {
    name: String,
    config: ClaudeCliConfig,
    counter: Arc<TokenCounter>,
}

impl ClaudeCliClient {
    pub fn new(name: &str, config: ClaudeCliConfig, counter: Arc<TokenCounter>) -> Self {
        Self {
            name: name.to_string(),
            config,
            counter,
        }
    }

    pub fn config(&self) -> &ClaudeCliConfig {
        &self.config
    }
}

#[async_trait]
impl LlmClient for ClaudeCliClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn counter(&self) -> &Arc<TokenCounter> {
        &self.counter
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError> {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(self.config.args(request))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(
            client = %self.name,
            prompt_chars = request.user.len(),
            "Spawning model process"
        );
        let dropped = ClaudeCliConfig::dropped_options(request);
        if !dropped.is_empty() {
            tracing::debug!(client = %self.name, options = ?dropped, "CLI ignores request options");
        }

        let mut child = cmd.spawn().map_err(LlmError::SpawnFailed)?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(request.user.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let output = tokio::time::timeout(self.config.timeout, child.wait_with_output())
            .await
            .map_err(|_| LlmError::Timeout {
                secs: self.config.timeout.as_secs(),
            })??;

        if !output.status.success() {
            return Err(LlmError::ProcessFailed {
                exit_code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let completion = parse_cli_output(&stdout, request)?;
        self.counter.add(completion.total_tokens());

        tracing::debug!(
            client = %self.name,
            input_tokens = completion.input_tokens,
            output_tokens = completion.output_tokens,
            "Model call completed"
        );

        Ok(completion)
    }
}

#[derive(Debug, Deserialize)]
struct CliResult {
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    usage: Option<CliUsage>,
}

#[derive(Debug, Deserialize)]
struct CliUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

/// Interpret the CLI's stdout.
///
/// Plain text output (no JSON envelope) is accepted as the answer with an
/// estimated token cost.
fn parse_cli_output(stdout: &str, request: &CompletionRequest) -> Result<Completion, LlmError> {
    let trimmed = stdout.trim();
    let Ok(envelope) = serde_json::from_str::<CliResult>(trimmed) else {
        return Ok(Completion {
            text: trimmed.to_string(),
            input_tokens: estimate_tokens(&request.system) + estimate_tokens(&request.user),
            output_tokens: estimate_tokens(trimmed),
        });
    };

    let text = envelope.result.unwrap_or_default();
    if envelope.is_error {
        return Err(LlmError::MalformedResponse(text));
    }

    let (input_tokens, output_tokens) = match envelope.usage {
        Some(usage) => (usage.input_tokens, usage.output_tokens),
        None => (
            estimate_tokens(&request.system) + estimate_tokens(&request.user),
            estimate_tokens(&text),
        ),
    };

    Ok(Completion {
        text,
        input_tokens,
        output_tokens,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_include_model_and_system() {
        let config = ClaudeCliConfig::default().with_model(Some("sonnet".to_string()));
        let args = config.args(&CompletionRequest::new("be terse", "hello"));
        assert_eq!(&args[..3], &["--print", "--output-format", "json"]);
        assert!(args.windows(2).any(|w| w == ["--model", "sonnet"]));
        assert!(args.windows(2).any(|w| w == ["--system-prompt", "be terse"]));
    }

    #[test]
    fn test_args_skip_empty_system() {
        let args = ClaudeCliConfig::default().args(&CompletionRequest::new("", "hello"));
        assert!(!args.contains(&"--system-prompt".to_string()));
    }

    #[test]
    fn test_sampling_options_are_reported_as_dropped() {
        let plain = CompletionRequest::new("", "hello");
        assert!(ClaudeCliConfig::dropped_options(&plain).is_empty());

        let tuned = CompletionRequest::new("", "hello").with_temperature(0.9);
        assert_eq!(ClaudeCliConfig::dropped_options(&tuned), ["temperature"]);
        let args = ClaudeCliConfig::default().args(&tuned);
        assert!(!args.iter().any(|a| a.contains("temperature")));
    }

    #[test]
    fn test_parse_cli_output_with_usage() {
        let out = r#"{"type":"result","result":"The rain fell.","is_error":false,"usage":{"input_tokens":120,"output_tokens":8}}"#;
        let completion = parse_cli_output(out, &CompletionRequest::new("", "x")).unwrap();
        assert_eq!(completion.text, "The rain fell.");
        assert_eq!(completion.input_tokens, 120);
        assert_eq!(completion.output_tokens, 8);
    }

    #[test]
    fn test_parse_cli_output_plain_text() {
        let completion =
            parse_cli_output("just prose\n", &CompletionRequest::new("", "abcd")).unwrap();
        assert_eq!(completion.text, "just prose");
        assert_eq!(completion.input_tokens, 1);
    }

    #[test]
    fn test_parse_cli_output_error_flag() {
        let out = r#"{"result":"rate limited","is_error":true}"#;
        let err = parse_cli_output(out, &CompletionRequest::default()).unwrap_err();
        assert!(matches!(err, LlmError::MalformedResponse(msg) if msg == "rate limited"));
    }

    #[tokio::test]
    async fn test_missing_command_is_spawn_failure() {
        let config = ClaudeCliConfig::default().with_command("scriptorium-no-such-binary");
        let client = ClaudeCliClient::new("missing", config, TokenCounter::shared());
        let err = client
            .complete(&CompletionRequest::new("", "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::SpawnFailed(_)));
    }
}
