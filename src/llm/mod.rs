//! Model client abstraction and shared token accounting.
//!
//! Every component that talks to a model does so through [`LlmClient`]. Token
//! usage is accumulated on a [`TokenCounter`] shared by all clients in a run;
//! components never increment a global tally themselves, they take a
//! [`TokenSnapshot`] before their work and read the delta afterwards.

pub mod claude;
pub mod scripted;

pub use claude::{ClaudeCliClient, ClaudeCliConfig};
pub use scripted::ScriptedClient;

use crate::errors::LlmError;
use crate::prompts::RenderedPrompt;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// A single completion request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub system: String,
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// The caller will parse the response as structured JSON.
    #[serde(default)]
    pub json: bool,
}

impl CompletionRequest {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
            ..Default::default()
        }
    }

    pub fn from_rendered(prompt: RenderedPrompt) -> Self {
        Self::new(prompt.system, prompt.user)
    }

    /// Mark the request as expecting a structured JSON answer.
    pub fn expecting_json(mut self) -> Self {
        self.json = true;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

/// A completed model response with its token cost.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Completion {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Monotonic token tally shared by every client in a run.
#[derive(Debug, Default)]
pub struct TokenCounter {
    total: AtomicU64,
}

impl TokenCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn add(&self, tokens: u64) {
        self.total.fetch_add(tokens, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> TokenSnapshot {
        TokenSnapshot { at: self.total() }
    }
}

/// Point-in-time reading of a [`TokenCounter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenSnapshot {
    at: u64,
}

impl TokenSnapshot {
    /// Tokens consumed on the counter since this snapshot was taken.
    pub fn delta(&self, counter: &TokenCounter) -> u64 {
        counter.total().saturating_sub(self.at)
    }
}

/// A request/response model service with token accounting.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Client identifier used in logs.
    fn name(&self) -> &str;

    /// The counter this client reports usage to.
    fn counter(&self) -> &Arc<TokenCounter>;

    /// Whether the client can be asked for structured JSON output.
    fn supports_json(&self) -> bool {
        true
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError>;
}

/// Issue a request whose answer will be parsed as structured output.
///
/// Fails immediately when the client lacks the capability; that is a wiring
/// bug, not a quality issue to degrade around.
pub async fn complete_structured(
    client: &dyn LlmClient,
    request: CompletionRequest,
) -> Result<Completion, LlmError> {
    if !client.supports_json() {
        return Err(LlmError::Unsupported {
            capability: "structured_output",
        });
    }
    client.complete(&request.expecting_json()).await
}

/// Rough token estimate for clients that do not report usage.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}
