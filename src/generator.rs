//! Candidate text generators.

use crate::llm::{CompletionRequest, LlmClient};
use crate::prompts::{PromptRenderer, names};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

/// One generator's candidate for a prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationResult {
    pub generator_id: String,
    pub text: String,
    pub tokens_used: u64,
}

/// Produces a candidate text for a prompt.
#[async_trait]
pub trait Generator: Send + Sync {
    fn id(&self) -> &str;

    async fn generate_with_metadata(&self, prompt: &str) -> Result<GenerationResult>;

    async fn generate(&self, prompt: &str) -> Result<String> {
        Ok(self.generate_with_metadata(prompt).await?.text)
    }
}

/// Generator backed by a model call, with an optional style directive.
pub struct LlmGenerator {
    id: String,
    style: String,
    temperature: Option<f32>,
    client: Arc<dyn LlmClient>,
    renderer: Arc<dyn PromptRenderer>,
}

impl LlmGenerator {
    pub fn new(id: &str, client: Arc<dyn LlmClient>, renderer: Arc<dyn PromptRenderer>) -> Self {
        Self {
            id: id.to_string(),
            style: String::new(),
            temperature: None,
            client,
            renderer,
        }
    }

    pub fn with_style(mut self, style: &str) -> Self {
        self.style = style.to_string();
        self
    }

    pub fn with_temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }
}

#[async_trait]
impl Generator for LlmGenerator {
    fn id(&self) -> &str {
        &self.id
    }

    async fn generate_with_metadata(&self, prompt: &str) -> Result<GenerationResult> {
        let rendered = self
            .renderer
            .render(names::GENERATE, &json!({ "prompt": prompt, "style": self.style }))?;
        let mut request = CompletionRequest::from_rendered(rendered);
        if let Some(temperature) = self.temperature {
            request = request.with_temperature(temperature);
        }

        let completion = self
            .client
            .complete(&request)
            .await
            .with_context(|| format!("Generator {} failed", self.id))?;

        Ok(GenerationResult {
            generator_id: self.id.clone(),
            text: completion.text.trim().to_string(),
            tokens_used: completion.total_tokens(),
        })
    }
}
