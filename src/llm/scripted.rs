//! Replay client that answers from a script instead of a model.
//!
//! Used by tests and offline dry runs. Responses are served in order; once
//! the script is exhausted the responder (if any) or the fallback answers.

use super::{Completion, CompletionRequest, LlmClient, TokenCounter, estimate_tokens};
use crate::errors::LlmError;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

type Responder = Box<dyn Fn(&CompletionRequest) -> String + Send + Sync>;

pub struct ScriptedClient {
    name: String,
    script: Mutex<VecDeque<String>>,
    responder: Option<Responder>,
    fallback: Option<String>,
    tokens_per_call: Option<u64>,
    json_support: bool,
    requests: Mutex<Vec<CompletionRequest>>,
    counter: Arc<TokenCounter>,
}

impl ScriptedClient {
    pub fn new(responses: Vec<String>) -> Self {
        Self {
            name: "scripted".to_string(),
            script: Mutex::new(responses.into()),
            responder: None,
            fallback: None,
            tokens_per_call: None,
            json_support: true,
            requests: Mutex::new(Vec::new()),
            counter: TokenCounter::shared(),
        }
    }

    /// Answer every request by calling `responder`.
    pub fn with_responder(
        responder: impl Fn(&CompletionRequest) -> String + Send + Sync + 'static,
    ) -> Self {
        let mut client = Self::new(Vec::new());
        client.responder = Some(Box::new(responder));
        client
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_fallback(mut self, response: &str) -> Self {
        self.fallback = Some(response.to_string());
        self
    }

    /// Report a fixed token cost per call instead of an estimate.
    pub fn with_tokens_per_call(mut self, tokens: u64) -> Self {
        self.tokens_per_call = Some(tokens);
        self
    }

    pub fn with_counter(mut self, counter: Arc<TokenCounter>) -> Self {
        self.counter = counter;
        self
    }

    pub fn without_json_support(mut self) -> Self {
        self.json_support = false;
        self
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    fn next_response(&self, request: &CompletionRequest) -> Option<String> {
        let scripted = self.script.lock().ok().and_then(|mut s| s.pop_front());
        scripted
            .or_else(|| self.responder.as_ref().map(|r| r(request)))
            .or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl LlmClient for ScriptedClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn counter(&self) -> &Arc<TokenCounter> {
        &self.counter
    }

    fn supports_json(&self) -> bool {
        self.json_support
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }

        let text = self.next_response(request).ok_or_else(|| {
            LlmError::MalformedResponse(format!("{}: script exhausted", self.name))
        })?;

        let (input_tokens, output_tokens) = match self.tokens_per_call {
            Some(tokens) => (0, tokens),
            None => (
                estimate_tokens(&request.system) + estimate_tokens(&request.user),
                estimate_tokens(&text),
            ),
        };
        self.counter.add(input_tokens + output_tokens);

        Ok(Completion {
            text,
            input_tokens,
            output_tokens,
        })
    }
}
