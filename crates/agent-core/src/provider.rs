//! LLM Provider Strategy Pattern
//!
//! Defines a common interface for all LLM providers (Ollama, OpenAI, Anthropic, etc.)
//! allowing the agent to work with any backend without code changes.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use agent_core::provider::{LlmProvider, ProviderReply};
//!
//! match provider.complete(&snapshot, &registry.describe_all()).await {
//!     Ok(ProviderReply::FinalAnswer { text, .. }) => println!("{text}"),
//!     Ok(ProviderReply::ToolCallBatch { calls, .. }) => { /* run tools */ }
//!     Err(e) if e.retryable => { /* try again */ }
//!     Err(e) => return Err(e.into()),
//! }
//! ```

use std::collections::VecDeque;
use std::ops::{Add, AddAssign};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::message::Message;
use crate::tool::{ToolCallRequest, ToolSpec};

/// Token usage statistics
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }
}

impl Add for TokenUsage {
    type Output = TokenUsage;

    fn add(self, other: TokenUsage) -> TokenUsage {
        TokenUsage {
            prompt_tokens: self.prompt_tokens.saturating_add(other.prompt_tokens),
            completion_tokens: self.completion_tokens.saturating_add(other.completion_tokens),
            total_tokens: self.total_tokens.saturating_add(other.total_tokens),
        }
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, other: TokenUsage) {
        *self = *self + other;
    }
}

/// Successful reply from a provider
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderReply {
    /// The model answered; the turn is over
    FinalAnswer {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<TokenUsage>,
    },
    /// The model wants tools run before it continues.
    ///
    /// An empty `calls` list is only legal together with `done = true`.
    ToolCallBatch {
        calls: Vec<ToolCallRequest>,
        #[serde(default)]
        done: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<TokenUsage>,
    },
}

impl ProviderReply {
    pub fn final_answer(text: impl Into<String>) -> Self {
        Self::FinalAnswer {
            text: text.into(),
            usage: None,
        }
    }

    pub fn tool_calls(calls: Vec<ToolCallRequest>) -> Self {
        Self::ToolCallBatch {
            calls,
            done: false,
            usage: None,
        }
    }

    /// Attach token usage
    pub fn with_usage(mut self, value: TokenUsage) -> Self {
        match &mut self {
            Self::FinalAnswer { usage, .. } | Self::ToolCallBatch { usage, .. } => {
                *usage = Some(value);
            }
        }
        self
    }

    pub fn usage(&self) -> Option<TokenUsage> {
        match self {
            Self::FinalAnswer { usage, .. } | Self::ToolCallBatch { usage, .. } => *usage,
        }
    }
}

/// What [`LlmProvider::complete`] yields
pub type ProviderResult = std::result::Result<ProviderReply, ProviderError>;

/// Strategy trait for LLM providers
///
/// Implement this trait to add support for new LLM backends.
/// The agent works exclusively through this interface and never inspects
/// which backend sits behind it.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Short backend name, used in logs
    fn name(&self) -> &str;

    /// Produce the next step of the conversation.
    ///
    /// Must not retain or mutate its inputs; `history` is the literal context
    /// in order and `tools` the tools the model may request.
    async fn complete(&self, history: &[Message], tools: &[ToolSpec]) -> ProviderResult;

    /// Check if the provider is available and configured correctly
    async fn health_check(&self) -> bool {
        true
    }
}

/// Provider selection strategy
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProviderStrategy {
    /// Stay on the current provider; move to the next one only on a retryable failure
    Failover,

    /// Round-robin load balancing, still failing over on retryable errors
    RoundRobin,
}

/// Multi-provider wrapper with failover support
pub struct ProviderChain {
    name: String,
    providers: Vec<Box<dyn LlmProvider>>,
    strategy: ProviderStrategy,
    current_index: AtomicUsize,
}

impl ProviderChain {
    pub fn new(providers: Vec<Box<dyn LlmProvider>>, strategy: ProviderStrategy) -> Self {
        let name = providers
            .iter()
            .map(|p| p.name())
            .collect::<Vec<_>>()
            .join("|");
        Self {
            name: format!("chain({name})"),
            providers,
            strategy,
            current_index: AtomicUsize::new(0),
        }
    }

    /// Index of the provider the next request starts with
    fn start_index(&self) -> usize {
        match self.strategy {
            ProviderStrategy::Failover => self.current_index.load(Ordering::SeqCst),
            ProviderStrategy::RoundRobin => self.current_index.fetch_add(1, Ordering::SeqCst),
        }
    }

    /// Advance to next provider (for failover)
    fn advance_past(&self, failed: usize) {
        if self.strategy == ProviderStrategy::Failover {
            let _ = self.current_index.compare_exchange(
                failed,
                failed.wrapping_add(1),
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
        }
    }
}

#[async_trait]
impl LlmProvider for ProviderChain {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, history: &[Message], tools: &[ToolSpec]) -> ProviderResult {
        if self.providers.is_empty() {
            return Err(ProviderError::unavailable("provider chain is empty").with_retryable(false));
        }

        let start = self.start_index();
        let mut last_error = None;
        for offset in 0..self.providers.len() {
            let slot = start.wrapping_add(offset);
            let provider = &self.providers[slot % self.providers.len()];
            match provider.complete(history, tools).await {
                Ok(reply) => return Ok(reply),
                Err(e) if e.retryable => {
                    tracing::warn!(provider = provider.name(), error = %e, "Provider failed, trying next");
                    self.advance_past(slot);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| ProviderError::unavailable("no provider answered")))
    }

    async fn health_check(&self) -> bool {
        for provider in &self.providers {
            if provider.health_check().await {
                return true;
            }
        }
        false
    }
}

/// Provider that replays a fixed script of results.
///
/// Records every request it receives, which makes it the workhorse of loop
/// tests and offline demos. When the script runs out it answers with a
/// non-retryable `MalformedResponse`.
#[derive(Default)]
pub struct ScriptedProvider {
    script: Mutex<VecDeque<ProviderResult>>,
    requests: Mutex<Vec<(Vec<Message>, Vec<String>)>>,
}

impl ScriptedProvider {
    pub fn new(script: impl IntoIterator<Item = ProviderResult>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Queue one more result
    pub fn push(&self, result: ProviderResult) {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(result);
    }

    /// Number of `complete` calls so far
    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// History and tool names of every request, in call order
    pub fn requests(&self) -> Vec<(Vec<Message>, Vec<String>)> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, history: &[Message], tools: &[ToolSpec]) -> ProviderResult {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((history.to_vec(), tools.iter().map(|t| t.name.clone()).collect()));
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| Err(ProviderError::malformed("script exhausted")))
    }
}
