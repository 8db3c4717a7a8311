//! Reasoning Loop
//!
//! Implements the think-act-observe cycle as an explicit state machine:
//!
//! ```text
//!          ┌──────────── tool results appended ────────────┐
//!          ▼                                               │
//! Idle ─► Querying ── ToolCallBatch(N≥1) ──► ExecutingTools ┘
//!          │  │
//!          │  └── FinalAnswer ──► Done
//!          └── fatal error / limit / cancel ──► Errored
//! ```
//!
//! The agent owns no conversation state: each turn borrows the caller's
//! [`Session`] exclusively and hands it back when the turn ends. The provider
//! and the tool registry are shared, read-only, across sessions.

use std::collections::HashSet;
use std::sync::Arc;

use futures::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::{AgentConfig, RetryPolicy};
use crate::error::{AgentError, ProviderError, Result, TurnErrorKind};
use crate::events::{AgentEvent, EventBus, DEFAULT_EVENT_CAPACITY};
use crate::message::{CallId, Message};
use crate::provider::{LlmProvider, ProviderReply};
use crate::session::{Session, SessionStatus};
use crate::tool::{Tool, ToolCallRequest, ToolExecutor, ToolRegistry, ToolSpec};

/// Where a turn currently is
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Idle,
    Querying,
    ExecutingTools,
    Done,
    Errored,
}

/// How a turn ended
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TurnOutcome {
    FinalAnswer { text: String },
    Errored { kind: TurnErrorKind, message: String },
}

impl TurnOutcome {
    pub fn is_final_answer(&self) -> bool {
        matches!(self, TurnOutcome::FinalAnswer { .. })
    }

    pub fn error_kind(&self) -> Option<TurnErrorKind> {
        match self {
            TurnOutcome::Errored { kind, .. } => Some(*kind),
            TurnOutcome::FinalAnswer { .. } => None,
        }
    }

    fn errored(err: &AgentError) -> Self {
        TurnOutcome::Errored {
            kind: err.turn_kind(),
            message: err.to_string(),
        }
    }
}

/// The main Agent struct
pub struct Agent {
    provider: Arc<dyn LlmProvider>,
    tools: Arc<ToolRegistry>,
    config: AgentConfig,
    events: EventBus,
}

impl Agent {
    /// Create a new agent
    pub fn new(provider: Arc<dyn LlmProvider>, tools: Arc<ToolRegistry>, config: AgentConfig) -> Self {
        Self {
            provider,
            tools,
            config,
            events: EventBus::default(),
        }
    }

    /// Create with default configuration
    pub fn with_defaults(provider: Arc<dyn LlmProvider>, tools: Arc<ToolRegistry>) -> Self {
        Self::new(provider, tools, AgentConfig::default())
    }

    pub fn builder() -> AgentBuilder {
        AgentBuilder::new()
    }

    /// Start a conversation, seeded with the configured system prompt
    pub fn create_session(&self) -> Result<Session> {
        match &self.config.system_prompt {
            Some(prompt) => Session::with_system_prompt(prompt.clone()),
            None => Ok(Session::new()),
        }
    }

    /// Append the user's next message.
    ///
    /// A session whose last turn failed is reopened first, provided that turn
    /// left no tool calls pending.
    pub fn submit_user_message(&self, session: &mut Session, text: impl Into<String>) -> Result<()> {
        let message = Message::user(text)?;
        if session.status() == SessionStatus::Failed && session.pending_tool_calls().is_empty() {
            session.resume();
        }
        session.append(message)
    }

    /// Drive one turn to a final answer or a terminal error.
    ///
    /// A failed session is resumed: tool calls its last turn left unresolved
    /// are executed before the provider is queried again.
    pub async fn run_turn(&self, session: &mut Session) -> TurnOutcome {
        self.run_turn_with_cancel(session, &CancellationToken::new()).await
    }

    /// [`Self::run_turn`], abandoning the turn once `cancel` fires
    pub async fn run_turn_with_cancel(&self, session: &mut Session, cancel: &CancellationToken) -> TurnOutcome {
        TurnDriver {
            agent: self,
            session,
            cancel,
            state: LoopState::Idle,
            iterations: 0,
        }
        .drive()
        .await
    }

    /// Run with a simple string input (creates temporary session)
    pub async fn ask(&self, question: &str) -> Result<String> {
        let mut session = self.create_session()?;
        self.submit_user_message(&mut session, question)?;
        match self.run_turn(&mut session).await {
            TurnOutcome::FinalAnswer { text } => Ok(text),
            TurnOutcome::Errored { kind, message } => Err(match kind {
                TurnErrorKind::ProviderError(kind) => ProviderError::new(kind, message).into(),
                TurnErrorKind::IterationLimitExceeded => {
                    AgentError::IterationLimitExceeded(self.config.max_iterations)
                }
                TurnErrorKind::Cancelled => AgentError::Cancelled,
                TurnErrorKind::InvariantViolation => AgentError::InvariantViolation(message),
            }),
        }
    }

    /// Receive lifecycle events for every turn this agent runs
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<AgentEvent> {
        self.events.subscribe()
    }

    /// Get the tool registry
    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Get configuration
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }
}

/// Next thing the driver has to do
enum Step {
    Query,
    Execute(Vec<ToolCallRequest>),
    Finish(Option<String>),
    Fail(AgentError),
}

/// State of one in-flight turn
struct TurnDriver<'a> {
    agent: &'a Agent,
    session: &'a mut Session,
    cancel: &'a CancellationToken,
    state: LoopState,
    iterations: usize,
}

impl TurnDriver<'_> {
    async fn drive(mut self) -> TurnOutcome {
        self.enter(LoopState::Idle);
        let reopened = self.session.resume();
        if reopened {
            tracing::info!(session_id = %self.session.id(), "Resuming failed session");
        }

        let resumed: Vec<ToolCallRequest> = self
            .session
            .pending_tool_calls()
            .into_iter()
            .filter_map(|message| match message {
                Message::AssistantToolCall {
                    call_id,
                    tool_name,
                    arguments,
                } => Some(ToolCallRequest::new(tool_name.as_str(), arguments.clone()).with_call_id(call_id.clone())),
                _ => None,
            })
            .collect();
        let mut step = if !resumed.is_empty() {
            tracing::info!(session_id = %self.session.id(), calls = resumed.len(), "Re-running pending tool calls");
            if self.cancel.is_cancelled() {
                Step::Fail(AgentError::Cancelled)
            } else {
                Step::Execute(resumed)
            }
        } else if self.session.awaits_reply() {
            Step::Query
        } else {
            let err = AgentError::InvariantViolation(format!(
                "session {} has no unanswered user message (status {:?})",
                self.session.id(),
                self.session.status()
            ));
            tracing::warn!(session_id = %self.session.id(), "Turn rejected: {}", err);
            if reopened {
                self.session.mark_failed();
            }
            self.enter(LoopState::Errored);
            return self.publish_outcome(TurnOutcome::errored(&err));
        };

        tracing::info!(session_id = %self.session.id(), turn = self.session.turn(), "Turn started");
        loop {
            step = match step {
                Step::Query => self.query().await,
                Step::Execute(calls) => self.execute(calls).await,
                Step::Finish(text) => return self.finish(text),
                Step::Fail(err) => return self.fail(&err),
            };
        }
    }

    fn enter(&mut self, state: LoopState) {
        tracing::debug!(session_id = %self.session.id(), from = ?self.state, to = ?state, "Loop state");
        self.state = state;
        self.agent.events.publish(AgentEvent::StateChanged {
            session_id: self.session.id().clone(),
            state,
        });
    }

    fn publish_outcome(&self, outcome: TurnOutcome) -> TurnOutcome {
        self.agent.events.publish(AgentEvent::TurnFinished {
            session_id: self.session.id().clone(),
            outcome: outcome.clone(),
        });
        outcome
    }

    /// Ask the provider for the next step, retrying transient failures
    async fn query(&mut self) -> Step {
        if self.cancel.is_cancelled() {
            return Step::Fail(AgentError::Cancelled);
        }
        let agent = self.agent;
        self.iterations += 1;
        if self.iterations > agent.config.max_iterations {
            return Step::Fail(AgentError::IterationLimitExceeded(agent.config.max_iterations));
        }
        self.enter(LoopState::Querying);

        let snapshot = self.session.snapshot();
        let view = match agent.config.max_context_tokens {
            Some(budget) => snapshot.fit_to_budget(budget),
            None => snapshot,
        };
        let specs: Vec<ToolSpec> = agent.tools.describe_all();
        let policy: &RetryPolicy = &agent.config.retry;

        let mut retry = 0;
        loop {
            let result = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Step::Fail(AgentError::Cancelled),
                result = agent.provider.complete(&view, &specs) => result,
            };

            match result {
                Ok(reply) => return self.accept_reply(reply),
                Err(e) if e.retryable && retry < policy.max_retries => {
                    retry += 1;
                    tracing::warn!(
                        session_id = %self.session.id(),
                        provider = agent.provider.name(),
                        retry,
                        max_retries = policy.max_retries,
                        error = %e,
                        "Retrying provider request"
                    );
                    agent.events.publish(AgentEvent::ProviderRetry {
                        session_id: self.session.id().clone(),
                        retry,
                        error: e,
                    });
                    let wait = policy.backoff(retry);
                    if !wait.is_zero() {
                        tokio::select! {
                            biased;
                            () = self.cancel.cancelled() => return Step::Fail(AgentError::Cancelled),
                            () = tokio::time::sleep(wait) => {}
                        }
                    }
                }
                Err(e) => return Step::Fail(e.into()),
            }
        }
    }

    fn accept_reply(&mut self, reply: ProviderReply) -> Step {
        if let Some(usage) = reply.usage() {
            self.session.record_usage(usage);
        }

        match reply {
            ProviderReply::FinalAnswer { text, .. } => {
                if text.trim().is_empty() {
                    return Step::Fail(ProviderError::malformed("final answer is empty").into());
                }
                Step::Finish(Some(text))
            }
            ProviderReply::ToolCallBatch { calls, done, .. } if calls.is_empty() => {
                if done {
                    Step::Finish(None)
                } else {
                    Step::Fail(ProviderError::malformed("tool call batch is empty").into())
                }
            }
            ProviderReply::ToolCallBatch { calls, .. } => self.record_calls(calls),
        }
    }

    /// Append one `AssistantToolCall` per request, in provider order
    fn record_calls(&mut self, requested: Vec<ToolCallRequest>) -> Step {
        if self.cancel.is_cancelled() {
            return Step::Fail(AgentError::Cancelled);
        }

        let mut seen = HashSet::new();
        let mut calls = Vec::with_capacity(requested.len());
        let mut messages = Vec::with_capacity(requested.len());
        for mut call in requested {
            if self.session.has_call(&call.call_id) || seen.contains(&call.call_id) {
                let fresh = CallId::generate();
                tracing::warn!(
                    session_id = %self.session.id(),
                    reused = %call.call_id,
                    assigned = %fresh,
                    "Provider reused a call_id; assigned a fresh one"
                );
                call.call_id = fresh;
            }
            seen.insert(call.call_id.clone());

            match Message::tool_call(call.call_id.clone(), call.tool_name.clone(), call.arguments.clone()) {
                Ok(message) => messages.push(message),
                Err(e) => return Step::Fail(ProviderError::malformed(e.to_string()).into()),
            }
            calls.push(call);
        }

        if let Err(e) = self.session.append_all(messages) {
            return Step::Fail(e);
        }
        Step::Execute(calls)
    }

    /// Run every pending call, then append the results in call order
    async fn execute(&mut self, calls: Vec<ToolCallRequest>) -> Step {
        self.enter(LoopState::ExecutingTools);
        for call in &calls {
            self.agent.events.publish(AgentEvent::ToolCallStarted {
                session_id: self.session.id().clone(),
                call_id: call.call_id.clone(),
                tool_name: call.tool_name.clone(),
            });
        }

        let agent = self.agent;
        let registry: &ToolRegistry = &agent.tools;
        let timeout = agent.config.tool_timeout();
        let invocations = stream::iter(calls.iter())
            .map(|call| registry.invoke_with_timeout(call, timeout))
            .buffered(agent.config.tool_concurrency.max(1))
            .collect::<Vec<_>>();

        let results = tokio::select! {
            biased;
            () = self.cancel.cancelled() => {
                tracing::info!(session_id = %self.session.id(), abandoned = calls.len(), "Tool batch abandoned");
                return Step::Fail(AgentError::Cancelled);
            }
            results = invocations => results,
        };

        for result in &results {
            self.agent.events.publish(AgentEvent::ToolCallFinished {
                session_id: self.session.id().clone(),
                call_id: result.call_id.clone(),
                status: result.status,
            });
        }

        let messages = results.into_iter().map(|r| r.into_message()).collect();
        if let Err(e) = self.session.append_all(messages) {
            return Step::Fail(e);
        }
        Step::Query
    }

    fn finish(mut self, text: Option<String>) -> TurnOutcome {
        if let Some(text) = &text {
            let appended = Message::assistant(text.clone()).and_then(|m| self.session.append(m));
            if let Err(e) = appended {
                return self.fail(&e);
            }
        }
        self.session.mark_completed();
        self.enter(LoopState::Done);
        tracing::info!(
            session_id = %self.session.id(),
            iterations = self.iterations,
            "Turn completed"
        );
        self.publish_outcome(TurnOutcome::FinalAnswer {
            text: text.unwrap_or_default(),
        })
    }

    fn fail(mut self, err: &AgentError) -> TurnOutcome {
        self.session.mark_failed();
        self.enter(LoopState::Errored);
        tracing::error!(
            session_id = %self.session.id(),
            iterations = self.iterations,
            kind = %err.turn_kind(),
            error = %err,
            "Turn failed"
        );
        self.publish_outcome(TurnOutcome::errored(err))
    }
}

/// Builder for Agent configuration
pub struct AgentBuilder {
    provider: Option<Arc<dyn LlmProvider>>,
    tools: ToolRegistry,
    shared_tools: Option<Arc<ToolRegistry>>,
    config: AgentConfig,
    event_capacity: usize,
    error: Option<AgentError>,
}

impl Default for AgentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentBuilder {
    pub fn new() -> Self {
        Self {
            provider: None,
            tools: ToolRegistry::new(),
            shared_tools: None,
            config: AgentConfig::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
            error: None,
        }
    }

    pub fn provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Register a self-describing tool
    pub fn tool<T: Tool + 'static>(mut self, tool: T) -> Self {
        if let Err(e) = self.tools.register_tool(tool) {
            self.error.get_or_insert(e);
        }
        self
    }

    /// Register a descriptor with its executor
    pub fn tool_fn(mut self, spec: ToolSpec, executor: Arc<dyn ToolExecutor>) -> Self {
        if let Err(e) = self.tools.register(spec, executor) {
            self.error.get_or_insert(e);
        }
        self
    }

    /// Use an already built registry, shared with other agents
    pub fn tools(mut self, tools: Arc<ToolRegistry>) -> Self {
        self.shared_tools = Some(tools);
        self
    }

    pub fn config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub fn max_iterations(mut self, max: usize) -> Self {
        self.config.max_iterations = max;
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    pub fn tool_concurrency(mut self, limit: usize) -> Self {
        self.config.tool_concurrency = limit;
        self
    }

    pub fn tool_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.config.tool_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn max_context_tokens(mut self, budget: u32) -> Self {
        self.config.max_context_tokens = Some(budget);
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn build(self) -> Result<Agent> {
        if let Some(e) = self.error {
            return Err(e);
        }
        let provider = self
            .provider
            .ok_or_else(|| AgentError::Config("Provider is required".into()))?;
        self.config.validate()?;

        let tools = match self.shared_tools {
            Some(shared) if self.tools.is_empty() => shared,
            Some(_) => {
                return Err(AgentError::Config(
                    "use either a shared registry or individual tools, not both".into(),
                ));
            }
            None => Arc::new(self.tools),
        };

        Ok(Agent {
            provider,
            tools,
            config: self.config,
            events: EventBus::new(self.event_capacity),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderErrorKind;
    use crate::message::ToolStatus;
    use crate::provider::{ScriptedProvider, TokenUsage};
    use crate::session::SessionStatus;
    use crate::tool::{executor_fn, ParamType, ParameterSchema, ToolArguments, ToolErrorKind};
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    fn lookup_spec() -> ToolSpec {
        ToolSpec::new("lookup", "Look up a key")
            .param(ParameterSchema::required("key", ParamType::String, "Key to look up"))
    }

    fn fixed_lookup() -> Arc<dyn ToolExecutor> {
        executor_fn(|_args: ToolArguments| async { Ok::<_, anyhow::Error>(json!({"value": 42})) })
    }

    fn call(id: &str, args: Value) -> ToolCallRequest {
        ToolCallRequest::new("lookup", args).with_call_id(CallId::new(id).unwrap())
    }

    fn agent_with(provider: Arc<ScriptedProvider>) -> Agent {
        Agent::builder()
            .provider(provider)
            .tool_fn(lookup_spec(), fixed_lookup())
            .retry(RetryPolicy::immediate(2))
            .build()
            .unwrap()
    }

    fn started_session(agent: &Agent) -> Session {
        let mut session = agent.create_session().unwrap();
        agent.submit_user_message(&mut session, "What is the value?").unwrap();
        session
    }

    fn drain_states(rx: &mut tokio::sync::broadcast::Receiver<AgentEvent>) -> Vec<LoopState> {
        let mut states = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let AgentEvent::StateChanged { state, .. } = event {
                states.push(state);
            }
        }
        states
    }

    #[tokio::test]
    async fn test_final_answer_in_one_call() {
        let provider = Arc::new(ScriptedProvider::new([Ok(ProviderReply::final_answer("Hello!"))]));
        let agent = agent_with(provider.clone());
        let mut rx = agent.subscribe();
        let mut session = started_session(&agent);

        let outcome = agent.run_turn(&mut session).await;

        assert_eq!(outcome, TurnOutcome::FinalAnswer { text: "Hello!".into() });
        assert_eq!(provider.calls(), 1);
        assert_eq!(session.status(), SessionStatus::Completed);
        assert_eq!(session.messages().last().unwrap().text(), Some("Hello!"));
        assert_eq!(
            drain_states(&mut rx),
            vec![LoopState::Idle, LoopState::Querying, LoopState::Done]
        );
    }

    #[tokio::test]
    async fn test_tool_round_trip_appends_call_result_answer() {
        let provider = Arc::new(ScriptedProvider::new([
            Ok(ProviderReply::tool_calls(vec![call("c1", json!({"key": "answer"}))])),
            Ok(ProviderReply::final_answer("The value is 42.")),
        ]));
        let agent = agent_with(provider.clone());
        let mut session = started_session(&agent);

        let outcome = agent.run_turn(&mut session).await;

        assert!(outcome.is_final_answer());
        assert_eq!(session.status(), SessionStatus::Completed);
        let messages = session.messages();
        assert_eq!(messages.len(), 4);
        assert!(matches!(messages[0], Message::UserText { .. }));
        assert!(matches!(&messages[1], Message::AssistantToolCall { call_id, .. } if call_id.as_str() == "c1"));
        assert_eq!(
            messages[2],
            Message::tool_result(CallId::new("c1").unwrap(), ToolStatus::Ok, json!({"value": 42}))
        );
        assert_eq!(messages[3].text(), Some("The value is 42."));

        // The second query saw the tool result.
        let requests = provider.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].0.len(), 3);
        assert_eq!(requests[1].1, vec!["lookup".to_string()]);
    }

    #[tokio::test]
    async fn test_schema_violation_is_fed_back() {
        let provider = Arc::new(ScriptedProvider::new([
            Ok(ProviderReply::tool_calls(vec![call("c1", json!({}))])),
            Ok(ProviderReply::final_answer("Sorry, let me fix that.")),
        ]));
        let agent = agent_with(provider.clone());
        let mut session = started_session(&agent);

        let outcome = agent.run_turn(&mut session).await;

        assert!(outcome.is_final_answer());
        let Message::ToolResult { status, content, .. } = &session.messages()[2] else {
            panic!("expected a tool result");
        };
        assert_eq!(*status, ToolStatus::Error);
        assert_eq!(content["kind"], "schema_violation");
        assert_eq!(content["violations"][0]["field"], "key");
    }

    #[tokio::test]
    async fn test_unknown_tool_is_fed_back() {
        let provider = Arc::new(ScriptedProvider::new([
            Ok(ProviderReply::tool_calls(vec![ToolCallRequest::new("teleport", json!({}))])),
            Ok(ProviderReply::final_answer("I cannot teleport.")),
        ]));
        let agent = agent_with(provider);
        let mut session = started_session(&agent);

        assert!(agent.run_turn(&mut session).await.is_final_answer());
        let Message::ToolResult { content, .. } = &session.messages()[2] else {
            panic!("expected a tool result");
        };
        assert_eq!(content["kind"], "unknown_tool");
    }

    #[tokio::test]
    async fn test_retries_within_budget_succeed() {
        let provider = Arc::new(ScriptedProvider::new([
            Err(ProviderError::unavailable("blip 1")),
            Err(ProviderError::unavailable("blip 2")),
            Ok(ProviderReply::final_answer("Recovered")),
        ]));
        let agent = agent_with(provider.clone());
        let mut session = started_session(&agent);

        let outcome = agent.run_turn(&mut session).await;

        assert!(outcome.is_final_answer());
        assert_eq!(provider.calls(), 3);
        assert_eq!(session.status(), SessionStatus::Completed);
    }

    #[tokio::test]
    async fn test_retries_beyond_budget_error() {
        let provider = Arc::new(ScriptedProvider::new([
            Err(ProviderError::unavailable("blip 1")),
            Err(ProviderError::unavailable("blip 2")),
            Err(ProviderError::unavailable("blip 3")),
            Ok(ProviderReply::final_answer("too late")),
        ]));
        let agent = agent_with(provider.clone());
        let mut session = started_session(&agent);

        let outcome = agent.run_turn(&mut session).await;

        assert_eq!(
            outcome.error_kind(),
            Some(TurnErrorKind::ProviderError(ProviderErrorKind::Unavailable))
        );
        assert_eq!(provider.calls(), 3);
        assert_eq!(session.status(), SessionStatus::Failed);
        assert_eq!(session.len(), 1);
    }

    #[tokio::test]
    async fn test_non_retryable_error_is_not_retried() {
        let provider = Arc::new(ScriptedProvider::new([Err(ProviderError::new(
            ProviderErrorKind::Authentication,
            "bad key",
        ))]));
        let agent = agent_with(provider.clone());
        let mut session = started_session(&agent);

        let outcome = agent.run_turn(&mut session).await;

        assert_eq!(
            outcome.error_kind(),
            Some(TurnErrorKind::ProviderError(ProviderErrorKind::Authentication))
        );
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_iteration_limit() {
        let provider = Arc::new(ScriptedProvider::new(
            (0..10).map(|i| Ok(ProviderReply::tool_calls(vec![call(&format!("c{i}"), json!({"key": "k"}))]))),
        ));
        let agent = Agent::builder()
            .provider(provider.clone())
            .tool_fn(lookup_spec(), fixed_lookup())
            .max_iterations(3)
            .build()
            .unwrap();
        let mut session = started_session(&agent);

        let outcome = agent.run_turn(&mut session).await;

        assert_eq!(outcome.error_kind(), Some(TurnErrorKind::IterationLimitExceeded));
        assert_eq!(provider.calls(), 3);
        assert_eq!(session.status(), SessionStatus::Failed);
        assert!(session.pending_tool_calls().is_empty());
    }

    #[tokio::test]
    async fn test_empty_batch_without_done_is_malformed() {
        let provider = Arc::new(ScriptedProvider::new([Ok(ProviderReply::tool_calls(Vec::new()))]));
        let agent = agent_with(provider);
        let mut session = started_session(&agent);

        let outcome = agent.run_turn(&mut session).await;

        assert_eq!(
            outcome.error_kind(),
            Some(TurnErrorKind::ProviderError(ProviderErrorKind::MalformedResponse))
        );
        assert_eq!(session.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_batch_with_done_completes() {
        let provider = Arc::new(ScriptedProvider::new([Ok(ProviderReply::ToolCallBatch {
            calls: Vec::new(),
            done: true,
            usage: None,
        })]));
        let agent = agent_with(provider);
        let mut session = started_session(&agent);

        let outcome = agent.run_turn(&mut session).await;

        assert_eq!(outcome, TurnOutcome::FinalAnswer { text: String::new() });
        assert_eq!(session.status(), SessionStatus::Completed);
        assert_eq!(session.len(), 1);
    }

    #[tokio::test]
    async fn test_reused_call_ids_are_reassigned() {
        let provider = Arc::new(ScriptedProvider::new([
            Ok(ProviderReply::tool_calls(vec![
                call("dup", json!({"key": "a"})),
                call("dup", json!({"key": "b"})),
            ])),
            Ok(ProviderReply::final_answer("done")),
        ]));
        let agent = agent_with(provider);
        let mut session = started_session(&agent);

        assert!(agent.run_turn(&mut session).await.is_final_answer());
        let messages = session.messages();
        let first = messages[1].call_id().unwrap();
        let second = messages[2].call_id().unwrap();
        assert_eq!(first.as_str(), "dup");
        assert_ne!(first, second);
        assert_eq!(messages[3].call_id(), Some(first));
        assert_eq!(messages[4].call_id(), Some(second));
    }

    #[tokio::test]
    async fn test_results_follow_call_order_with_bounded_concurrency() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (in_flight_c, peak_c) = (in_flight.clone(), peak.clone());
        let sleepy = executor_fn(move |args: ToolArguments| {
            let (in_flight, peak) = (in_flight_c.clone(), peak_c.clone());
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                let delay = args.get("delay_ms").and_then(Value::as_u64).unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(delay)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(json!(delay))
            }
        });
        let spec = ToolSpec::new("sleep", "Sleep for a while")
            .param(ParameterSchema::required("delay_ms", ParamType::Integer, "Delay"));

        let delays = [60, 5, 30, 0];
        let calls = delays
            .iter()
            .enumerate()
            .map(|(i, d)| {
                ToolCallRequest::new("sleep", json!({"delay_ms": d})).with_call_id(CallId::new(format!("s{i}")).unwrap())
            })
            .collect();
        let provider = Arc::new(ScriptedProvider::new([
            Ok(ProviderReply::tool_calls(calls)),
            Ok(ProviderReply::final_answer("rested")),
        ]));
        let agent = Agent::builder()
            .provider(provider)
            .tool_fn(spec, sleepy)
            .tool_concurrency(2)
            .build()
            .unwrap();
        let mut session = started_session(&agent);

        assert!(agent.run_turn(&mut session).await.is_final_answer());

        let results: Vec<(String, Value)> = session.messages()[5..9]
            .iter()
            .map(|m| match m {
                Message::ToolResult { call_id, content, .. } => (call_id.to_string(), content.clone()),
                other => panic!("unexpected message {other:?}"),
            })
            .collect();
        assert_eq!(
            results,
            vec![
                ("s0".to_string(), json!(60)),
                ("s1".to_string(), json!(5)),
                ("s2".to_string(), json!(30)),
                ("s3".to_string(), json!(0)),
            ]
        );
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_cancel_during_tool_execution() {
        let started = Arc::new(Notify::new());
        let started_c = started.clone();
        let hanging = executor_fn(move |_args: ToolArguments| {
            let started = started_c.clone();
            async move {
                started.notify_one();
                futures::future::pending::<()>().await;
                Ok::<_, anyhow::Error>(Value::Null)
            }
        });
        let provider = Arc::new(ScriptedProvider::new([
            Ok(ProviderReply::tool_calls(vec![ToolCallRequest::new("hang", json!({}))])),
            Ok(ProviderReply::final_answer("never")),
        ]));
        let agent = Agent::builder()
            .provider(provider.clone())
            .tool_fn(ToolSpec::new("hang", "Never returns"), hanging)
            .build()
            .unwrap();
        let mut session = started_session(&agent);
        let cancel = CancellationToken::new();

        let (outcome, ()) = tokio::join!(agent.run_turn_with_cancel(&mut session, &cancel), async {
            started.notified().await;
            cancel.cancel();
        });

        assert_eq!(outcome.error_kind(), Some(TurnErrorKind::Cancelled));
        assert_eq!(provider.calls(), 1);
        assert_eq!(session.status(), SessionStatus::Failed);
        assert_eq!(session.len(), 2);
        assert_eq!(session.pending_tool_calls().len(), 1);
        assert!(!session
            .messages()
            .iter()
            .any(|m| matches!(m, Message::ToolResult { .. })));
    }

    #[tokio::test]
    async fn test_cancel_before_start_skips_provider() {
        let provider = Arc::new(ScriptedProvider::new([Ok(ProviderReply::final_answer("hi"))]));
        let agent = agent_with(provider.clone());
        let mut session = started_session(&agent);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = agent.run_turn_with_cancel(&mut session, &cancel).await;

        assert_eq!(outcome.error_kind(), Some(TurnErrorKind::Cancelled));
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_turn_requires_unanswered_user_message() {
        let provider = Arc::new(ScriptedProvider::new([Ok(ProviderReply::final_answer("hi"))]));
        let agent = agent_with(provider.clone());
        let mut session = agent.create_session().unwrap();

        let outcome = agent.run_turn(&mut session).await;

        assert_eq!(outcome.error_kind(), Some(TurnErrorKind::InvariantViolation));
        assert_eq!(provider.calls(), 0);
        assert_eq!(session.status(), SessionStatus::Active);
    }

    #[tokio::test]
    async fn test_multi_turn_conversation_and_usage() {
        let provider = Arc::new(ScriptedProvider::new([
            Ok(ProviderReply::final_answer("First").with_usage(TokenUsage::new(10, 2))),
            Ok(ProviderReply::final_answer("Second").with_usage(TokenUsage::new(20, 3))),
        ]));
        let agent = Agent::builder()
            .provider(provider.clone())
            .system_prompt("You are terse.")
            .build()
            .unwrap();
        let mut session = agent.create_session().unwrap();

        agent.submit_user_message(&mut session, "one").unwrap();
        assert!(agent.run_turn(&mut session).await.is_final_answer());
        agent.submit_user_message(&mut session, "two").unwrap();
        assert!(agent.run_turn(&mut session).await.is_final_answer());

        assert_eq!(session.turn(), 2);
        assert_eq!(session.len(), 5);
        assert_eq!(session.usage(), TokenUsage::new(30, 5));
        assert_eq!(provider.requests()[1].0.len(), 4);
        assert!(provider.requests()[0].1.is_empty());
    }

    #[tokio::test]
    async fn test_context_budget_trims_provider_view_only() {
        let provider = Arc::new(ScriptedProvider::new([
            Ok(ProviderReply::final_answer("ok")),
            Ok(ProviderReply::final_answer("ok again")),
        ]));
        let agent = Agent::builder()
            .provider(provider.clone())
            .max_context_tokens(40)
            .build()
            .unwrap();
        let mut session = agent.create_session().unwrap();

        agent.submit_user_message(&mut session, "x".repeat(400)).unwrap();
        agent.run_turn(&mut session).await;
        agent.submit_user_message(&mut session, "short").unwrap();
        agent.run_turn(&mut session).await;

        assert_eq!(session.len(), 4);
        let seen = &provider.requests()[1].0;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].text(), Some("short"));
    }

    #[tokio::test]
    async fn test_ask_maps_outcome() {
        let provider = Arc::new(ScriptedProvider::new([Ok(ProviderReply::final_answer("42"))]));
        let agent = agent_with(provider);
        assert_eq!(agent.ask("meaning of life?").await.unwrap(), "42");

        let failing = Arc::new(ScriptedProvider::new([Err(ProviderError::malformed("nope"))]));
        let agent = agent_with(failing);
        let err = agent.ask("again?").await.unwrap_err();
        assert!(matches!(err, AgentError::Provider(e) if e.kind == ProviderErrorKind::MalformedResponse));
    }

    #[test]
    fn test_builder_surfaces_registration_errors() {
        let provider = Arc::new(ScriptedProvider::default());
        let err = Agent::builder()
            .provider(provider)
            .tool_fn(lookup_spec(), fixed_lookup())
            .tool_fn(lookup_spec(), fixed_lookup())
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, AgentError::DuplicateTool(_)));

        assert!(matches!(Agent::builder().build(), Err(AgentError::Config(_))));
    }

    #[tokio::test]
    async fn test_execution_failure_kind_visible_to_model() {
        let failing = executor_fn(|_args: ToolArguments| async { Err::<Value, _>(anyhow::anyhow!("backend said no")) });
        let provider = Arc::new(ScriptedProvider::new([
            Ok(ProviderReply::tool_calls(vec![ToolCallRequest::new("flaky", json!(null))])),
            Ok(ProviderReply::final_answer("It failed.")),
        ]));
        let agent = Agent::builder()
            .provider(provider)
            .tool_fn(ToolSpec::new("flaky", "Always fails"), failing)
            .build()
            .unwrap();
        let mut session = started_session(&agent);

        assert!(agent.run_turn(&mut session).await.is_final_answer());
        let Message::ToolResult { call_id, status, content } = session.messages()[2].clone() else {
            panic!("expected a tool result");
        };
        let result = crate::tool::ToolCallResult { call_id, status, content };
        assert_eq!(result.failure_details().unwrap().kind, ToolErrorKind::ExecutionFailed);
    }

    /// Parks in `complete` forever once entered
    struct HangingProvider {
        entered: Arc<Notify>,
    }

    #[async_trait::async_trait]
    impl LlmProvider for HangingProvider {
        fn name(&self) -> &str {
            "hanging"
        }

        async fn complete(&self, _history: &[Message], _tools: &[ToolSpec]) -> crate::provider::ProviderResult {
            self.entered.notify_one();
            futures::future::pending().await
        }
    }

    /// Raises the cancellation signal, then asks for a tool anyway
    struct CancellingProvider {
        cancel: CancellationToken,
    }

    #[async_trait::async_trait]
    impl LlmProvider for CancellingProvider {
        fn name(&self) -> &str {
            "cancelling"
        }

        async fn complete(&self, _history: &[Message], _tools: &[ToolSpec]) -> crate::provider::ProviderResult {
            self.cancel.cancel();
            Ok(ProviderReply::tool_calls(vec![call("c1", json!({"key": "k"}))]))
        }
    }

    #[tokio::test]
    async fn test_cancel_while_awaiting_provider() {
        let entered = Arc::new(Notify::new());
        let agent = Agent::builder()
            .provider(Arc::new(HangingProvider {
                entered: entered.clone(),
            }))
            .build()
            .unwrap();
        let mut session = started_session(&agent);
        let cancel = CancellationToken::new();

        let (outcome, ()) = tokio::join!(agent.run_turn_with_cancel(&mut session, &cancel), async {
            entered.notified().await;
            cancel.cancel();
        });

        assert_eq!(outcome.error_kind(), Some(TurnErrorKind::Cancelled));
        assert_eq!(session.len(), 1);
        assert_eq!(session.status(), SessionStatus::Failed);
    }

    #[tokio::test]
    async fn test_cancel_during_retry_backoff() {
        let provider = Arc::new(ScriptedProvider::new([
            Err(ProviderError::unavailable("blip")),
            Ok(ProviderReply::final_answer("too late")),
        ]));
        let agent = Agent::builder()
            .provider(provider.clone())
            .retry(RetryPolicy {
                max_retries: 2,
                initial_backoff_ms: 600_000,
                max_backoff_ms: 600_000,
                multiplier: 1.0,
            })
            .build()
            .unwrap();
        let mut rx = agent.subscribe();
        let mut session = started_session(&agent);
        let cancel = CancellationToken::new();

        let (outcome, ()) = tokio::join!(agent.run_turn_with_cancel(&mut session, &cancel), async {
            loop {
                match rx.recv().await {
                    Ok(AgentEvent::ProviderRetry { retry, .. }) => {
                        assert_eq!(retry, 1);
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => panic!("event stream closed: {e}"),
                }
            }
            cancel.cancel();
        });

        assert_eq!(outcome.error_kind(), Some(TurnErrorKind::Cancelled));
        assert_eq!(provider.calls(), 1);
        assert_eq!(session.len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_before_recording_tool_calls() {
        let cancel = CancellationToken::new();
        let agent = Agent::builder()
            .provider(Arc::new(CancellingProvider { cancel: cancel.clone() }))
            .tool_fn(lookup_spec(), fixed_lookup())
            .build()
            .unwrap();
        let mut session = started_session(&agent);

        let outcome = agent.run_turn_with_cancel(&mut session, &cancel).await;

        assert_eq!(outcome.error_kind(), Some(TurnErrorKind::Cancelled));
        assert_eq!(session.len(), 1);
        assert!(!session
            .messages()
            .iter()
            .any(|m| matches!(m, Message::AssistantToolCall { .. })));
        assert!(session.pending_tool_calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_turn_can_be_run_again() {
        let provider = Arc::new(ScriptedProvider::new([
            Err(ProviderError::unavailable("down 1")),
            Err(ProviderError::unavailable("down 2")),
            Err(ProviderError::unavailable("down 3")),
            Ok(ProviderReply::final_answer("Back online.")),
        ]));
        let agent = agent_with(provider.clone());
        let mut session = started_session(&agent);

        assert!(!agent.run_turn(&mut session).await.is_final_answer());
        assert_eq!(session.status(), SessionStatus::Failed);

        let outcome = agent.run_turn(&mut session).await;

        assert_eq!(outcome, TurnOutcome::FinalAnswer { text: "Back online.".into() });
        assert_eq!(provider.calls(), 4);
        assert_eq!(session.status(), SessionStatus::Completed);
        assert_eq!(session.len(), 2);
        agent.submit_user_message(&mut session, "Thanks").unwrap();
    }

    #[tokio::test]
    async fn test_submit_reopens_failed_session() {
        let provider = Arc::new(ScriptedProvider::new([Ok(ProviderReply::final_answer("Yes."))]));
        let agent = agent_with(provider.clone());
        let mut session = started_session(&agent);
        let cancel = CancellationToken::new();
        cancel.cancel();
        agent.run_turn_with_cancel(&mut session, &cancel).await;
        assert_eq!(session.status(), SessionStatus::Failed);

        agent.submit_user_message(&mut session, "Are you there?").unwrap();
        assert_eq!(session.status(), SessionStatus::Active);
        assert_eq!(session.turn(), 2);

        assert!(agent.run_turn(&mut session).await.is_final_answer());
        assert_eq!(session.len(), 3);
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_interrupted_tool_calls_rerun_on_next_turn() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let started = Arc::new(Notify::new());
        let (attempts_c, started_c) = (attempts.clone(), started.clone());
        let hangs_once = executor_fn(move |_args: ToolArguments| {
            let (attempts, started) = (attempts_c.clone(), started_c.clone());
            async move {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    started.notify_one();
                    futures::future::pending::<()>().await;
                }
                Ok::<_, anyhow::Error>(json!("ready"))
            }
        });
        let provider = Arc::new(ScriptedProvider::new([
            Ok(ProviderReply::tool_calls(vec![
                ToolCallRequest::new("warmup", json!({})).with_call_id(CallId::new("c1").unwrap()),
            ])),
            Ok(ProviderReply::final_answer("Warm now.")),
        ]));
        let agent = Agent::builder()
            .provider(provider.clone())
            .tool_fn(ToolSpec::new("warmup", "Hangs on first use"), hangs_once)
            .build()
            .unwrap();
        let mut session = started_session(&agent);
        let cancel = CancellationToken::new();

        let (outcome, ()) = tokio::join!(agent.run_turn_with_cancel(&mut session, &cancel), async {
            started.notified().await;
            cancel.cancel();
        });
        assert_eq!(outcome.error_kind(), Some(TurnErrorKind::Cancelled));
        assert!(agent.submit_user_message(&mut session, "Hello?").is_err());
        assert_eq!(session.status(), SessionStatus::Failed);

        let outcome = agent.run_turn(&mut session).await;

        assert_eq!(outcome, TurnOutcome::FinalAnswer { text: "Warm now.".into() });
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(provider.calls(), 2);
        let messages = session.messages();
        assert_eq!(messages.len(), 4);
        assert_eq!(
            messages[2],
            Message::tool_result(CallId::new("c1").unwrap(), ToolStatus::Ok, json!("ready"))
        );
        assert_eq!(session.status(), SessionStatus::Completed);
    }
}
