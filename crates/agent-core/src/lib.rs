//! # agent-core
//!
//! Core agent logic with provider-agnostic LLM abstraction and extensible tool system.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Agent                                 │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐  │
//! │  │  Reasoning  │  │    Tools    │  │   LlmProvider       │  │
//! │  │    Loop     │──│   Registry  │──│   (Strategy)        │  │
//! │  └──────┬──────┘  └─────────────┘  └─────────────────────┘  │
//! │         │ &mut                                               │
//! │  ┌──────▼──────┐  ┌─────────────┐                            │
//! │  │   Session   │  │  EventBus   │                            │
//! │  │  (history)  │  │ (broadcast) │                            │
//! │  └─────────────┘  └─────────────┘                            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The `LlmProvider` trait enables swapping between Ollama, OpenAI, Anthropic,
//! or any other provider without changing agent logic. A [`Session`] belongs
//! to one caller; the agent borrows it for the duration of a turn.

pub mod config;
pub mod error;
pub mod events;
pub mod message;
pub mod provider;
pub mod reasoning;
pub mod session;
pub mod tool;

pub use config::{AgentConfig, RetryPolicy};
pub use error::{AgentError, ProviderError, ProviderErrorKind, Result, TurnErrorKind};
pub use events::{AgentEvent, EventBus};
pub use message::{CallId, Message, NonEmptyText, Role, ToolStatus};
pub use provider::{LlmProvider, ProviderChain, ProviderReply, ProviderResult, ScriptedProvider, TokenUsage};
pub use reasoning::{Agent, AgentBuilder, LoopState, TurnOutcome};
pub use session::{Session, SessionId, SessionStatus, Snapshot};
pub use tool::{
    ParamType, ParameterSchema, Tool, ToolArguments, ToolCallRequest, ToolCallResult, ToolExecutor, ToolRegistry,
    ToolSpec, executor_fn,
};

pub use tokio_util::sync::CancellationToken;
