//! # agent-runtime
//!
//! Runtime providers for the agent core.
//!
//! ## Providers
//!
//! - **Ollama** (default): Local LLM inference via Ollama's `/api/chat`
//! - **OpenAI** (coming soon): OpenAI API integration
//! - **Anthropic** (coming soon): Claude API integration
//!
//! ## Usage
//!
//! ```rust,ignore
//! use agent_runtime::{Agent, ollama::OllamaProvider};
//!
//! let provider = OllamaProvider::from_env();
//! let agent = Agent::builder()
//!     .provider(Arc::new(provider))
//!     .tool(MyTool)
//!     .build()?;
//!
//! let mut session = agent.create_session()?;
//! agent.submit_user_message(&mut session, "What's the weather in Oslo?")?;
//! let outcome = agent.run_turn(&mut session).await;
//! ```

#[cfg(feature = "ollama")]
pub mod ollama;

#[cfg(feature = "ollama")]
pub use ollama::{OllamaConfig, OllamaProvider};

// Re-export core types for convenience
pub use agent_core::{
    Agent, AgentBuilder, AgentConfig, AgentError, CancellationToken, LlmProvider, Message, Result, Role, Session,
    Tool, ToolRegistry, TurnOutcome,
};
