//! Agent Events
//!
//! Lifecycle notifications published by the reasoning loop on a broadcast
//! channel. Publishing never blocks: with no subscribers events are dropped,
//! and a subscriber that falls behind skips the oldest ones.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::error::ProviderError;
use crate::message::{CallId, ToolStatus};
use crate::reasoning::{LoopState, TurnOutcome};
use crate::session::SessionId;

/// Default channel capacity
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Something observable happened inside a turn
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AgentEvent {
    /// The loop entered a new state
    StateChanged {
        session_id: SessionId,
        state: LoopState,
    },
    /// A retryable provider failure is about to be retried
    ProviderRetry {
        session_id: SessionId,
        retry: u32,
        error: ProviderError,
    },
    ToolCallStarted {
        session_id: SessionId,
        call_id: CallId,
        tool_name: String,
    },
    ToolCallFinished {
        session_id: SessionId,
        call_id: CallId,
        status: ToolStatus,
    },
    TurnFinished {
        session_id: SessionId,
        outcome: TurnOutcome,
    },
}

/// Fan-out channel for [`AgentEvent`]s
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<AgentEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Send to every current subscriber
    pub fn publish(&self, event: AgentEvent) {
        // An error only means nobody is listening.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
