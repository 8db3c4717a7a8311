//! Session Management
//!
//! A [`Session`] is the append-only conversation log plus bookkeeping. Every
//! append is checked against the tool-call pairing rules:
//!
//! - a `call_id` is issued by exactly one `AssistantToolCall`
//! - a `ToolResult` must answer a call that is still pending
//! - no user, assistant or system text may be appended while calls are pending
//!
//! The `call_id -> position` index lives next to the log; messages never
//! point at each other.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AgentError, Result};
use crate::message::{CallId, Message};
use crate::provider::TokenUsage;

/// Unique session identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle flag of a session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    AwaitingTool,
    Completed,
    Failed,
}

/// Where a call was issued and, once answered, where its result sits
#[derive(Clone, Copy, Debug)]
struct CallSlot {
    issued_at: usize,
    resolved_at: Option<usize>,
}

/// Immutable copy of the history at one point in time
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Snapshot(Arc<[Message]>);

impl Snapshot {
    pub fn messages(&self) -> &[Message] {
        &self.0
    }

    /// Estimate total tokens in the snapshot
    pub fn estimate_tokens(&self) -> u32 {
        self.0.iter().map(Message::estimate_tokens).sum()
    }

    /// Trim to fit within `max_tokens`, dropping whole turns from the oldest.
    ///
    /// System messages and the most recent turn are always kept; a turn
    /// starts at a `UserText`, so tool calls and their results stay together.
    pub fn fit_to_budget(&self, max_tokens: u32) -> Snapshot {
        if self.estimate_tokens() <= max_tokens {
            return self.clone();
        }

        let turn_starts: Vec<usize> = self
            .0
            .iter()
            .enumerate()
            .filter(|(_, m)| matches!(m, Message::UserText { .. }))
            .map(|(i, _)| i)
            .collect();

        let mut kept = self.clone();
        for &cut in turn_starts.iter().skip(1) {
            let candidate: Vec<Message> = self
                .0
                .iter()
                .enumerate()
                .filter(|(i, m)| *i >= cut || matches!(m, Message::SystemText { .. }))
                .map(|(_, m)| m.clone())
                .collect();
            kept = Snapshot(candidate.into());
            if kept.estimate_tokens() <= max_tokens {
                break;
            }
        }
        kept
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Message> {
        self.0.iter()
    }
}

impl std::ops::Deref for Snapshot {
    type Target = [Message];

    fn deref(&self) -> &[Message] {
        &self.0
    }
}

impl<'a> IntoIterator for &'a Snapshot {
    type Item = &'a Message;
    type IntoIter = std::slice::Iter<'a, Message>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// A complete agent session
#[derive(Clone, Debug)]
pub struct Session {
    id: SessionId,
    history: Vec<Message>,
    calls: HashMap<CallId, CallSlot>,
    pending: usize,
    turn: u64,
    status: SessionStatus,
    usage: TokenUsage,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Session {
    /// Create a new session
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            history: Vec::new(),
            calls: HashMap::new(),
            pending: 0,
            turn: 0,
            status: SessionStatus::Active,
            usage: TokenUsage::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Create with specific ID
    pub fn with_id(id: SessionId) -> Self {
        let mut session = Self::new();
        session.id = id;
        session
    }

    /// Create with system prompt
    pub fn with_system_prompt(system_prompt: impl Into<String>) -> Result<Self> {
        let mut session = Self::new();
        session.append(Message::system(system_prompt)?)?;
        Ok(session)
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// Number of user messages appended so far
    pub fn turn(&self) -> u64 {
        self.turn
    }

    /// Cumulative token usage reported by providers
    pub fn usage(&self) -> TokenUsage {
        self.usage
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Read-only view of the ordered history
    pub fn messages(&self) -> &[Message] {
        &self.history
    }

    /// Message count
    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// Append one message, enforcing the pairing invariants.
    ///
    /// On error the session is left exactly as it was.
    pub fn append(&mut self, message: Message) -> Result<()> {
        self.append_all(vec![message])
    }

    /// Append a group of messages atomically: either all are recorded or none.
    pub fn append_all(&mut self, messages: Vec<Message>) -> Result<()> {
        if self.status == SessionStatus::Failed {
            return Err(AgentError::InvariantViolation(format!(
                "session {} has failed and accepts no further messages",
                self.id
            )));
        }

        // Dry run against a scratch copy of the call index.
        let mut calls = self.calls.clone();
        let mut pending = self.pending;
        let mut new_turns = 0;
        for (offset, message) in messages.iter().enumerate() {
            let position = self.history.len() + offset;
            Self::check(&mut calls, &mut pending, position, message)?;
            if matches!(message, Message::UserText { .. }) {
                new_turns += 1;
            }
        }

        self.history.extend(messages);
        self.calls = calls;
        self.pending = pending;
        self.turn += new_turns;
        self.status = if self.pending > 0 {
            SessionStatus::AwaitingTool
        } else if new_turns > 0 || self.status == SessionStatus::AwaitingTool {
            SessionStatus::Active
        } else {
            self.status
        };
        self.touch();
        Ok(())
    }

    fn check(
        calls: &mut HashMap<CallId, CallSlot>,
        pending: &mut usize,
        position: usize,
        message: &Message,
    ) -> Result<()> {
        match message {
            Message::AssistantToolCall { call_id, .. } => {
                if let Some(slot) = calls.get(call_id) {
                    let state = if slot.resolved_at.is_some() { "resolved" } else { "unresolved" };
                    return Err(AgentError::InvariantViolation(format!(
                        "call_id {call_id} duplicates an {state} tool call at position {}",
                        slot.issued_at
                    )));
                }
                calls.insert(
                    call_id.clone(),
                    CallSlot {
                        issued_at: position,
                        resolved_at: None,
                    },
                );
                *pending += 1;
            }
            Message::ToolResult { call_id, .. } => match calls.get_mut(call_id) {
                Some(slot) if slot.resolved_at.is_none() => {
                    slot.resolved_at = Some(position);
                    *pending -= 1;
                }
                Some(_) => {
                    return Err(AgentError::InvariantViolation(format!(
                        "tool result for call_id {call_id} was already recorded"
                    )));
                }
                None => {
                    return Err(AgentError::InvariantViolation(format!(
                        "tool result references unknown call_id {call_id}"
                    )));
                }
            },
            Message::UserText { .. } | Message::AssistantText { .. } | Message::SystemText { .. } => {
                if *pending > 0 {
                    return Err(AgentError::InvariantViolation(format!(
                        "cannot append {} while {pending} tool call(s) are unresolved",
                        message.role()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Every tool call not yet matched by a result, in insertion order
    pub fn pending_tool_calls(&self) -> Vec<&Message> {
        let mut positions: Vec<usize> = self
            .calls
            .values()
            .filter(|slot| slot.resolved_at.is_none())
            .map(|slot| slot.issued_at)
            .collect();
        positions.sort_unstable();
        positions.into_iter().map(|i| &self.history[i]).collect()
    }

    /// Whether `call_id` has already been issued in this session
    pub fn has_call(&self, call_id: &CallId) -> bool {
        self.calls.contains_key(call_id)
    }

    /// Independent copy of the full history
    pub fn snapshot(&self) -> Snapshot {
        Snapshot(self.history.clone().into())
    }

    /// True when the latest non-system message is a user message awaiting a reply
    pub fn awaits_reply(&self) -> bool {
        self.status == SessionStatus::Active
            && self
                .history
                .iter()
                .rev()
                .find(|m| !matches!(m, Message::SystemText { .. }))
                .is_some_and(|m| matches!(m, Message::UserText { .. }))
    }

    pub(crate) fn record_usage(&mut self, usage: TokenUsage) {
        self.usage += usage;
    }

    pub(crate) fn mark_completed(&mut self) {
        if self.status == SessionStatus::Active {
            self.status = SessionStatus::Completed;
            self.touch();
        }
    }

    /// Reopen a failed session.
    ///
    /// Calls left unresolved by the failed turn stay pending, so the session
    /// comes back `AwaitingTool` if any exist and `Active` otherwise. Returns
    /// whether the status changed.
    pub fn resume(&mut self) -> bool {
        if self.status != SessionStatus::Failed {
            return false;
        }
        self.status = if self.pending > 0 {
            SessionStatus::AwaitingTool
        } else {
            SessionStatus::Active
        };
        self.touch();
        true
    }

    pub(crate) fn mark_failed(&mut self) {
        self.status = SessionStatus::Failed;
        self.touch();
    }

    /// Update the activity timestamp
    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
