//! Conversation Messages
//!
//! Standard message format used across the agent system. A [`Message`] is a
//! closed sum over the five shapes of conversational content. Values are
//! validated when built (through the constructors or when decoded) and never
//! change afterwards.
//!
//! The wire form is a field-keyed JSON object with an explicit `type`
//! discriminator:
//!
//! ```text
//! {"type":"user_text","content":"hi"}
//! {"type":"assistant_tool_call","call_id":"c1","tool_name":"search","arguments":{"q":"rust"}}
//! {"type":"tool_result","call_id":"c1","status":"ok","content":{"hits":3}}
//! ```

use std::cmp::Ordering;
use std::fmt;
use std::ops::Deref;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AgentError, Result};

/// Role of a message sender, as most vendor APIs name it
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System prompt/instructions
    System,
    /// User input
    User,
    /// Assistant (LLM) response
    Assistant,
    /// Tool result (injected as context)
    Tool,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::Tool => write!(f, "tool"),
        }
    }
}

/// A string guaranteed to hold at least one non-whitespace character
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NonEmptyText(String);

impl NonEmptyText {
    pub fn new(text: impl Into<String>) -> Result<Self> {
        let text = text.into();
        if text.trim().is_empty() {
            return Err(AgentError::InvalidMessage("text must not be empty".into()));
        }
        Ok(Self(text))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for NonEmptyText {
    type Error = AgentError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<NonEmptyText> for String {
    fn from(value: NonEmptyText) -> Self {
        value.0
    }
}

impl Deref for NonEmptyText {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NonEmptyText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Correlation token linking a tool call to its result within one session
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CallId(String);

impl CallId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(AgentError::InvalidMessage("call_id must not be empty".into()));
        }
        Ok(Self(id))
    }

    /// Fresh random identifier
    pub fn generate() -> Self {
        Self(format!("call_{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for CallId {
    type Error = AgentError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<CallId> for String {
    fn from(value: CallId) -> Self {
        value.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome flag of a tool invocation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Ok,
    Error,
}

/// A single message in a conversation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    UserText {
        content: NonEmptyText,
    },
    AssistantText {
        content: NonEmptyText,
    },
    AssistantToolCall {
        call_id: CallId,
        tool_name: NonEmptyText,
        arguments: Value,
    },
    ToolResult {
        call_id: CallId,
        status: ToolStatus,
        content: Value,
    },
    SystemText {
        content: NonEmptyText,
    },
}

impl Message {
    /// Create a user message
    pub fn user(content: impl Into<String>) -> Result<Self> {
        Ok(Self::UserText {
            content: NonEmptyText::new(content)?,
        })
    }

    /// Create an assistant message
    pub fn assistant(content: impl Into<String>) -> Result<Self> {
        Ok(Self::AssistantText {
            content: NonEmptyText::new(content)?,
        })
    }

    /// Create a system message
    pub fn system(content: impl Into<String>) -> Result<Self> {
        Ok(Self::SystemText {
            content: NonEmptyText::new(content)?,
        })
    }

    /// Create an assistant tool-call message
    pub fn tool_call(call_id: CallId, tool_name: impl Into<String>, arguments: Value) -> Result<Self> {
        let tool_name = NonEmptyText::new(tool_name)
            .map_err(|_| AgentError::InvalidMessage("tool_name must not be empty".into()))?;
        Ok(Self::AssistantToolCall {
            call_id,
            tool_name,
            arguments,
        })
    }

    /// Create a tool result message
    pub fn tool_result(call_id: CallId, status: ToolStatus, content: Value) -> Self {
        Self::ToolResult {
            call_id,
            status,
            content,
        }
    }

    /// Sender role for vendor adapters
    pub fn role(&self) -> Role {
        match self {
            Message::UserText { .. } => Role::User,
            Message::AssistantText { .. } | Message::AssistantToolCall { .. } => Role::Assistant,
            Message::ToolResult { .. } => Role::Tool,
            Message::SystemText { .. } => Role::System,
        }
    }

    /// Textual content, for the three text variants
    pub fn text(&self) -> Option<&str> {
        match self {
            Message::UserText { content }
            | Message::AssistantText { content }
            | Message::SystemText { content } => Some(content.as_str()),
            _ => None,
        }
    }

    /// Correlation token, for tool calls and tool results
    pub fn call_id(&self) -> Option<&CallId> {
        match self {
            Message::AssistantToolCall { call_id, .. } | Message::ToolResult { call_id, .. } => {
                Some(call_id)
            }
            _ => None,
        }
    }

    /// Encode to the JSON wire form
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode from the JSON wire form, re-validating every field
    pub fn decode(wire: &str) -> Result<Self> {
        Ok(serde_json::from_str(wire)?)
    }

    /// Estimate token count (rough approximation)
    pub fn estimate_tokens(&self) -> u32 {
        let chars = match self {
            Message::UserText { content }
            | Message::AssistantText { content }
            | Message::SystemText { content } => content.len(),
            Message::AssistantToolCall {
                tool_name,
                arguments,
                ..
            } => tool_name.len() + arguments.to_string().len(),
            Message::ToolResult { content, .. } => content.to_string().len(),
        };
        // ~4 characters per token, +4 for role overhead
        u32::try_from(chars / 4).unwrap_or(u32::MAX).saturating_add(4)
    }
}

impl Message {
    fn variant_rank(&self) -> u8 {
        match self {
            Message::UserText { .. } => 0,
            Message::AssistantText { .. } => 1,
            Message::AssistantToolCall { .. } => 2,
            Message::ToolResult { .. } => 3,
            Message::SystemText { .. } => 4,
        }
    }
}

/// Field-by-field ordering: variant first, then fields in declaration order
impl Ord for Message {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Message::UserText { content: a }, Message::UserText { content: b })
            | (Message::AssistantText { content: a }, Message::AssistantText { content: b })
            | (Message::SystemText { content: a }, Message::SystemText { content: b }) => a.cmp(b),
            (
                Message::AssistantToolCall {
                    call_id: a_id,
                    tool_name: a_name,
                    arguments: a_args,
                },
                Message::AssistantToolCall {
                    call_id: b_id,
                    tool_name: b_name,
                    arguments: b_args,
                },
            ) => a_id
                .cmp(b_id)
                .then_with(|| a_name.cmp(b_name))
                .then_with(|| cmp_values(a_args, b_args)),
            (
                Message::ToolResult {
                    call_id: a_id,
                    status: a_status,
                    content: a_content,
                },
                Message::ToolResult {
                    call_id: b_id,
                    status: b_status,
                    content: b_content,
                },
            ) => a_id
                .cmp(b_id)
                .then_with(|| a_status.cmp(b_status))
                .then_with(|| cmp_values(a_content, b_content)),
            _ => self.variant_rank().cmp(&other.variant_rank()),
        }
    }
}

impl PartialOrd for Message {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Total order over JSON values that agrees with `Value`'s equality
fn cmp_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(n) if !n.is_f64() => 2,
            Value::Number(_) => 3,
            Value::String(_) => 4,
            Value::Array(_) => 5,
            Value::Object(_) => 6,
        }
    }

    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) if x.is_f64() && y.is_f64() => {
            // JSON numbers are never NaN.
            let (x, y) = (x.as_f64().unwrap_or_default(), y.as_f64().unwrap_or_default());
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::Number(x), Value::Number(y)) if !x.is_f64() && !y.is_f64() => {
            let wide = |n: &serde_json::Number| {
                n.as_i64()
                    .map(i128::from)
                    .or_else(|| n.as_u64().map(i128::from))
                    .unwrap_or_default()
            };
            wide(x).cmp(&wide(y))
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => x
            .iter()
            .zip(y)
            .map(|(l, r)| cmp_values(l, r))
            .find(|o| o.is_ne())
            .unwrap_or_else(|| x.len().cmp(&y.len())),
        (Value::Object(x), Value::Object(y)) => x
            .iter()
            .zip(y)
            .map(|((lk, lv), (rk, rv))| lk.cmp(rk).then_with(|| cmp_values(lv, rv)))
            .find(|o| o.is_ne())
            .unwrap_or_else(|| x.len().cmp(&y.len())),
        _ => rank(a).cmp(&rank(b)),
    }
}
