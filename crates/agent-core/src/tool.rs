//! Tool System
//!
//! Extensible tool framework for agent capabilities.
//! Tools are registered once at startup and invoked by the reasoning loop
//! through a structured request/result protocol:
//!
//! ```text
//! ToolCallRequest ──► lookup ──► validate ──► execute ──► ToolCallResult
//!                       │            │            │
//!                  UnknownTool  SchemaViolation  ExecutionFailed
//! ```
//!
//! [`ToolRegistry::invoke`] always produces a [`ToolCallResult`]: lookup misses,
//! malformed arguments, executor errors, timeouts and even executor panics are
//! reported as `status = error` results the model can read.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{AgentError, Result};
use crate::message::{CallId, Message};

pub use crate::message::ToolStatus;

/// Validated arguments handed to an executor
pub type ToolArguments = Map<String, Value>;

/// Tool call request from the LLM
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Correlation token
    pub call_id: CallId,

    /// Tool identifier
    pub tool_name: String,

    /// Untyped structured arguments, checked against the tool's schema
    #[serde(default)]
    pub arguments: Value,
}

impl ToolCallRequest {
    /// New request with a freshly generated call id
    pub fn new(tool_name: impl Into<String>, arguments: Value) -> Self {
        Self {
            call_id: CallId::generate(),
            tool_name: tool_name.into(),
            arguments,
        }
    }

    pub fn with_call_id(mut self, call_id: CallId) -> Self {
        self.call_id = call_id;
        self
    }
}

/// Result from tool execution
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub call_id: CallId,
    pub status: ToolStatus,
    /// Executor output on success, a serialized [`ToolFailure`] on error
    pub content: Value,
}

impl ToolCallResult {
    pub fn ok(call_id: CallId, content: Value) -> Self {
        Self {
            call_id,
            status: ToolStatus::Ok,
            content,
        }
    }

    pub fn failure(call_id: CallId, failure: &ToolFailure) -> Self {
        Self {
            call_id,
            status: ToolStatus::Error,
            content: failure.to_value(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ToolStatus::Ok
    }

    /// Structured failure details, if this is an error result
    pub fn failure_details(&self) -> Option<ToolFailure> {
        if self.status == ToolStatus::Ok {
            return None;
        }
        serde_json::from_value(self.content.clone()).ok()
    }

    /// Convert into the conversation message that records it
    pub fn into_message(self) -> Message {
        Message::tool_result(self.call_id, self.status, self.content)
    }
}

/// Tool-level failure classes; all are fed back to the model as data
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    UnknownTool,
    SchemaViolation,
    ExecutionFailed,
}

/// One offending argument
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldViolation {
    pub field: String,
    pub reason: String,
}

impl fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}': {}", self.field, self.reason)
    }
}

/// Error payload of a failed tool call
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolFailure {
    pub kind: ToolErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<FieldViolation>,
}

impl ToolFailure {
    pub fn unknown_tool(name: &str, available: &[&str]) -> Self {
        let message = if available.is_empty() {
            format!("unknown tool '{name}'; no tools are registered")
        } else {
            format!("unknown tool '{name}'; available tools: {}", available.join(", "))
        };
        Self {
            kind: ToolErrorKind::UnknownTool,
            message,
            violations: Vec::new(),
        }
    }

    pub fn schema_violation(tool: &str, violations: Vec<FieldViolation>) -> Self {
        let listed = violations
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        Self {
            kind: ToolErrorKind::SchemaViolation,
            message: format!("invalid arguments for '{tool}': {listed}"),
            violations,
        }
    }

    pub fn execution_failed(tool: &str, cause: impl fmt::Display) -> Self {
        Self {
            kind: ToolErrorKind::ExecutionFailed,
            message: format!("tool '{tool}' failed: {cause}"),
            violations: Vec::new(),
        }
    }

    fn to_value(&self) -> Value {
        let mut value = json!({ "kind": self.kind, "message": self.message });
        if !self.violations.is_empty() {
            value["violations"] = json!(self.violations);
        }
        value
    }
}

/// Structural type of a parameter
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
}

impl ParamType {
    fn matches(self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Number => value.is_number(),
            ParamType::Integer => value.is_i64() || value.is_u64(),
            ParamType::Boolean => value.is_boolean(),
            ParamType::Object => value.is_object(),
            ParamType::Array => value.is_array(),
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ParamType::String => "string",
            ParamType::Number => "number",
            ParamType::Integer => "integer",
            ParamType::Boolean => "boolean",
            ParamType::Object => "object",
            ParamType::Array => "array",
        };
        f.write_str(name)
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Parameter definition for tool schema
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParameterSchema {
    /// Parameter name
    pub name: String,

    /// Expected JSON type
    #[serde(rename = "type")]
    pub param_type: ParamType,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Whether this parameter is required
    #[serde(default)]
    pub required: bool,

    /// Default value if not provided
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl ParameterSchema {
    pub fn required(name: impl Into<String>, param_type: ParamType, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            param_type,
            description: description.into(),
            required: true,
            default: None,
        }
    }

    pub fn optional(name: impl Into<String>, param_type: ParamType, description: impl Into<String>) -> Self {
        Self {
            required: false,
            ..Self::required(name, param_type, description)
        }
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }
}

/// Tool definition schema (for LLM function calling)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Unique tool identifier
    pub name: String,

    /// Human-readable description (shown to LLM)
    pub description: String,

    /// Parameter definitions
    #[serde(default)]
    pub parameters: Vec<ParameterSchema>,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: Vec::new(),
        }
    }

    pub fn param(mut self, parameter: ParameterSchema) -> Self {
        self.parameters.push(parameter);
        self
    }

    /// JSON-Schema rendering of the parameters, as vendor APIs expect it
    pub fn json_schema(&self) -> Value {
        let properties: Map<String, Value> = self
            .parameters
            .iter()
            .map(|p| {
                let mut prop = json!({ "type": p.param_type, "description": p.description });
                if let Some(default) = &p.default {
                    prop["default"] = default.clone();
                }
                (p.name.clone(), prop)
            })
            .collect();
        let required: Vec<&str> = self
            .parameters
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name.as_str())
            .collect();
        json!({ "type": "object", "properties": properties, "required": required })
    }

    fn check(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(AgentError::InvalidToolSpec("tool name must not be empty".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for p in &self.parameters {
            if !seen.insert(p.name.as_str()) {
                return Err(AgentError::InvalidToolSpec(format!(
                    "tool '{}' declares parameter '{}' twice",
                    self.name, p.name
                )));
            }
        }
        Ok(())
    }

    /// Check `arguments` structurally; report every offending field.
    ///
    /// `null` is read as "no arguments". Unknown extra fields are accepted.
    /// Omitted optional parameters with a default are filled in.
    pub fn validate_arguments(&self, arguments: &Value) -> std::result::Result<ToolArguments, Vec<FieldViolation>> {
        let mut args = match arguments {
            Value::Null => Map::new(),
            Value::Object(map) => map.clone(),
            other => {
                return Err(vec![FieldViolation {
                    field: "$".into(),
                    reason: format!("expected an object of arguments, got {}", json_type_name(other)),
                }]);
            }
        };

        let mut violations = Vec::new();
        for param in &self.parameters {
            match args.get(&param.name) {
                None | Some(Value::Null) if param.required => violations.push(FieldViolation {
                    field: param.name.clone(),
                    reason: "missing required field".into(),
                }),
                None | Some(Value::Null) => {
                    if let Some(default) = &param.default {
                        args.insert(param.name.clone(), default.clone());
                    }
                }
                Some(value) if !param.param_type.matches(value) => violations.push(FieldViolation {
                    field: param.name.clone(),
                    reason: format!("expected {}, got {}", param.param_type, json_type_name(value)),
                }),
                Some(_) => {}
            }
        }

        if violations.is_empty() {
            Ok(args)
        } else {
            Err(violations)
        }
    }
}

/// The capability behind a tool: validated arguments in, structured value out
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, arguments: &ToolArguments) -> anyhow::Result<Value>;
}

/// Tool trait - a descriptor and its executor in one type
pub trait Tool: ToolExecutor {
    /// Get the tool's schema for LLM function calling
    fn spec(&self) -> ToolSpec;
}

/// Adapter turning an async closure into a [`ToolExecutor`]
pub struct FnExecutor<F>(F);

#[async_trait]
impl<F, Fut> ToolExecutor for FnExecutor<F>
where
    F: Fn(ToolArguments) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn execute(&self, arguments: &ToolArguments) -> anyhow::Result<Value> {
        (self.0)(arguments.clone()).await
    }
}

/// Wrap an async closure as a shareable executor
pub fn executor_fn<F, Fut>(f: F) -> Arc<dyn ToolExecutor>
where
    F: Fn(ToolArguments) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(FnExecutor(f))
}

struct RegisteredTool {
    spec: ToolSpec,
    executor: Arc<dyn ToolExecutor>,
}

/// Registry for available tools
///
/// Read-only once built; wrap it in an `Arc` to share across sessions.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<RegisteredTool>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor with its executor
    pub fn register(&mut self, spec: ToolSpec, executor: Arc<dyn ToolExecutor>) -> Result<()> {
        spec.check()?;
        if self.index.contains_key(&spec.name) {
            return Err(AgentError::DuplicateTool(spec.name));
        }
        tracing::debug!(tool = %spec.name, "Registered tool");
        self.index.insert(spec.name.clone(), self.tools.len());
        self.tools.push(RegisteredTool { spec, executor });
        Ok(())
    }

    /// Register a self-describing tool
    pub fn register_tool<T: Tool + 'static>(&mut self, tool: T) -> Result<()> {
        let spec = tool.spec();
        self.register(spec, Arc::new(tool))
    }

    /// All descriptors, in registration order
    pub fn describe_all(&self) -> Vec<ToolSpec> {
        self.tools.iter().map(|t| t.spec.clone()).collect()
    }

    /// Get a descriptor by name
    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.index.get(name).map(|&i| &self.tools[i].spec)
    }

    /// Get tool names
    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.spec.name.as_str()).collect()
    }

    /// Number of registered tools
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Execute a tool call; never fails, errors come back as error results
    pub async fn invoke(&self, request: &ToolCallRequest) -> ToolCallResult {
        self.invoke_with_timeout(request, None).await
    }

    /// [`Self::invoke`] with an optional upper bound on executor run time
    pub async fn invoke_with_timeout(
        &self,
        request: &ToolCallRequest,
        timeout: Option<Duration>,
    ) -> ToolCallResult {
        let call_id = request.call_id.clone();
        let name = request.tool_name.as_str();

        let Some(tool) = self.index.get(name).map(|&i| &self.tools[i]) else {
            tracing::warn!(tool = name, call_id = %call_id, "Unknown tool requested");
            return ToolCallResult::failure(call_id, &ToolFailure::unknown_tool(name, &self.names()));
        };

        let arguments = match tool.spec.validate_arguments(&request.arguments) {
            Ok(arguments) => arguments,
            Err(violations) => {
                tracing::debug!(tool = name, call_id = %call_id, count = violations.len(), "Tool arguments rejected");
                return ToolCallResult::failure(call_id, &ToolFailure::schema_violation(name, violations));
            }
        };

        tracing::debug!(tool = name, call_id = %call_id, "Executing tool");
        let run = AssertUnwindSafe(tool.executor.execute(&arguments)).catch_unwind();
        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, run).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    let cause = format!("timed out after {}ms", limit.as_millis());
                    return ToolCallResult::failure(call_id, &ToolFailure::execution_failed(name, cause));
                }
            },
            None => run.await,
        };

        match outcome {
            Ok(Ok(value)) => ToolCallResult::ok(call_id, value),
            Ok(Err(e)) => {
                tracing::debug!(tool = name, call_id = %call_id, error = %e, "Tool execution failed");
                ToolCallResult::failure(call_id, &ToolFailure::execution_failed(name, format!("{e:#}")))
            }
            Err(panic) => {
                let cause = panic
                    .downcast_ref::<&str>()
                    .map(ToString::to_string)
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "executor panicked".into());
                tracing::error!(tool = name, call_id = %call_id, cause = %cause, "Tool executor panicked");
                ToolCallResult::failure(call_id, &ToolFailure::execution_failed(name, format!("panicked: {cause}")))
            }
        }
    }
}
