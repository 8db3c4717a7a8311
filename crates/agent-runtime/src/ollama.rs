//! Ollama LLM Provider
//!
//! Implementation of `LlmProvider` for local Ollama inference over the
//! `/api/chat` endpoint, with native tool calling.
//!
//! Ollama does not carry call ids: tool calls of one assistant turn travel as
//! a single message, and each tool result names the tool it answers. Fresh
//! [`CallId`]s are minted for every call the model requests.

use std::collections::HashMap;
use std::time::Duration;

use agent_core::{
    error::{ProviderError, ProviderErrorKind},
    message::{CallId, Message},
    provider::{LlmProvider, ProviderReply, ProviderResult, TokenUsage},
    tool::{ToolCallRequest, ToolSpec},
};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Ollama provider configuration
#[derive(Clone, Debug, PartialEq)]
pub struct OllamaConfig {
    /// Ollama host URL
    pub host: String,

    /// Ollama port
    pub port: u16,

    /// Model to chat with
    pub model: String,

    /// Sampling temperature; Ollama's default when unset
    pub temperature: Option<f32>,

    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            host: "http://localhost".into(),
            port: 11434,
            model: "llama3.2".into(),
            temperature: None,
            timeout_secs: 120,
        }
    }
}

impl OllamaConfig {
    /// Read `OLLAMA_*` variables, loading a `.env` file first if present
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unparseable values fall back to defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            host: lookup("OLLAMA_HOST").unwrap_or(defaults.host),
            port: lookup("OLLAMA_PORT")
                .and_then(|p| p.trim().parse().ok())
                .unwrap_or(defaults.port),
            model: lookup("OLLAMA_MODEL").unwrap_or(defaults.model),
            temperature: lookup("OLLAMA_TEMPERATURE").and_then(|t| t.trim().parse().ok()),
            timeout_secs: lookup("OLLAMA_TIMEOUT_SECS")
                .and_then(|t| t.trim().parse().ok())
                .unwrap_or(defaults.timeout_secs),
        }
    }

    pub fn base_url(&self) -> String {
        format!("{}:{}", self.host.trim_end_matches('/'), self.port)
    }
}

/// Message as `/api/chat` reads and writes it
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
struct WireMessage {
    role: String,
    #[serde(default)]
    content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<WireToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_name: Option<String>,
}

impl WireMessage {
    fn text(role: &str, content: &str) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct WireToolCall {
    function: WireFunction,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<Value>,
}

#[derive(Deserialize)]
struct ChatResponse {
    message: Option<WireMessage>,
    prompt_eval_count: Option<u32>,
    eval_count: Option<u32>,
    error: Option<String>,
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelTag>,
}

#[derive(Deserialize)]
struct ModelTag {
    name: String,
}

/// Ollama LLM provider
pub struct OllamaProvider {
    client: reqwest::Client,
    config: OllamaConfig,
}

impl OllamaProvider {
    /// Create a new Ollama provider with custom host/port
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self::from_config(OllamaConfig {
            host: host.into(),
            port,
            ..Default::default()
        })
    }

    /// Create from configuration
    pub fn from_config(config: OllamaConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    /// Create from environment variables
    pub fn from_env() -> Self {
        Self::from_config(OllamaConfig::from_env())
    }

    /// Create with default localhost settings
    pub fn localhost() -> Self {
        Self::from_config(OllamaConfig::default())
    }

    /// Use a different model
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.config.model = model.into();
        self
    }

    pub fn config(&self) -> &OllamaConfig {
        &self.config
    }

    /// Names of the models pulled on the server
    pub async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        let response = self
            .client
            .get(format!("{}/api/tags", self.config.base_url()))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status();
        let body = response.text().await.map_err(transport_error)?;
        if !status.is_success() {
            return Err(error_for_status(status, &body));
        }
        let tags: TagsResponse = serde_json::from_str(&body)
            .map_err(|e| ProviderError::malformed(format!("cannot parse ollama model list: {e}")))?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    fn chat_request<'a>(&'a self, history: &[Message], tools: &[ToolSpec]) -> ChatRequest<'a> {
        ChatRequest {
            model: &self.config.model,
            messages: convert_messages(history),
            tools: tools.iter().map(convert_tool).collect(),
            stream: false,
            options: self.config.temperature.map(|t| json!({ "temperature": t })),
        }
    }
}

/// Convert agent messages to Ollama format
fn convert_messages(history: &[Message]) -> Vec<WireMessage> {
    let mut tool_names: HashMap<&CallId, &str> = HashMap::new();
    let mut out: Vec<WireMessage> = Vec::with_capacity(history.len());

    for message in history {
        match message {
            Message::SystemText { content } => out.push(WireMessage::text("system", content)),
            Message::UserText { content } => out.push(WireMessage::text("user", content)),
            Message::AssistantText { content } => out.push(WireMessage::text("assistant", content)),
            Message::AssistantToolCall {
                call_id,
                tool_name,
                arguments,
            } => {
                tool_names.insert(call_id, tool_name.as_str());
                let call = WireToolCall {
                    function: WireFunction {
                        name: tool_name.to_string(),
                        arguments: arguments.clone(),
                    },
                };
                // Calls of one step share a single assistant message.
                match out.last_mut() {
                    Some(last) if last.role == "assistant" && !last.tool_calls.is_empty() => {
                        last.tool_calls.push(call);
                    }
                    _ => out.push(WireMessage {
                        role: "assistant".into(),
                        tool_calls: vec![call],
                        ..WireMessage::default()
                    }),
                }
            }
            Message::ToolResult { call_id, content, .. } => out.push(WireMessage {
                role: "tool".into(),
                content: match content {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                },
                tool_name: tool_names.get(call_id).map(|name| (*name).to_string()),
                ..WireMessage::default()
            }),
        }
    }
    out
}

fn convert_tool(spec: &ToolSpec) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": spec.name,
            "description": spec.description,
            "parameters": spec.json_schema(),
        }
    })
}

/// Convert an Ollama response into a provider reply
fn convert_response(response: ChatResponse) -> ProviderResult {
    if let Some(error) = response.error {
        return Err(classify_message(&error));
    }
    let message = response
        .message
        .ok_or_else(|| ProviderError::malformed("ollama response has no message"))?;

    let usage = match (response.prompt_eval_count, response.eval_count) {
        (None, None) => None,
        (prompt, completion) => Some(TokenUsage::new(prompt.unwrap_or(0), completion.unwrap_or(0))),
    };

    let reply = if !message.tool_calls.is_empty() {
        let calls = message
            .tool_calls
            .into_iter()
            .map(|call| ToolCallRequest::new(call.function.name, parse_arguments(call.function.arguments)))
            .collect();
        ProviderReply::tool_calls(calls)
    } else if message.content.trim().is_empty() {
        return Err(ProviderError::malformed("model returned neither text nor tool calls"));
    } else {
        ProviderReply::final_answer(message.content)
    };

    Ok(match usage {
        Some(usage) => reply.with_usage(usage),
        None => reply,
    })
}

/// Some models send arguments as a JSON-encoded string
fn parse_arguments(arguments: Value) -> Value {
    match arguments {
        Value::String(raw) => serde_json::from_str(&raw).unwrap_or(Value::String(raw)),
        other => other,
    }
}

fn classify_message(detail: &str) -> ProviderError {
    let lower = detail.to_lowercase();
    let kind = if lower.contains("context length") || lower.contains("context window") {
        ProviderErrorKind::ContextLengthExceeded
    } else if lower.contains("not found") && lower.contains("model") {
        ProviderErrorKind::ModelNotSupported
    } else {
        ProviderErrorKind::Execution
    };
    ProviderError::new(kind, format!("ollama: {detail}"))
}

fn error_for_status(status: StatusCode, body: &str) -> ProviderError {
    let detail = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string());
    let message = format!("ollama returned {status}: {detail}");

    match status.as_u16() {
        401 | 403 => ProviderError::new(ProviderErrorKind::Authentication, message),
        404 => ProviderError::new(ProviderErrorKind::ModelNotSupported, message),
        408 | 500..=599 => ProviderError::unavailable(message),
        413 => ProviderError::new(ProviderErrorKind::ContextLengthExceeded, message),
        429 => ProviderError::rate_limited(message),
        _ => match classify_message(&detail).kind {
            ProviderErrorKind::Execution => {
                ProviderError::new(ProviderErrorKind::RequestFailed, message).with_retryable(false)
            }
            kind => ProviderError::new(kind, message),
        },
    }
}

fn transport_error(e: reqwest::Error) -> ProviderError {
    if e.is_connect() || e.is_timeout() {
        ProviderError::unavailable(format!("ollama unreachable: {e}"))
    } else {
        ProviderError::new(ProviderErrorKind::RequestFailed, format!("ollama request failed: {e}"))
    }
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn complete(&self, history: &[Message], tools: &[ToolSpec]) -> ProviderResult {
        let request = self.chat_request(history, tools);
        tracing::debug!(
            model = %self.config.model,
            messages = request.messages.len(),
            tools = request.tools.len(),
            "Sending Ollama chat request"
        );

        let response = self
            .client
            .post(format!("{}/api/chat", self.config.base_url()))
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .json(&request)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let body = response.text().await.map_err(transport_error)?;
        if !status.is_success() {
            let err = error_for_status(status, &body);
            tracing::warn!(status = %status, kind = %err.kind, "Ollama request rejected");
            return Err(err);
        }

        let parsed: ChatResponse = serde_json::from_str(&body)
            .map_err(|e| ProviderError::malformed(format!("cannot parse ollama response: {e}")))?;
        convert_response(parsed)
    }

    async fn health_check(&self) -> bool {
        match self.list_models().await {
            Ok(models) => models.iter().any(|m| m.starts_with(&self.config.model)),
            Err(e) => {
                tracing::warn!("Ollama health check failed: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_core::message::ToolStatus;
    use agent_core::tool::{ParamType, ParameterSchema};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn id(s: &str) -> CallId {
        CallId::new(s).unwrap()
    }

    fn config_for(server: &MockServer) -> OllamaConfig {
        OllamaConfig {
            host: "http://127.0.0.1".into(),
            port: server.address().port(),
            timeout_secs: 5,
            ..OllamaConfig::default()
        }
    }

    #[test]
    fn test_config_defaults() {
        let config = OllamaConfig::default();
        assert_eq!(config.host, "http://localhost");
        assert_eq!(config.port, 11434);
        assert_eq!(config.base_url(), "http://localhost:11434");
    }

    #[test]
    fn test_config_from_lookup() {
        let config = OllamaConfig::from_lookup(|key| match key {
            "OLLAMA_HOST" => Some("http://gpu-box/".into()),
            "OLLAMA_PORT" => Some("8080".into()),
            "OLLAMA_MODEL" => Some("qwen2.5".into()),
            "OLLAMA_TEMPERATURE" => Some("not a number".into()),
            _ => None,
        });
        assert_eq!(config.base_url(), "http://gpu-box:8080");
        assert_eq!(config.model, "qwen2.5");
        assert_eq!(config.temperature, None);
        assert_eq!(config.timeout_secs, 120);
    }

    #[test]
    fn test_message_conversion() {
        let history = vec![
            Message::system("You are helpful.").unwrap(),
            Message::user("Weather in Oslo and Rome?").unwrap(),
            Message::tool_call(id("a"), "weather", json!({"city": "Oslo"})).unwrap(),
            Message::tool_call(id("b"), "weather", json!({"city": "Rome"})).unwrap(),
            Message::tool_result(id("a"), ToolStatus::Ok, json!({"temp": 3})),
            Message::tool_result(id("b"), ToolStatus::Ok, json!("sunny")),
            Message::assistant("Cold in Oslo, sunny in Rome.").unwrap(),
        ];

        let converted = convert_messages(&history);
        let roles: Vec<_> = converted.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "tool", "tool", "assistant"]);
        assert_eq!(converted[2].tool_calls.len(), 2);
        assert_eq!(converted[2].tool_calls[1].function.arguments, json!({"city": "Rome"}));
        assert_eq!(converted[3].content, r#"{"temp":3}"#);
        assert_eq!(converted[3].tool_name.as_deref(), Some("weather"));
        assert_eq!(converted[4].content, "sunny");
    }

    #[test]
    fn test_tool_rendering() {
        let spec = ToolSpec::new("weather", "Current weather")
            .param(ParameterSchema::required("city", ParamType::String, "City name"));
        let rendered = convert_tool(&spec);
        assert_eq!(rendered["type"], "function");
        assert_eq!(rendered["function"]["name"], "weather");
        assert_eq!(rendered["function"]["parameters"]["required"], json!(["city"]));
    }

    #[test]
    fn test_response_with_tool_calls() {
        let response: ChatResponse = serde_json::from_value(json!({
            "model": "llama3.2",
            "message": {
                "role": "assistant",
                "content": "",
                "tool_calls": [
                    {"function": {"name": "weather", "arguments": {"city": "Oslo"}}},
                    {"function": {"name": "weather", "arguments": "{\"city\": \"Rome\"}"}}
                ]
            },
            "done": true,
            "prompt_eval_count": 30,
            "eval_count": 12
        }))
        .unwrap();

        let ProviderReply::ToolCallBatch { calls, done, usage } = convert_response(response).unwrap() else {
            panic!("expected a tool call batch");
        };
        assert!(!done);
        assert_eq!(calls.len(), 2);
        assert_ne!(calls[0].call_id, calls[1].call_id);
        assert_eq!(calls[1].arguments, json!({"city": "Rome"}));
        assert_eq!(usage, Some(TokenUsage::new(30, 12)));
    }

    #[test]
    fn test_empty_response_is_malformed() {
        let response: ChatResponse =
            serde_json::from_value(json!({"message": {"role": "assistant", "content": "  "}})).unwrap();
        let err = convert_response(response).unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::MalformedResponse);
        assert!(!err.retryable);
    }

    #[test]
    fn test_status_mapping() {
        let cases = [
            (StatusCode::TOO_MANY_REQUESTS, ProviderErrorKind::RateLimited, true),
            (StatusCode::SERVICE_UNAVAILABLE, ProviderErrorKind::Unavailable, true),
            (StatusCode::UNAUTHORIZED, ProviderErrorKind::Authentication, false),
            (StatusCode::NOT_FOUND, ProviderErrorKind::ModelNotSupported, false),
            (StatusCode::BAD_REQUEST, ProviderErrorKind::RequestFailed, false),
        ];
        for (status, kind, retryable) in cases {
            let err = error_for_status(status, r#"{"error": "nope"}"#);
            assert_eq!((err.kind, err.retryable), (kind, retryable), "{status}");
            assert!(err.message.contains("nope"));
        }

        let err = error_for_status(StatusCode::BAD_REQUEST, r#"{"error": "input exceeds context length"}"#);
        assert_eq!(err.kind, ProviderErrorKind::ContextLengthExceeded);
    }

    #[tokio::test]
    async fn test_complete_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "message": {"role": "assistant", "content": "Hello there!"},
                "done": true,
                "prompt_eval_count": 5,
                "eval_count": 3
            })))
            .expect(1)
            .mount(&server)
            .await;
        let provider = OllamaProvider::from_config(config_for(&server));
        let spec = ToolSpec::new("weather", "Current weather")
            .param(ParameterSchema::required("city", ParamType::String, "City name"));

        let reply = provider
            .complete(
                &[Message::system("Be brief.").unwrap(), Message::user("Hi").unwrap()],
                &[spec],
            )
            .await
            .unwrap();
        assert_eq!(
            reply,
            ProviderReply::final_answer("Hello there!").with_usage(TokenUsage::new(5, 3))
        );

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        let body: Value = requests[0].body_json().unwrap();
        assert_eq!(body["model"], "llama3.2");
        assert_eq!(body["stream"], false);
        assert_eq!(
            body["messages"],
            json!([
                {"role": "system", "content": "Be brief."},
                {"role": "user", "content": "Hi"}
            ])
        );
        assert_eq!(body["tools"][0]["type"], "function");
        assert_eq!(body["tools"][0]["function"]["name"], "weather");
        assert_eq!(body["tools"][0]["function"]["parameters"]["required"], json!(["city"]));
        assert!(body.get("options").is_none());
    }

    #[tokio::test]
    async fn test_complete_maps_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(503).set_body_json(json!({"error": "model is loading"})))
            .mount(&server)
            .await;
        let provider = OllamaProvider::from_config(config_for(&server));

        let err = provider
            .complete(&[Message::user("Hi").unwrap()], &[])
            .await
            .unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::Unavailable);
        assert!(err.retryable);
        assert!(err.message.contains("model is loading"));
    }

    #[tokio::test]
    async fn test_health_check_looks_for_configured_model() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "models": [{"name": "llama3.2:latest"}, {"name": "qwen2.5:7b"}]
            })))
            .mount(&server)
            .await;
        let provider = OllamaProvider::from_config(config_for(&server));

        assert_eq!(
            provider.list_models().await.unwrap(),
            vec!["llama3.2:latest".to_string(), "qwen2.5:7b".to_string()]
        );
        assert!(provider.health_check().await);
        assert!(!provider.with_model("mistral").health_check().await);
    }

    #[tokio::test]
    async fn test_unreachable_server_is_unavailable() {
        // Bind then drop to get a port nobody listens on.
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let provider = OllamaProvider::new("http://127.0.0.1", port);

        let err = provider
            .complete(&[Message::user("Hi").unwrap()], &[])
            .await
            .unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::Unavailable);
        assert!(!provider.health_check().await);
    }
}
