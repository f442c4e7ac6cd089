//! Language model abstractions and the OpenAI-compatible client.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::ModelConfig;
use crate::error::{Result, TetherError};
use crate::message::{Message, Role, ToolCall};
use crate::output::parse_partial_json;
use crate::tool::ToolDescription;

/// A fully assembled model reply. No tool calls means a final answer.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ModelReply {
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
}

impl ModelReply {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            tool_calls: Vec::new(),
        }
    }

    pub fn with_tool_calls(tool_calls: Vec<ToolCall>) -> Self {
        Self {
            content: None,
            tool_calls,
        }
    }

    pub fn is_final(&self) -> bool {
        self.tool_calls.is_empty()
    }

    pub fn into_message(self) -> Message {
        Message::assistant_with_tool_calls(self.content.unwrap_or_default(), self.tool_calls)
    }
}

/// Minimal abstraction around a chat completion provider.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete_chat(
        &self,
        messages: &[Message],
        tools: &[ToolDescription],
    ) -> Result<ModelReply>;
}

#[async_trait]
impl<T: LanguageModel + ?Sized> LanguageModel for Arc<T> {
    async fn complete_chat(
        &self,
        messages: &[Message],
        tools: &[ToolDescription],
    ) -> Result<ModelReply> {
        (**self).complete_chat(messages, tools).await
    }
}

/// One incremental piece of a streamed reply.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplyChunk {
    pub content: Option<String>,
    pub tool_call_chunks: Vec<ToolCallChunk>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolCallChunk {
    pub index: usize,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

#[derive(Debug, Default, Clone)]
struct PartialToolCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

/// Folds streamed chunks into a single immutable [`ModelReply`].
#[derive(Debug, Default, Clone)]
pub struct ReplyAccumulator {
    content: String,
    calls: BTreeMap<usize, PartialToolCall>,
}

impl ReplyAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: ReplyChunk) {
        if let Some(delta) = chunk.content {
            self.content.push_str(&delta);
        }
        for piece in chunk.tool_call_chunks {
            let state = self.calls.entry(piece.index).or_default();
            if state.id.is_none() {
                state.id = piece.id.filter(|id| !id.is_empty());
            }
            if let Some(name) = piece.name.filter(|name| !name.is_empty()) {
                state.name.get_or_insert(name);
            }
            if let Some(args) = piece.arguments {
                state.arguments.push_str(&args);
            }
        }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    /// Partially parsed arguments of every call seen so far, keyed by index.
    pub fn preview(&self) -> Vec<(usize, Option<String>, Value)> {
        self.calls
            .iter()
            .filter_map(|(index, state)| {
                parse_partial_json(&state.arguments)
                    .map(|args| (*index, state.name.clone(), args))
            })
            .collect()
    }

    pub fn finish(self) -> ModelReply {
        let tool_calls = self
            .calls
            .into_iter()
            .filter_map(|(index, state)| {
                let name = state.name?;
                let arguments = if state.arguments.trim().is_empty() {
                    json!({})
                } else {
                    serde_json::from_str(&state.arguments)
                        .unwrap_or_else(|_| Value::String(state.arguments.clone()))
                };
                let id = state
                    .id
                    .unwrap_or_else(|| format!("call_{index}_{}", uuid::Uuid::new_v4().simple()));
                Some(ToolCall {
                    id,
                    name,
                    arguments,
                })
            })
            .collect();

        ModelReply {
            content: if self.content.is_empty() {
                None
            } else {
                Some(self.content)
            },
            tool_calls,
        }
    }
}

fn coalesce_error(status: reqwest::StatusCode, body: &str, provider: &str) -> TetherError {
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return TetherError::LanguageModel(format!("{provider} rate limit exceeded: {body}"));
    }
    TetherError::LanguageModel(format!("{provider} request failed with {status}: {body}"))
}

fn serialize_tool_arguments(args: &Value) -> String {
    serde_json::to_string(args).unwrap_or_else(|_| args.to_string())
}

/// Client for any OpenAI-compatible `/chat/completions` endpoint.
#[derive(Clone)]
pub struct OpenAIClient {
    http: reqwest::Client,
    model: String,
    api_key: String,
    base_url: String,
    temperature: Option<f32>,
    stream: bool,
}

impl OpenAIClient {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Result<Self> {
        Ok(Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(120))
                .build()
                .map_err(|err| TetherError::LanguageModel(format!("http client error: {err}")))?,
            model: model.into(),
            api_key: api_key.into(),
            base_url: "https://api.openai.com/v1".to_string(),
            temperature: None,
            stream: false,
        })
    }

    pub fn from_config(cfg: &ModelConfig) -> Result<Self> {
        let api_key = cfg.api_key.clone().ok_or_else(|| {
            TetherError::Config("missing API key in model config".into())
        })?;
        let mut client = Self::new(api_key, cfg.model.clone())?.with_streaming(cfg.stream);
        if let Some(base_url) = &cfg.base_url {
            client = client.with_base_url(base_url.clone());
        }
        if let Some(temperature) = cfg.temperature {
            client = client.with_temperature(temperature);
        }
        Ok(client)
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    fn to_openai_messages(messages: &[Message]) -> Vec<OpenAiMessage> {
        messages
            .iter()
            .map(|message| {
                let role = match message.role {
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant => "assistant",
                    Role::Tool => "tool",
                }
                .to_string();

                let tool_calls = (!message.tool_calls.is_empty()).then(|| {
                    message
                        .tool_calls
                        .iter()
                        .map(|call| OpenAiToolCall {
                            id: call.id.clone(),
                            r#type: "function".to_string(),
                            function: OpenAiFunctionCall {
                                name: call.name.clone(),
                                arguments: serialize_tool_arguments(&call.arguments),
                            },
                        })
                        .collect()
                });

                let content = if tool_calls.is_some() && message.content.is_empty() {
                    None
                } else {
                    Some(message.content.clone())
                };

                OpenAiMessage {
                    role,
                    content,
                    tool_call_id: message.tool_call_id.clone(),
                    tool_calls,
                }
            })
            .collect()
    }

    fn to_openai_tools(tools: &[ToolDescription]) -> Option<Vec<OpenAiTool>> {
        if tools.is_empty() {
            return None;
        }

        Some(
            tools
                .iter()
                .map(|tool| OpenAiTool {
                    r#type: "function".to_string(),
                    function: OpenAiFunction {
                        name: tool.name.clone(),
                        description: Some(tool.description.clone()),
                        parameters: tool
                            .parameters
                            .clone()
                            .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
                    },
                })
                .collect(),
        )
    }

    async fn read_stream(resp: reqwest::Response) -> Result<ModelReply> {
        let mut accumulator = ReplyAccumulator::new();
        let mut buffer = String::new();
        let mut stream = resp.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk
                .map_err(|err| TetherError::LanguageModel(format!("OpenAI stream error: {err}")))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(newline) = buffer.find('\n') {
                let line: String = buffer.drain(..=newline).collect();
                if let Some(parsed) = parse_sse_line(&line)? {
                    accumulator.push(parsed);
                }
            }
        }
        if let Some(parsed) = parse_sse_line(&buffer)? {
            accumulator.push(parsed);
        }

        Ok(accumulator.finish())
    }
}

fn parse_sse_line(line: &str) -> Result<Option<ReplyChunk>> {
    let line = line.trim();
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(None);
    };
    let data = data.trim();
    if data.is_empty() || data == "[DONE]" {
        return Ok(None);
    }

    let parsed: OpenAiStreamChunk = serde_json::from_str(data).map_err(|err| {
        TetherError::LanguageModel(format!("OpenAI stream parse error `{data}`: {err}"))
    })?;

    let mut chunk = ReplyChunk::default();
    for choice in parsed.choices {
        if let Some(content) = choice.delta.content {
            chunk
                .content
                .get_or_insert_with(String::new)
                .push_str(&content);
        }
        for call in choice.delta.tool_calls.unwrap_or_default() {
            let (name, arguments) = match call.function {
                Some(function) => (function.name, function.arguments),
                None => (None, None),
            };
            chunk.tool_call_chunks.push(ToolCallChunk {
                index: call.index,
                id: call.id,
                name,
                arguments,
            });
        }
    }
    Ok(Some(chunk))
}

#[async_trait]
impl LanguageModel for OpenAIClient {
    async fn complete_chat(
        &self,
        messages: &[Message],
        tools: &[ToolDescription],
    ) -> Result<ModelReply> {
        let mut payload = json!({
            "model": self.model,
            "messages": Self::to_openai_messages(messages),
            "stream": self.stream,
        });
        if let Some(tools) = Self::to_openai_tools(tools) {
            payload["tools"] = json!(tools);
            payload["tool_choice"] = json!("auto");
        }
        if let Some(temperature) = self.temperature {
            payload["temperature"] = json!(temperature);
        }

        tracing::debug!(
            model = %self.model,
            messages = messages.len(),
            tools = tools.len(),
            stream = self.stream,
            "sending chat completion request"
        );

        let resp = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|err| TetherError::LanguageModel(format!("OpenAI request error: {err}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(coalesce_error(status, &body, "openai"));
        }

        if self.stream {
            return Self::read_stream(resp).await;
        }

        let body: OpenAiResponse = resp.json().await.map_err(|err| {
            TetherError::LanguageModel(format!("OpenAI response parse error: {err}"))
        })?;

        let first = body
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| TetherError::LanguageModel("OpenAI returned no choices".into()))?;

        let tool_calls = first
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|call| {
                let arguments = serde_json::from_str(&call.function.arguments)
                    .unwrap_or_else(|_| Value::String(call.function.arguments.clone()));
                ToolCall {
                    id: call.id,
                    name: call.function.name,
                    arguments,
                }
            })
            .collect();

        Ok(ModelReply {
            content: first.message.content,
            tool_calls,
        })
    }
}

/// A deterministic model used for tests and demos.
///
/// Replies are handed out in order; every invocation's message list is kept.
pub struct StubModel {
    responses: Mutex<VecDeque<ModelReply>>,
    invocations: Mutex<Vec<Vec<Message>>>,
}

impl StubModel {
    pub fn new(responses: Vec<ModelReply>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            invocations: Mutex::new(Vec::new()),
        })
    }

    pub fn call_count(&self) -> usize {
        self.invocations.lock().map(|calls| calls.len()).unwrap_or(0)
    }

    pub fn invocations(&self) -> Vec<Vec<Message>> {
        self.invocations
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl LanguageModel for StubModel {
    async fn complete_chat(
        &self,
        messages: &[Message],
        _tools: &[ToolDescription],
    ) -> Result<ModelReply> {
        self.invocations
            .lock()
            .map_err(|_| TetherError::LanguageModel("stub model poisoned".into()))?
            .push(messages.to_vec());

        self.responses
            .lock()
            .map_err(|_| TetherError::LanguageModel("stub model poisoned".into()))?
            .pop_front()
            .ok_or_else(|| {
                TetherError::LanguageModel("StubModel ran out of scripted responses".into())
            })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAiMessage {
    role: String,
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OpenAiToolCall>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAiToolCall {
    id: String,
    #[serde(default = "default_function_type")]
    r#type: String,
    function: OpenAiFunctionCall,
}

fn default_function_type() -> String {
    "function".to_string()
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAiFunctionCall {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Serialize)]
struct OpenAiTool {
    r#type: String,
    function: OpenAiFunction,
}

#[derive(Debug, Serialize)]
struct OpenAiFunction {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    parameters: Value,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoiceMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<OpenAiToolCall>>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChunk {
    #[serde(default)]
    choices: Vec<OpenAiDeltaChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiDeltaChoice {
    delta: OpenAiDelta,
}

#[derive(Debug, Deserialize)]
struct OpenAiDelta {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<OpenAiToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct OpenAiToolCallDelta {
    #[serde(default)]
    index: usize,
    id: Option<String>,
    #[serde(default)]
    function: Option<OpenAiFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct OpenAiFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call_chunk(index: usize, id: Option<&str>, name: Option<&str>, args: &str) -> ReplyChunk {
        ReplyChunk {
            content: None,
            tool_call_chunks: vec![ToolCallChunk {
                index,
                id: id.map(String::from),
                name: name.map(String::from),
                arguments: Some(args.to_string()),
            }],
        }
    }

    #[test]
    fn accumulator_merges_fragments_by_index() {
        let mut acc = ReplyAccumulator::new();
        acc.push(call_chunk(1, Some("b"), Some("list_directory"), "{\"directoryPath\""));
        acc.push(call_chunk(0, Some("a"), Some("read_file"), "{\"filePath\":"));
        acc.push(call_chunk(0, None, None, "\"a.txt\"}"));
        acc.push(call_chunk(1, None, None, ":\".\"}"));

        let reply = acc.finish();
        assert!(reply.content.is_none());
        assert_eq!(reply.tool_calls.len(), 2);
        assert_eq!(reply.tool_calls[0].id, "a");
        assert_eq!(reply.tool_calls[0].arguments, json!({"filePath": "a.txt"}));
        assert_eq!(reply.tool_calls[1].name, "list_directory");
        assert_eq!(reply.tool_calls[1].arguments, json!({"directoryPath": "."}));
    }

    #[test]
    fn accumulator_concatenates_content_and_fills_gaps() {
        let mut acc = ReplyAccumulator::new();
        acc.push(ReplyChunk {
            content: Some("Hel".into()),
            ..Default::default()
        });
        acc.push(ReplyChunk {
            content: Some("lo".into()),
            ..Default::default()
        });
        acc.push(call_chunk(0, None, Some("ping"), ""));
        acc.push(call_chunk(1, Some("orphan"), None, "{}"));
        assert_eq!(acc.content(), "Hello");

        let reply = acc.finish();
        assert_eq!(reply.content.as_deref(), Some("Hello"));
        assert_eq!(reply.tool_calls.len(), 1);
        assert!(reply.tool_calls[0].id.starts_with("call_0_"));
        assert_eq!(reply.tool_calls[0].arguments, json!({}));
    }

    #[test]
    fn synthesized_ids_differ_between_replies() {
        let reply = |_| {
            let mut acc = ReplyAccumulator::new();
            acc.push(call_chunk(0, None, Some("ping"), "{}"));
            acc.finish().tool_calls.remove(0).id
        };
        assert_ne!(reply(1), reply(2));
    }

    #[test]
    fn accumulator_previews_partial_arguments() {
        let mut acc = ReplyAccumulator::new();
        acc.push(call_chunk(
            0,
            Some("w"),
            Some("write_file"),
            "{\"filePath\":\"App.tsx\",\"content\":\"import Re",
        ));
        let preview = acc.preview();
        assert_eq!(preview.len(), 1);
        assert_eq!(preview[0].1.as_deref(), Some("write_file"));
        assert_eq!(preview[0].2["content"], "import Re");
    }

    #[test]
    fn parses_sse_lines() {
        let line = r#"data: {"choices":[{"delta":{"content":"hi","tool_calls":[{"index":0,"id":"c1","function":{"name":"calc","arguments":"{}"}}]}}]}"#;
        let chunk = parse_sse_line(line).unwrap().unwrap();
        assert_eq!(chunk.content.as_deref(), Some("hi"));
        assert_eq!(chunk.tool_call_chunks[0].id.as_deref(), Some("c1"));
        assert!(parse_sse_line("data: [DONE]").unwrap().is_none());
        assert!(parse_sse_line(": keep-alive").unwrap().is_none());
    }

    #[test]
    fn maps_tool_messages_for_openai() {
        let messages = vec![
            Message::assistant_with_tool_calls(
                "",
                vec![ToolCall::new("a", "calc", json!({"expr": "2+2"}))],
            ),
            Message::tool_result("a", "4"),
        ];
        let mapped = OpenAIClient::to_openai_messages(&messages);
        assert!(mapped[0].content.is_none());
        let calls = mapped[0].tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].function.arguments, r#"{"expr":"2+2"}"#);
        assert_eq!(mapped[1].role, "tool");
        assert_eq!(mapped[1].tool_call_id.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn stub_model_replays_and_records() {
        let model = StubModel::new(vec![ModelReply::text("one")]);
        let reply = model
            .complete_chat(&[Message::user("hi")], &[])
            .await
            .unwrap();
        assert_eq!(reply, ModelReply::text("one"));
        assert_eq!(model.call_count(), 1);
        assert!(model.complete_chat(&[], &[]).await.is_err());
        assert_eq!(model.invocations()[0], vec![Message::user("hi")]);
    }
}
