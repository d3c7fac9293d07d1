use async_stream::try_stream;
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::ProviderError;
use crate::llm::{
    ChatModel, ChunkStream, Message, MessageChunk, ModelCompletion, ModelRequest, ModelUsage,
    ToolCallDelta, ToolCallRequest,
};

const DEFAULT_API_BASE_URL: &str = "https://api.openai.com/v1";
const ROUTING_PREFIX: &str = "openai/";
const STREAM_DONE_MARKER: &str = "[DONE]";
const RESERVED_BODY_KEYS: [&str; 5] = ["model", "messages", "tools", "response_format", "stream"];

#[derive(Debug, Clone, Default)]
pub struct OpenAiModelConfig {
    pub api_key: Option<String>,
    pub api_base_url: Option<String>,
}

impl OpenAiModelConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: Some(api_key.into()),
            api_base_url: None,
        }
    }

    /// Reads `OPENAI_API_KEY` and `OPENAI_BASE_URL`. Both are optional so
    /// keyless OpenAI-compatible servers work out of the box.
    pub fn from_env() -> Self {
        Self {
            api_key: std::env::var("OPENAI_API_KEY")
                .ok()
                .filter(|key| !key.is_empty()),
            api_base_url: std::env::var("OPENAI_BASE_URL")
                .ok()
                .filter(|url| !url.is_empty()),
        }
    }

    pub fn with_api_base_url(mut self, api_base_url: impl Into<String>) -> Self {
        self.api_base_url = Some(api_base_url.into());
        self
    }
}

/// Adapter for `/chat/completions` endpoints speaking the OpenAI wire format.
#[derive(Debug, Clone)]
pub struct OpenAiModel {
    client: Client,
    config: OpenAiModelConfig,
}

impl OpenAiModel {
    pub fn new(config: OpenAiModelConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .build()
            .map_err(|err| ProviderError::Request(err.to_string()))?;

        Ok(Self { client, config })
    }

    pub fn from_env() -> Result<Self, ProviderError> {
        Self::new(OpenAiModelConfig::from_env())
    }

    fn endpoint(&self) -> String {
        let base = self
            .config
            .api_base_url
            .as_deref()
            .unwrap_or(DEFAULT_API_BASE_URL)
            .trim_end_matches('/');
        format!("{base}/chat/completions")
    }

    async fn send(&self, body: &OpenAiChatRequest<'_>) -> Result<reqwest::Response, ProviderError> {
        let mut request = self
            .client
            .post(self.endpoint())
            .header("content-type", "application/json")
            .json(body);
        if let Some(api_key) = &self.config.api_key {
            request = request.header("authorization", format!("Bearer {api_key}"));
        }

        let response = request
            .send()
            .await
            .map_err(|err| ProviderError::Request(err.to_string()))?;

        if !response.status().is_success() {
            return Err(ProviderError::Request(extract_api_error(response).await));
        }

        Ok(response)
    }
}

#[async_trait]
impl ChatModel for OpenAiModel {
    async fn invoke(&self, request: &ModelRequest<'_>) -> Result<ModelCompletion, ProviderError> {
        let body = build_request(request, false);
        let payload = self
            .send(&body)
            .await?
            .json::<OpenAiChatResponse>()
            .await
            .map_err(|err| ProviderError::Response(err.to_string()))?;

        normalize_response(payload, request.response_format.is_some())
    }

    async fn invoke_stream(&self, request: &ModelRequest<'_>) -> Result<ChunkStream, ProviderError> {
        let body = build_request(request, true);
        let response = self.send(&body).await?;

        Ok(Box::pin(sse_chunks(response)))
    }
}

fn sse_chunks(
    response: reqwest::Response,
) -> impl Stream<Item = Result<MessageChunk, ProviderError>> + Send {
    try_stream! {
        let mut bytes = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();

        while let Some(piece) = bytes.next().await {
            let piece = piece.map_err(|err| ProviderError::Request(err.to_string()))?;
            buffer.extend_from_slice(&piece);

            while let Some(position) = buffer.iter().position(|byte| *byte == b'\n') {
                let line = buffer.drain(..=position).collect::<Vec<u8>>();
                match parse_sse_line(&line)? {
                    SseLine::Chunk(chunk) => yield chunk,
                    SseLine::Done => return,
                    SseLine::Skip => {}
                }
            }
        }

        if let SseLine::Chunk(chunk) = parse_sse_line(&buffer)? {
            yield chunk;
        }
    }
}

#[derive(Debug, Serialize)]
struct OpenAiChatRequest<'a> {
    model: &'a str,
    messages: Vec<OpenAiRequestMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OpenAiToolDefinition>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
    stream: bool,
    #[serde(flatten)]
    params: Map<String, Value>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "role", rename_all = "lowercase")]
enum OpenAiRequestMessage {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_calls: Option<Vec<OpenAiToolCall>>,
    },
    Tool {
        tool_call_id: String,
        content: String,
    },
}

#[derive(Debug, Serialize)]
struct OpenAiToolDefinition {
    #[serde(rename = "type")]
    type_: String,
    function: OpenAiToolFunctionDefinition,
}

#[derive(Debug, Serialize)]
struct OpenAiToolFunctionDefinition {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct OpenAiToolCall {
    id: String,
    #[serde(rename = "type", default)]
    type_: String,
    function: OpenAiToolCallFunction,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct OpenAiToolCallFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiChatResponse {
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: Option<OpenAiAssistantMessage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiAssistantMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<OpenAiToolCall>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChunk {
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChoice {
    #[serde(default)]
    delta: OpenAiStreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAiStreamDelta {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<OpenAiStreamToolCall>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamToolCall {
    index: usize,
    id: Option<String>,
    function: Option<OpenAiStreamFunction>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamFunction {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiErrorEnvelope {
    error: OpenAiApiError,
}

#[derive(Debug, Deserialize)]
struct OpenAiApiError {
    message: Option<String>,
    #[serde(rename = "type")]
    type_: Option<String>,
    code: Option<Value>,
}

#[derive(Debug, PartialEq)]
enum SseLine {
    Chunk(MessageChunk),
    Done,
    Skip,
}

fn build_request<'a>(request: &'a ModelRequest<'a>, stream: bool) -> OpenAiChatRequest<'a> {
    let tools = if request.tools.is_empty() {
        None
    } else {
        Some(
            request
                .tools
                .iter()
                .map(|tool| OpenAiToolDefinition {
                    type_: "function".to_string(),
                    function: OpenAiToolFunctionDefinition {
                        name: tool.name.clone(),
                        description: tool.description.clone(),
                        parameters: tool.parameters.clone(),
                    },
                })
                .collect::<Vec<_>>(),
        )
    };

    let response_format = request.response_format.map(|format| {
        json!({
            "type": "json_schema",
            "json_schema": {
                "name": format.name(),
                "schema": format.json_schema(),
            }
        })
    });

    OpenAiChatRequest {
        model: request
            .model
            .strip_prefix(ROUTING_PREFIX)
            .unwrap_or(request.model),
        messages: to_openai_messages(request.messages),
        tools,
        response_format,
        stream,
        params: passthrough_params(request.params),
    }
}

fn passthrough_params(params: &Map<String, Value>) -> Map<String, Value> {
    params
        .iter()
        .filter(|(key, _)| {
            let reserved = RESERVED_BODY_KEYS.contains(&key.as_str());
            if reserved {
                tracing::warn!(param = %key, "ignoring param that collides with a request field");
            }
            !reserved
        })
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

fn to_openai_messages(messages: &[Message]) -> Vec<OpenAiRequestMessage> {
    messages
        .iter()
        .filter_map(|message| match message {
            Message::System { content } if content.is_empty() => None,
            Message::System { content } => Some(OpenAiRequestMessage::System {
                content: content.clone(),
            }),
            Message::User { content } => Some(OpenAiRequestMessage::User {
                content: content.clone(),
            }),
            Message::Assistant {
                content,
                tool_calls,
                ..
            } => {
                let tool_calls = tool_calls
                    .iter()
                    .map(|call| OpenAiToolCall {
                        id: call.id.clone(),
                        type_: "function".to_string(),
                        function: OpenAiToolCallFunction {
                            name: call.name.clone(),
                            arguments: call.arguments.clone(),
                        },
                    })
                    .collect::<Vec<_>>();

                Some(OpenAiRequestMessage::Assistant {
                    content: content.clone(),
                    tool_calls: if tool_calls.is_empty() {
                        None
                    } else {
                        Some(tool_calls)
                    },
                })
            }
            Message::Tool {
                tool_call_id,
                content,
            } => Some(OpenAiRequestMessage::Tool {
                tool_call_id: tool_call_id.clone(),
                content: content.clone(),
            }),
        })
        .collect()
}

fn normalize_response(
    response: OpenAiChatResponse,
    structured: bool,
) -> Result<ModelCompletion, ProviderError> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::Response("response missing choices".to_string()))?;

    let message = choice
        .message
        .ok_or_else(|| ProviderError::Response("response missing choice message".to_string()))?;

    let tool_calls = message
        .tool_calls
        .into_iter()
        .map(|call| ToolCallRequest {
            id: call.id,
            name: call.function.name,
            arguments: call.function.arguments,
        })
        .collect::<Vec<_>>();

    let parsed = if structured && tool_calls.is_empty() {
        message
            .content
            .as_deref()
            .and_then(|content| serde_json::from_str::<Value>(content).ok())
    } else {
        None
    };

    let usage = response.usage.map(|usage| ModelUsage {
        input_tokens: usage.prompt_tokens.unwrap_or(0),
        output_tokens: usage.completion_tokens.unwrap_or(0),
    });

    Ok(ModelCompletion {
        content: message.content,
        tool_calls,
        parsed,
        usage,
    })
}

fn parse_sse_line(line: &[u8]) -> Result<SseLine, ProviderError> {
    let line = std::str::from_utf8(line)
        .map_err(|err| ProviderError::Response(format!("stream is not valid UTF-8: {err}")))?
        .trim();

    let Some(data) = line.strip_prefix("data:").map(str::trim_start) else {
        return Ok(SseLine::Skip);
    };
    if data == STREAM_DONE_MARKER {
        return Ok(SseLine::Done);
    }
    if data.is_empty() {
        return Ok(SseLine::Skip);
    }

    let chunk = serde_json::from_str::<OpenAiStreamChunk>(data)
        .map_err(|err| ProviderError::Response(format!("invalid stream chunk: {err}")))?;

    let Some(choice) = chunk.choices.into_iter().next() else {
        return Ok(SseLine::Skip);
    };

    let tool_calls = choice
        .delta
        .tool_calls
        .into_iter()
        .map(|call| {
            let (name, arguments) = match call.function {
                Some(function) => (function.name, function.arguments.unwrap_or_default()),
                None => (None, String::new()),
            };
            ToolCallDelta {
                index: call.index,
                id: call.id,
                name,
                arguments,
            }
        })
        .collect::<Vec<_>>();

    Ok(SseLine::Chunk(MessageChunk {
        content: choice.delta.content,
        tool_calls,
    }))
}

async fn extract_api_error(response: reqwest::Response) -> String {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();

    if let Ok(parsed) = serde_json::from_str::<OpenAiErrorEnvelope>(&body) {
        let code = parsed
            .error
            .code
            .map(|value| match value {
                Value::String(value) => value,
                other => other.to_string(),
            })
            .unwrap_or_else(|| status.as_u16().to_string());
        let error_type = parsed
            .error
            .type_
            .unwrap_or_else(|| status.to_string().to_uppercase());
        let message = parsed
            .error
            .message
            .unwrap_or_else(|| "unknown api error".to_string());

        return format!("api error {code} {error_type}: {message}");
    }

    if body.is_empty() {
        format!("api request failed ({status})")
    } else {
        format!("api request failed ({status}): {body}")
    }
}
