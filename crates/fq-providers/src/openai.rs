use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, RequestBuilder};
use reqwest_eventsource::{Event, EventSource};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, trace};

use fq_core::{
    CompletionRequest, CompletionResponse, Error, FinishReason, Message, Provider, Role,
    StreamChunk, StreamResult, ToolCall, ToolDefinition, Usage,
};

/// LM Studio's local server, the usual home of the models this tool drives.
pub const DEFAULT_BASE_URL: &str = "http://localhost:1234/v1";

pub struct OpenAIProvider {
    client: Client,
    api_key: String,
    base_url: String,
}

impl OpenAIProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_timeout(api_key, None)
    }

    /// Create a provider that gives up when connecting, or waiting for the
    /// next piece of a reply, takes longer than `timeout`. A reply that keeps
    /// streaming is never cut off. `None` means requests may wait indefinitely.
    pub fn with_timeout(api_key: impl Into<String>, timeout: Option<Duration>) -> Self {
        // Configure client for proper SSE streaming:
        // - Use HTTP/1.1 to avoid HTTP/2 framing issues
        // - Disable automatic decompression which can buffer entire response
        let mut builder = Client::builder()
            .http1_only()
            .no_gzip()
            .no_brotli()
            .no_deflate();
        if let Some(timeout) = timeout {
            builder = builder.connect_timeout(timeout).read_timeout(timeout);
        }

        Self {
            client: builder.build().unwrap_or_else(|_| Client::new()),
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn build_request(&self, request: &CompletionRequest) -> OpenAIChatRequest {
        let tools = if request.tools.is_empty() {
            None
        } else {
            Some(request.tools.iter().map(convert_tool).collect())
        };

        OpenAIChatRequest {
            model: request.model.clone(),
            messages: request.messages.iter().map(convert_message).collect(),
            temperature: request.temperature,
            stream: request.stream,
            tools,
        }
    }

    fn request_builder(&self, request: &CompletionRequest) -> RequestBuilder {
        let api_request = self.build_request(request);
        debug!(?api_request, "OpenAI request");

        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json");
        if request.stream {
            builder = builder
                .header("Accept-Encoding", "identity")
                .header("Cache-Control", "no-cache");
        }
        builder.json(&api_request)
    }

    async fn send(&self, request: &CompletionRequest) -> Result<reqwest::Response, Error> {
        let response = self
            .request_builder(request)
            .send()
            .await
            .map_err(|e| Error::network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(parse_error(status.as_u16(), &error_text));
        }
        Ok(response)
    }
}

fn convert_message(message: &Message) -> OpenAIMessage {
    let role = match message.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };

    let tool_calls = if message.tool_calls.is_empty() {
        None
    } else {
        Some(
            message
                .tool_calls
                .iter()
                .map(|tc| OpenAIToolCall {
                    id: tc.id.clone(),
                    r#type: "function".to_string(),
                    function: OpenAIFunctionCall {
                        name: tc.name.clone(),
                        arguments: tc.arguments.clone(),
                    },
                })
                .collect(),
        )
    };

    OpenAIMessage {
        role: role.to_string(),
        content: Some(message.content.clone()),
        tool_calls,
        tool_call_id: message.tool_call_id.clone(),
    }
}

fn convert_tool(tool: &ToolDefinition) -> OpenAITool {
    OpenAITool {
        r#type: "function".to_string(),
        function: OpenAIFunction {
            name: tool.name.clone(),
            description: tool.description.clone(),
            parameters: serde_json::to_value(&tool.parameters).unwrap_or_default(),
        },
    }
}

fn parse_response(response: OpenAIChatResponse) -> Result<CompletionResponse, Error> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| Error::api(500, "No choices in response"))?;

    let tool_calls: Vec<ToolCall> = choice
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|tc| ToolCall::new(tc.id, tc.function.name, tc.function.arguments))
        .collect();

    let content = choice.message.content.unwrap_or_default();
    let message = if tool_calls.is_empty() {
        Message::assistant(content)
    } else {
        Message::assistant_with_tool_calls(content, tool_calls)
    };

    let finish_reason = match choice.finish_reason.as_deref() {
        Some("length") => FinishReason::Length,
        Some("tool_calls") => FinishReason::ToolCalls,
        Some("content_filter") => FinishReason::ContentFilter,
        _ => FinishReason::Stop,
    };

    let usage = response
        .usage
        .map(|u| Usage::new(u.prompt_tokens, u.completion_tokens));

    Ok(CompletionResponse {
        message,
        usage: usage.unwrap_or_default(),
        model: response.model,
        finish_reason,
    })
}

fn parse_error(status: u16, body: &str) -> Error {
    #[derive(Deserialize)]
    struct ErrorResponse {
        error: ErrorDetail,
    }

    #[derive(Deserialize)]
    struct ErrorDetail {
        message: String,
    }

    if let Ok(err) = serde_json::from_str::<ErrorResponse>(body) {
        match status {
            401 => Error::auth(err.error.message),
            429 => Error::rate_limit(err.error.message),
            400 => Error::invalid_request(err.error.message),
            _ => Error::api(status, err.error.message),
        }
    } else {
        Error::api(status, body.to_string())
    }
}

/// What one SSE event contributes to the stream.
#[derive(Debug, Default)]
struct StreamData {
    chunks: Vec<StreamChunk>,
    /// Token counts, sent by most servers on the final chunk only
    usage: Option<Usage>,
}

/// Decode the payload of one SSE event.
///
/// Returns `Ok(None)` for the `[DONE]` sentinel.
fn decode_stream_data(data: &str) -> Result<Option<StreamData>, Error> {
    if data.trim() == "[DONE]" {
        return Ok(None);
    }

    let response: OpenAIStreamResponse = serde_json::from_str(data)
        .map_err(|e| Error::serialization(format!("Malformed stream chunk: {} - data: {}", e, data)))?;

    let usage = response
        .usage
        .map(|u| Usage::new(u.prompt_tokens, u.completion_tokens));
    let mut chunks = Vec::new();
    for choice in response.choices {
        if let Some(content) = choice.delta.content {
            if !content.is_empty() {
                chunks.push(StreamChunk::Delta { content });
            }
        }

        for tc in choice.delta.tool_calls.unwrap_or_default() {
            if let Some(id) = tc.id {
                let name = tc
                    .function
                    .as_ref()
                    .and_then(|f| f.name.clone())
                    .unwrap_or_default();
                chunks.push(StreamChunk::ToolCallStart {
                    index: tc.index,
                    id,
                    name,
                });
            }
            if let Some(arguments) = tc.function.and_then(|f| f.arguments) {
                if !arguments.is_empty() {
                    chunks.push(StreamChunk::ToolCallDelta {
                        index: tc.index,
                        arguments,
                    });
                }
            }
        }
    }
    Ok(Some(StreamData { chunks, usage }))
}

/// Forward one SSE payload to the consumer. Returns `false` once the stream
/// is finished: `[DONE]` seen, malformed data, or the consumer went away.
async fn forward_event(
    data: &str,
    tx: &mpsc::Sender<Result<StreamChunk, Error>>,
    usage: &mut Option<Usage>,
) -> bool {
    match decode_stream_data(data) {
        Ok(Some(decoded)) => {
            if decoded.usage.is_some() {
                *usage = decoded.usage;
            }
            for chunk in decoded.chunks {
                if tx.send(Ok(chunk)).await.is_err() {
                    return false;
                }
            }
            true
        }
        Ok(None) => {
            let _ = tx.send(Ok(StreamChunk::Done { usage: usage.take() })).await;
            false
        }
        Err(e) => {
            let _ = tx.send(Err(e)).await;
            false
        }
    }
}

/// Map a failure to open the event stream onto the provider error taxonomy.
async fn open_error(err: reqwest_eventsource::Error) -> Error {
    match err {
        reqwest_eventsource::Error::InvalidStatusCode(status, response) => {
            let body = response.text().await.unwrap_or_default();
            parse_error(status.as_u16(), &body)
        }
        reqwest_eventsource::Error::Transport(e) => Error::network(e.to_string()),
        other => Error::stream(other.to_string()),
    }
}

#[async_trait]
impl Provider for OpenAIProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, Error> {
        let response = self.send(&request.with_stream(false)).await?;

        let api_response: OpenAIChatResponse = response
            .json()
            .await
            .map_err(|e| Error::serialization(e.to_string()))?;

        parse_response(api_response)
    }

    async fn stream(&self, request: CompletionRequest) -> Result<StreamResult, Error> {
        let builder = self.request_builder(&request.with_stream(true));
        let mut es = EventSource::new(builder).map_err(|e| Error::stream(e.to_string()))?;

        // Connection and HTTP status failures are reported here rather than
        // as the first stream item.
        let first = match es.next().await {
            Some(Ok(Event::Open)) => None,
            Some(Ok(Event::Message(msg))) => Some(msg.data),
            Some(Err(e)) => {
                es.close();
                return Err(open_error(e).await);
            }
            None => return Err(Error::stream("Event stream closed before opening")),
        };
        debug!("OpenAI SSE connection opened");

        let (tx, rx) = mpsc::channel::<Result<StreamChunk, Error>>(100);

        tokio::spawn(async move {
            let mut es = es;
            let mut usage = None;

            if let Some(data) = first {
                if !forward_event(&data, &tx, &mut usage).await {
                    es.close();
                    return;
                }
            }

            while let Some(event) = es.next().await {
                match event {
                    Ok(Event::Open) => {}
                    Ok(Event::Message(msg)) => {
                        trace!(data = %msg.data, "OpenAI SSE event");
                        if !forward_event(&msg.data, &tx, &mut usage).await {
                            break;
                        }
                    }
                    Err(reqwest_eventsource::Error::StreamEnded) => {
                        // Body ended without a [DONE] sentinel
                        let _ = tx.send(Ok(StreamChunk::Done { usage: usage.take() })).await;
                        break;
                    }
                    Err(e) => {
                        error!(error = %e, "OpenAI SSE error");
                        let _ = tx.send(Err(Error::stream(e.to_string()))).await;
                        break;
                    }
                }
            }

            // Stop the event source from reconnecting
            es.close();
        });

        Ok(Box::pin(ReceiverStream::new(rx)) as StreamResult)
    }
}

// OpenAI API types

#[derive(Debug, Serialize)]
struct OpenAIChatRequest {
    /// Model to use. Optional for servers that have a default model.
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<String>,
    messages: Vec<OpenAIMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OpenAITool>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAIMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OpenAIToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAIToolCall {
    id: String,
    r#type: String,
    function: OpenAIFunctionCall,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAIFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize)]
struct OpenAITool {
    r#type: String,
    function: OpenAIFunction,
}

#[derive(Debug, Serialize)]
struct OpenAIFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct OpenAIChatResponse {
    #[serde(default)]
    model: String,
    choices: Vec<OpenAIChoice>,
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamResponse {
    #[serde(default)]
    choices: Vec<OpenAIStreamChoice>,
    #[serde(default)]
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamChoice {
    #[serde(default)]
    delta: OpenAIStreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAIStreamDelta {
    content: Option<String>,
    tool_calls: Option<Vec<OpenAIStreamToolCall>>,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamToolCall {
    #[serde(default)]
    index: usize,
    id: Option<String>,
    function: Option<OpenAIStreamFunction>,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamFunction {
    name: Option<String>,
    arguments: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use fq_core::{PropertySchema, ToolParameters};

    #[test]
    fn test_provider_creation() {
        let provider = OpenAIProvider::new("not-needed");
        assert_eq!(provider.name(), "openai");
        assert_eq!(provider.base_url, DEFAULT_BASE_URL);
    }

    #[test]
    fn test_base_url_trailing_slash() {
        let provider = OpenAIProvider::new("k").with_base_url("http://127.0.0.1:8080/v1/");
        assert_eq!(provider.base_url, "http://127.0.0.1:8080/v1");
    }

    #[test]
    fn test_build_request() {
        let provider = OpenAIProvider::new("test-key");
        let tool = ToolDefinition::new("fetch_wikipedia_content", "Search Wikipedia").with_parameters(
            ToolParameters::new().add_property("search_query", PropertySchema::string("topic"), true),
        );
        let request = CompletionRequest::new(vec![Message::system("sys"), Message::user("Hello")])
            .with_model("starling-lm-7b-beta")
            .with_temperature(Some(0.7))
            .with_tools(vec![tool]);
        let api_request = provider.build_request(&request);

        assert_eq!(api_request.model, Some("starling-lm-7b-beta".to_string()));
        assert_eq!(api_request.messages.len(), 2);
        assert_eq!(api_request.messages[1].role, "user");

        let json = serde_json::to_value(&api_request).unwrap();
        assert_eq!(json["stream"], true);
        assert_eq!(json["tools"][0]["type"], "function");
        assert_eq!(json["tools"][0]["function"]["name"], "fetch_wikipedia_content");
        assert_eq!(
            json["tools"][0]["function"]["parameters"]["required"][0],
            "search_query"
        );
    }

    #[test]
    fn test_build_request_without_tools_omits_field() {
        let provider = OpenAIProvider::new("test-key");
        let request = CompletionRequest::new(vec![Message::user("Hello")]);
        let json = serde_json::to_value(provider.build_request(&request)).unwrap();

        assert!(json.get("tools").is_none());
        assert!(json.get("model").is_none());
        assert!(json.get("temperature").is_none());
    }

    #[test]
    fn test_convert_tool_turns() {
        let call = ToolCall::new("call_1", "fetch_wikipedia_content", r#"{"search_query":"Rust"}"#);
        let assistant = convert_message(&Message::assistant_with_tool_calls("", vec![call]));
        let json = serde_json::to_value(&assistant).unwrap();
        assert_eq!(json["tool_calls"][0]["id"], "call_1");
        assert_eq!(
            json["tool_calls"][0]["function"]["arguments"],
            r#"{"search_query":"Rust"}"#
        );

        let tool = convert_message(&Message::tool_result("call_1", "{}"));
        assert_eq!(tool.role, "tool");
        assert_eq!(tool.tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn test_decode_content_delta() {
        let data = r#"{"model":"m","choices":[{"index":0,"delta":{"content":"Hel"}}]}"#;
        let decoded = decode_stream_data(data).unwrap().unwrap();
        assert_eq!(
            decoded.chunks,
            vec![StreamChunk::Delta {
                content: "Hel".to_string()
            }]
        );
        assert!(decoded.usage.is_none());
    }

    #[test]
    fn test_decode_tool_call_pieces() {
        let start = r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_9","type":"function","function":{"name":"fetch_wikipedia_content","arguments":""}}]}}]}"#;
        let delta = r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"search_query\":"}}]}}]}"#;

        assert_eq!(
            decode_stream_data(start).unwrap().unwrap().chunks,
            vec![StreamChunk::ToolCallStart {
                index: 0,
                id: "call_9".to_string(),
                name: "fetch_wikipedia_content".to_string(),
            }]
        );
        assert_eq!(
            decode_stream_data(delta).unwrap().unwrap().chunks,
            vec![StreamChunk::ToolCallDelta {
                index: 0,
                arguments: "{\"search_query\":".to_string(),
            }]
        );
    }

    #[test]
    fn test_decode_done_and_usage_only() {
        assert!(decode_stream_data("[DONE]").unwrap().is_none());

        let usage_only = r#"{"choices":[],"usage":{"prompt_tokens":3,"completion_tokens":4}}"#;
        let decoded = decode_stream_data(usage_only).unwrap().unwrap();
        assert!(decoded.chunks.is_empty());
        assert_eq!(decoded.usage, Some(Usage::new(3, 4)));
    }

    #[test]
    fn test_decode_malformed_chunk() {
        let err = decode_stream_data("{\"choices\": [").unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn test_parse_error_mapping() {
        let body = r#"{"error":{"message":"bad key","type":"auth"}}"#;
        assert!(matches!(parse_error(401, body), Error::Auth(_)));
        assert!(matches!(parse_error(429, body), Error::RateLimit(_)));
        assert!(matches!(parse_error(400, body), Error::InvalidRequest(_)));
        assert!(matches!(
            parse_error(503, "upstream down"),
            Error::Api { status: 503, .. }
        ));
    }

    #[test]
    fn test_parse_response_with_tool_call() {
        let body = r#"{
            "model": "m",
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{"id": "c1", "type": "function", "function": {"name": "f", "arguments": "{}"}}]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5}
        }"#;
        let response = parse_response(serde_json::from_str(body).unwrap()).unwrap();
        assert_eq!(response.finish_reason, FinishReason::ToolCalls);
        assert_eq!(response.message.tool_calls[0].id, "c1");
        assert_eq!(response.usage.total_tokens, 15);
    }
}
