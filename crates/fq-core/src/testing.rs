//! Test utilities shared across the workspace.
//! Only compiled when running tests or with the `testing` feature.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::Error;
use crate::event::{EventReceiver, OutputEvent};
use crate::message::{Message, StreamChunk, Usage};
use crate::provider::{CompletionRequest, CompletionResponse, FinishReason, Provider, StreamResult};
use crate::tool::{KnowledgeLookup, ToolResult};

/// A mock provider that replays pre-configured responses and streams.
pub struct MockProvider {
    responses: Mutex<Vec<CompletionResponse>>,
    streams: Mutex<Vec<Vec<Result<StreamChunk, Error>>>>,
    /// Captured requests (for assertion).
    pub captured_requests: Mutex<Vec<CompletionRequest>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(Vec::new()),
            streams: Mutex::new(Vec::new()),
            captured_requests: Mutex::new(Vec::new()),
        }
    }

    /// Queue a response to be returned by the next complete() call.
    /// Responses are returned in FIFO order (first queued = first returned).
    pub fn queue_response(&self, content: &str) {
        let response = CompletionResponse {
            message: Message::assistant(content),
            usage: Usage::new(0, 0),
            model: "mock-model".to_string(),
            finish_reason: FinishReason::Stop,
        };
        self.responses.lock().unwrap().insert(0, response);
    }

    /// Queue a stream for the next stream() call, terminated as scripted.
    pub fn queue_stream(&self, chunks: Vec<StreamChunk>) {
        self.queue_stream_results(chunks.into_iter().map(Ok).collect());
    }

    /// Queue a stream that may yield errors part way through.
    pub fn queue_stream_results(&self, items: Vec<Result<StreamChunk, Error>>) {
        self.streams.lock().unwrap().insert(0, items);
    }

    /// Queue the same reply for both complete() and stream(), the stream
    /// split into fragments of at most `fragment_chars` characters.
    pub fn queue_text(&self, text: &str, fragment_chars: usize) {
        self.queue_response(text);
        let chars: Vec<char> = text.chars().collect();
        let mut chunks: Vec<StreamChunk> = chars
            .chunks(fragment_chars.max(1))
            .map(|c| StreamChunk::Delta {
                content: c.iter().collect(),
            })
            .collect();
        chunks.push(StreamChunk::Done { usage: None });
        self.queue_stream(chunks);
    }

    /// Get the number of captured requests.
    pub fn request_count(&self) -> usize {
        self.captured_requests.lock().unwrap().len()
    }

    /// Get the last captured request.
    pub fn last_request(&self) -> Option<CompletionRequest> {
        self.captured_requests.lock().unwrap().last().cloned()
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, Error> {
        self.captured_requests.lock().unwrap().push(request);
        match self.responses.lock().unwrap().pop() {
            Some(response) => Ok(response),
            None => Err(Error::Unknown("No mock response queued".to_string())),
        }
    }

    async fn stream(&self, request: CompletionRequest) -> Result<StreamResult, Error> {
        self.captured_requests.lock().unwrap().push(request);
        let items = self
            .streams
            .lock()
            .unwrap()
            .pop()
            .ok_or_else(|| Error::Unknown("No mock stream queued".to_string()))?;
        Ok(Box::pin(futures::stream::iter(items)) as StreamResult)
    }
}

/// A mock knowledge service with canned results per query.
pub struct MockLookup {
    results: HashMap<String, ToolResult>,
    queries: Mutex<Vec<String>>,
}

impl MockLookup {
    pub fn new() -> Self {
        Self {
            results: HashMap::new(),
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn with_article(mut self, query: &str, title: &str, content: &str) -> Self {
        self.results
            .insert(query.to_string(), ToolResult::success(content, title));
        self
    }

    pub fn with_failure(mut self, query: &str, message: &str) -> Self {
        self.results
            .insert(query.to_string(), ToolResult::error(message));
        self
    }

    /// Queries received so far, in call order.
    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

impl Default for MockLookup {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KnowledgeLookup for MockLookup {
    async fn lookup(&self, query: &str) -> ToolResult {
        self.queries.lock().unwrap().push(query.to_string());
        self.results
            .get(query)
            .cloned()
            .unwrap_or_else(|| ToolResult::not_found(query))
    }
}

/// Take every event currently buffered in the channel.
pub fn drain_events(rx: &mut EventReceiver) -> Vec<OutputEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
