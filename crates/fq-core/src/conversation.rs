//! A single (model, query) conversation.
//!
//! Phase one streams a completion with the tool catalog attached. If the
//! model asks for a tool, the call is dispatched, its result appended as a
//! tool turn, and phase two streams a follow-up completion without tools.

use std::sync::Arc;

use futures::StreamExt;
use tracing::{debug, warn};

use crate::dispatch::ToolDispatcher;
use crate::error::Error;
use crate::event::EventSender;
use crate::message::{Message, StreamChunk, ToolCall};
use crate::provider::{CompletionRequest, Provider};

/// Last event every conversation emits, whether or not it succeeded.
pub(crate) const QUERY_COMPLETE: &str = "Query processing complete";

/// One model/query pair and the history it accumulates.
#[derive(Debug, Clone)]
pub struct ConversationTask {
    pub model: String,
    pub query: String,
    pub history: Vec<Message>,
}

impl ConversationTask {
    pub fn new(model: impl Into<String>, query: impl Into<String>, system_prompt: &str) -> Self {
        let query = query.into();
        Self {
            model: model.into(),
            history: vec![Message::system(system_prompt), Message::user(query.as_str())],
            query,
        }
    }
}

/// Text and the first tool call collected from one streamed completion.
#[derive(Debug, Default)]
struct PhaseOutput {
    text: String,
    tool_call: Option<ToolCall>,
}

#[derive(Debug)]
struct PendingToolCall {
    index: usize,
    call: ToolCall,
}

/// Shared collaborators for running conversations. Cheap to clone.
#[derive(Clone)]
pub struct ConversationRunner {
    provider: Arc<dyn Provider>,
    dispatcher: Arc<ToolDispatcher>,
    events: EventSender,
    temperature: Option<f32>,
}

impl ConversationRunner {
    pub fn new(provider: Arc<dyn Provider>, dispatcher: Arc<ToolDispatcher>, events: EventSender) -> Self {
        Self {
            provider,
            dispatcher,
            events,
            temperature: None,
        }
    }

    /// Sampling temperature for the tool-enabled first phase.
    pub fn with_temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn events(&self) -> &EventSender {
        &self.events
    }

    /// Run the conversation to completion and return its history.
    ///
    /// Never fails: any error ends the conversation early with a single
    /// `error` event, and the history gathered so far is returned.
    pub async fn run(&self, mut task: ConversationTask) -> Vec<Message> {
        self.events.info(format!(
            "Processing query with model {}: {}",
            task.model, task.query
        ));

        if let Err(e) = self.drive(&mut task).await {
            warn!(
                model = %task.model,
                transport = e.is_transport(),
                error = %e,
                "Conversation failed"
            );
            self.events.error(format!("Error: {}", e));
        }

        self.events.info(QUERY_COMPLETE);
        task.history
    }

    async fn drive(&self, task: &mut ConversationTask) -> Result<(), Error> {
        let request = CompletionRequest::new(task.history.clone())
            .with_model(task.model.as_str())
            .with_temperature(self.temperature)
            .with_tools(self.dispatcher.catalog());
        let first = self.stream_phase(request).await?;

        let Some(call) = first.tool_call else {
            if !first.text.is_empty() {
                task.history.push(Message::assistant(first.text));
            }
            return Ok(());
        };

        task.history
            .push(Message::assistant_with_tool_calls(first.text, vec![call.clone()]));

        let result = self.dispatcher.dispatch(&call).await?;
        task.history
            .push(Message::tool_result(call.id.as_str(), result.to_json()?));

        // No tools on the follow-up: the model must answer from the result.
        let request = CompletionRequest::new(task.history.clone()).with_model(task.model.as_str());
        let second = self.stream_phase(request).await?;
        if second.tool_call.is_some() {
            debug!(model = %task.model, "Ignoring tool call in follow-up completion");
        }
        if !second.text.is_empty() {
            task.history.push(Message::assistant(second.text));
        }
        Ok(())
    }

    /// Stream one completion, emitting each text fragment as it arrives.
    ///
    /// Only the first tool call is kept; its argument fragments are joined
    /// until the stream ends.
    async fn stream_phase(&self, request: CompletionRequest) -> Result<PhaseOutput, Error> {
        let mut stream = self.provider.stream(request).await?;
        let mut output = PhaseOutput::default();
        let mut pending: Option<PendingToolCall> = None;

        while let Some(chunk) = stream.next().await {
            match chunk? {
                StreamChunk::Delta { content } => {
                    output.text.push_str(&content);
                    self.events.stream(content);
                }
                StreamChunk::ToolCallStart { index, id, name } => {
                    if pending.is_none() {
                        pending = Some(PendingToolCall {
                            index,
                            call: ToolCall::new(id, name, String::new()),
                        });
                    } else if pending.as_ref().is_some_and(|p| p.index != index) {
                        debug!(tool = %name, "Ignoring additional tool call in stream");
                    }
                }
                StreamChunk::ToolCallDelta { index, arguments } => {
                    if let Some(p) = pending.as_mut().filter(|p| p.index == index) {
                        p.call.arguments.push_str(&arguments);
                    }
                }
                StreamChunk::Done { usage } => {
                    if let Some(usage) = usage {
                        debug!(
                            prompt_tokens = usage.prompt_tokens,
                            completion_tokens = usage.completion_tokens,
                            "Completion usage"
                        );
                    }
                    break;
                }
                StreamChunk::Error { message } => return Err(Error::stream(message)),
            }
        }

        output.tool_call = pending.map(|p| p.call);
        Ok(output)
    }
}
