//! fq-core: Core types and orchestration for fanout-query
//!
//! This crate holds the conversation protocol (stream, dispatch a tool,
//! stream again), the shared output channel, and the scheduler that fans
//! conversations out across models and queries.

pub mod conversation;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod message;
pub mod provider;
pub mod scheduler;
pub mod tool;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use conversation::{ConversationRunner, ConversationTask};
pub use dispatch::{ToolDispatcher, LOOKUP_TOOL_NAME};
pub use error::Error;
pub use event::{output_channel, EventKind, EventReceiver, EventSender, OutputEvent};
pub use message::{Message, Role, StreamChunk, ToolCall, Usage};
pub use provider::{CompletionRequest, CompletionResponse, FinishReason, Provider, StreamResult};
pub use scheduler::{ConversationReport, Scheduler, TaskId};
pub use tool::{KnowledgeLookup, PropertySchema, ToolDefinition, ToolParameters, ToolResult};

pub type Result<T> = std::result::Result<T, Error>;
