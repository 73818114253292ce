//! Output channel shared by every conversation.
//!
//! Producers hold cheap [`EventSender`] clones; a single consumer owns the
//! [`EventReceiver`]. Events from one producer arrive in the order they were
//! sent; events from different producers interleave freely.

use chrono::{DateTime, Local};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Info,
    Stream,
    Tool,
    Wiki,
    Error,
}

impl EventKind {
    pub fn label(&self) -> &'static str {
        match self {
            EventKind::Info => "info",
            EventKind::Stream => "stream",
            EventKind::Tool => "tool",
            EventKind::Wiki => "wiki",
            EventKind::Error => "error",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// A timestamped piece of output. `Stream` events carry a single fragment,
/// never the accumulated text.
#[derive(Debug, Clone)]
pub struct OutputEvent {
    pub timestamp: DateTime<Local>,
    pub kind: EventKind,
    pub content: String,
}

impl OutputEvent {
    pub fn new(kind: EventKind, content: impl Into<String>) -> Self {
        Self {
            timestamp: Local::now(),
            kind,
            content: content.into(),
        }
    }
}

pub type EventReceiver = mpsc::UnboundedReceiver<OutputEvent>;

/// Producer handle for the output channel.
///
/// The channel closes once every clone is dropped, which lets the consumer
/// drain what is left and stop.
#[derive(Clone, Debug)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<OutputEvent>,
}

/// Create the output channel.
pub fn output_channel() -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { tx }, rx)
}

impl EventSender {
    pub fn emit(&self, kind: EventKind, content: impl Into<String>) {
        // Ignore send errors (consumer gone)
        let _ = self.tx.send(OutputEvent::new(kind, content));
    }

    pub fn info(&self, content: impl Into<String>) {
        self.emit(EventKind::Info, content);
    }

    pub fn stream(&self, fragment: impl Into<String>) {
        self.emit(EventKind::Stream, fragment);
    }

    pub fn tool(&self, content: impl Into<String>) {
        self.emit(EventKind::Tool, content);
    }

    pub fn wiki(&self, content: impl Into<String>) {
        self.emit(EventKind::Wiki, content);
    }

    pub fn error(&self, content: impl Into<String>) {
        self.emit(EventKind::Error, content);
    }
}
