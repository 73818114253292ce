//! Fan-out of conversations across every (model, query) pair.
//!
//! Each conversation runs as its own tokio task, so a stalled remote call
//! only holds up the conversation that made it.

use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::join_all;
use tracing::{error, info, info_span, Instrument};

use crate::conversation::{ConversationRunner, ConversationTask, QUERY_COMPLETE};
use crate::message::Message;

/// Unique identifier for a scheduled conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub u64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a finished conversation left behind.
#[derive(Debug, Clone)]
pub struct ConversationReport {
    pub id: TaskId,
    pub model: String,
    pub query: String,
    /// Final history, or `None` if the task panicked.
    pub history: Option<Vec<Message>>,
}

pub struct Scheduler {
    runner: ConversationRunner,
    system_prompt: String,
    next_id: AtomicU64,
}

impl Scheduler {
    pub fn new(runner: ConversationRunner, system_prompt: impl Into<String>) -> Self {
        Self {
            runner,
            system_prompt: system_prompt.into(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Build one task per (model, query) pair, models outermost.
    pub fn plan(&self, models: &[String], queries: &[String]) -> Vec<ConversationTask> {
        models
            .iter()
            .flat_map(|model| {
                queries
                    .iter()
                    .map(move |query| ConversationTask::new(model.as_str(), query.as_str(), &self.system_prompt))
            })
            .collect()
    }

    /// Run every pair concurrently and wait for all of them.
    ///
    /// Consumes the scheduler so that its handle on the output channel is
    /// released once the batch is over.
    pub async fn run(self, models: &[String], queries: &[String]) -> Vec<ConversationReport> {
        let tasks = self.plan(models, queries);
        info!(count = tasks.len(), "Scheduling conversations");

        let handles: Vec<_> = tasks
            .into_iter()
            .map(|task| {
                let id = TaskId(self.next_id.fetch_add(1, Ordering::SeqCst));
                let span = info_span!("conversation", task = %id, model = %task.model);
                let report = (id, task.model.clone(), task.query.clone());
                let runner = self.runner.clone();
                let handle = tokio::spawn(async move { runner.run(task).await }.instrument(span));
                (report, handle)
            })
            .collect();

        let (meta, handles): (Vec<_>, Vec<_>) = handles.into_iter().unzip();
        let results = join_all(handles).await;

        meta.into_iter()
            .zip(results)
            .map(|((id, model, query), result)| {
                let history = match result {
                    Ok(history) => Some(history),
                    Err(e) => {
                        error!(task = %id, %model, error = %e, "Conversation task panicked");
                        let events = self.runner.events();
                        events.error(format!("Error: conversation {} with model {} panicked", id, model));
                        events.info(QUERY_COMPLETE);
                        None
                    }
                };
                ConversationReport {
                    id,
                    model,
                    query,
                    history,
                }
            })
            .collect()
    }
}
