//! Tool dispatch: turns a model's tool call into a knowledge lookup.

use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::Error;
use crate::event::EventSender;
use crate::message::ToolCall;
use crate::tool::{KnowledgeLookup, PropertySchema, ToolDefinition, ToolParameters, ToolResult};

pub const LOOKUP_TOOL_NAME: &str = "fetch_wikipedia_content";

#[derive(Debug, Deserialize)]
struct LookupArgs {
    search_query: String,
}

impl LookupArgs {
    fn parse(raw: &str) -> Result<Self, Error> {
        let args: LookupArgs = serde_json::from_str(raw)
            .map_err(|e| Error::tool(LOOKUP_TOOL_NAME, format!("Invalid arguments: {}", e)))?;
        if args.search_query.trim().is_empty() {
            return Err(Error::tool(
                LOOKUP_TOOL_NAME,
                "Invalid arguments: search_query must not be empty",
            ));
        }
        Ok(args)
    }
}

pub struct ToolDispatcher {
    lookup: Arc<dyn KnowledgeLookup>,
    events: EventSender,
}

impl ToolDispatcher {
    pub fn new(lookup: Arc<dyn KnowledgeLookup>, events: EventSender) -> Self {
        Self { lookup, events }
    }

    /// The tool catalog offered to the model during the first phase.
    pub fn catalog(&self) -> Vec<ToolDefinition> {
        vec![ToolDefinition::new(
            LOOKUP_TOOL_NAME,
            "Search Wikipedia and fetch content about a topic",
        )
        .with_parameters(ToolParameters::new().add_property(
            "search_query",
            PropertySchema::string("The topic to search for on Wikipedia"),
            true,
        ))]
    }

    /// Execute a tool call.
    ///
    /// Malformed arguments are returned as `Err`; a lookup that finds nothing
    /// is an ordinary `Ok(ToolResult::Error { .. })`.
    pub async fn dispatch(&self, call: &ToolCall) -> Result<ToolResult, Error> {
        if call.name != LOOKUP_TOOL_NAME {
            warn!(tool = %call.name, "Model requested an unknown tool");
            return Ok(ToolResult::error(format!("Unknown tool '{}'", call.name)));
        }

        let args = LookupArgs::parse(&call.arguments)?;
        self.events
            .tool(format!("Fetching Wikipedia content for: {}", args.search_query));

        let result = self.lookup.lookup(&args.search_query).await;
        match &result {
            ToolResult::Success { content, title } => {
                self.events.tool(format!("Found article: {}", title));
                self.events.wiki(content.as_str());
            }
            ToolResult::Error { message } => {
                debug!(query = %args.search_query, %message, "Lookup returned no article");
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{output_channel, EventKind};
    use crate::testing::{drain_events, MockLookup};

    fn dispatcher(lookup: MockLookup) -> (ToolDispatcher, crate::event::EventReceiver, Arc<MockLookup>) {
        let lookup = Arc::new(lookup);
        let (events, rx) = output_channel();
        (ToolDispatcher::new(lookup.clone(), events), rx, lookup)
    }

    #[tokio::test]
    async fn test_dispatch_success_emits_tool_and_wiki() {
        let lookup = MockLookup::new().with_article(
            "Python (programming language)",
            "Python (programming language)",
            "Python is a high-level programming language.",
        );
        let (dispatcher, mut rx, _) = dispatcher(lookup);
        let call = ToolCall::new(
            "call_1",
            LOOKUP_TOOL_NAME,
            r#"{"search_query": "Python (programming language)"}"#,
        );

        let result = dispatcher.dispatch(&call).await.unwrap();
        assert!(result.is_success());

        let events = drain_events(&mut rx);
        let kinds: Vec<_> = events.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::Tool, EventKind::Tool, EventKind::Wiki]);
        assert_eq!(
            events[0].content,
            "Fetching Wikipedia content for: Python (programming language)"
        );
        assert_eq!(events[1].content, "Found article: Python (programming language)");
        assert_eq!(events[2].content, "Python is a high-level programming language.");
    }

    #[tokio::test]
    async fn test_dispatch_not_found_emits_no_wiki() {
        let (dispatcher, mut rx, lookup) = dispatcher(MockLookup::new());
        let call = ToolCall::new(
            "call_1",
            LOOKUP_TOOL_NAME,
            r#"{"search_query": "zzznonexistentarticlexyz"}"#,
        );

        let result = dispatcher.dispatch(&call).await.unwrap();
        assert_eq!(result, ToolResult::not_found("zzznonexistentarticlexyz"));

        let events = drain_events(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Tool);
        assert_eq!(lookup.queries(), vec!["zzznonexistentarticlexyz".to_string()]);
    }

    #[tokio::test]
    async fn test_dispatch_passes_lookup_failure_through() {
        let lookup = MockLookup::new().with_failure("Rust", "Network error: dns error");
        let (dispatcher, mut rx, _) = dispatcher(lookup);
        let call = ToolCall::new("call_1", LOOKUP_TOOL_NAME, r#"{"search_query": "Rust"}"#);

        let result = dispatcher.dispatch(&call).await.unwrap();
        assert_eq!(result, ToolResult::error("Network error: dns error"));

        // Only the announcement; failures are not reported as error events here.
        let events = drain_events(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Tool);
    }

    #[tokio::test]
    async fn test_dispatch_rejects_non_json_arguments() {
        let (dispatcher, mut rx, lookup) = dispatcher(MockLookup::new());
        let call = ToolCall::new("call_1", LOOKUP_TOOL_NAME, "search_query=rust");

        let err = dispatcher.dispatch(&call).await.unwrap_err();
        assert!(matches!(err, Error::Tool { .. }));
        assert!(drain_events(&mut rx).is_empty());
        assert!(lookup.queries().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_rejects_missing_or_empty_query() {
        let (dispatcher, _rx, lookup) = dispatcher(MockLookup::new());

        let missing = ToolCall::new("call_1", LOOKUP_TOOL_NAME, r#"{"query": "rust"}"#);
        assert!(dispatcher.dispatch(&missing).await.is_err());

        let empty = ToolCall::new("call_2", LOOKUP_TOOL_NAME, r#"{"search_query": "  "}"#);
        let err = dispatcher.dispatch(&empty).await.unwrap_err();
        assert!(err.to_string().contains("must not be empty"));

        assert!(lookup.queries().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_unknown_tool() {
        let (dispatcher, mut rx, _) = dispatcher(MockLookup::new());
        let call = ToolCall::new("call_1", "get_current_weather", r#"{"location": "Paris"}"#);

        let result = dispatcher.dispatch(&call).await.unwrap();
        assert_eq!(result, ToolResult::error("Unknown tool 'get_current_weather'"));
        assert!(drain_events(&mut rx).is_empty());
    }

    #[test]
    fn test_catalog() {
        let (dispatcher, _rx, _) = dispatcher(MockLookup::new());
        let catalog = dispatcher.catalog();
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog[0].name, LOOKUP_TOOL_NAME);
        assert_eq!(catalog[0].parameters.required, vec!["search_query".to_string()]);
    }
}
