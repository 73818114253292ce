//! Knowledge lookup backed by the Wikipedia action API.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use fq_core::{Error, KnowledgeLookup, ToolResult};

pub const DEFAULT_ENDPOINT: &str = "https://en.wikipedia.org/w/api.php";
pub const DEFAULT_USER_AGENT: &str = concat!("fq/", env!("CARGO_PKG_VERSION"));

/// Page id the API uses for titles that do not exist.
const MISSING_PAGE_ID: &str = "-1";

/// Search-then-fetch lookup: find the best matching title, then pull the
/// plain-text intro of that article.
pub struct WikipediaLookup {
    client: Client,
    endpoint: String,
}

impl Default for WikipediaLookup {
    fn default() -> Self {
        Self::new()
    }
}

impl WikipediaLookup {
    pub fn new() -> Self {
        Self::with_options(DEFAULT_USER_AGENT, None)
    }

    /// Build a lookup with a custom User-Agent. `timeout` bounds connecting
    /// and each wait for response data.
    pub fn with_options(user_agent: &str, timeout: Option<Duration>) -> Self {
        let mut builder = Client::builder().user_agent(user_agent);
        if let Some(timeout) = timeout {
            builder = builder.connect_timeout(timeout).read_timeout(timeout);
        }
        Self {
            client: builder.build().unwrap_or_default(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    async fn get_json<T: DeserializeOwned>(&self, params: &[(&str, &str)]) -> Result<T, Error> {
        let response = self
            .client
            .get(&self.endpoint)
            .query(params)
            .send()
            .await
            .map_err(|e| Error::network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::api(status.as_u16(), body));
        }

        response
            .json()
            .await
            .map_err(|e| Error::serialization(e.to_string()))
    }

    /// Title of the best match for `query`, if any.
    async fn search(&self, query: &str) -> Result<Option<String>, Error> {
        let data: SearchResponse = self
            .get_json(&[
                ("action", "query"),
                ("format", "json"),
                ("list", "search"),
                ("srsearch", query),
                ("srlimit", "1"),
            ])
            .await?;

        Ok(data.query.search.into_iter().next().map(|hit| hit.title))
    }

    /// Plain-text intro of the page titled `title`, or `None` if the page is missing.
    async fn fetch_extract(&self, title: &str) -> Result<Option<String>, Error> {
        let data: ExtractResponse = self
            .get_json(&[
                ("action", "query"),
                ("format", "json"),
                ("titles", title),
                ("prop", "extracts"),
                ("exintro", "true"),
                ("explaintext", "true"),
            ])
            .await?;

        let Some((page_id, page)) = data.query.pages.into_iter().next() else {
            return Ok(None);
        };
        if page_id == MISSING_PAGE_ID {
            return Ok(None);
        }

        page.extract
            .map(|text| Some(text.trim().to_string()))
            .ok_or_else(|| Error::serialization(format!("Page '{}' has no extract", title)))
    }

    async fn try_lookup(&self, query: &str) -> Result<ToolResult, Error> {
        let Some(title) = self.search(query).await? else {
            debug!(%query, "Search returned no matches");
            return Ok(ToolResult::not_found(query));
        };

        match self.fetch_extract(&title).await? {
            Some(content) => Ok(ToolResult::success(content, title)),
            None => {
                debug!(%query, %title, "Matched page is missing");
                Ok(ToolResult::not_found(query))
            }
        }
    }
}

#[async_trait]
impl KnowledgeLookup for WikipediaLookup {
    async fn lookup(&self, query: &str) -> ToolResult {
        match self.try_lookup(query).await {
            Ok(result) => result,
            Err(e) => ToolResult::error(e.to_string()),
        }
    }
}

#[derive(Deserialize)]
struct SearchResponse {
    query: SearchQuery,
}

#[derive(Deserialize)]
struct SearchQuery {
    #[serde(default)]
    search: Vec<SearchHit>,
}

#[derive(Deserialize)]
struct SearchHit {
    title: String,
}

#[derive(Deserialize)]
struct ExtractResponse {
    query: ExtractQuery,
}

#[derive(Deserialize)]
struct ExtractQuery {
    #[serde(default)]
    pages: BTreeMap<String, Page>,
}

#[derive(Deserialize)]
struct Page {
    #[serde(default)]
    extract: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_response_shapes() {
        let hit: SearchResponse =
            serde_json::from_str(r#"{"batchcomplete":"","query":{"searchinfo":{"totalhits":1},"search":[{"ns":0,"title":"Entropy","pageid":9891}]}}"#)
                .unwrap();
        assert_eq!(hit.query.search[0].title, "Entropy");

        let empty: SearchResponse =
            serde_json::from_str(r#"{"query":{"searchinfo":{"totalhits":0},"search":[]}}"#).unwrap();
        assert!(empty.query.search.is_empty());
    }

    #[test]
    fn test_extract_response_missing_page() {
        let missing: ExtractResponse = serde_json::from_str(
            r#"{"query":{"pages":{"-1":{"ns":0,"title":"Nope","missing":""}}}}"#,
        )
        .unwrap();
        let (id, page) = missing.query.pages.into_iter().next().unwrap();
        assert_eq!(id, MISSING_PAGE_ID);
        assert!(page.extract.is_none());
    }

    #[test]
    fn test_default_user_agent_tracks_version() {
        assert_eq!(
            DEFAULT_USER_AGENT,
            format!("fq/{}", env!("CARGO_PKG_VERSION"))
        );
    }

    #[test]
    fn test_default_endpoint() {
        let lookup = WikipediaLookup::new();
        assert_eq!(lookup.endpoint, DEFAULT_ENDPOINT);
        let lookup = lookup.with_endpoint("http://127.0.0.1:1/w/api.php");
        assert_eq!(lookup.endpoint, "http://127.0.0.1:1/w/api.php");
    }
}
