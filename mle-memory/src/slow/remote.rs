//! Client for the hosted Mem0 REST API.

use crate::error::Result;
use crate::slow::SlowMemoryBackend;
use crate::types::{AddOutcome, EventKind, MemoryEvent, Message, Metadata, SlowMemoryItem};
use async_trait::async_trait;
use mle_common::config::DEFAULT_MEM0_BASE_URL;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Hosted Mem0 backend authenticated with `Authorization: Token <key>`.
pub struct Mem0Client {
    client: Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Serialize)]
struct AddRequest<'a> {
    messages: &'a [Message],
    agent_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<&'a Metadata>,
    infer: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    prompt: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct SearchRequest<'a> {
    query: &'a str,
    agent_id: &'a str,
    limit: usize,
}

/// Endpoints answer either with a bare array or `{"results": [...]}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Listing<T> {
    Bare(Vec<T>),
    Wrapped { results: Vec<T> },
}

impl<T> Listing<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            Self::Bare(items) | Self::Wrapped { results: items } => items,
        }
    }
}

/// Add result entry: `{id, memory, event}` or `{id, data: {memory}, event}`.
#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    memory: Option<String>,
    #[serde(default)]
    data: Option<RawEventData>,
    #[serde(default)]
    event: Option<EventKind>,
}

#[derive(Debug, Deserialize)]
struct RawEventData {
    #[serde(default)]
    memory: Option<String>,
}

impl RawEvent {
    fn into_event(self) -> Option<MemoryEvent> {
        let id = self.id?;
        let memory = self
            .memory
            .or_else(|| self.data.and_then(|d| d.memory))
            .unwrap_or_default();
        Some(MemoryEvent {
            id,
            memory,
            event: self.event.unwrap_or(EventKind::Add),
        })
    }
}

impl Mem0Client {
    pub fn new(api_key: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: DEFAULT_MEM0_BASE_URL.to_string(),
            api_key: api_key.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authorized(&self, req: RequestBuilder) -> RequestBuilder {
        req.header("Authorization", format!("Token {}", self.api_key))
    }
}

#[async_trait]
impl SlowMemoryBackend for Mem0Client {
    fn name(&self) -> &str {
        "mem0"
    }

    async fn add(
        &self,
        agent_id: &str,
        messages: &[Message],
        metadata: Option<&Metadata>,
        prompt: Option<&str>,
        infer: bool,
    ) -> Result<AddOutcome> {
        let url = format!("{}/v1/memories/", self.base_url);
        let body = AddRequest {
            messages,
            agent_id,
            metadata,
            infer,
            prompt,
        };

        let listing: Listing<RawEvent> = self
            .authorized(self.client.post(&url).json(&body))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let results: Vec<MemoryEvent> = listing
            .into_vec()
            .into_iter()
            .filter_map(RawEvent::into_event)
            .collect();
        tracing::debug!(agent_id, events = results.len(), "Mem0 add completed");
        Ok(AddOutcome { results })
    }

    async fn search(
        &self,
        agent_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<SlowMemoryItem>> {
        let url = format!("{}/v1/memories/search/", self.base_url);
        let listing: Listing<SlowMemoryItem> = self
            .authorized(self.client.post(&url).json(&SearchRequest {
                query,
                agent_id,
                limit,
            }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(listing.into_vec())
    }

    async fn get_all(
        &self,
        agent_id: &str,
        filters: Option<&Metadata>,
        limit: usize,
    ) -> Result<Vec<SlowMemoryItem>> {
        let url = format!("{}/v2/memories/", self.base_url);
        let mut conditions = vec![json!({ "agent_id": agent_id })];
        if let Some(filters) = filters.filter(|f| !f.is_empty()) {
            conditions.push(json!({ "metadata": filters }));
        }
        let body = json!({
            "filters": { "AND": conditions },
            "page_size": limit,
        });

        let listing: Listing<SlowMemoryItem> = self
            .authorized(self.client.post(&url).json(&body))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let mut items = listing.into_vec();
        items.truncate(limit);
        Ok(items)
    }

    async fn reset(&self, agent_id: &str) -> Result<()> {
        let url = format!("{}/v1/memories/", self.base_url);
        self.authorized(self.client.delete(&url).query(&[("agent_id", agent_id)]))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MemoryError;
    use wiremock::matchers::{body_json, body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client_for(server: &MockServer) -> Mem0Client {
        Mem0Client::new("m0-test").with_base_url(&server.uri())
    }

    #[tokio::test]
    async fn add_posts_messages_and_parses_both_event_shapes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/memories/"))
            .and(header("authorization", "Token m0-test"))
            .and(body_json(json!({
                "messages": [{ "role": "user", "content": "I use polars" }],
                "agent_id": "default",
                "metadata": { "source": "chat" },
                "infer": true,
                "prompt": "extract tools"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "id": "a", "data": { "memory": "Uses polars" }, "event": "ADD" },
                { "id": "b", "memory": "Dislikes pandas", "event": "UPDATE" }
            ])))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let metadata: Metadata = serde_json::from_value(json!({ "source": "chat" })).unwrap();
        let outcome = client
            .add(
                "default",
                &[Message::user("I use polars")],
                Some(&metadata),
                Some("extract tools"),
                true,
            )
            .await
            .unwrap();

        assert_eq!(outcome.results.len(), 2);
        assert_eq!(outcome.results[0].memory, "Uses polars");
        assert_eq!(outcome.results[1].event, EventKind::Update);
    }

    #[tokio::test]
    async fn add_without_metadata_omits_optional_fields() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/memories/"))
            .and(body_json(json!({
                "messages": [{ "role": "user", "content": "hi" }],
                "agent_id": "default",
                "infer": false
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [{ "id": "x", "memory": "hi", "event": "ADD" }]
            })))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let outcome = client
            .add("default", &[Message::user("hi")], None, None, false)
            .await
            .unwrap();
        assert_eq!(outcome.written_ids(), vec!["x"]);
    }

    #[tokio::test]
    async fn search_accepts_wrapped_results() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/memories/search/"))
            .and(body_partial_json(json!({ "query": "tools", "agent_id": "a1", "limit": 3 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [{
                    "id": "m1",
                    "memory": "Uses polars",
                    "agent_id": "a1",
                    "metadata": null,
                    "score": 0.91,
                    "created_at": "2024-01-01T00:00:00Z",
                    "updated_at": null
                }]
            })))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let hits = client.search("a1", "tools", 3).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].score, Some(0.91));
        assert!(hits[0].metadata.is_empty());
    }

    #[tokio::test]
    async fn get_all_sends_agent_and_metadata_filters() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/memories/"))
            .and(body_json(json!({
                "filters": { "AND": [
                    { "agent_id": "default" },
                    { "metadata": { "topic": "data" } }
                ]},
                "page_size": 2
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "id": "1", "memory": "one", "metadata": { "topic": "data" } },
                { "id": "2", "memory": "two", "metadata": { "topic": "data" } },
                { "id": "3", "memory": "three", "metadata": { "topic": "data" } }
            ])))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let filters: Metadata = serde_json::from_value(json!({ "topic": "data" })).unwrap();
        let items = client.get_all("default", Some(&filters), 2).await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].memory, "two");
    }

    #[tokio::test]
    async fn reset_deletes_by_agent() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/v1/memories/"))
            .and(query_param("agent_id", "default"))
            .respond_with(
                ResponseTemplate::new(204),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        client.reset("default").await.unwrap();
    }

    #[tokio::test]
    async fn http_errors_propagate() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let err = client.search("default", "x", 5).await.unwrap_err();
        assert!(matches!(err, MemoryError::Http(_)));
    }
}
