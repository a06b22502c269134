//! Index Client (C3)
//!
//! Upserts a batch of documents into a Solr collection with commit-on-write
//! semantics (spec.md §4.3). Empty input is a no-op with a warning, not an
//! error. Partial failures are not split and retried -- the whole call
//! fails.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Map, Value as JsonValue};
use std::time::Duration;

const UPSERT_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait IndexClient: Send + Sync {
    /// Upsert `documents` into `collection_url`. A no-op (returns `Ok`
    /// immediately) when `documents` is empty.
    async fn upsert(
        &self,
        collection_url: &str,
        documents: Vec<Map<String, JsonValue>>,
    ) -> anyhow::Result<()>;
}

pub struct SolrIndexClient {
    client: Client,
    user: Option<String>,
    password: Option<String>,
}

impl SolrIndexClient {
    pub fn new(user: Option<String>, password: Option<String>) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(UPSERT_TIMEOUT).build()?;
        Ok(Self {
            client,
            user,
            password,
        })
    }
}

#[async_trait]
impl IndexClient for SolrIndexClient {
    async fn upsert(
        &self,
        collection_url: &str,
        documents: Vec<Map<String, JsonValue>>,
    ) -> anyhow::Result<()> {
        if documents.is_empty() {
            tracing::warn!("upsert called with no documents, skipping");
            return Ok(());
        }

        let url = format!("{}/update?commit=true", collection_url.trim_end_matches('/'));
        let body = JsonValue::Array(documents.into_iter().map(JsonValue::Object).collect());

        let mut request = self.client.post(&url).json(&body);
        if let (Some(user), Some(password)) = (&self.user, &self.password) {
            request = request.basic_auth(user, Some(password));
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("solr upsert failed ({status}): {text}");
        }
        Ok(())
    }
}
