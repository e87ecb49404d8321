//! Chroma HTTP backend.
//!
//! Talks to the v1 REST API: heartbeat for connectivity, get-or-create for
//! per-project collections, `add` for documents. When an embeddings endpoint
//! is configured (OpenAI-compatible `/v1/embeddings`) vectors are computed
//! locally and sent along; otherwise the server's embedding function is used.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use super::{VectorBackend, VectorDocument, VectorSyncError};

#[derive(Debug, Serialize)]
struct CreateCollectionRequest<'a> {
    name: &'a str,
    get_or_create: bool,
}

#[derive(Debug, Deserialize)]
struct CollectionResponse {
    id: String,
}

#[derive(Debug, Serialize)]
struct AddRequest<'a> {
    ids: Vec<&'a str>,
    documents: Vec<&'a str>,
    metadatas: Vec<&'a serde_json::Map<String, serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    embeddings: Option<Vec<Vec<f32>>>,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: Vec<&'a str>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

/// Client for an OpenAI-compatible embeddings endpoint.
pub struct EmbeddingClient {
    base_url: String,
    model: String,
    http_client: reqwest::Client,
}

impl EmbeddingClient {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            http_client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
        }
    }

    pub async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, VectorSyncError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        debug!("Generating embeddings for {} document(s)", texts.len());
        let request = EmbeddingRequest {
            model: &self.model,
            input: texts.to_vec(),
        };
        let response = self
            .http_client
            .post(format!("{}/v1/embeddings", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| VectorSyncError::Embedding(format!("request failed: {}", e)))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(VectorSyncError::Embedding(format!(
                "endpoint returned {}: {}",
                status, body
            )));
        }
        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| VectorSyncError::Embedding(format!("invalid response: {}", e)))?;
        if parsed.data.len() != texts.len() {
            return Err(VectorSyncError::Embedding(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                parsed.data.len()
            )));
        }
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}

pub struct ChromaBackend {
    base_url: String,
    http_client: reqwest::Client,
    /// collection name -> collection id
    collections: DashMap<String, String>,
    embedder: Option<EmbeddingClient>,
}

impl ChromaBackend {
    pub fn new(base_url: impl Into<String>, timeout: Duration, embedder: Option<EmbeddingClient>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        info!("Chroma backend configured at {}", base_url);
        Self {
            base_url,
            http_client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            collections: DashMap::new(),
            embedder,
        }
    }

    async fn collection_id(&self, name: &str) -> Result<String, VectorSyncError> {
        if let Some(id) = self.collections.get(name) {
            return Ok(id.value().clone());
        }
        let response = self
            .http_client
            .post(format!("{}/api/v1/collections", self.base_url))
            .json(&CreateCollectionRequest {
                name,
                get_or_create: true,
            })
            .send()
            .await
            .map_err(|e| VectorSyncError::Connection(e.to_string()))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(VectorSyncError::Request(format!(
                "collection {} returned {}: {}",
                name, status, body
            )));
        }
        let collection: CollectionResponse = response
            .json()
            .await
            .map_err(|e| VectorSyncError::Request(format!("invalid collection response: {}", e)))?;
        debug!("Resolved collection {} -> {}", name, collection.id);
        self.collections.insert(name.to_string(), collection.id.clone());
        Ok(collection.id)
    }
}

#[async_trait]
impl VectorBackend for ChromaBackend {
    fn name(&self) -> &str {
        "chroma"
    }

    async fn connect(&self) -> Result<(), VectorSyncError> {
        let response = self
            .http_client
            .get(format!("{}/api/v1/heartbeat", self.base_url))
            .send()
            .await
            .map_err(|e| VectorSyncError::Connection(e.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(VectorSyncError::Connection(format!(
                "heartbeat returned {}",
                response.status()
            )))
        }
    }

    async fn add_documents(
        &self,
        collection: &str,
        documents: &[VectorDocument],
    ) -> Result<(), VectorSyncError> {
        if documents.is_empty() {
            return Ok(());
        }
        let collection_id = self.collection_id(collection).await?;

        let texts: Vec<&str> = documents.iter().map(|d| d.document.as_str()).collect();
        let embeddings = match &self.embedder {
            Some(embedder) => Some(embedder.embed(&texts).await?),
            None => None,
        };
        let request = AddRequest {
            ids: documents.iter().map(|d| d.id.as_str()).collect(),
            documents: texts,
            metadatas: documents.iter().map(|d| &d.metadata).collect(),
            embeddings,
        };

        let response = self
            .http_client
            .post(format!(
                "{}/api/v1/collections/{}/add",
                self.base_url, collection_id
            ))
            .json(&request)
            .send()
            .await
            .map_err(|e| VectorSyncError::Connection(e.to_string()))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            if status == reqwest::StatusCode::NOT_FOUND {
                // collection dropped server side, resolve again next time
                self.collections.remove(collection);
            }
            return Err(VectorSyncError::Request(format!(
                "add to {} returned {}: {}",
                collection, status, body
            )));
        }
        debug!("Added {} document(s) to {}", documents.len(), collection);
        Ok(())
    }
}
