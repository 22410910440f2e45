//! HTTP client for the local embedding/summarization service.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::errors::{ArchiveError, Result};

use super::EmbeddingBackend;

/// Hint returned when the backend socket cannot be reached.
const RETRY_AFTER_MS: u64 = 5_000;

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    vector: Vec<f32>,
}

#[derive(Debug, Serialize)]
struct EmbedBatchRequest<'a> {
    model: &'a str,
    texts: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbedBatchResponse {
    vectors: Vec<Vec<f32>>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    content: String,
}

/// Client for a local model server exposing `/api/embed`,
/// `/api/embed_batch`, `/api/chat`, and the `/api/tags` probe.
///
/// The client is single-threaded with respect to the backend: an internal
/// mutex serializes requests, so at most one is in flight per process
/// regardless of how many tasks share the handle.
pub struct OllamaBackend {
    http: reqwest::Client,
    base_url: String,
    embed_model: String,
    chat_model: String,
    dimensions: usize,
    timeout: Duration,
    batch_size: usize,
    gate: Mutex<()>,
}

impl OllamaBackend {
    pub fn new(base_url: impl Into<String>, dimensions: usize) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            embed_model: "nomic-embed-text".to_string(),
            chat_model: "llama3.2".to_string(),
            dimensions,
            timeout: Duration::from_secs(120),
            batch_size: 32,
            gate: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn with_embed_model(mut self, model: impl Into<String>) -> Self {
        self.embed_model = model.into();
        self
    }

    #[must_use]
    pub fn with_chat_model(mut self, model: impl Into<String>) -> Self {
        self.chat_model = model.into();
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn map_transport_error(&self, what: &str, err: reqwest::Error) -> ArchiveError {
        if err.is_timeout() {
            ArchiveError::Timeout(format!("{what} request timed out"))
        } else if err.is_connect() {
            ArchiveError::backend_unreachable(
                format!("{what}: backend unreachable: {err}"),
                RETRY_AFTER_MS,
            )
        } else {
            ArchiveError::backend(format!("{what}: {err}"))
        }
    }

    async fn check_status(what: &str, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let lowered = body.to_ascii_lowercase();
        if lowered.contains("context") && (lowered.contains("too long") || lowered.contains("length"))
        {
            return Err(ArchiveError::context_too_long(format!(
                "{what}: {status}: {body}"
            )));
        }
        Err(ArchiveError::backend(format!("{what}: {status}: {body}")))
    }

    fn check_dimensions(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimensions {
            return Err(ArchiveError::backend(format!(
                "backend returned {}-dim vector, expected {}",
                vector.len(),
                self.dimensions
            )));
        }
        Ok(())
    }

    async fn embed_one_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let request = EmbedBatchRequest {
            model: &self.embed_model,
            texts,
        };
        let response = self
            .http
            .post(self.url("/api/embed_batch"))
            .timeout(self.timeout)
            .json(&request)
            .send()
            .await
            .map_err(|err| self.map_transport_error("embed_batch", err))?;
        let response = Self::check_status("embed_batch", response).await?;
        let payload: EmbedBatchResponse = response
            .json()
            .await
            .map_err(|err| ArchiveError::backend(format!("embed_batch: bad payload: {err}")))?;
        if payload.vectors.len() != texts.len() {
            return Err(ArchiveError::backend(format!(
                "embed_batch returned {} vectors for {} texts",
                payload.vectors.len(),
                texts.len()
            )));
        }
        for vector in &payload.vectors {
            self.check_dimensions(vector)?;
        }
        Ok(payload.vectors)
    }
}

#[async_trait]
impl EmbeddingBackend for OllamaBackend {
    #[instrument(skip(self, text), fields(chars = text.len()))]
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let _serial = self.gate.lock().await;
        let request = EmbedRequest {
            model: &self.embed_model,
            text,
        };
        let response = self
            .http
            .post(self.url("/api/embed"))
            .timeout(self.timeout)
            .json(&request)
            .send()
            .await
            .map_err(|err| self.map_transport_error("embed", err))?;
        let response = Self::check_status("embed", response).await?;
        let payload: EmbedResponse = response
            .json()
            .await
            .map_err(|err| ArchiveError::backend(format!("embed: bad payload: {err}")))?;
        self.check_dimensions(&payload.vector)?;
        Ok(payload.vector)
    }

    #[instrument(skip(self, texts), fields(n = texts.len()))]
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let _serial = self.gate.lock().await;
        let mut vectors = Vec::with_capacity(texts.len());
        for slice in texts.chunks(self.batch_size) {
            vectors.extend(self.embed_one_batch(slice).await?);
        }
        debug!(vectors = vectors.len(), "embedded batch");
        Ok(vectors)
    }

    #[instrument(skip(self, prompt))]
    async fn summarize(&self, prompt: &str) -> Result<String> {
        let _serial = self.gate.lock().await;
        let request = ChatRequest {
            model: &self.chat_model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
        };
        let response = self
            .http
            .post(self.url("/api/chat"))
            .timeout(self.timeout)
            .json(&request)
            .send()
            .await
            .map_err(|err| self.map_transport_error("chat", err))?;
        let response = Self::check_status("chat", response).await?;
        let payload: ChatResponse = response
            .json()
            .await
            .map_err(|err| ArchiveError::backend(format!("chat: bad payload: {err}")))?;
        Ok(payload.content)
    }

    async fn is_available(&self) -> bool {
        let probe = self
            .http
            .get(self.url("/api/tags"))
            .timeout(Duration::from_secs(2))
            .send()
            .await;
        match probe {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                warn!(error = %err, "embedding backend probe failed");
                false
            }
        }
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    #[tokio::test]
    async fn embed_round_trips_vector() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/api/embed");
                then.status(200)
                    .json_body(serde_json::json!({"vector": [0.5, 0.5, 0.0]}));
            })
            .await;

        let backend = OllamaBackend::new(server.base_url(), 3);
        let vector = backend.embed("hello").await.unwrap();
        assert_eq!(vector, vec![0.5, 0.5, 0.0]);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn context_too_long_is_typed() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/embed");
                then.status(400).body("input exceeds context length");
            })
            .await;

        let backend = OllamaBackend::new(server.base_url(), 3);
        let err = backend.embed("way too much text").await.unwrap_err();
        assert!(err.is_context_too_long());
    }

    #[tokio::test]
    async fn dimension_mismatch_is_backend_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/embed");
                then.status(200)
                    .json_body(serde_json::json!({"vector": [1.0, 0.0]}));
            })
            .await;

        let backend = OllamaBackend::new(server.base_url(), 3);
        let err = backend.embed("hello").await.unwrap_err();
        assert!(matches!(err, ArchiveError::Backend { .. }));
    }

    #[tokio::test]
    async fn availability_probe_hits_tags() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/tags");
                then.status(200).json_body(serde_json::json!({"models": []}));
            })
            .await;

        let backend = OllamaBackend::new(server.base_url(), 3);
        assert!(backend.is_available().await);
    }

    #[tokio::test]
    async fn batch_preserves_order_across_sub_batches() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/embed_batch")
                    .body_contains("\"a\"");
                then.status(200)
                    .json_body(serde_json::json!({"vectors": [[1.0, 0.0], [0.0, 1.0]]}));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/embed_batch")
                    .body_contains("\"c\"");
                then.status(200)
                    .json_body(serde_json::json!({"vectors": [[0.7, 0.7]]}));
            })
            .await;

        let backend = OllamaBackend::new(server.base_url(), 2).with_batch_size(2);
        let vectors = backend
            .embed_batch(&["a".into(), "b".into(), "c".into()])
            .await
            .unwrap();
        assert_eq!(vectors.len(), 3);
        assert_eq!(vectors[2], vec![0.7, 0.7]);
    }
}
