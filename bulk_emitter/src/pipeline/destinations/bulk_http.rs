use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::pipeline::{
    batching::Batch,
    failure::{FailureHandler, LoggingFailureHandler},
};

use super::{
    status_failure_kind, Client, ClientObjectFactory, DeliveryError, DeliveryOutcome,
    DestinationError, ItemFailure,
};

fn default_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct BulkHttpConfig {
    /// Base url of the endpoint, `/_bulk` is appended.
    pub endpoint: String,
    pub index: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl BulkHttpConfig {
    pub fn new(endpoint: impl Into<String>, index: impl Into<String>) -> Self {
        BulkHttpConfig {
            endpoint: endpoint.into(),
            index: index.into(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

pub struct BulkHttpClientFactory {
    config: BulkHttpConfig,
    failure_handler: Arc<dyn FailureHandler>,
}

impl BulkHttpClientFactory {
    pub fn new(config: BulkHttpConfig) -> Result<Self, DestinationError> {
        if !(config.endpoint.starts_with("http://") || config.endpoint.starts_with("https://")) {
            return Err(DestinationError::InvalidConfig(format!(
                "endpoint must be an http(s) url, got '{}'",
                config.endpoint
            )));
        }
        if config.index.is_empty() {
            return Err(DestinationError::InvalidConfig("index must not be empty".into()));
        }
        if config.timeout_ms == 0 {
            return Err(DestinationError::InvalidConfig("timeout_ms must be positive".into()));
        }

        Ok(BulkHttpClientFactory {
            config,
            failure_handler: Arc::new(LoggingFailureHandler),
        })
    }

    pub fn with_failure_handler(mut self, failure_handler: Arc<dyn FailureHandler>) -> Self {
        self.failure_handler = failure_handler;
        self
    }
}

impl ClientObjectFactory for BulkHttpClientFactory {
    type Client = BulkHttpClient;

    fn create_client(&self) -> Result<BulkHttpClient, DestinationError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(self.config.timeout_ms))
            .build()?;

        let action_line = serde_json::to_vec(&json!({ "index": { "_index": self.config.index } }))
            .map_err(|e| DestinationError::InvalidConfig(e.to_string()))?;

        Ok(BulkHttpClient {
            http,
            url: format!("{}/_bulk", self.config.endpoint.trim_end_matches('/')),
            action_line,
        })
    }

    fn failure_handler(&self) -> Arc<dyn FailureHandler> {
        self.failure_handler.clone()
    }
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    errors: bool,
    #[serde(default)]
    items: Vec<HashMap<String, BulkItemResponse>>,
}

#[derive(Debug, Deserialize)]
struct BulkItemResponse {
    status: u16,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

pub struct BulkHttpClient {
    http: reqwest::Client,
    url: String,
    action_line: Vec<u8>,
}

impl BulkHttpClient {
    fn encode(&self, batch: &Batch) -> BytesMut {
        let mut body =
            BytesMut::with_capacity(batch.payload_bytes() + batch.len() * (self.action_line.len() + 2));
        for item in batch.items() {
            body.put_slice(&self.action_line);
            body.put_u8(b'\n');
            body.put_slice(item.payload());
            body.put_u8(b'\n');
        }
        body
    }

    fn item_failures(response: BulkResponse) -> Vec<ItemFailure> {
        response
            .items
            .into_iter()
            .enumerate()
            .filter_map(|(index, mut entry)| {
                // each entry is keyed by its action, e.g. {"index": {...}}
                let (_, item) = entry.drain().next()?;
                if item.status < 300 {
                    return None;
                }
                let reason = item
                    .error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| format!("status {}", item.status));
                Some(ItemFailure {
                    index,
                    kind: status_failure_kind(item.status),
                    reason,
                })
            })
            .collect()
    }
}

#[async_trait]
impl Client for BulkHttpClient {
    async fn deliver(&self, batch: &Batch) -> DeliveryOutcome {
        let body = self.encode(batch);
        debug!("posting batch {} ({} bytes) to {}", batch.id(), body.len(), self.url);

        let response = match self
            .http
            .post(&self.url)
            .header(CONTENT_TYPE, "application/x-ndjson")
            .body(body.freeze())
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) if e.is_timeout() => return DeliveryOutcome::Failure(DeliveryError::Timeout),
            Err(e) => return DeliveryOutcome::Failure(DeliveryError::Transport(e.to_string())),
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return DeliveryOutcome::Failure(DeliveryError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => return DeliveryOutcome::Failure(DeliveryError::Transport(e.to_string())),
        };
        let parsed: BulkResponse = match serde_json::from_slice(&bytes) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("unable to parse bulk response for batch {}: {e}", batch.id());
                return DeliveryOutcome::Failure(DeliveryError::InvalidResponse(e.to_string()));
            }
        };

        if !parsed.errors {
            return DeliveryOutcome::Accepted;
        }

        let failures = Self::item_failures(parsed);
        if failures.is_empty() {
            DeliveryOutcome::Accepted
        } else {
            DeliveryOutcome::PartialFailure(failures)
        }
    }
}
