pub mod bulk_http;
pub mod stdout;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use super::{
    batching::Batch,
    failure::{FailureHandler, LoggingFailureHandler},
};

#[derive(Debug, Error)]
pub enum DestinationError {
    #[error("invalid client configuration: {0}")]
    InvalidConfig(String),

    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Worth another attempt, e.g. a timeout or an overloaded endpoint.
    Transient,
    /// Resubmitting would be rejected the same way.
    Permanent,
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out")]
    Timeout,

    #[error("endpoint responded with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("unreadable response: {0}")]
    InvalidResponse(String),
}

impl DeliveryError {
    pub fn kind(&self) -> FailureKind {
        match self {
            DeliveryError::Transport(_) | DeliveryError::Timeout => FailureKind::Transient,
            DeliveryError::Status { status, .. } => status_failure_kind(*status),
            DeliveryError::InvalidResponse(_) => FailureKind::Transient,
        }
    }
}

/// 429 and 5xx are worth retrying, every other error status is final.
pub fn status_failure_kind(status: u16) -> FailureKind {
    if status == 429 || status >= 500 {
        FailureKind::Transient
    } else {
        FailureKind::Permanent
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFailure {
    /// Position of the item within the delivered batch.
    pub index: usize,
    pub kind: FailureKind,
    pub reason: String,
}

#[derive(Debug)]
pub enum DeliveryOutcome {
    Accepted,
    PartialFailure(Vec<ItemFailure>),
    Failure(DeliveryError),
}

#[async_trait]
pub trait Client: Send + Sync {
    /// Transmits one batch. Called at most once per batch.
    async fn deliver(&self, batch: &Batch) -> DeliveryOutcome;

    async fn close(&self) {}
}

pub trait ClientObjectFactory: Send + Sync {
    type Client: Client + 'static;

    fn create_client(&self) -> Result<Self::Client, DestinationError>;

    /// Sink for items that will not be delivered.
    fn failure_handler(&self) -> Arc<dyn FailureHandler> {
        Arc::new(LoggingFailureHandler)
    }
}
