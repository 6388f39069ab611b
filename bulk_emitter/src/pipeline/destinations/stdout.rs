use std::str::from_utf8;

use async_trait::async_trait;
use tracing::info;

use crate::pipeline::batching::Batch;

use super::{Client, ClientObjectFactory, DeliveryOutcome, DestinationError};

pub struct StdoutClientFactory;

impl ClientObjectFactory for StdoutClientFactory {
    type Client = StdoutClient;

    fn create_client(&self) -> Result<StdoutClient, DestinationError> {
        Ok(StdoutClient)
    }
}

pub struct StdoutClient;

#[async_trait]
impl Client for StdoutClient
where
    Self: Send + Sync,
{
    async fn deliver(&self, batch: &Batch) -> DeliveryOutcome {
        info!("sending batch {} with {} items", batch.id(), batch.len());
        for item in batch.items() {
            match from_utf8(item.payload()) {
                Ok(line) => info!("{line}"),
                Err(_) => info!("<{} bytes>", item.len()),
            }
        }
        DeliveryOutcome::Accepted
    }
}
