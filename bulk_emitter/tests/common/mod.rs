//! Scripted client and collecting failure handler shared by the integration tests

#![allow(dead_code)]

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use bulk_emitter::pipeline::{
    batching::{Batch, BatchId},
    destinations::{
        Client, ClientObjectFactory, DeliveryError, DeliveryOutcome, DestinationError, ItemFailure,
    },
    failure::{FailedItems, FailureHandler, FailureReason},
    items::ItemSource,
};

pub enum Script {
    Accept,
    Timeout,
    Reject(u16),
    Partial(Vec<ItemFailure>),
    Stall(Duration),
}

#[derive(Debug, Clone)]
pub struct Delivered {
    pub id: BatchId,
    pub payloads: Vec<String>,
}

#[derive(Debug)]
pub struct Dropped {
    pub reason: FailureReason,
    pub payloads: Vec<String>,
    pub attempts: Vec<u32>,
}

pub fn payloads(items: &[ItemSource]) -> Vec<String> {
    items
        .iter()
        .map(|item| String::from_utf8(item.payload().to_vec()).unwrap())
        .collect()
}

#[derive(Default)]
pub struct CollectingFailureHandler {
    pub dropped: Mutex<Vec<Dropped>>,
}

impl FailureHandler for CollectingFailureHandler {
    fn on_failure(&self, failed: FailedItems) {
        self.dropped.lock().unwrap().push(Dropped {
            payloads: payloads(&failed.items),
            attempts: failed.items.iter().map(ItemSource::attempts).collect(),
            reason: failed.reason,
        });
    }
}

#[derive(Clone, Default)]
pub struct ScriptedFactory {
    pub script: Arc<Mutex<VecDeque<Script>>>,
    pub delivered: Arc<Mutex<Vec<Delivered>>>,
    pub failures: Arc<CollectingFailureHandler>,
}

impl ScriptedFactory {
    pub fn with_script(script: Vec<Script>) -> Self {
        let factory = ScriptedFactory::default();
        factory.script.lock().unwrap().extend(script);
        factory
    }

    pub fn delivered(&self) -> Vec<Delivered> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn delivered_payloads(&self) -> Vec<String> {
        self.delivered()
            .into_iter()
            .flat_map(|delivered| delivered.payloads)
            .collect()
    }
}

impl ClientObjectFactory for ScriptedFactory {
    type Client = ScriptedClient;

    fn create_client(&self) -> Result<ScriptedClient, DestinationError> {
        Ok(ScriptedClient {
            script: self.script.clone(),
            delivered: self.delivered.clone(),
        })
    }

    fn failure_handler(&self) -> Arc<dyn FailureHandler> {
        self.failures.clone()
    }
}

pub struct ScriptedClient {
    script: Arc<Mutex<VecDeque<Script>>>,
    delivered: Arc<Mutex<Vec<Delivered>>>,
}

#[async_trait]
impl Client for ScriptedClient {
    async fn deliver(&self, batch: &Batch) -> DeliveryOutcome {
        let step = self.script.lock().unwrap().pop_front().unwrap_or(Script::Accept);
        match step {
            Script::Accept => {}
            Script::Timeout => return DeliveryOutcome::Failure(DeliveryError::Timeout),
            Script::Reject(status) => {
                return DeliveryOutcome::Failure(DeliveryError::Status {
                    status,
                    body: "rejected".into(),
                })
            }
            Script::Partial(failures) => {
                self.record(batch);
                return DeliveryOutcome::PartialFailure(failures);
            }
            Script::Stall(duration) => tokio::time::sleep(duration).await,
        }
        self.record(batch);
        DeliveryOutcome::Accepted
    }
}

impl ScriptedClient {
    fn record(&self, batch: &Batch) {
        self.delivered.lock().unwrap().push(Delivered {
            id: batch.id(),
            payloads: payloads(batch.items()),
        });
    }
}
