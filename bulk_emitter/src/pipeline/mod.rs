use batching::emitter::EmitError;
use config::ConfigError;
use destinations::DestinationError;
use delivery::LifecycleError;
use items::ItemSourceError;
use publisher::PublisherError;
use thiserror::Error;

pub mod batching;
pub mod config;
pub mod delivery;
pub mod destinations;
pub mod failure;
pub mod items;
pub mod publisher;
pub mod scheduler;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("config error: {0}")]
    ConfigError(#[from] ConfigError),

    #[error("lifecycle error: {0}")]
    LifecycleError(#[from] LifecycleError),

    #[error("emit error: {0}")]
    EmitError(#[from] EmitError),

    #[error("item source error: {0}")]
    ItemSourceError(#[from] ItemSourceError),

    #[error("destination error: {0}")]
    DestinationError(#[from] DestinationError),

    #[error("publisher error: {0}")]
    PublisherError(#[from] PublisherError),

    #[error("io error: {0}")]
    IOError(#[from] std::io::Error),
}
