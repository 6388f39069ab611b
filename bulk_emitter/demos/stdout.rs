use std::{sync::Arc, time::Duration};

use bulk_emitter::{
    conversions::{
        json::{JsonSerializer, VirtualProperty},
        log_event::{Level, LogEvent},
        Payload,
    },
    pipeline::{
        config::DeliveryConfig,
        delivery::BatchDelivery,
        destinations::{
            bulk_http::{BulkHttpClientFactory, BulkHttpConfig},
            stdout::StdoutClientFactory,
            ClientObjectFactory,
        },
        items::{
            pooled::{BufferPool, PooledItemSourceFactory},
            ItemSourceFactory,
        },
        PipelineError,
    },
};
use clap::{Args, Parser, Subcommand};
use tracing::{error, info, info_span};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "stdout", version, about, arg_required_else_help = true)]
struct AppArgs {
    #[clap(flatten)]
    delivery_args: DeliveryArgs,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct DeliveryArgs {
    /// JSON file with the delivery configuration, overrides the flags below
    #[arg(long)]
    config: Option<String>,

    /// Items per batch
    #[arg(long, default_value_t = 100)]
    batch_size: usize,

    /// Time-triggered flush period in milliseconds
    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,

    /// Number of producer threads
    #[arg(long, default_value_t = 4)]
    producers: usize,

    /// Events emitted by each producer
    #[arg(long, default_value_t = 250)]
    events: usize,

    /// Hostname attached to every event
    #[arg(long)]
    hostname: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Log every batch through tracing
    Stdout,
    /// Post batches to a bulk endpoint
    Bulk {
        endpoint: String,
        #[arg(long, default_value = "logs")]
        index: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if let Err(e) = main_impl().await {
        error!("{e}");
    }

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stdout=info,bulk_emitter=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn delivery_config(args: &DeliveryArgs) -> Result<DeliveryConfig, PipelineError> {
    let config = match &args.config {
        Some(path) => DeliveryConfig::from_json(&std::fs::read_to_string(path)?)?,
        None => DeliveryConfig::new(args.batch_size, Duration::from_millis(args.interval_ms)),
    };
    Ok(config)
}

async fn main_impl() -> Result<(), PipelineError> {
    init_tracing();
    let args = AppArgs::parse();
    let config = delivery_config(&args.delivery_args)?;

    match args.command {
        Command::Stdout => run(config, StdoutClientFactory, &args.delivery_args).await,
        Command::Bulk { endpoint, index } => {
            let factory = BulkHttpClientFactory::new(BulkHttpConfig::new(endpoint, index))?;
            run(config, factory, &args.delivery_args).await
        }
    }
}

async fn run<F: ClientObjectFactory + 'static>(
    config: DeliveryConfig,
    factory: F,
    args: &DeliveryArgs,
) -> Result<(), PipelineError> {
    let delivery = Arc::new(BatchDelivery::new(config, factory, info_span!("delivery"))?);
    delivery.start()?;

    let properties = args
        .hostname
        .iter()
        .map(|hostname| VirtualProperty::new("hostname", hostname))
        .collect();
    let items = Arc::new(PooledItemSourceFactory::new(
        JsonSerializer::new(properties),
        BufferPool::new(args.batch_size, args.batch_size * 2, 512),
    ));

    let producers = (0..args.producers).map(|producer| {
        let delivery = delivery.clone();
        let items = items.clone();
        let events = args.events;
        tokio::task::spawn_blocking(move || -> Result<(), PipelineError> {
            for i in 0..events {
                let event = LogEvent::new(Level::Info, "demo::producer", format!("event {i}"))
                    .with_thread(format!("producer-{producer}"));
                let item = items.create(&Payload::from(event))?;
                delivery.add(item)?;
            }
            Ok(())
        })
    });

    let results = futures::future::try_join_all(producers)
        .await
        .map_err(std::io::Error::other)?;
    for result in results {
        result?;
    }

    info!("all producers done, stopping");
    delivery.stop().await;

    Ok(())
}
