//! Consume calculation stages from Kafka, deduplicated and checkpointed in Redis.
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::routing::get;
use envconfig::Envconfig;
use health::HealthRegistry;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use calculation_worker::config::Config;
use calculation_worker::consumer::{ConsumeLoop, KafkaSubscriber, Subscriber};
use calculation_worker::metrics::{serve, setup_metrics_router};
use calculation_worker::sender::{KafkaSender, OutboundSender};
use calculation_worker::step::{Processor, StepProcessor};
use calculation_worker::steps::{AcceptAll, NettingStep, PriceAccumulator, ValidationStep};
use calculation_worker::store::CheckpointStore;
use calculation_worker::supervisor::Supervisor;
use calculation_worker::time::{SystemTime, TimeSource};
use common_kafka::kafka_producer::create_kafka_producer;
use common_redis::RedisClient;

async fn shutdown() -> Result<()> {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("failed to register SIGTERM handler")?;
    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .context("failed to register SIGINT handler")?;

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    info!("Shutting down gracefully...");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::init_from_env().context("Invalid configuration")?;

    let liveness = HealthRegistry::new("liveness");

    let redis = RedisClient::new(config.redis_url.clone())
        .await
        .context("failed to connect to redis")?;
    let store = CheckpointStore::new(Arc::new(redis));

    let producer_liveness = liveness.register("rdkafka".to_string(), config.liveness_deadline.0);
    let producer = create_kafka_producer(&config.kafka, producer_liveness)
        .await
        .context("failed to create kafka producer")?;
    let sender: Arc<dyn OutboundSender> =
        Arc::new(KafkaSender::new(producer, config.produce_timeout.0));
    let time: Arc<dyn TimeSource + Send + Sync> = Arc::new(SystemTime {});

    let validation: Arc<dyn Processor> = Arc::new(StepProcessor::new(
        ValidationStep::new(
            Arc::new(AcceptAll),
            config.validation_next_activity.as_str(),
        ),
        store.clone(),
        sender.clone(),
        config.validation_output_topic.as_str(),
        time.clone(),
    ));
    let netting: Arc<dyn Processor> = Arc::new(StepProcessor::new(
        NettingStep::new(Arc::new(PriceAccumulator)),
        store,
        sender,
        config.netting_output_topic.as_str(),
        time,
    ));

    let subscriber: Arc<dyn Subscriber> = Arc::new(KafkaSubscriber::new(
        config.kafka.clone(),
        config.consumer.clone(),
    ));
    let cancel = CancellationToken::new();
    let mut supervisor = Supervisor::new(cancel.clone());
    for (topic, processor) in [
        (config.validation_input_topic.as_str(), validation),
        (config.netting_input_topic.as_str(), netting),
    ] {
        let handle = liveness.register(format!("consumer-{topic}"), config.liveness_deadline.0);
        supervisor.add(ConsumeLoop::new(
            topic,
            subscriber.clone(),
            processor,
            handle,
            config.liveness_deadline.0,
            config.resubscribe_backoff.0,
        ));
    }

    let router = setup_metrics_router()
        .context("failed to install metrics recorder")?
        .route("/_readiness", get(|| async { "ok" }))
        .route("/_liveness", get(move || std::future::ready(liveness.get_status())));
    let bind = config.bind();
    tokio::task::spawn(async move {
        if let Err(error) = serve(router, &bind).await {
            error!(%error, "failed to serve metrics and health endpoints");
        }
    });

    let signal_cancel = cancel.clone();
    tokio::task::spawn(async move {
        if let Err(error) = shutdown().await {
            error!(%error, "no signal handler, stop the process with SIGKILL");
            return;
        }
        signal_cancel.cancel();
    });

    supervisor.run().await?;
    info!("all consume loops stopped");

    Ok(())
}
