use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing::{error, info};

use delivery_semantics::application::LoggingHandler;
use delivery_semantics::infrastructure::logging::init_logging;
use delivery_semantics::infrastructure::{
    AppConfig, ConsumerPool, ConsumerPoolConfig, DeadLetterStore, DedupCache, DeliveryMetrics,
    KafkaProducer, KafkaSubscriber, KafkaTransactionalProducer, MessageConsumer,
    MessagePublisher, MessageSubscriber, OutboxRelay, PostgresOutboxStore,
    PostgresProcessedLedger, Shutdown, ShutdownManager, TopicDeadLetterQueue,
    TransactionalPublisher,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    let config = AppConfig::from_env().context("Invalid configuration")?;
    let _log_guard = init_logging(config.logging.clone())?;

    info!(
        "Starting delivery-semantics service ({}, instance {})",
        config.delivery_mode.guarantee, config.kafka.instance_id
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.database_pool_size)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to the database")?;
    sqlx::migrate!()
        .run(&pool)
        .await
        .context("Failed to run migrations")?;

    let metrics = Arc::new(DeliveryMetrics::default());
    let shutdown = ShutdownManager::new();

    let producer: Arc<dyn MessagePublisher> = Arc::new(
        KafkaProducer::new(&config.kafka, &config.delivery_mode)
            .context("Failed to create Kafka producer")?,
    );
    let dead_letters: Arc<dyn DeadLetterStore> = Arc::new(TopicDeadLetterQueue::new(
        producer,
        config.topics.dead_letter.clone(),
    ));

    let relay_task = if config.relay_enabled {
        let tx_producer = KafkaTransactionalProducer::new(&config.kafka)
            .await
            .context("Failed to initialize transactional producer")?;
        let publisher = Arc::new(TransactionalPublisher::new(
            Arc::new(tx_producer),
            config.send_timeout,
        ));
        let relay = Arc::new(OutboxRelay::new(
            Arc::new(PostgresOutboxStore::new(pool.clone())),
            publisher,
            config.topics.clone(),
            config.relay.clone(),
            Arc::clone(&metrics),
        ));
        Some(tokio::spawn(relay.run(shutdown.token())))
    } else {
        info!("Outbox relay disabled");
        None
    };

    let consumer = Arc::new(MessageConsumer::new(
        &config.delivery_mode,
        Arc::new(PostgresProcessedLedger::new(pool.clone())),
        Arc::new(LoggingHandler),
        Arc::new(DedupCache::new(
            config.dedup.cache_capacity,
            config.dedup.cache_ttl,
        )),
        dead_letters,
        Arc::clone(&metrics),
    ));
    let subscriber: Arc<dyn MessageSubscriber> = Arc::new(KafkaSubscriber::new(
        config.kafka.clone(),
        config.delivery_mode.clone(),
    ));
    let mut pool_config = ConsumerPoolConfig::new(
        config.delivery_mode.topic(&config.topics),
        config.consumer_group(),
    );
    pool_config.workers = config.consumer.workers;
    pool_config.poll_timeout = config.consumer.poll_timeout;
    let consumer_task = ConsumerPool::new(subscriber, consumer, pool_config).spawn(shutdown.token());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    shutdown.shutdown().await?;

    if let Some(relay_task) = relay_task {
        if let Err(e) = relay_task.await {
            error!("Relay task failed: {}", e);
        }
    }
    match consumer_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Consumer pool failed: {:#}", e),
        Err(e) => error!("Consumer pool task failed: {}", e),
    }

    info!("Final metrics: {:?}", metrics.snapshot());
    pool.close().await;
    Ok(())
}
