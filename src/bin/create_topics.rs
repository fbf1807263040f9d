use anyhow::Context;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;

use delivery_semantics::infrastructure::kafka_config::KafkaTopicConfig;
use delivery_semantics::infrastructure::AppConfig;

fn env_override(key: &str, default: i32) -> anyhow::Result<i32> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid {}: {}", key, raw)),
        Err(_) => Ok(default),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let config = AppConfig::from_env()?;

    let defaults = KafkaTopicConfig::default();
    let settings = KafkaTopicConfig {
        partitions: env_override("TOPIC_PARTITIONS", defaults.partitions)?,
        replication_factor: env_override("TOPIC_REPLICATION_FACTOR", defaults.replication_factor)?,
        ..defaults
    };

    let admin_client: AdminClient<DefaultClientContext> = ClientConfig::new()
        .set("bootstrap.servers", &config.kafka.bootstrap_servers)
        .set("security.protocol", &config.kafka.security_protocol)
        .create()
        .context("Failed to create admin client")?;

    let min_insync = settings
        .min_insync_replicas
        .min(settings.replication_factor)
        .to_string();
    let retention_ms = settings.retention_ms.to_string();
    let segment_bytes = settings.segment_bytes.to_string();
    let max_message_bytes = settings.max_message_bytes.to_string();

    let topics: Vec<NewTopic> = config
        .topics
        .all()
        .into_iter()
        .map(|name| {
            NewTopic::new(
                name,
                settings.partitions,
                TopicReplication::Fixed(settings.replication_factor),
            )
            .set("min.insync.replicas", &min_insync)
            .set("cleanup.policy", &settings.cleanup_policy)
            .set("retention.ms", &retention_ms)
            .set("segment.bytes", &segment_bytes)
            .set("max.message.bytes", &max_message_bytes)
        })
        .collect();

    let results = admin_client
        .create_topics(&topics, &AdminOptions::new())
        .await
        .context("Failed to create topics")?;

    for result in results {
        match result {
            Ok(topic) => println!("Created topic: {}", topic),
            Err((topic, e)) => println!("Failed to create topic {}: {}", topic, e),
        }
    }
    Ok(())
}
