use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::infrastructure::error::DeliveryError;
use crate::infrastructure::kafka_abstraction::{DeliveryPosition, MessagePublisher};
use crate::infrastructure::kafka_dlq::{DeadLetter, DeadLetterStore};
use crate::infrastructure::kafka_metrics::DeliveryMetrics;

/// Upper bound for `max_attempts`, whatever the caller asks for.
pub const MAX_ATTEMPTS_CAP: u32 = 10;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(300),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            max_jitter: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Delay after the given failed attempt (1-based), without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let nanos = self.base_delay.as_nanos() as f64 * factor;
        if !nanos.is_finite() || nanos >= self.max_delay.as_nanos() as f64 {
            return self.max_delay;
        }
        Duration::from_nanos(nanos.max(0.0).round() as u64)
    }

    fn jitter(&self) -> Duration {
        let max = self.max_jitter.as_millis() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max))
    }
}

/// Progress of one retried send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryAttempt {
    pub message_id: String,
    pub attempt_count: u32,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Delivered {
        position: DeliveryPosition,
        attempts: u32,
    },
    DeadLettered {
        attempts: u32,
        last_error: String,
    },
    /// Delivery failed and the dead-letter store refused the message too.
    Lost {
        attempts: u32,
        last_error: String,
        store_error: String,
    },
    /// The publish task was cancelled or panicked before reaching an outcome.
    Interrupted(String),
}

/// Handle to a send running in the background.
pub struct PendingPublish(JoinHandle<PublishOutcome>);

impl PendingPublish {
    pub async fn outcome(self) -> PublishOutcome {
        match self.0.await {
            Ok(outcome) => outcome,
            Err(e) => PublishOutcome::Interrupted(e.to_string()),
        }
    }
}

/// Publishes with bounded retries and routes what cannot be delivered to a
/// dead-letter store. Callers get an outcome, never an error.
#[derive(Clone)]
pub struct RetryingPublisher {
    publisher: Arc<dyn MessagePublisher>,
    dead_letters: Arc<dyn DeadLetterStore>,
    policy: RetryPolicy,
    send_timeout: Duration,
    metrics: Arc<DeliveryMetrics>,
}

impl RetryingPublisher {
    pub fn new(
        publisher: Arc<dyn MessagePublisher>,
        dead_letters: Arc<dyn DeadLetterStore>,
        policy: RetryPolicy,
        send_timeout: Duration,
        metrics: Arc<DeliveryMetrics>,
    ) -> Self {
        Self {
            publisher,
            dead_letters,
            policy,
            send_timeout,
            metrics,
        }
    }

    /// One send, bounded by the send timeout.
    pub async fn publish_once(
        &self,
        topic: &str,
        key: &str,
        payload: &[u8],
    ) -> Result<DeliveryPosition, DeliveryError> {
        let started = Instant::now();
        let result =
            match tokio::time::timeout(self.send_timeout, self.publisher.publish(topic, key, payload))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(DeliveryError::TimeoutExceeded(self.send_timeout)),
            };

        match &result {
            Ok(_) => {
                DeliveryMetrics::incr(&self.metrics.messages_published);
                self.metrics.record_publish_latency(started.elapsed());
            }
            Err(_) => DeliveryMetrics::incr(&self.metrics.publish_failures),
        }
        result
    }

    /// Starts the send on its own task and returns immediately. `max_attempts` is
    /// clamped to `1..=MAX_ATTEMPTS_CAP`.
    pub fn send_with_retry(
        &self,
        topic: impl Into<String>,
        key: impl Into<String>,
        payload: Vec<u8>,
        max_attempts: u32,
    ) -> PendingPublish {
        let this = self.clone();
        let topic = topic.into();
        let key = key.into();
        let max_attempts = max_attempts.clamp(1, MAX_ATTEMPTS_CAP);

        PendingPublish(tokio::spawn(async move {
            this.deliver(topic, key, payload, max_attempts).await
        }))
    }

    async fn deliver(
        &self,
        topic: String,
        key: String,
        payload: Vec<u8>,
        max_attempts: u32,
    ) -> PublishOutcome {
        let mut attempt = DeliveryAttempt {
            message_id: key.clone(),
            attempt_count: 0,
            last_error: None,
        };

        loop {
            attempt.attempt_count += 1;
            let error = match self.publish_once(&topic, &key, &payload).await {
                Ok(position) => {
                    if attempt.attempt_count > 1 {
                        info!(
                            "Message {} delivered to {} after {} attempts",
                            key, topic, attempt.attempt_count
                        );
                    }
                    return PublishOutcome::Delivered {
                        position,
                        attempts: attempt.attempt_count,
                    };
                }
                Err(e) => e,
            };

            let retryable = error.is_retryable();
            attempt.last_error = Some(error.to_string());

            if !retryable {
                error!(
                    "Message {} rejected by {}, not retrying: {}",
                    key, topic, error
                );
                break;
            }
            if attempt.attempt_count >= max_attempts {
                error!(
                    "Message {} failed after {}/{} attempts: {}",
                    key, attempt.attempt_count, max_attempts, error
                );
                break;
            }

            let delay = self.policy.backoff(attempt.attempt_count) + self.policy.jitter();
            warn!(
                "Retrying message: {}, attempt: {}/{} in {:?}",
                key,
                attempt.attempt_count + 1,
                max_attempts,
                delay
            );
            DeliveryMetrics::incr(&self.metrics.publish_retries);
            tokio::time::sleep(delay).await;
        }

        self.dead_letter(topic, payload, attempt).await
    }

    async fn dead_letter(
        &self,
        topic: String,
        payload: Vec<u8>,
        attempt: DeliveryAttempt,
    ) -> PublishOutcome {
        let last_error = attempt.last_error.unwrap_or_default();
        let letter = DeadLetter::new(
            attempt.message_id.clone(),
            topic,
            attempt.message_id.clone(),
            payload,
            attempt.attempt_count,
            last_error.clone(),
        );

        match self.dead_letters.store(letter).await {
            Ok(()) => {
                DeliveryMetrics::incr(&self.metrics.dead_lettered);
                PublishOutcome::DeadLettered {
                    attempts: attempt.attempt_count,
                    last_error,
                }
            }
            Err(e) => {
                error!(
                    "Message {} could not be dead-lettered and is lost: {:#}",
                    attempt.message_id, e
                );
                DeliveryMetrics::incr(&self.metrics.messages_lost);
                PublishOutcome::Lost {
                    attempts: attempt.attempt_count,
                    last_error,
                    store_error: format!("{:#}", e),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_the_ceiling() {
        let policy = RetryPolicy {
            max_delay: Duration::from_secs(1),
            ..Default::default()
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(300));
        assert_eq!(policy.backoff(2), Duration::from_millis(600));
        assert_eq!(policy.backoff(3), Duration::from_secs(1));
        assert_eq!(policy.backoff(40), Duration::from_secs(1));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy::default();
        for _ in 0..100 {
            assert!(policy.jitter() <= policy.max_jitter);
        }
        let none = RetryPolicy {
            max_jitter: Duration::ZERO,
            ..Default::default()
        };
        assert_eq!(none.jitter(), Duration::ZERO);
    }
}
