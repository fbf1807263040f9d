//! Static selection of the producer/consumer stack for a deployment.
//!
//! A [`DeliveryMode`] is resolved once at startup and handed to the components that
//! need it. It carries no runtime state; [`DeliveryMode::validate`] only checks that
//! the requested knobs make sense together.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use strum_macros::{AsRefStr, Display, EnumString};

use crate::infrastructure::error::ConfigError;
use crate::infrastructure::kafka_config::TopicConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString, AsRefStr)]
#[strum(serialize_all = "kebab-case")]
pub enum DeliveryGuarantee {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[derive(Display, EnumString, AsRefStr)]
#[strum(serialize_all = "kebab-case")]
pub enum AckMode {
    /// Offsets are committed automatically, before the record is processed.
    None,
    /// Offsets are committed by the consumer after processing.
    Manual,
    /// Like `Manual`, but the commit is synchronous.
    ManualImmediate,
}

impl AckMode {
    pub fn is_manual(&self) -> bool {
        !matches!(self, AckMode::None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[derive(Display, EnumString, AsRefStr)]
#[strum(serialize_all = "kebab-case")]
pub enum IsolationLevel {
    ReadCommitted,
    ReadUncommitted,
}

impl IsolationLevel {
    /// The librdkafka property value.
    pub fn as_kafka_value(&self) -> &'static str {
        match self {
            IsolationLevel::ReadCommitted => "read_committed",
            IsolationLevel::ReadUncommitted => "read_uncommitted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryMode {
    pub guarantee: DeliveryGuarantee,
    pub ack_mode: AckMode,
    pub idempotence: bool,
    pub transactions: bool,
    pub isolation: IsolationLevel,
}

impl DeliveryMode {
    pub fn at_most_once() -> Self {
        Self {
            guarantee: DeliveryGuarantee::AtMostOnce,
            ack_mode: AckMode::None,
            idempotence: false,
            transactions: false,
            isolation: IsolationLevel::ReadUncommitted,
        }
    }

    pub fn at_least_once() -> Self {
        Self {
            guarantee: DeliveryGuarantee::AtLeastOnce,
            ack_mode: AckMode::Manual,
            idempotence: false,
            transactions: false,
            isolation: IsolationLevel::ReadUncommitted,
        }
    }

    pub fn exactly_once() -> Self {
        Self {
            guarantee: DeliveryGuarantee::ExactlyOnce,
            ack_mode: AckMode::Manual,
            idempotence: true,
            transactions: true,
            isolation: IsolationLevel::ReadCommitted,
        }
    }

    pub fn preset(guarantee: DeliveryGuarantee) -> Self {
        match guarantee {
            DeliveryGuarantee::AtMostOnce => Self::at_most_once(),
            DeliveryGuarantee::AtLeastOnce => Self::at_least_once(),
            DeliveryGuarantee::ExactlyOnce => Self::exactly_once(),
        }
    }

    /// Resolves a mode from its textual configuration. Overrides that are `None`
    /// keep the preset value of the guarantee.
    pub fn resolve(
        guarantee: &str,
        ack_mode: Option<&str>,
        isolation: Option<&str>,
    ) -> Result<Self, ConfigError> {
        let guarantee =
            DeliveryGuarantee::from_str(guarantee).map_err(|_| ConfigError::Invalid {
                key: "DELIVERY_MODE".to_string(),
                value: guarantee.to_string(),
            })?;
        let mut mode = Self::preset(guarantee);

        if let Some(raw) = ack_mode {
            mode.ack_mode = AckMode::from_str(raw).map_err(|_| ConfigError::Invalid {
                key: "ACK_MODE".to_string(),
                value: raw.to_string(),
            })?;
        }
        if let Some(raw) = isolation {
            mode.isolation = IsolationLevel::from_str(raw).map_err(|_| ConfigError::Invalid {
                key: "ISOLATION_LEVEL".to_string(),
                value: raw.to_string(),
            })?;
        }

        mode.validate()?;
        Ok(mode)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.transactions && !self.idempotence {
            return Err(ConfigError::Inconsistent(
                "transactions require producer idempotence".to_string(),
            ));
        }

        match self.guarantee {
            DeliveryGuarantee::ExactlyOnce => {
                if !self.ack_mode.is_manual() {
                    return Err(ConfigError::Inconsistent(
                        "exactly-once requires manual acknowledgment".to_string(),
                    ));
                }
                if !self.transactions || !self.idempotence {
                    return Err(ConfigError::Inconsistent(
                        "exactly-once requires transactions and idempotence".to_string(),
                    ));
                }
                if self.isolation != IsolationLevel::ReadCommitted {
                    return Err(ConfigError::Inconsistent(
                        "exactly-once requires read-committed isolation".to_string(),
                    ));
                }
            }
            DeliveryGuarantee::AtLeastOnce => {
                if !self.ack_mode.is_manual() {
                    return Err(ConfigError::Inconsistent(
                        "at-least-once requires manual acknowledgment".to_string(),
                    ));
                }
            }
            DeliveryGuarantee::AtMostOnce => {
                if self.ack_mode.is_manual() {
                    return Err(ConfigError::Inconsistent(
                        "at-most-once acknowledges before processing; manual ack is not allowed"
                            .to_string(),
                    ));
                }
                if self.transactions {
                    return Err(ConfigError::Inconsistent(
                        "at-most-once does not use transactions".to_string(),
                    ));
                }
            }
        }

        Ok(())
    }

    /// Producer properties for this mode.
    pub fn producer_properties(&self) -> Vec<(&'static str, String)> {
        match self.guarantee {
            DeliveryGuarantee::AtMostOnce => vec![
                ("acks", "0".to_string()),
                ("retries", "0".to_string()),
                ("linger.ms", "0".to_string()),
                ("enable.idempotence", self.idempotence.to_string()),
            ],
            DeliveryGuarantee::AtLeastOnce => vec![
                ("acks", "all".to_string()),
                ("retries", "10".to_string()),
                ("retry.backoff.ms", "300".to_string()),
                ("enable.idempotence", self.idempotence.to_string()),
            ],
            DeliveryGuarantee::ExactlyOnce => vec![
                ("acks", "all".to_string()),
                ("retries", i32::MAX.to_string()),
                ("enable.idempotence", "true".to_string()),
                ("max.in.flight.requests.per.connection", "1".to_string()),
            ],
        }
    }

    /// Consumer properties for this mode.
    pub fn consumer_properties(&self) -> Vec<(&'static str, String)> {
        let mut props = vec![
            ("enable.auto.commit", (!self.ack_mode.is_manual()).to_string()),
            ("isolation.level", self.isolation.as_kafka_value().to_string()),
        ];
        if !self.ack_mode.is_manual() {
            props.push(("auto.commit.interval.ms", "100".to_string()));
        }
        props
    }

    pub fn topic<'a>(&self, topics: &'a TopicConfig) -> &'a str {
        match self.guarantee {
            DeliveryGuarantee::AtMostOnce => &topics.at_most_once,
            DeliveryGuarantee::AtLeastOnce => &topics.at_least_once,
            DeliveryGuarantee::ExactlyOnce => &topics.exactly_once,
        }
    }

    pub fn default_group_id(&self) -> &'static str {
        match self.guarantee {
            DeliveryGuarantee::AtMostOnce => "at-most-once-group",
            DeliveryGuarantee::AtLeastOnce => "at-least-once-group",
            DeliveryGuarantee::ExactlyOnce => "exactly-once-group",
        }
    }
}
