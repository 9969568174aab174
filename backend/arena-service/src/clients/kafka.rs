//! Kafka event publisher
//!
//! Publishes notification and reward-trigger events for the downstream
//! notification and wallet consumers. Keys are the target user id so one
//! user's events stay ordered within a partition.

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use serde::Serialize;
use std::time::Duration;

use super::{Notification, NotificationSink, RewardGrant, RewardLedger};
use crate::error::{AppError, Result};

#[derive(Clone)]
pub struct KafkaEventPublisher {
    producer: FutureProducer,
    notification_topic: String,
    reward_topic: String,
}

impl KafkaEventPublisher {
    pub fn new(brokers: &str, notification_topic: &str, reward_topic: &str) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .set("acks", "all")
            .set("retries", "3")
            .set("retry.backoff.ms", "100")
            .create()
            .map_err(|e| AppError::Internal(format!("Failed to create Kafka producer: {}", e)))?;

        tracing::info!(
            brokers = %brokers,
            notification_topic = %notification_topic,
            reward_topic = %reward_topic,
            "KafkaEventPublisher initialized"
        );

        Ok(Self {
            producer,
            notification_topic: notification_topic.to_string(),
            reward_topic: reward_topic.to_string(),
        })
    }

    async fn publish<T: Serialize>(&self, topic: &str, key: &str, event: &T) -> Result<()> {
        let payload = serde_json::to_string(event)?;
        let record = FutureRecord::to(topic).key(key).payload(&payload);

        match self.producer.send(record, Duration::from_secs(5)).await {
            Ok((partition, offset)) => {
                tracing::debug!(
                    topic = %topic,
                    key = %key,
                    partition = partition,
                    offset = offset,
                    "Event published to Kafka"
                );
                Ok(())
            }
            Err((e, _)) => {
                tracing::error!(error = %e, topic = %topic, key = %key, "Failed to publish event to Kafka");
                Err(AppError::TransientDependency(format!("kafka: {}", e)))
            }
        }
    }
}

#[async_trait]
impl NotificationSink for KafkaEventPublisher {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        let key = notification
            .user_id
            .unwrap_or(notification.battle_id)
            .to_string();
        self.publish(&self.notification_topic, &key, notification)
            .await
    }
}

#[async_trait]
impl RewardLedger for KafkaEventPublisher {
    async fn grant(&self, grant: &RewardGrant) -> Result<()> {
        let key = grant.user_id.to_string();
        self.publish(&self.reward_topic, &key, grant).await
    }
}
