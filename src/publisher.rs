// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! This module provides the typed publishing helpers: single publish, batch
//! publish, and transactional batch publish over AMQP transactions. Messages
//! are published persistent (`delivery_mode=2`) with the serializer's content
//! type, a fresh message id, and the current trace context injected into the
//! headers.

use crate::{
    errors::AmqpError,
    otel,
    pool::ConnectionPool,
    serializer::Serializer,
};
use lapin::{
    options::BasicPublishOptions,
    types::{FieldTable, ShortString},
    BasicProperties, Channel,
};
use opentelemetry::Context;
use serde::Serialize;
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error};
use uuid::Uuid;

/// Typed publisher over the shared connection pool.
///
/// Publish helpers open a short-lived channel per call (one channel for a
/// whole batch) and release it on every exit path.
pub struct RabbitMQPublisher<S> {
    pool: Arc<ConnectionPool>,
    serializer: Arc<S>,
}

impl<S: Serializer> RabbitMQPublisher<S> {
    /// Creates a publisher sharing the given pool and serializer.
    pub fn new(pool: Arc<ConnectionPool>, serializer: Arc<S>) -> RabbitMQPublisher<S> {
        RabbitMQPublisher { pool, serializer }
    }

    /// Publishes one message to the exchange with the given routing key.
    pub async fn publish<T: Serialize>(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &T,
    ) -> Result<(), AmqpError> {
        let channel = self.open_channel().await?;

        let result = self
            .publish_on(&channel, exchange, routing_key, message)
            .await;

        close_channel(&channel).await;
        result
    }

    /// Publishes a batch of messages over one channel.
    ///
    /// Stops at the first failure; messages published before the failure are
    /// already on the broker.
    pub async fn publish_batch<T: Serialize>(
        &self,
        exchange: &str,
        routing_key: &str,
        messages: &[T],
    ) -> Result<(), AmqpError> {
        let channel = self.open_channel().await?;

        let mut result = Ok(());
        for message in messages {
            result = self
                .publish_on(&channel, exchange, routing_key, message)
                .await;

            if result.is_err() {
                break;
            }
        }

        close_channel(&channel).await;
        result
    }

    /// Publishes a batch atomically inside an AMQP transaction.
    ///
    /// Either every message is committed or the transaction is rolled back
    /// and none is visible to consumers.
    pub async fn publish_batch_transactional<T: Serialize>(
        &self,
        exchange: &str,
        routing_key: &str,
        messages: &[T],
    ) -> Result<(), AmqpError> {
        let channel = self.open_channel().await?;

        if let Err(err) = channel.tx_select().await {
            error!(error = err.to_string(), "error to select publish transaction");
            close_channel(&channel).await;
            return Err(AmqpError::TransactionError);
        }

        for message in messages {
            if let Err(err) = self
                .publish_on(&channel, exchange, routing_key, message)
                .await
            {
                if let Err(rollback) = channel.tx_rollback().await {
                    error!(
                        error = rollback.to_string(),
                        "error to rollback publish transaction"
                    );
                }

                close_channel(&channel).await;
                return Err(err);
            }
        }

        let result = match channel.tx_commit().await {
            Ok(_) => Ok(()),
            Err(err) => {
                error!(error = err.to_string(), "error to commit publish transaction");
                Err(AmqpError::TransactionError)
            }
        };

        close_channel(&channel).await;
        result
    }

    async fn publish_on<T: Serialize>(
        &self,
        channel: &Channel,
        exchange: &str,
        routing_key: &str,
        message: &T,
    ) -> Result<(), AmqpError> {
        let payload = self
            .serializer
            .serialize(message)
            .map_err(|err| {
                error!(error = err.to_string(), "error serializing message");
                AmqpError::PublishingError
            })?;

        match channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &payload,
                self.properties(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError)
            }
            _ => Ok(()),
        }
    }

    fn properties(&self) -> BasicProperties {
        let mut headers = BTreeMap::new();
        otel::inject_trace_headers(&Context::current(), &mut headers);

        BasicProperties::default()
            .with_content_type(ShortString::from(self.serializer.content_type()))
            .with_delivery_mode(2)
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_headers(FieldTable::from(headers))
    }

    async fn open_channel(&self) -> Result<Channel, AmqpError> {
        let connection = self.pool.get_connection().await?;
        connection.create_channel().await
    }
}

async fn close_channel(channel: &Channel) {
    if let Err(err) = channel.close(200, "publish done").await {
        debug!(error = err.to_string(), "error closing publish channel");
    }
}
