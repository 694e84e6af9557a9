// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Rejection Handling
//!
//! This module provides the terminal sink for payloads the runtime gives up
//! on: bodies that cannot be deserialized and messages the processing worker
//! permanently discards. The default implementation publishes the raw body to
//! a per-queue rejection exchange for durable audit; the broker-side nack is
//! issued by the worker regardless of whether that publish succeeds.

use crate::{errors::AmqpError, pool::ConnectionPool};
use async_trait::async_trait;
use lapin::{options::BasicPublishOptions, BasicProperties};
use std::sync::Arc;
use tracing::{debug, warn};

/// Name of the rejection exchange derived from a queue name.
pub fn rejection_exchange_name(queue_name: &str) -> String {
    format!("{queue_name}.rejected")
}

/// A payload the runtime has permanently given up on.
#[derive(Debug, Clone)]
pub struct RejectedMessage {
    /// Raw delivery body, exactly as received
    pub body: Vec<u8>,
    /// Why the message was rejected
    pub reason: String,
    /// Queue the message was consumed from
    pub queue_name: String,
    /// Virtual host of the originating connection
    pub virtual_host: String,
}

/// Terminal sink for rejected payloads.
///
/// Implementations must not fail the caller: whatever happens here, the
/// worker has already decided the message is discarded.
#[async_trait]
pub trait MessageRejectionHandler: Send + Sync {
    /// Receives a payload that could not be deserialized or was permanently
    /// discarded by the processing worker.
    async fn on_message_rejection(&self, rejection: RejectedMessage);
}

/// Default rejection handler: publish the raw body to the queue's rejection
/// exchange.
///
/// Publish failures are logged and swallowed; the delivery's nack has already
/// been (or will be) issued by the worker.
pub struct RejectionPublisher {
    pool: Arc<ConnectionPool>,
}

impl RejectionPublisher {
    /// Creates a rejection publisher over the shared connection pool.
    pub fn new(pool: Arc<ConnectionPool>) -> RejectionPublisher {
        RejectionPublisher { pool }
    }

    async fn publish(&self, rejection: &RejectedMessage) -> Result<(), AmqpError> {
        let exchange = rejection_exchange_name(&rejection.queue_name);

        let connection = self.pool.get_connection().await?;
        let channel = connection.create_channel().await?;

        let result = channel
            .basic_publish(
                &exchange,
                "",
                BasicPublishOptions::default(),
                &rejection.body,
                BasicProperties::default().with_delivery_mode(2),
            )
            .await;

        if let Err(err) = channel.close(200, "rejection published").await {
            debug!(error = err.to_string(), "error closing rejection channel");
        }

        result.map(|_| ()).map_err(|err| {
            warn!(
                error = err.to_string(),
                exchange, "error publishing rejected payload"
            );
            AmqpError::PublishingError
        })
    }
}

#[async_trait]
impl MessageRejectionHandler for RejectionPublisher {
    async fn on_message_rejection(&self, rejection: RejectedMessage) {
        debug!(
            queue = rejection.queue_name,
            reason = rejection.reason,
            "routing rejected payload to the rejection exchange"
        );

        if let Err(err) = self.publish(&rejection).await {
            warn!(
                error = err.to_string(),
                queue = rejection.queue_name,
                "rejected payload could not be published, dropping it"
            );
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_exchange_derives_from_queue_name() {
        assert_eq!(rejection_exchange_name("orders"), "orders.rejected");
        assert_eq!(
            rejection_exchange_name("billing.invoices"),
            "billing.invoices.rejected"
        );
    }
}
