// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Management
//!
//! This module declares the broker-side topology this library consumes from
//! and publishes to: exchanges, queues, and the bindings between them. Queues
//! flagged for rejection handling additionally get a fanout rejection
//! exchange plus a bound audit queue, so discarded payloads stay inspectable.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    pool::ConnectionPool,
    queue::{QueueBinding, QueueDefinition},
    rejection::rejection_exchange_name,
};
use async_trait::async_trait;
use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable, LongInt, ShortString},
    Channel,
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error};

/// Header field selecting the per-message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Header field selecting the maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";

/// Trait defining the interface for topology management.
///
/// Definitions are registered first; `install` declares everything on the
/// broker in dependency order.
#[async_trait]
pub trait Topology<'tp> {
    /// Adds an exchange definition to the topology.
    fn exchange(self, def: &'tp ExchangeDefinition<'tp>) -> Self;

    /// Adds a queue definition to the topology.
    fn queue(self, def: &'tp QueueDefinition) -> Self;

    /// Adds a queue-to-exchange binding to the topology.
    fn queue_binding(self, binding: &'tp QueueBinding<'tp>) -> Self;

    /// Installs the topology to the RabbitMQ server.
    async fn install(&self) -> Result<(), AmqpError>;
}

/// RabbitMQ implementation of the [`Topology`] trait.
pub struct AmqpTopology<'tp> {
    pool: Arc<ConnectionPool>,
    pub(crate) exchanges: Vec<&'tp ExchangeDefinition<'tp>>,
    pub(crate) queues: Vec<&'tp QueueDefinition>,
    pub(crate) queues_binding: Vec<&'tp QueueBinding<'tp>>,
}

impl<'tp> AmqpTopology<'tp> {
    /// Creates an empty topology over the shared connection pool.
    pub fn new(pool: Arc<ConnectionPool>) -> AmqpTopology<'tp> {
        AmqpTopology {
            pool,
            exchanges: vec![],
            queues: vec![],
            queues_binding: vec![],
        }
    }
}

#[async_trait]
impl<'tp> Topology<'tp> for AmqpTopology<'tp> {
    fn exchange(mut self, def: &'tp ExchangeDefinition<'tp>) -> Self {
        self.exchanges.push(def);
        self
    }

    fn queue(mut self, def: &'tp QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    fn queue_binding(mut self, binding: &'tp QueueBinding<'tp>) -> Self {
        self.queues_binding.push(binding);
        self
    }

    /// Installs the topology to the RabbitMQ server.
    ///
    /// Declares exchanges first, then queues (with their rejection exchanges
    /// and audit queues), then bindings, over one short-lived channel.
    async fn install(&self) -> Result<(), AmqpError> {
        let connection = self.pool.get_connection().await?;
        let channel = connection.create_channel().await?;

        let result = self.install_on(&channel).await;

        if let Err(err) = channel.close(200, "topology installed").await {
            debug!(error = err.to_string(), "error closing topology channel");
        }

        result
    }
}

impl AmqpTopology<'_> {
    async fn install_on(&self, channel: &Channel) -> Result<(), AmqpError> {
        for exchange in &self.exchanges {
            declare_exchange(channel, exchange).await?;
        }

        for queue in &self.queues {
            self.install_queue(channel, queue).await?;
        }

        for binding in &self.queues_binding {
            bind_queue(
                channel,
                binding.queue_name,
                binding.exchange_name,
                binding.routing_key,
            )
            .await?;
        }

        Ok(())
    }

    async fn install_queue(
        &self,
        channel: &Channel,
        def: &QueueDefinition,
    ) -> Result<(), AmqpError> {
        debug!("creating queue: {}", def.name);

        let mut queue_args = BTreeMap::new();

        if let Some(ttl) = def.ttl {
            queue_args.insert(
                ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
                AMQPValue::LongInt(LongInt::from(ttl)),
            );
        }

        if let Some(max_length) = def.max_length {
            queue_args.insert(
                ShortString::from(AMQP_HEADERS_MAX_LENGTH),
                AMQPValue::LongInt(LongInt::from(max_length)),
            );
        }

        match channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.auto_delete,
                    nowait: false,
                },
                FieldTable::from(queue_args),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name,
                    "error to declare the queue"
                );
                return Err(AmqpError::DeclareQueueError(def.name.clone()));
            }
            _ => debug!("queue: {} was created", def.name),
        }

        if def.with_rejection {
            self.install_rejection(channel, def).await?;
        }

        Ok(())
    }

    /// Declares the queue's rejection exchange and its audit queue.
    ///
    /// The exchange receives raw bodies the worker permanently discards; the
    /// audit queue keeps them durable.
    async fn install_rejection(
        &self,
        channel: &Channel,
        def: &QueueDefinition,
    ) -> Result<(), AmqpError> {
        let exchange_name = rejection_exchange_name(&def.name);
        let exchange = ExchangeDefinition::new(&exchange_name).fanout();

        declare_exchange(channel, &exchange).await?;

        match channel
            .queue_declare(
                &exchange_name,
                QueueDeclareOptions {
                    passive: false,
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = exchange_name,
                    "error to declare the rejection queue"
                );
                return Err(AmqpError::DeclareQueueError(exchange_name));
            }
            _ => debug!("rejection queue: {} was created", exchange_name),
        }

        bind_queue(channel, &exchange_name, &exchange_name, "").await
    }
}

async fn declare_exchange(
    channel: &Channel,
    def: &ExchangeDefinition<'_>,
) -> Result<(), AmqpError> {
    debug!("creating exchange: {}", def.name);

    match channel
        .exchange_declare(
            def.name,
            def.kind.into(),
            ExchangeDeclareOptions {
                passive: false,
                durable: def.durable,
                auto_delete: def.auto_delete,
                internal: def.internal,
                nowait: false,
            },
            FieldTable::default(),
        )
        .await
    {
        Err(err) => {
            error!(
                error = err.to_string(),
                name = def.name,
                "error to declare the exchange"
            );
            Err(AmqpError::DeclareExchangeError(def.name.to_owned()))
        }
        _ => {
            debug!("exchange: {} was created", def.name);
            Ok(())
        }
    }
}

async fn bind_queue(
    channel: &Channel,
    queue_name: &str,
    exchange_name: &str,
    routing_key: &str,
) -> Result<(), AmqpError> {
    debug!(
        "binding queue: {} to the exchange: {} with the key: {}",
        queue_name, exchange_name, routing_key
    );

    match channel
        .queue_bind(
            queue_name,
            exchange_name,
            routing_key,
            QueueBindOptions { nowait: false },
            FieldTable::default(),
        )
        .await
    {
        Err(err) => {
            error!(error = err.to_string(), "error to bind queue to exchange");
            Err(AmqpError::BindQueueError(
                queue_name.to_owned(),
                exchange_name.to_owned(),
            ))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;

    #[test]
    fn registration_accumulates_definitions() {
        let pool = Arc::new(ConnectionPool::new(ConnectionConfig::default()));

        let exchange = ExchangeDefinition::new("commerce");
        let queue = QueueDefinition::new("orders").with_rejection_exchange();
        let binding = QueueBinding::new("orders")
            .exchange("commerce")
            .routing_key("orders.*");

        let topology = AmqpTopology::new(pool)
            .exchange(&exchange)
            .queue(&queue)
            .queue_binding(&binding);

        assert_eq!(topology.exchanges.len(), 1);
        assert_eq!(topology.queues.len(), 1);
        assert_eq!(topology.queues_binding.len(), 1);
    }
}
