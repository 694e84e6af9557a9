// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Client Facade
//!
//! This module ties the library together: a [`RabbitMQClient`] owns the
//! connection pool and the serializer, declares topology, exposes queue
//! helpers, and constructs self-scaling consumers bound to a handler, a
//! count manager, and a rejection handler. Construction is total and does no
//! I/O; every broker interaction is an explicit async method.

use crate::{
    config::ConnectionConfig,
    consumer::RabbitMQConsumer,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    pool::ConnectionPool,
    publisher::RabbitMQPublisher,
    queue::{QueueBinding, QueueDefinition},
    rejection::{MessageRejectionHandler, RejectionPublisher},
    scaling::ConsumerCountManager,
    serializer::{JsonSerializer, Serializer},
    topology::{AmqpTopology, Topology},
    worker::{MessageHandler, ProcessingWorker, WorkerConfig},
};
use lapin::{
    options::{QueueDeclareOptions, QueueDeleteOptions, QueuePurgeOptions},
    types::FieldTable,
};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::{debug, error};

/// Facade over a shared connection pool for one broker.
///
/// Clients are cheap to construct and may share a pool; the pool is only
/// torn down by [`dispose`](RabbitMQClient::dispose).
pub struct RabbitMQClient<S = JsonSerializer> {
    pool: Arc<ConnectionPool>,
    serializer: Arc<S>,
    vhost: String,
}

impl RabbitMQClient<JsonSerializer> {
    /// Creates a client with the default JSON serializer.
    ///
    /// # Parameters
    /// * `config` - Connection details for the broker
    ///
    /// # Returns
    /// A client over a fresh pool; no broker I/O happens until a method needs it
    pub fn new(config: ConnectionConfig) -> RabbitMQClient<JsonSerializer> {
        RabbitMQClient::with_serializer(config, JsonSerializer)
    }
}

impl<S: Serializer> RabbitMQClient<S> {
    /// Creates a client with a custom serializer.
    ///
    /// # Parameters
    /// * `config` - Connection details for the broker
    /// * `serializer` - Codec shared by the publish helpers and consumers
    ///
    /// # Returns
    /// A client over a fresh pool
    pub fn with_serializer(config: ConnectionConfig, serializer: S) -> RabbitMQClient<S> {
        let vhost = config.vhost.clone();

        RabbitMQClient {
            pool: Arc::new(ConnectionPool::new(config)),
            serializer: Arc::new(serializer),
            vhost,
        }
    }

    /// Creates a client over an existing shared pool.
    ///
    /// # Parameters
    /// * `pool` - A pool already shared with other clients or consumers
    /// * `serializer` - Codec shared by the publish helpers and consumers
    ///
    /// # Returns
    /// A client borrowing the pool's connections and virtual host
    pub fn with_pool(pool: Arc<ConnectionPool>, serializer: S) -> RabbitMQClient<S> {
        let vhost = pool.virtual_host().to_owned();

        RabbitMQClient {
            pool,
            serializer: Arc::new(serializer),
            vhost,
        }
    }

    /// The shared connection pool.
    ///
    /// # Returns
    /// A handle suitable for `with_pool` on further clients
    pub fn connection_pool(&self) -> Arc<ConnectionPool> {
        self.pool.clone()
    }

    /// A typed publisher sharing this client's pool and serializer.
    ///
    /// # Returns
    /// A publisher for single, batch, and transactional batch publishes
    pub fn publisher(&self) -> RabbitMQPublisher<S> {
        RabbitMQPublisher::new(self.pool.clone(), self.serializer.clone())
    }

    /// Builds an empty topology over this client's pool.
    ///
    /// # Returns
    /// A topology builder; register definitions, then `install`
    pub fn topology<'tp>(&self) -> AmqpTopology<'tp> {
        AmqpTopology::new(self.pool.clone())
    }

    /// Declares a queue (and its rejection exchange, if requested).
    ///
    /// # Parameters
    /// * `def` - The queue definition to declare
    ///
    /// # Returns
    /// Ok(()) on success or AmqpError on failure
    pub async fn ensure_queue_exists(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        self.topology().queue(def).install().await
    }

    /// Declares an exchange.
    ///
    /// # Parameters
    /// * `def` - The exchange definition to declare
    ///
    /// # Returns
    /// Ok(()) on success or AmqpError on failure
    pub async fn ensure_exchange_exists(
        &self,
        def: &ExchangeDefinition<'_>,
    ) -> Result<(), AmqpError> {
        self.topology().exchange(def).install().await
    }

    /// Binds a queue to an exchange.
    ///
    /// # Parameters
    /// * `binding` - Queue, exchange and routing key to bind
    ///
    /// # Returns
    /// Ok(()) on success or AmqpError on failure
    pub async fn bind_queue(&self, binding: &QueueBinding<'_>) -> Result<(), AmqpError> {
        self.topology().queue_binding(binding).install().await
    }

    /// Broker-reported depth of a queue, read through a passive declare.
    ///
    /// # Parameters
    /// * `queue_name` - The queue to probe
    ///
    /// # Returns
    /// The number of ready messages, or AmqpError when the probe fails
    pub async fn queue_depth(&self, queue_name: &str) -> Result<u32, AmqpError> {
        let connection = self.pool.get_connection().await?;
        let channel = connection.create_channel().await?;

        let declared = channel
            .queue_declare(
                queue_name,
                QueueDeclareOptions {
                    passive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await;

        close_channel(&channel).await;

        match declared {
            Ok(queue) => Ok(queue.message_count()),
            Err(err) => {
                error!(error = err.to_string(), queue_name, "error probing queue");
                Err(AmqpError::DeclareQueueError(queue_name.to_owned()))
            }
        }
    }

    /// Deletes a queue.
    ///
    /// # Parameters
    /// * `queue_name` - The queue to delete
    ///
    /// # Returns
    /// Ok(()) on success or AmqpError on failure
    pub async fn delete_queue(&self, queue_name: &str) -> Result<(), AmqpError> {
        let connection = self.pool.get_connection().await?;
        let channel = connection.create_channel().await?;

        let deleted = channel
            .queue_delete(queue_name, QueueDeleteOptions::default())
            .await;

        close_channel(&channel).await;

        match deleted {
            Ok(_) => Ok(()),
            Err(err) => {
                error!(error = err.to_string(), queue_name, "error deleting queue");
                Err(AmqpError::DeleteQueueError(queue_name.to_owned()))
            }
        }
    }

    /// Purges all ready messages from a queue.
    ///
    /// # Parameters
    /// * `queue_name` - The queue to purge
    ///
    /// # Returns
    /// Ok(()) on success or AmqpError on failure
    pub async fn purge_queue(&self, queue_name: &str) -> Result<(), AmqpError> {
        let connection = self.pool.get_connection().await?;
        let channel = connection.create_channel().await?;

        let purged = channel
            .queue_purge(queue_name, QueuePurgeOptions::default())
            .await;

        close_channel(&channel).await;

        match purged {
            Ok(_) => Ok(()),
            Err(err) => {
                error!(error = err.to_string(), queue_name, "error purging queue");
                Err(AmqpError::PurgeQueueError(queue_name.to_owned()))
            }
        }
    }

    /// Constructs a self-scaling consumer with the default rejection handler.
    ///
    /// Discarded payloads are published to the queue's rejection exchange.
    /// Construction is total; call [`RabbitMQConsumer::start`] to engage the
    /// broker.
    ///
    /// # Parameters
    /// * `queue_name` - The queue to consume from
    /// * `handler` - User callback receiving deserialized messages
    /// * `worker_config` - Retry policy for the processing worker
    /// * `count_manager` - Policy deciding the subscription count
    ///
    /// # Returns
    /// An idle consumer bound to this client's pool and serializer
    pub fn create_consumer<T, H>(
        &self,
        queue_name: &str,
        handler: Arc<H>,
        worker_config: WorkerConfig,
        count_manager: Arc<dyn ConsumerCountManager>,
    ) -> RabbitMQConsumer
    where
        T: DeserializeOwned + Send + Sync + 'static,
        H: MessageHandler<T> + 'static,
    {
        let rejection_handler = Arc::new(RejectionPublisher::new(self.pool.clone()));

        self.create_consumer_with_rejection(
            queue_name,
            handler,
            worker_config,
            count_manager,
            rejection_handler,
        )
    }

    /// Constructs a self-scaling consumer with a custom rejection handler.
    ///
    /// # Parameters
    /// * `queue_name` - The queue to consume from
    /// * `handler` - User callback receiving deserialized messages
    /// * `worker_config` - Retry policy for the processing worker
    /// * `count_manager` - Policy deciding the subscription count
    /// * `rejection_handler` - Terminal sink for discarded payloads
    ///
    /// # Returns
    /// An idle consumer bound to this client's pool and serializer
    pub fn create_consumer_with_rejection<T, H>(
        &self,
        queue_name: &str,
        handler: Arc<H>,
        worker_config: WorkerConfig,
        count_manager: Arc<dyn ConsumerCountManager>,
        rejection_handler: Arc<dyn MessageRejectionHandler>,
    ) -> RabbitMQConsumer
    where
        T: DeserializeOwned + Send + Sync + 'static,
        H: MessageHandler<T> + 'static,
    {
        let worker = ProcessingWorker::<T, H, S>::new(
            handler,
            self.serializer.clone(),
            rejection_handler,
            worker_config,
            queue_name,
            &self.vhost,
        );

        RabbitMQConsumer::new(queue_name, self.pool.clone(), Arc::new(worker), count_manager)
    }

    /// Disposes the shared pool; every client over it becomes unusable.
    ///
    /// Terminal: subsequent operations on any client sharing the pool fail
    /// with `PoolDisposed`.
    pub async fn dispose(&self) {
        self.pool.dispose().await;
    }
}

async fn close_channel(channel: &lapin::Channel) {
    if let Err(err) = channel.close(200, "client operation done").await {
        debug!(error = err.to_string(), "error closing client channel");
    }
}
