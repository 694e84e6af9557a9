// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Consumer Runtime
//!
//! This module provides the error taxonomy shared by the connection pool,
//! the queue consumer, the processing worker, and the publishing helpers.
//! Recoverable faults (dropped channels, dropped connections) are absorbed
//! and logged by the components that observe them; only a handful of
//! variants cross the public boundary.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Only `BrokerUnreachable` (surfaced by `start` and the publish helpers when
/// the pool cannot obtain a connection) and `PoolDisposed` (terminal) are
/// expected to reach callers during steady-state operation. The remaining
/// variants describe per-operation failures that the runtime logs and
/// recovers from.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// The pool could not open a connection within its bounded retry budget
    #[error("broker unreachable after `{0}` connection attempts")]
    BrokerUnreachable(u32),

    /// The pool was disposed; all further operations fail
    #[error("connection pool disposed")]
    PoolDisposed,

    /// The broker closed an established connection
    #[error("connection dropped by the broker")]
    ConnectionDropped,

    /// The broker closed a channel mid-operation
    #[error("channel dropped by the broker")]
    ChannelDropped,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// A configuration record violated one of its invariants
    #[error("invalid configuration: {0}")]
    ConfigError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error deleting a queue with the given name
    #[error("failure to delete a queue `{0}`")]
    DeleteQueueError(String),

    /// Error purging a queue with the given name
    #[error("failure to purge a queue `{0}`")]
    PurgeQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{0}` to exchange `{1}`")]
    BindQueueError(String, String),

    /// Error starting a consumer on a queue
    #[error("failure to declare consumer on queue `{0}`")]
    BindingConsumerError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos on queue `{0}`")]
    QoSDeclarationError(String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error committing or rolling back a publish transaction
    #[error("failure to complete publish transaction")]
    TransactionError,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// A feedback sender was resolved a second time
    #[error("feedback already sent for delivery tag `{0}`")]
    FeedbackAlreadySent(u64),

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),
}
