// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # rabbitmq-consumers
//!
//! Self-scaling RabbitMQ consumer runtime: a pool of per-channel
//! subscriptions pulls typed messages from a queue, hands each one to a
//! user-supplied handler, and translates the outcome into broker
//! acknowledgements with configurable retry, requeue, and discard semantics.

mod otel;

pub mod client;
pub mod config;
pub mod consumer;
pub mod errors;
pub mod exchange;
pub mod feedback;
pub mod pool;
pub mod publisher;
pub mod queue;
pub mod rejection;
pub mod scaling;
pub mod serializer;
pub mod signals;
pub mod topology;
pub mod worker;

pub use client::RabbitMQClient;
pub use config::ConnectionConfig;
pub use consumer::RabbitMQConsumer;
pub use errors::AmqpError;
pub use scaling::{ConsumerCountManager, ConsumerCountManagerConfig};
pub use signals::{ExceptionHandlingStrategy, HandlerError, QueuingSignal, QueuingSignalKind};
pub use worker::{MessageHandler, WorkerConfig};
