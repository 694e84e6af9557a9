// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! This module provides the builder used to declare queues. Queues default to
//! durable, non-exclusive and non-auto-delete, the shape this library's
//! consumers expect. A definition may additionally request a rejection
//! exchange, which the topology installer declares alongside the queue for
//! durable audit of discarded payloads.

/// Definition of a RabbitMQ queue with its declaration parameters.
///
/// This struct implements the builder pattern. The defaults match what the
/// consumer runtime assumes: durable queues that survive broker restarts.
#[derive(Debug, Clone, Default)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) exclusive: bool,
    pub(crate) auto_delete: bool,
    pub(crate) ttl: Option<i32>,
    pub(crate) max_length: Option<i32>,
    pub(crate) with_rejection: bool,
}

impl QueueDefinition {
    /// Creates a durable queue definition with the given name.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            durable: true,
            exclusive: false,
            auto_delete: false,
            ttl: None,
            max_length: None,
            with_rejection: false,
        }
    }

    /// The queue name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Makes the queue transient; it will not survive a broker restart.
    pub fn transient(mut self) -> Self {
        self.durable = false;
        self
    }

    /// Makes the queue exclusive to the declaring connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Deletes the queue automatically once its last consumer leaves.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Sets the per-message Time-To-Live in milliseconds.
    pub fn ttl(mut self, ttl: i32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets the maximum number of messages the queue can hold.
    pub fn max_length(mut self, max: i32) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Declares a rejection exchange next to the queue.
    ///
    /// The exchange receives raw bodies the consumer runtime permanently
    /// discards; its name is derived from the queue name.
    pub fn with_rejection_exchange(mut self) -> Self {
        self.with_rejection = true;
        self
    }
}

/// Configuration for binding a queue to an exchange.
pub struct QueueBinding<'qb> {
    pub(crate) queue_name: &'qb str,
    pub(crate) exchange_name: &'qb str,
    pub(crate) routing_key: &'qb str,
}

impl<'qb> QueueBinding<'qb> {
    /// Creates a binding for the given queue.
    ///
    /// The exchange and routing key default to empty strings and should be
    /// set with [`exchange`](QueueBinding::exchange) and
    /// [`routing_key`](QueueBinding::routing_key).
    pub fn new(queue: &'qb str) -> QueueBinding<'qb> {
        QueueBinding {
            queue_name: queue,
            exchange_name: "",
            routing_key: "",
        }
    }

    /// Sets the exchange to bind the queue to.
    pub fn exchange(mut self, exchange: &'qb str) -> Self {
        self.exchange_name = exchange;
        self
    }

    /// Sets the routing key for the binding.
    pub fn routing_key(mut self, key: &'qb str) -> Self {
        self.routing_key = key;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queues_are_durable_by_default() {
        let def = QueueDefinition::new("orders");

        assert_eq!(def.name(), "orders");
        assert!(def.durable);
        assert!(!def.exclusive);
        assert!(!def.auto_delete);
        assert!(!def.with_rejection);
    }

    #[test]
    fn builder_flags_compose() {
        let def = QueueDefinition::new("orders")
            .transient()
            .exclusive()
            .auto_delete()
            .ttl(60_000)
            .max_length(10_000)
            .with_rejection_exchange();

        assert!(!def.durable);
        assert!(def.exclusive);
        assert!(def.auto_delete);
        assert_eq!(def.ttl, Some(60_000));
        assert_eq!(def.max_length, Some(10_000));
        assert!(def.with_rejection);
    }

    #[test]
    fn binding_builder_sets_all_parts() {
        let binding = QueueBinding::new("orders")
            .exchange("commerce")
            .routing_key("orders.created");

        assert_eq!(binding.queue_name, "orders");
        assert_eq!(binding.exchange_name, "commerce");
        assert_eq!(binding.routing_key, "orders.created");
    }
}
