// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Consumer
//!
//! This module implements the self-scaling consumer loop for one queue. A
//! started consumer runs a scaling task that wakes on the count manager's
//! interval, reads the broker-reported queue depth through a passive declare,
//! and reconciles the set of subscriptions against the returned target. Each
//! subscription owns a dedicated channel in manual-ack mode with a prefetch
//! of 1, so the concurrency bound is exactly the number of active
//! subscriptions and deliveries within one subscription are processed
//! strictly in order.
//!
//! Faults are absorbed: a dropped channel retires its subscription (the next
//! tick re-creates it), a dropped connection heals inside the pool, and an
//! unreachable broker leaves the consumer running with zero subscriptions,
//! retrying every tick until `stop` is called.

use crate::{
    errors::AmqpError,
    feedback::{Acknowledger, ChannelAcknowledger, FeedbackSender},
    pool::ConnectionPool,
    scaling::ConsumerCountManager,
    worker::{DeliveryProcessor, ProcessingOutcome},
};
use futures_util::StreamExt;
use lapin::{
    message::Delivery,
    options::{BasicCancelOptions, BasicConsumeOptions, BasicQosOptions, QueueDeclareOptions},
    types::FieldTable,
    Channel,
};
use opentelemetry::{
    global,
    trace::{Span, Status},
};
use std::{
    borrow::Cow,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Self-scaling consumer bound to one queue.
///
/// Construction is total and does no I/O; [`start`](RabbitMQConsumer::start)
/// is the only operation that engages the broker.
pub struct RabbitMQConsumer {
    inner: Arc<ConsumerInner>,
}

struct ConsumerInner {
    queue_name: String,
    pool: Arc<ConnectionPool>,
    processor: Arc<dyn DeliveryProcessor>,
    count_manager: Arc<dyn ConsumerCountManager>,
    cancel: CancellationToken,
    running: AtomicBool,
    subscriptions: Mutex<Vec<Subscription>>,
    scaling_task: Mutex<Option<JoinHandle<()>>>,
}

/// One active basic.consume on its own channel.
///
/// Lifecycle: Starting -> Running -> Draining -> Closed. Draining is entered
/// on scale-down or stop by cancelling `drain`; the task cancels the
/// broker-side consumer, finishes its in-flight delivery and closes the
/// channel. A Draining subscription still counts as active until Closed,
/// because its in-flight delivery may still be processing.
struct Subscription {
    consumer_tag: String,
    drain: CancellationToken,
    handle: JoinHandle<()>,
}

impl Subscription {
    /// Running or Draining; the task has not closed its channel yet.
    fn is_active(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Running and still accepting new deliveries.
    fn is_accepting(&self) -> bool {
        !self.drain.is_cancelled() && !self.handle.is_finished()
    }
}

impl RabbitMQConsumer {
    /// Creates a consumer for the given queue.
    ///
    /// The processor receives every delivery paired with a fresh
    /// [`FeedbackSender`]; the count manager is polled on its own interval to
    /// decide the subscription count.
    ///
    /// # Parameters
    /// * `queue_name` - The queue to consume from
    /// * `pool` - Shared connection pool the subscriptions draw channels from
    /// * `processor` - Per-delivery processing seam, usually a `ProcessingWorker`
    /// * `count_manager` - Policy deciding the target subscription count
    ///
    /// # Returns
    /// An idle consumer; no broker I/O happens until `start`
    pub fn new(
        queue_name: &str,
        pool: Arc<ConnectionPool>,
        processor: Arc<dyn DeliveryProcessor>,
        count_manager: Arc<dyn ConsumerCountManager>,
    ) -> RabbitMQConsumer {
        RabbitMQConsumer {
            inner: Arc::new(ConsumerInner {
                queue_name: queue_name.to_owned(),
                pool,
                processor,
                count_manager,
                cancel: CancellationToken::new(),
                running: AtomicBool::new(false),
                subscriptions: Mutex::new(Vec::new()),
                scaling_task: Mutex::new(None),
            }),
        }
    }

    /// The queue this consumer drains.
    ///
    /// # Returns
    /// The queue name this consumer was constructed with
    pub fn queue_name(&self) -> &str {
        &self.inner.queue_name
    }

    /// How often the scaling loop reconciles.
    ///
    /// # Returns
    /// The count manager's reconcile interval
    pub fn scaling_interval(&self) -> Duration {
        self.inner.count_manager.scale_interval()
    }

    /// Whether the consumer has been started and not yet stopped.
    ///
    /// # Returns
    /// true between a successful `start` and the next `stop`
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Number of subscriptions that are not yet closed.
    ///
    /// Draining subscriptions keep counting until their in-flight delivery
    /// resolves and the channel closes, so in-flight handler invocations
    /// never exceed this count.
    ///
    /// # Returns
    /// The number of Running and Draining subscriptions
    pub async fn active_subscriptions(&self) -> usize {
        self.inner
            .subscriptions
            .lock()
            .await
            .iter()
            .filter(|sub| sub.is_active())
            .count()
    }

    /// Starts the scaling loop.
    ///
    /// Verifies the broker is reachable, then spawns the scaling task. The
    /// first reconcile happens immediately; subscriptions follow from it.
    ///
    /// # Returns
    /// Ok(()) once the scaling loop is running, `BrokerUnreachable` or
    /// `PoolDisposed` when the pool cannot provide a connection, or
    /// `ConsumerError` when the consumer is already running or was stopped
    pub async fn start(&self) -> Result<(), AmqpError> {
        if self.inner.cancel.is_cancelled() {
            return Err(AmqpError::ConsumerError(
                "consumer already stopped".to_owned(),
            ));
        }

        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(AmqpError::ConsumerError("consumer already running".to_owned()));
        }

        match self.inner.pool.get_connection().await {
            Ok(_) => {}
            Err(err) => {
                self.inner.running.store(false, Ordering::SeqCst);
                return Err(err);
            }
        }

        info!(queue = self.inner.queue_name, "starting consumer");

        let inner = self.inner.clone();
        let task = tokio::spawn(scaling_loop(inner));
        *self.inner.scaling_task.lock().await = Some(task);

        Ok(())
    }

    /// Stops the consumer, waiting up to `grace` for in-flight deliveries.
    ///
    /// Cancels the root token (which unwinds retry sleeps and drains every
    /// subscription), then waits. Subscriptions that do not finish within the
    /// grace period are aborted; their unacked deliveries are redelivered by
    /// the broker.
    ///
    /// # Parameters
    /// * `grace` - How long to wait for in-flight deliveries to resolve
    pub async fn stop(&self, grace: Duration) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }

        info!(queue = self.inner.queue_name, "stopping consumer");
        self.inner.cancel.cancel();

        if let Some(task) = self.inner.scaling_task.lock().await.take() {
            let _ = task.await;
        }

        let subscriptions = {
            let mut guard = self.inner.subscriptions.lock().await;
            std::mem::take(&mut *guard)
        };

        let deadline = Instant::now() + grace;
        for mut subscription in subscriptions {
            let remaining = deadline.saturating_duration_since(Instant::now());

            if tokio::time::timeout(remaining, &mut subscription.handle)
                .await
                .is_err()
            {
                warn!(
                    queue = self.inner.queue_name,
                    consumer_tag = subscription.consumer_tag,
                    "grace period elapsed, abandoning in-flight delivery"
                );
                subscription.handle.abort();
            }
        }

        info!(queue = self.inner.queue_name, "consumer stopped");
    }
}

/// Wakes on the scaling interval and reconciles until cancelled.
async fn scaling_loop(inner: Arc<ConsumerInner>) {
    let interval = inner.count_manager.scale_interval();

    loop {
        if let Err(err) = reconcile(&inner).await {
            warn!(
                error = err.to_string(),
                queue = inner.queue_name,
                "scaling tick failed, retrying on the next interval"
            );
        }

        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    debug!(queue = inner.queue_name, "scaling loop stopped");
}

/// One scaling tick: probe depth, ask the count manager, converge.
async fn reconcile(inner: &Arc<ConsumerInner>) -> Result<(), AmqpError> {
    let depth = queue_depth(inner).await?;

    let mut subscriptions = inner.subscriptions.lock().await;
    subscriptions.retain(|sub| !sub.handle.is_finished());

    // Running and Draining both count; scale-up waits for drains to close
    // so the subscription count stays within the configured maximum
    let active = subscriptions.len() as u32;
    let target = inner.count_manager.target_scale(depth, active);

    if active < target {
        debug!(
            queue = inner.queue_name,
            depth, active, target, "scaling up"
        );

        for _ in 0..(target - active) {
            subscriptions.push(spawn_subscription(inner));
        }
    } else if active > target {
        debug!(
            queue = inner.queue_name,
            depth, active, target, "scaling down"
        );

        // retire the newest accepting subscriptions first; ones already
        // draining keep counting until they close
        let mut excess = active - target;
        for subscription in subscriptions.iter().rev() {
            if excess == 0 {
                break;
            }

            if subscription.is_accepting() {
                subscription.drain.cancel();
                excess -= 1;
            }
        }
    }

    Ok(())
}

/// Reads the broker-reported depth through a passive declare.
///
/// Uses a short-lived channel of its own; the scaling loop never touches a
/// subscription's channel.
async fn queue_depth(inner: &Arc<ConsumerInner>) -> Result<u32, AmqpError> {
    let connection = inner.pool.get_connection().await?;
    let channel = connection.create_channel().await?;

    let declared = channel
        .queue_declare(
            &inner.queue_name,
            QueueDeclareOptions {
                passive: true,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await;

    if let Err(err) = channel.close(200, "depth probe done").await {
        debug!(error = err.to_string(), "error closing depth probe channel");
    }

    match declared {
        Ok(queue) => Ok(queue.message_count()),
        Err(err) => {
            warn!(
                error = err.to_string(),
                queue = inner.queue_name,
                "error probing queue depth"
            );
            Err(AmqpError::DeclareQueueError(inner.queue_name.clone()))
        }
    }
}

fn spawn_subscription(inner: &Arc<ConsumerInner>) -> Subscription {
    let drain = inner.cancel.child_token();
    let consumer_tag = format!("{}-{}", inner.queue_name, Uuid::new_v4());

    let handle = tokio::spawn(run_subscription(
        inner.clone(),
        drain.clone(),
        consumer_tag.clone(),
    ));

    Subscription {
        consumer_tag,
        drain,
        handle,
    }
}

/// Drives one subscription from Starting to Closed.
async fn run_subscription(inner: Arc<ConsumerInner>, drain: CancellationToken, consumer_tag: String) {
    let (channel, mut deliveries) = match open_subscription(&inner, &consumer_tag).await {
        Ok(subscription) => subscription,
        Err(err) => {
            warn!(
                error = err.to_string(),
                queue = inner.queue_name,
                "failure to open subscription, retrying on the next scaling tick"
            );
            return;
        }
    };

    debug!(
        queue = inner.queue_name,
        consumer_tag, "subscription running"
    );

    let acknowledger: Arc<dyn Acknowledger> = Arc::new(ChannelAcknowledger::new(channel.clone()));
    let tracer = global::tracer("rabbitmq-consumers");

    loop {
        tokio::select! {
            _ = drain.cancelled() => {
                // no new deliveries during drain; the in-flight one already
                // completed inline before this branch could be taken
                if let Err(err) = channel
                    .basic_cancel(&consumer_tag, BasicCancelOptions::default())
                    .await
                {
                    debug!(
                        error = err.to_string(),
                        "error cancelling consumer during drain"
                    );
                }
                break;
            }
            delivery = deliveries.next() => match delivery {
                Some(Ok(delivery)) => {
                    handle_delivery(&inner, &acknowledger, &tracer, delivery, &drain).await;
                }
                Some(Err(err)) => {
                    warn!(
                        error = err.to_string(),
                        queue = inner.queue_name,
                        "channel error, retiring subscription"
                    );
                    break;
                }
                None => {
                    debug!(queue = inner.queue_name, "consumer stream closed");
                    break;
                }
            }
        }
    }

    if let Err(err) = channel.close(200, "subscription closed").await {
        debug!(error = err.to_string(), "error closing subscription channel");
    }

    debug!(queue = inner.queue_name, consumer_tag, "subscription closed");
}

/// Opens the subscription's channel: QoS prefetch 1, manual-ack consume.
async fn open_subscription(
    inner: &Arc<ConsumerInner>,
    consumer_tag: &str,
) -> Result<(Channel, lapin::Consumer), AmqpError> {
    let connection = inner.pool.get_connection().await?;
    let channel = connection.create_channel().await?;

    if let Err(err) = channel.basic_qos(1, BasicQosOptions::default()).await {
        warn!(error = err.to_string(), "error to configure qos");
        let _ = channel.close(200, "qos failed").await;
        return Err(AmqpError::QoSDeclarationError(inner.queue_name.clone()));
    }

    let consumer = match channel
        .basic_consume(
            &inner.queue_name,
            consumer_tag,
            BasicConsumeOptions {
                no_local: false,
                no_ack: false,
                exclusive: false,
                nowait: false,
            },
            FieldTable::default(),
        )
        .await
    {
        Ok(consumer) => consumer,
        Err(err) => {
            warn!(error = err.to_string(), "error to create the consumer");
            let _ = channel.close(200, "consume failed").await;
            return Err(AmqpError::BindingConsumerError(inner.queue_name.clone()));
        }
    };

    Ok((channel, consumer))
}

/// Hands one delivery to the processor and enforces feedback resolution.
async fn handle_delivery(
    inner: &Arc<ConsumerInner>,
    acknowledger: &Arc<dyn Acknowledger>,
    tracer: &global::BoxedTracer,
    delivery: Delivery,
    drain: &CancellationToken,
) {
    let feedback = FeedbackSender::new(acknowledger.clone(), delivery.delivery_tag);
    let (_ctx, mut span) = crate::otel::consumer_span(&delivery.properties, tracer, &inner.queue_name);

    let outcome = inner
        .processor
        .process(&delivery.data, &feedback, drain)
        .await;

    match outcome {
        ProcessingOutcome::Acked => span.set_status(Status::Ok),
        ProcessingOutcome::Requeued => span.set_status(Status::Error {
            description: Cow::from("delivery requeued"),
        }),
        ProcessingOutcome::Discarded => span.set_status(Status::Error {
            description: Cow::from("delivery discarded"),
        }),
        ProcessingOutcome::Cancelled => span.set_status(Status::Error {
            description: Cow::from("processing cancelled"),
        }),
    }

    // safety default: a processor that returns without resolving feedback
    // must not leave the delivery unacked forever
    if !feedback.is_resolved() {
        warn!(
            queue = inner.queue_name,
            delivery_tag = delivery.delivery_tag,
            "delivery left unresolved by the processor, requeueing"
        );

        if let Err(err) = feedback.nack(true).await {
            warn!(error = err.to_string(), "error whiling nack msg");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::scaling::FixedConsumerCountManager;
    use async_trait::async_trait;

    struct NoopProcessor;

    #[async_trait]
    impl DeliveryProcessor for NoopProcessor {
        async fn process(
            &self,
            _body: &[u8],
            feedback: &FeedbackSender,
            _cancel: &CancellationToken,
        ) -> ProcessingOutcome {
            let _ = feedback.ack().await;
            ProcessingOutcome::Acked
        }
    }

    fn consumer() -> RabbitMQConsumer {
        RabbitMQConsumer::new(
            "orders",
            Arc::new(ConnectionPool::new(ConnectionConfig::default())),
            Arc::new(NoopProcessor),
            Arc::new(FixedConsumerCountManager::new(1)),
        )
    }

    #[tokio::test]
    async fn construction_is_total_and_idle() {
        let consumer = consumer();

        assert_eq!(consumer.queue_name(), "orders");
        assert!(!consumer.is_running());
        assert_eq!(consumer.active_subscriptions().await, 0);
        assert_eq!(consumer.scaling_interval(), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn stop_before_start_is_a_no_op() {
        let consumer = consumer();

        consumer.stop(Duration::from_secs(1)).await;

        assert!(!consumer.is_running());
    }

    #[tokio::test]
    async fn start_fails_against_a_disposed_pool() {
        let pool = Arc::new(ConnectionPool::new(ConnectionConfig::default()));
        pool.dispose().await;

        let consumer = RabbitMQConsumer::new(
            "orders",
            pool,
            Arc::new(NoopProcessor),
            Arc::new(FixedConsumerCountManager::new(1)),
        );

        assert_eq!(consumer.start().await.err(), Some(AmqpError::PoolDisposed));
        assert!(!consumer.is_running());
    }

    /// Installs a fake subscription task on a consumer marked running, so
    /// `stop` has something to drain.
    async fn install_subscription(
        consumer: &RabbitMQConsumer,
        consumer_tag: &str,
        handle: JoinHandle<()>,
    ) {
        consumer.inner.running.store(true, Ordering::SeqCst);
        consumer
            .inner
            .subscriptions
            .lock()
            .await
            .push(Subscription {
                consumer_tag: consumer_tag.to_owned(),
                drain: consumer.inner.cancel.child_token(),
                handle,
            });
    }

    #[tokio::test]
    async fn stop_waits_for_in_flight_work_within_grace() {
        let consumer = consumer();
        let completed = Arc::new(AtomicBool::new(false));

        let drain = consumer.inner.cancel.child_token();
        let flag = completed.clone();
        let handle = tokio::spawn(async move {
            // simulated in-flight delivery: resolves shortly after the
            // drain signal arrives
            drain.cancelled().await;
            tokio::time::sleep(Duration::from_millis(50)).await;
            flag.store(true, Ordering::SeqCst);
        });

        install_subscription(&consumer, "orders-inflight", handle).await;

        let started = Instant::now();
        consumer.stop(Duration::from_secs(10)).await;

        // the in-flight delivery finished well inside the grace period
        assert!(completed.load(Ordering::SeqCst));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!consumer.is_running());
        assert_eq!(consumer.active_subscriptions().await, 0);
    }

    #[tokio::test]
    async fn stop_abandons_work_past_the_grace_deadline() {
        let consumer = consumer();
        let completed = Arc::new(AtomicBool::new(false));

        let flag = completed.clone();
        let handle = tokio::spawn(async move {
            // ignores cancellation and outlives any reasonable grace period
            tokio::time::sleep(Duration::from_secs(60)).await;
            flag.store(true, Ordering::SeqCst);
        });

        install_subscription(&consumer, "orders-stuck", handle).await;

        let started = Instant::now();
        consumer.stop(Duration::from_millis(100)).await;

        // stop returned at the deadline and aborted the straggler
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!completed.load(Ordering::SeqCst));
        assert!(!consumer.is_running());
        assert_eq!(consumer.active_subscriptions().await, 0);
    }
}
