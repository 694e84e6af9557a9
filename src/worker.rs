// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Processing Worker
//!
//! This module implements the per-message state machine: deserialize the raw
//! body, invoke the user handler with a configurable retry policy, and
//! resolve the delivery's feedback exactly once. The retry and requeue
//! decisions are driven first by [`QueuingSignal`]s raised from the handler
//! and then by the worker's default [`ExceptionHandlingStrategy`].

use crate::{
    feedback::FeedbackSender,
    rejection::{MessageRejectionHandler, RejectedMessage},
    serializer::Serializer,
    signals::{classify, ExceptionHandlingStrategy, HandlerError, QueuingSignalKind},
};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::{marker::PhantomData, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// User-supplied processing callback for messages of type `T`.
///
/// The handler is invoked once per attempt; returning `Ok` acknowledges the
/// delivery, returning an error engages the retry policy. Long-running
/// handlers should observe `cancel`, which fires when the consumer is
/// stopping.
#[async_trait]
pub trait MessageHandler<T>: Send + Sync
where
    T: Send + Sync,
{
    /// Processes one message.
    ///
    /// # Parameters
    /// * `message` - The deserialized message; retries receive the same value
    /// * `cancel` - Fires when the consumer is stopping
    ///
    /// # Returns
    /// Ok(()) to acknowledge the delivery, or an error (optionally carrying a
    /// [`QueuingSignal`]) to engage the retry policy
    async fn handle(&self, message: &T, cancel: &CancellationToken) -> Result<(), HandlerError>;
}

/// Retry policy bundle for a processing worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Default policy for handler failures that carry no signal
    pub strategy: ExceptionHandlingStrategy,
    /// Maximum handler invocations per delivery, at least 1
    pub invoke_retry_count: u32,
    /// Wait between invocations; zero retries immediately
    pub invoke_retry_wait: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig::simple(ExceptionHandlingStrategy::default())
    }
}

impl WorkerConfig {
    /// The simple worker variant: a single invocation, no in-process retry.
    ///
    /// The strategy still governs whether a failed message is requeued or
    /// discarded.
    ///
    /// # Parameters
    /// * `strategy` - Disposition for failures that carry no signal
    ///
    /// # Returns
    /// A config invoking the handler exactly once per delivery
    pub fn simple(strategy: ExceptionHandlingStrategy) -> WorkerConfig {
        WorkerConfig {
            strategy,
            invoke_retry_count: 1,
            invoke_retry_wait: Duration::ZERO,
        }
    }

    /// The advanced worker variant: up to `invoke_retry_count` invocations
    /// with `invoke_retry_wait` between them.
    ///
    /// # Parameters
    /// * `strategy` - Disposition for failures that carry no signal
    /// * `invoke_retry_count` - Maximum invocations per delivery; clamped to 1
    /// * `invoke_retry_wait` - Wait between invocations, honoring cancellation
    ///
    /// # Returns
    /// A config driving the full retry policy
    pub fn with_retry(
        strategy: ExceptionHandlingStrategy,
        invoke_retry_count: u32,
        invoke_retry_wait: Duration,
    ) -> WorkerConfig {
        WorkerConfig {
            strategy,
            invoke_retry_count: invoke_retry_count.max(1),
            invoke_retry_wait,
        }
    }
}

/// How a delivery was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingOutcome {
    /// Handler succeeded; the delivery was acked
    Acked,
    /// The delivery was nacked with requeue for later redelivery
    Requeued,
    /// The delivery was nacked without requeue and routed to the rejection
    /// handler
    Discarded,
    /// Cancellation aborted processing; the delivery was requeued
    Cancelled,
}

/// Object-safe processing seam the queue consumer drives.
///
/// [`ProcessingWorker`] is the stock implementation; custom implementations
/// receive the raw body and own the feedback resolution.
#[async_trait]
pub trait DeliveryProcessor: Send + Sync {
    /// Processes one raw delivery body, resolving `feedback` exactly once.
    ///
    /// # Parameters
    /// * `body` - Raw delivery body
    /// * `feedback` - The delivery's single-shot ack/nack gate
    /// * `cancel` - Fires when the owning consumer is stopping
    ///
    /// # Returns
    /// How the delivery was resolved
    async fn process(
        &self,
        body: &[u8],
        feedback: &FeedbackSender,
        cancel: &CancellationToken,
    ) -> ProcessingOutcome;
}

/// Per-message state machine binding a typed handler to the broker.
pub struct ProcessingWorker<T, H, S> {
    handler: Arc<H>,
    serializer: Arc<S>,
    rejection_handler: Arc<dyn MessageRejectionHandler>,
    config: WorkerConfig,
    queue_name: String,
    virtual_host: String,
    _message: PhantomData<fn() -> T>,
}

impl<T, H, S> ProcessingWorker<T, H, S>
where
    T: DeserializeOwned + Send + Sync,
    H: MessageHandler<T>,
    S: Serializer,
{
    /// Creates a worker for the given queue.
    ///
    /// # Parameters
    /// * `handler` - The user callback invoked per attempt
    /// * `serializer` - Codec turning raw bodies into `T`
    /// * `rejection_handler` - Terminal sink for discarded payloads
    /// * `config` - Retry policy bundle
    /// * `queue_name` - Queue the deliveries come from, for logs and rejections
    /// * `virtual_host` - Virtual host recorded on rejections
    ///
    /// # Returns
    /// A worker ready to be driven by a queue consumer
    pub fn new(
        handler: Arc<H>,
        serializer: Arc<S>,
        rejection_handler: Arc<dyn MessageRejectionHandler>,
        config: WorkerConfig,
        queue_name: &str,
        virtual_host: &str,
    ) -> ProcessingWorker<T, H, S> {
        ProcessingWorker {
            handler,
            serializer,
            rejection_handler,
            config,
            queue_name: queue_name.to_owned(),
            virtual_host: virtual_host.to_owned(),
            _message: PhantomData,
        }
    }

    /// Runs the state machine for one delivery.
    ///
    /// Deserializes the body, invokes the handler under the retry policy,
    /// and resolves `feedback` exactly once.
    ///
    /// # Parameters
    /// * `body` - Raw delivery body
    /// * `feedback` - The delivery's single-shot ack/nack gate
    /// * `cancel` - Unwinds the retry sleep when the consumer stops
    ///
    /// # Returns
    /// How the delivery was resolved
    pub async fn on_message(
        &self,
        body: &[u8],
        feedback: &FeedbackSender,
        cancel: &CancellationToken,
    ) -> ProcessingOutcome {
        let message: T = match self.serializer.deserialize(body) {
            Ok(message) => message,
            Err(err) => {
                warn!(
                    error = err.to_string(),
                    queue = self.queue_name,
                    "removing message from queue - reason: undeserializable payload"
                );

                self.reject(body, err.to_string()).await;
                self.resolve_nack(feedback, false).await;
                return ProcessingOutcome::Discarded;
            }
        };

        let mut errors: Vec<HandlerError> = Vec::new();
        let mut try_count: u32 = 0;
        let mut success = false;

        while try_count == 0 || (!success && self.should_retry(try_count, &errors)) {
            if try_count > 0 && !self.config.invoke_retry_wait.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(
                            queue = self.queue_name,
                            "cancelled while waiting to retry, requeueing"
                        );
                        self.resolve_nack(feedback, true).await;
                        return ProcessingOutcome::Cancelled;
                    }
                    _ = tokio::time::sleep(self.config.invoke_retry_wait) => {}
                }
            }

            try_count += 1;

            match self.handler.handle(&message, cancel).await {
                Ok(()) => success = true,
                Err(err) => {
                    warn!(
                        error = err.to_string(),
                        queue = self.queue_name,
                        try_count,
                        "error whiling handling msg"
                    );
                    errors.push(err);
                }
            }
        }

        if success {
            debug!(queue = self.queue_name, "message successfully processed");
            if let Err(err) = feedback.ack().await {
                error!(error = err.to_string(), "error whiling ack msg");
            }
            return ProcessingOutcome::Acked;
        }

        if self.should_requeue(&errors) {
            warn!(
                queue = self.queue_name,
                try_count, "handler exhausted, requeuing for later"
            );
            self.resolve_nack(feedback, true).await;
            return ProcessingOutcome::Requeued;
        }

        let reason = errors
            .last()
            .map(|err| err.to_string())
            .unwrap_or_else(|| "handler failed".to_owned());

        warn!(
            queue = self.queue_name,
            try_count, reason, "handler exhausted, discarding"
        );
        self.reject(body, reason).await;
        self.resolve_nack(feedback, false).await;

        ProcessingOutcome::Discarded
    }

    /// Whether another invocation should happen after a failed attempt.
    ///
    /// A `RetrySignal` forces another invocation while the budget allows; a
    /// `RequeueSignal` or `DiscardSignal` short-circuits the remaining
    /// budget. Unsignalled errors consume the budget under the `Retry` and
    /// `Requeue` strategies and never retry under `Discard` or `None`.
    ///
    /// # Parameters
    /// * `try_count` - Invocations already made for this delivery
    /// * `errors` - Errors collected so far; only the last one is classified
    ///
    /// # Returns
    /// true when the handler should be invoked again
    fn should_retry(&self, try_count: u32, errors: &[HandlerError]) -> bool {
        if try_count >= self.config.invoke_retry_count {
            return false;
        }

        match errors.last().and_then(classify) {
            Some(QueuingSignalKind::RetrySignal) => true,
            Some(QueuingSignalKind::DiscardSignal) | Some(QueuingSignalKind::RequeueSignal) => {
                false
            }
            None => matches!(
                self.config.strategy,
                ExceptionHandlingStrategy::Retry | ExceptionHandlingStrategy::Requeue
            ),
        }
    }

    /// Whether an exhausted delivery goes back to the queue or is discarded.
    ///
    /// # Returns
    /// true when the last error signals requeue, or carries no overriding
    /// signal and the default strategy is `Requeue`
    fn should_requeue(&self, errors: &[HandlerError]) -> bool {
        match errors.last().and_then(classify) {
            Some(QueuingSignalKind::RequeueSignal) => true,
            Some(QueuingSignalKind::DiscardSignal) => false,
            Some(QueuingSignalKind::RetrySignal) | None => {
                self.config.strategy == ExceptionHandlingStrategy::Requeue
            }
        }
    }

    async fn reject(&self, body: &[u8], reason: String) {
        self.rejection_handler
            .on_message_rejection(RejectedMessage {
                body: body.to_vec(),
                reason,
                queue_name: self.queue_name.clone(),
                virtual_host: self.virtual_host.clone(),
            })
            .await;
    }

    async fn resolve_nack(&self, feedback: &FeedbackSender, requeue: bool) {
        if let Err(err) = feedback.nack(requeue).await {
            error!(error = err.to_string(), requeue, "error whiling nack msg");
        }
    }
}

#[async_trait]
impl<T, H, S> DeliveryProcessor for ProcessingWorker<T, H, S>
where
    T: DeserializeOwned + Send + Sync,
    H: MessageHandler<T>,
    S: Serializer,
{
    async fn process(
        &self,
        body: &[u8],
        feedback: &FeedbackSender,
        cancel: &CancellationToken,
    ) -> ProcessingOutcome {
        self.on_message(body, feedback, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feedback::test_support::{AckEvent, RecordingAcknowledger};
    use crate::rejection::test_support::RecordingRejectionHandler;
    use crate::serializer::JsonSerializer;
    use crate::signals::QueuingSignal;
    use serde::Deserialize;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use thiserror::Error;
    use tokio::time::Instant;

    #[derive(Debug, Deserialize, PartialEq, Eq)]
    struct Numbered {
        n: i32,
    }

    #[derive(Debug, Error)]
    #[error("boom")]
    struct Boom;

    /// Handler returning scripted results in order; defaults to success once
    /// the script runs dry.
    struct ScriptedHandler {
        script: Mutex<VecDeque<Result<(), HandlerError>>>,
        calls: AtomicU32,
    }

    impl ScriptedHandler {
        fn new(script: Vec<Result<(), HandlerError>>) -> ScriptedHandler {
            ScriptedHandler {
                script: Mutex::new(script.into()),
                calls: AtomicU32::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MessageHandler<Numbered> for ScriptedHandler {
        async fn handle(
            &self,
            _message: &Numbered,
            _cancel: &CancellationToken,
        ) -> Result<(), HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script.lock().unwrap().pop_front().unwrap_or(Ok(()))
        }
    }

    struct Fixture {
        handler: Arc<ScriptedHandler>,
        rejections: Arc<RecordingRejectionHandler>,
        acknowledger: Arc<RecordingAcknowledger>,
        worker: ProcessingWorker<Numbered, ScriptedHandler, JsonSerializer>,
    }

    fn fixture(config: WorkerConfig, script: Vec<Result<(), HandlerError>>) -> Fixture {
        let handler = Arc::new(ScriptedHandler::new(script));
        let rejections = Arc::new(RecordingRejectionHandler::default());
        let worker = ProcessingWorker::new(
            handler.clone(),
            Arc::new(JsonSerializer),
            rejections.clone(),
            config,
            "orders",
            "commerce",
        );

        Fixture {
            handler,
            rejections,
            acknowledger: Arc::new(RecordingAcknowledger::default()),
            worker,
        }
    }

    fn feedback(fixture: &Fixture, tag: u64) -> FeedbackSender {
        FeedbackSender::new(fixture.acknowledger.clone(), tag)
    }

    #[tokio::test]
    async fn successful_handler_acks() {
        let fx = fixture(WorkerConfig::simple(ExceptionHandlingStrategy::Requeue), vec![]);
        let feedback = feedback(&fx, 1);

        let outcome = fx
            .worker
            .on_message(b"{\"n\":1}", &feedback, &CancellationToken::new())
            .await;

        assert_eq!(outcome, ProcessingOutcome::Acked);
        assert_eq!(fx.handler.calls(), 1);
        assert_eq!(fx.acknowledger.events(), vec![AckEvent::Ack(1)]);
        assert!(fx.rejections.rejections().is_empty());
    }

    #[tokio::test]
    async fn retry_signal_then_success_acks_after_wait() {
        let fx = fixture(
            WorkerConfig::with_retry(
                ExceptionHandlingStrategy::Requeue,
                3,
                Duration::from_millis(10),
            ),
            vec![Err(Box::new(QueuingSignal::retry("flaky")))],
        );
        let feedback = feedback(&fx, 2);

        let started = Instant::now();
        let outcome = fx
            .worker
            .on_message(b"{\"n\":2}", &feedback, &CancellationToken::new())
            .await;

        assert_eq!(outcome, ProcessingOutcome::Acked);
        assert_eq!(fx.handler.calls(), 2);
        assert!(started.elapsed() >= Duration::from_millis(10));
        assert_eq!(fx.acknowledger.events(), vec![AckEvent::Ack(2)]);
    }

    #[tokio::test]
    async fn retries_exhausted_under_requeue_strategy_requeues() {
        let fx = fixture(
            WorkerConfig::with_retry(ExceptionHandlingStrategy::Requeue, 2, Duration::ZERO),
            vec![Err(Box::new(Boom)), Err(Box::new(Boom))],
        );
        let feedback = feedback(&fx, 3);

        let outcome = fx
            .worker
            .on_message(b"{\"n\":3}", &feedback, &CancellationToken::new())
            .await;

        // two invocations burn the retry budget, then the message goes back
        // to the broker for the next redelivery cycle
        assert_eq!(outcome, ProcessingOutcome::Requeued);
        assert_eq!(fx.handler.calls(), 2);
        assert_eq!(fx.acknowledger.events(), vec![AckEvent::Nack(3, true)]);
        assert!(fx.rejections.rejections().is_empty());
    }

    #[tokio::test]
    async fn retry_strategy_retries_generic_errors_to_exhaustion() {
        let fx = fixture(
            WorkerConfig::with_retry(ExceptionHandlingStrategy::Retry, 3, Duration::ZERO),
            vec![
                Err(Box::new(Boom)),
                Err(Box::new(Boom)),
                Err(Box::new(Boom)),
            ],
        );
        let feedback = feedback(&fx, 4);

        let outcome = fx
            .worker
            .on_message(b"{\"n\":4}", &feedback, &CancellationToken::new())
            .await;

        // Retry strategy neither requeues nor preserves: exhausted deliveries
        // are discarded through the rejection handler
        assert_eq!(outcome, ProcessingOutcome::Discarded);
        assert_eq!(fx.handler.calls(), 3);
        assert_eq!(fx.acknowledger.events(), vec![AckEvent::Nack(4, false)]);
        assert_eq!(fx.rejections.rejections().len(), 1);
    }

    #[tokio::test]
    async fn discard_signal_short_circuits_retries() {
        let fx = fixture(
            WorkerConfig::with_retry(
                ExceptionHandlingStrategy::Requeue,
                5,
                Duration::from_millis(1),
            ),
            vec![Err(Box::new(QueuingSignal::discard("poison")))],
        );
        let feedback = feedback(&fx, 5);

        let outcome = fx
            .worker
            .on_message(b"{\"n\":5}", &feedback, &CancellationToken::new())
            .await;

        assert_eq!(outcome, ProcessingOutcome::Discarded);
        assert_eq!(fx.handler.calls(), 1);
        assert_eq!(fx.acknowledger.events(), vec![AckEvent::Nack(5, false)]);

        let rejections = fx.rejections.rejections();
        assert_eq!(rejections.len(), 1);
        assert_eq!(rejections[0].body, b"{\"n\":5}");
        assert_eq!(rejections[0].queue_name, "orders");
        assert_eq!(rejections[0].virtual_host, "commerce");
        assert_eq!(rejections[0].reason, "poison");
    }

    #[tokio::test]
    async fn requeue_signal_skips_remaining_retries() {
        let fx = fixture(
            WorkerConfig::with_retry(ExceptionHandlingStrategy::Retry, 5, Duration::ZERO),
            vec![Err(Box::new(QueuingSignal::requeue("db down")))],
        );
        let feedback = feedback(&fx, 6);

        let outcome = fx
            .worker
            .on_message(b"{\"n\":6}", &feedback, &CancellationToken::new())
            .await;

        assert_eq!(outcome, ProcessingOutcome::Requeued);
        assert_eq!(fx.handler.calls(), 1);
        assert_eq!(fx.acknowledger.events(), vec![AckEvent::Nack(6, true)]);
    }

    #[tokio::test]
    async fn wrapped_signal_is_honored_one_cause_deep() {
        #[derive(Debug, Error)]
        #[error("import failed")]
        struct ImportError {
            #[source]
            source: HandlerError,
        }

        let fx = fixture(
            WorkerConfig::with_retry(ExceptionHandlingStrategy::Requeue, 5, Duration::ZERO),
            vec![Err(Box::new(ImportError {
                source: Box::new(QueuingSignal::discard("bad reference")),
            }))],
        );
        let feedback = feedback(&fx, 7);

        let outcome = fx
            .worker
            .on_message(b"{\"n\":7}", &feedback, &CancellationToken::new())
            .await;

        assert_eq!(outcome, ProcessingOutcome::Discarded);
        assert_eq!(fx.handler.calls(), 1);
    }

    #[tokio::test]
    async fn undeserializable_payload_skips_handler_and_rejects() {
        let fx = fixture(WorkerConfig::default(), vec![]);
        let feedback = feedback(&fx, 8);

        let outcome = fx
            .worker
            .on_message(b"{\"n\": not json", &feedback, &CancellationToken::new())
            .await;

        assert_eq!(outcome, ProcessingOutcome::Discarded);
        assert_eq!(fx.handler.calls(), 0);
        assert_eq!(fx.acknowledger.events(), vec![AckEvent::Nack(8, false)]);

        let rejections = fx.rejections.rejections();
        assert_eq!(rejections.len(), 1);
        assert_eq!(rejections[0].body, b"{\"n\": not json");
    }

    #[tokio::test]
    async fn none_strategy_discards_failed_messages() {
        let fx = fixture(
            WorkerConfig::simple(ExceptionHandlingStrategy::None),
            vec![Err(Box::new(Boom))],
        );
        let feedback = feedback(&fx, 9);

        let outcome = fx
            .worker
            .on_message(b"{\"n\":9}", &feedback, &CancellationToken::new())
            .await;

        assert_eq!(outcome, ProcessingOutcome::Discarded);
        assert_eq!(fx.handler.calls(), 1);
        assert_eq!(fx.acknowledger.events(), vec![AckEvent::Nack(9, false)]);
        assert_eq!(fx.rejections.rejections().len(), 1);
    }

    #[tokio::test]
    async fn cancellation_in_the_retry_gap_requeues() {
        let fx = fixture(
            WorkerConfig::with_retry(
                ExceptionHandlingStrategy::Retry,
                5,
                Duration::from_secs(30),
            ),
            vec![Err(Box::new(QueuingSignal::retry("transient")))],
        );
        let feedback = feedback(&fx, 10);

        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = fx
            .worker
            .on_message(b"{\"n\":10}", &feedback, &cancel)
            .await;

        // the first invocation ran, the 30s gap was aborted by cancellation
        assert_eq!(outcome, ProcessingOutcome::Cancelled);
        assert_eq!(fx.handler.calls(), 1);
        assert_eq!(fx.acknowledger.events(), vec![AckEvent::Nack(10, true)]);
    }

    #[tokio::test]
    async fn simple_variant_invokes_exactly_once() {
        let fx = fixture(
            WorkerConfig::simple(ExceptionHandlingStrategy::Retry),
            vec![Err(Box::new(QueuingSignal::retry("asks for more")))],
        );
        let feedback = feedback(&fx, 11);

        let outcome = fx
            .worker
            .on_message(b"{\"n\":11}", &feedback, &CancellationToken::new())
            .await;

        // retry budget of 1 overrides even an explicit retry signal
        assert_eq!(fx.handler.calls(), 1);
        assert_eq!(outcome, ProcessingOutcome::Discarded);
    }

    #[tokio::test]
    async fn feedback_is_resolved_exactly_once_per_delivery() {
        let fx = fixture(
            WorkerConfig::with_retry(ExceptionHandlingStrategy::Requeue, 3, Duration::ZERO),
            vec![Err(Box::new(Boom))],
        );
        let feedback = feedback(&fx, 12);

        fx.worker
            .on_message(b"{\"n\":12}", &feedback, &CancellationToken::new())
            .await;

        assert!(feedback.is_resolved());
        assert_eq!(fx.acknowledger.events().len(), 1);
    }

    #[test]
    fn with_retry_clamps_zero_to_one_invocation() {
        let config =
            WorkerConfig::with_retry(ExceptionHandlingStrategy::Retry, 0, Duration::ZERO);
        assert_eq!(config.invoke_retry_count, 1);
    }
}
