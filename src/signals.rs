// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queuing Signals and Handling Strategies
//!
//! This module defines the vocabulary a message handler uses to steer the
//! processing worker. A handler may return a [`QueuingSignal`] directly, or
//! wrap one as the immediate cause of its own error type; the worker inspects
//! the returned error and its immediate cause (exactly two levels) to decide
//! whether the delivery is retried, requeued, or discarded. When no signal is
//! present, the worker falls back to its configured
//! [`ExceptionHandlingStrategy`].

use std::error::Error;
use thiserror::Error as ThisError;

/// The error type message handlers return.
///
/// Any error works; returning a [`QueuingSignal`] (or an error whose
/// `source()` is one) overrides the worker's default strategy for that
/// delivery.
pub type HandlerError = Box<dyn Error + Send + Sync + 'static>;

/// Default policy applied to handler failures that carry no signal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExceptionHandlingStrategy {
    /// Invoke the handler again up to the configured retry count; discard
    /// once the budget is exhausted
    Retry,
    /// Invoke the handler again up to the configured retry count, then
    /// return the message to its queue for later redelivery
    #[default]
    Requeue,
    /// Nack without requeue and hand the payload to the rejection handler
    Discard,
    /// Take no recovery action; failed messages are discarded
    None,
}

/// Classification attached to a [`QueuingSignal`].
///
/// The three kinds mirror the first three [`ExceptionHandlingStrategy`]
/// values and take precedence over the configured default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuingSignalKind {
    /// The failure is transient; invoke the handler again
    RetrySignal,
    /// Skip remaining retries and return the message to the queue
    RequeueSignal,
    /// Skip remaining retries and discard the message
    DiscardSignal,
}

/// A structured error a handler raises to direct the worker.
///
/// The signal is orthogonal to its message and cause chain: the worker reads
/// only the [`QueuingSignalKind`], while the message and source are preserved
/// for logging.
#[derive(Debug, ThisError)]
#[error("{message}")]
pub struct QueuingSignal {
    kind: QueuingSignalKind,
    message: String,
    #[source]
    source: Option<HandlerError>,
}

impl QueuingSignal {
    /// Creates a signal asking the worker to retry the delivery.
    pub fn retry(message: impl Into<String>) -> QueuingSignal {
        QueuingSignal::new(QueuingSignalKind::RetrySignal, message)
    }

    /// Creates a signal asking the worker to requeue the delivery.
    pub fn requeue(message: impl Into<String>) -> QueuingSignal {
        QueuingSignal::new(QueuingSignalKind::RequeueSignal, message)
    }

    /// Creates a signal asking the worker to discard the delivery.
    pub fn discard(message: impl Into<String>) -> QueuingSignal {
        QueuingSignal::new(QueuingSignalKind::DiscardSignal, message)
    }

    /// Creates a signal of the given kind.
    pub fn new(kind: QueuingSignalKind, message: impl Into<String>) -> QueuingSignal {
        QueuingSignal {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Attaches the underlying error that motivated the signal.
    pub fn with_source(mut self, source: HandlerError) -> Self {
        self.source = Some(source);
        self
    }

    /// The signal's classification.
    pub fn kind(&self) -> QueuingSignalKind {
        self.kind
    }
}

/// Extracts the signal kind from a handler error, if any.
///
/// Inspects the error itself and then its immediate cause; deeper causes are
/// ignored.
pub(crate) fn classify(error: &HandlerError) -> Option<QueuingSignalKind> {
    if let Some(signal) = error.downcast_ref::<QueuingSignal>() {
        return Some(signal.kind());
    }

    error
        .source()
        .and_then(|cause| cause.downcast_ref::<QueuingSignal>())
        .map(QueuingSignal::kind)
}
