// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Feedback
//!
//! This module provides the per-delivery acknowledgement gate. Every delivery
//! a subscription receives is paired with a [`FeedbackSender`]; the processing
//! worker resolves it exactly once with an ack, a requeueing nack, or a
//! discarding nack. A second resolution fails loudly without reaching the
//! broker.

use crate::errors::AmqpError;
use async_trait::async_trait;
use lapin::{
    options::{BasicAckOptions, BasicNackOptions},
    Channel,
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tracing::error;

/// Dispatches acknowledgements for delivery tags on some underlying channel.
///
/// The runtime implements this over a lapin channel; tests substitute a
/// recording implementation.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Positively acknowledges the delivery.
    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    /// Negatively acknowledges the delivery, optionally requeueing it.
    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;
}

/// Acknowledger over the lapin channel a subscription owns.
pub(crate) struct ChannelAcknowledger {
    channel: Channel,
}

impl ChannelAcknowledger {
    pub(crate) fn new(channel: Channel) -> ChannelAcknowledger {
        ChannelAcknowledger { channel }
    }
}

#[async_trait]
impl Acknowledger for ChannelAcknowledger {
    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
        {
            Ok(_) => Ok(()),
            Err(err) => {
                error!(error = err.to_string(), delivery_tag, "error whiling ack msg");
                Err(AmqpError::AckMessageError)
            }
        }
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(err) => {
                error!(error = err.to_string(), delivery_tag, "error whiling nack msg");
                Err(AmqpError::NackMessageError)
            }
        }
    }
}

/// Single-shot ack/nack gate for one delivery.
///
/// Exactly one of [`ack`](FeedbackSender::ack),
/// [`nack(true)`](FeedbackSender::nack) or `nack(false)` must be called
/// during the sender's lifetime. The subscription that created the sender
/// nacks with requeue as a safety default if the worker returns without
/// resolving it.
#[derive(Clone)]
pub struct FeedbackSender {
    inner: Arc<FeedbackInner>,
}

struct FeedbackInner {
    delivery_tag: u64,
    acknowledged: AtomicBool,
    acknowledger: Arc<dyn Acknowledger>,
}

impl FeedbackSender {
    pub(crate) fn new(acknowledger: Arc<dyn Acknowledger>, delivery_tag: u64) -> FeedbackSender {
        FeedbackSender {
            inner: Arc::new(FeedbackInner {
                delivery_tag,
                acknowledged: AtomicBool::new(false),
                acknowledger,
            }),
        }
    }

    /// The channel-local tag of the delivery this sender resolves.
    pub fn delivery_tag(&self) -> u64 {
        self.inner.delivery_tag
    }

    /// Whether the sender has already been resolved.
    pub fn is_resolved(&self) -> bool {
        self.inner.acknowledged.load(Ordering::SeqCst)
    }

    /// Positively acknowledges the delivery.
    ///
    /// Fails with `FeedbackAlreadySent` if the sender was already resolved;
    /// the duplicate never reaches the broker.
    pub async fn ack(&self) -> Result<(), AmqpError> {
        self.mark_resolved()?;
        self.inner.acknowledger.ack(self.inner.delivery_tag).await
    }

    /// Negatively acknowledges the delivery.
    ///
    /// With `requeue` the broker returns the message to its queue for
    /// redelivery; without it the message is dropped (or dead-lettered by
    /// broker policy).
    pub async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.mark_resolved()?;
        self.inner
            .acknowledger
            .nack(self.inner.delivery_tag, requeue)
            .await
    }

    fn mark_resolved(&self) -> Result<(), AmqpError> {
        if self.inner.acknowledged.swap(true, Ordering::SeqCst) {
            error!(
                delivery_tag = self.inner.delivery_tag,
                "feedback resolved twice for the same delivery"
            );
            return Err(AmqpError::FeedbackAlreadySent(self.inner.delivery_tag));
        }

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// What a fake acknowledger observed, in call order.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) enum AckEvent {
        Ack(u64),
        Nack(u64, bool),
    }

    /// Records every acknowledgement instead of talking to a broker.
    #[derive(Default)]
    pub(crate) struct RecordingAcknowledger {
        pub(crate) events: Mutex<Vec<AckEvent>>,
    }

    impl RecordingAcknowledger {
        pub(crate) fn events(&self) -> Vec<AckEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Acknowledger for RecordingAcknowledger {
        async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
            self.events.lock().unwrap().push(AckEvent::Ack(delivery_tag));
            Ok(())
        }

        async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
            self.events
                .lock()
                .unwrap()
                .push(AckEvent::Nack(delivery_tag, requeue));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{AckEvent, RecordingAcknowledger};
    use super::*;

    #[tokio::test]
    async fn ack_resolves_once() {
        let recorder = Arc::new(RecordingAcknowledger::default());
        let feedback = FeedbackSender::new(recorder.clone(), 7);

        assert!(!feedback.is_resolved());
        feedback.ack().await.unwrap();

        assert!(feedback.is_resolved());
        assert_eq!(recorder.events(), vec![AckEvent::Ack(7)]);
    }

    #[tokio::test]
    async fn second_resolution_fails_loudly_and_stays_local() {
        let recorder = Arc::new(RecordingAcknowledger::default());
        let feedback = FeedbackSender::new(recorder.clone(), 3);

        feedback.ack().await.unwrap();
        let second = feedback.nack(true).await;

        assert_eq!(second, Err(AmqpError::FeedbackAlreadySent(3)));
        // the duplicate never reached the acknowledger
        assert_eq!(recorder.events(), vec![AckEvent::Ack(3)]);
    }

    #[tokio::test]
    async fn nack_carries_requeue_flag() {
        let recorder = Arc::new(RecordingAcknowledger::default());

        let requeued = FeedbackSender::new(recorder.clone(), 1);
        requeued.nack(true).await.unwrap();

        let discarded = FeedbackSender::new(recorder.clone(), 2);
        discarded.nack(false).await.unwrap();

        assert_eq!(
            recorder.events(),
            vec![AckEvent::Nack(1, true), AckEvent::Nack(2, false)]
        );
    }

    #[tokio::test]
    async fn clones_share_the_one_shot_flag() {
        let recorder = Arc::new(RecordingAcknowledger::default());
        let feedback = FeedbackSender::new(recorder.clone(), 9);
        let observer = feedback.clone();

        feedback.nack(false).await.unwrap();

        assert!(observer.is_resolved());
        assert_eq!(
            observer.ack().await,
            Err(AmqpError::FeedbackAlreadySent(9))
        );
    }
}
