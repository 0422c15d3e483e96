//! Broker capability seam.
//!
//! The worker loop is written against [`BrokerConnector`] and
//! [`BrokerChannel`] rather than a concrete client, so the consume/ack
//! cycle and the shutdown state machine can be driven by an in-memory
//! broker in tests. The production binding lives in [`amqp`].

pub mod amqp;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// One message taken off the grading queue, not yet acknowledged.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub body: Vec<u8>,
}

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("dial {url}: {reason}")]
    Dial { url: String, reason: String },

    #[error("channel setup: {0}")]
    Setup(String),

    #[error("consume from {queue}: {reason}")]
    Consume { queue: String, reason: String },

    #[error("publish to {queue}: {reason}")]
    Publish { queue: String, reason: String },

    #[error("resolve delivery {delivery_tag}: {reason}")]
    Ack { delivery_tag: u64, reason: String },

    #[error("connection closed: {0}")]
    Closed(String),
}

/// Dials the broker and opens a channel ready for queue work.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn BrokerChannel>, BrokerError>;
}

/// One open channel on one broker connection.
///
/// A channel is used by exactly one worker loop instance; nothing here is
/// shared across jobs except the channel itself, and the worker only ever
/// has a single delivery outstanding (see `set_admission_limit`).
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Cap the number of unacknowledged deliveries the broker will push.
    /// The worker sets this to 1: the broker holds further jobs until the
    /// current one is acknowledged.
    async fn set_admission_limit(&self, limit: u16) -> Result<(), BrokerError>;

    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError>;

    /// Start consuming. Deliveries arrive on the returned receiver until
    /// the consumer is cancelled or the connection goes away, either of
    /// which ends the stream.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<mpsc::Receiver<Delivery>, BrokerError>;

    async fn publish(&self, queue: &str, payload: Vec<u8>) -> Result<(), BrokerError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    /// Reject without requeueing; the broker may dead-letter the message.
    async fn reject(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    async fn cancel_consumer(&self, consumer_tag: &str) -> Result<(), BrokerError>;

    /// Resolves when the broker closes the connection from its side,
    /// yielding the close reason. Never resolves for a close the worker
    /// itself initiated.
    async fn closed(&self) -> String;

    async fn close(&self) -> Result<(), BrokerError>;
}
