//! Admission-controlled consume loop and the worker lifecycle.
//!
//! The worker owns one broker connection at a time and processes strictly
//! one job at a time: the admission limit of one unacknowledged delivery
//! keeps the broker from pushing a second job until the first is acked,
//! and the handler task processes the delivery stream serially.
//!
//! Lifecycle: `Disconnected → Consuming → Draining → Closed`. A failed
//! connect retries forever on a fixed delay. A broker-initiated close
//! goes straight back to `Disconnected`; the in-flight job still runs to
//! completion first so jobs never overlap, but its result is lost to the
//! broker and the delivery becomes eligible for redelivery. An
//! operator-initiated shutdown drains: no new deliveries, the in-flight
//! job finishes and its result is published before the connection closes.

pub mod messages;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::broker::{BrokerChannel, BrokerConnector, BrokerError, Delivery};
use crate::config::AmqpConfig;
use crate::grader::{self, Grader};
use self::messages::{ResultMessage, StartedMessage};

pub const CONSUMER_TAG: &str = "graderd-consumer";

/// Lifecycle state of the worker's broker attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Disconnected,
    Consuming,
    Draining,
    Closed,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerState::Disconnected => write!(f, "disconnected"),
            WorkerState::Consuming => write!(f, "consuming"),
            WorkerState::Draining => write!(f, "draining"),
            WorkerState::Closed => write!(f, "closed"),
        }
    }
}

pub struct Worker {
    connector: Arc<dyn BrokerConnector>,
    grader: Arc<Grader>,
    amqp: AmqpConfig,
}

impl Worker {
    pub fn new(connector: Arc<dyn BrokerConnector>, grader: Arc<Grader>, amqp: AmqpConfig) -> Self {
        Self {
            connector,
            grader,
            amqp,
        }
    }

    /// Outer control flow of the process: reconnect forever until the
    /// shutdown token fires. Returns only once any in-flight job has
    /// fully finished.
    pub async fn run(&self, shutdown: CancellationToken) {
        let reconnect_delay = Duration::from_millis(self.amqp.reconnect_delay_ms);
        while !shutdown.is_cancelled() {
            tracing::debug!(state = %WorkerState::Disconnected, url = %self.amqp.url, "connecting to broker");
            let session = match Session::open(self).await {
                Ok(session) => session,
                Err(err) => {
                    tracing::warn!(
                        error = %err,
                        delay_ms = self.amqp.reconnect_delay_ms,
                        "broker unavailable, retrying"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = time::sleep(reconnect_delay) => {}
                    }
                    continue;
                }
            };
            tracing::info!(
                state = %WorkerState::Consuming,
                queue = %self.amqp.grading_queue,
                "consuming grading jobs"
            );

            let lost = session.channel.clone();
            tokio::select! {
                reason = async move { lost.closed().await } => {
                    tracing::warn!(reason = %reason, "connection closed by broker, reconnecting");
                    session.abandon().await;
                }
                _ = shutdown.cancelled() => {
                    tracing::info!(state = %WorkerState::Draining, "termination requested, finishing in-flight job");
                    session.drain().await;
                    break;
                }
            }
        }
        tracing::info!(state = %WorkerState::Closed, "worker stopped");
    }
}

/// One live connection: a channel plus the task draining its deliveries.
struct Session {
    channel: Arc<dyn BrokerChannel>,
    handler: JoinHandle<()>,
}

impl Session {
    async fn open(worker: &Worker) -> Result<Self, BrokerError> {
        let channel: Arc<dyn BrokerChannel> =
            Arc::from(worker.connector.connect(&worker.amqp.url).await?);
        channel.set_admission_limit(1).await?;
        for queue in [
            &worker.amqp.grading_queue,
            &worker.amqp.started_queue,
            &worker.amqp.result_queue,
        ] {
            channel.declare_queue(queue).await?;
        }
        let deliveries = channel
            .consume(&worker.amqp.grading_queue, CONSUMER_TAG)
            .await?;
        let handler = tokio::spawn(handle_deliveries(
            channel.clone(),
            deliveries,
            worker.grader.clone(),
            worker.amqp.clone(),
        ));
        Ok(Self { channel, handler })
    }

    /// Graceful path: stop taking deliveries, let the in-flight job run
    /// to completion and publish its result, then tear the connection
    /// down. Blocks until the handler has signalled completion.
    async fn drain(mut self) {
        if let Err(err) = self.channel.cancel_consumer(CONSUMER_TAG).await {
            tracing::warn!(error = %err, "consumer cancel failed");
        }
        self.join_handler().await;
        if let Err(err) = self.channel.close().await {
            tracing::warn!(error = %err, "connection close failed");
        }
    }

    /// Broker-initiated path: the connection is already gone, so no drain
    /// is possible. The in-flight job still runs to completion before the
    /// caller reconnects, keeping jobs strictly serial.
    async fn abandon(mut self) {
        self.join_handler().await;
    }

    async fn join_handler(&mut self) {
        if let Err(err) = (&mut self.handler).await {
            tracing::error!(error = %err, "delivery handler task failed");
        }
    }
}

async fn handle_deliveries(
    channel: Arc<dyn BrokerChannel>,
    mut deliveries: mpsc::Receiver<Delivery>,
    grader: Arc<Grader>,
    amqp: AmqpConfig,
) {
    while let Some(delivery) = deliveries.recv().await {
        handle_delivery(channel.as_ref(), grader.as_ref(), &amqp, delivery).await;
    }
    tracing::debug!("delivery stream closed");
}

async fn handle_delivery(
    channel: &dyn BrokerChannel,
    grader: &Grader,
    amqp: &AmqpConfig,
    delivery: Delivery,
) {
    tracing::info!(
        delivery_tag = delivery.delivery_tag,
        size = delivery.body.len(),
        "received grading job"
    );

    let gid = match grader::parse_gid(&delivery.body) {
        Ok(gid) => gid,
        Err(err) => {
            // A payload without a gid can never grade; reject it instead
            // of leaving it to cycle through redelivery forever.
            tracing::warn!(delivery_tag = delivery.delivery_tag, error = %err, "rejecting malformed job");
            if let Err(err) = channel.reject(delivery.delivery_tag).await {
                tracing::warn!(error = %err, "reject failed");
            }
            return;
        }
    };

    let started = StartedMessage {
        gid: gid.clone(),
        time: Utc::now(),
    };
    if !publish_json(channel, &amqp.started_queue, &started, &gid).await {
        return;
    }

    let report = match grader.grade(&delivery.body).await {
        Ok(report) => report,
        Err(err) => {
            tracing::warn!(gid = %gid, error = %err, "grading failed, leaving delivery unacknowledged");
            return;
        }
    };

    let result = ResultMessage::from(report);
    if !publish_json(channel, &amqp.result_queue, &result, &gid).await {
        return;
    }
    // Ack strictly after the result publish: an unacked delivery is the
    // broker's cue to redeliver if this worker dies in between.
    if let Err(err) = channel.ack(delivery.delivery_tag).await {
        tracing::warn!(gid = %gid, error = %err, "ack failed");
    }
}

async fn publish_json<T: serde::Serialize>(
    channel: &dyn BrokerChannel,
    queue: &str,
    message: &T,
    gid: &str,
) -> bool {
    let payload = match serde_json::to_vec(message) {
        Ok(payload) => payload,
        Err(err) => {
            tracing::error!(gid = %gid, error = %err, "message serialization failed");
            return false;
        }
    };
    match channel.publish(queue, payload).await {
        Ok(()) => true,
        Err(err) => {
            tracing::warn!(gid = %gid, queue, error = %err, "publish failed, leaving delivery unacknowledged");
            false
        }
    }
}
