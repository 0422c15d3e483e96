//! AMQP 0.9.1 binding backed by lapin.

use async_trait::async_trait;
use chrono::Utc;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
    BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::sync::{mpsc, watch};
use tokio_stream::StreamExt;

use super::{BrokerChannel, BrokerConnector, BrokerError, Delivery};

const REPLY_SUCCESS: u16 = 200;

pub struct AmqpConnector;

#[async_trait]
impl BrokerConnector for AmqpConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn BrokerChannel>, BrokerError> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|err| BrokerError::Dial {
                url: url.to_string(),
                reason: err.to_string(),
            })?;

        let (closed_tx, closed_rx) = watch::channel(None::<String>);
        connection.on_error(move |err| {
            let _ = closed_tx.send(Some(err.to_string()));
        });

        let channel = connection
            .create_channel()
            .await
            .map_err(|err| BrokerError::Setup(err.to_string()))?;
        // Publisher confirms, so a failed publish is an error we can see
        // instead of a silently dropped message.
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|err| BrokerError::Setup(err.to_string()))?;

        Ok(Box::new(AmqpChannel {
            connection,
            channel,
            closed: closed_rx,
        }))
    }
}

struct AmqpChannel {
    connection: Connection,
    channel: Channel,
    closed: watch::Receiver<Option<String>>,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn set_admission_limit(&self, limit: u16) -> Result<(), BrokerError> {
        self.channel
            .basic_qos(limit, BasicQosOptions::default())
            .await
            .map_err(|err| BrokerError::Setup(err.to_string()))
    }

    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map(|_| ())
            .map_err(|err| BrokerError::Setup(err.to_string()))
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<mpsc::Receiver<Delivery>, BrokerError> {
        let mut consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|err| BrokerError::Consume {
                queue: queue.to_string(),
                reason: err.to_string(),
            })?;

        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(async move {
            while let Some(attempt) = consumer.next().await {
                match attempt {
                    Ok(delivery) => {
                        let delivery = Delivery {
                            delivery_tag: delivery.delivery_tag,
                            body: delivery.data,
                        };
                        if tx.send(delivery).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "consumer stream error");
                        break;
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn publish(&self, queue: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        let properties = BasicProperties::default()
            .with_delivery_mode(2)
            .with_content_type("application/json".into())
            .with_timestamp(Utc::now().timestamp() as u64);
        self.channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await
            .map_err(|err| publish_error(queue, err))?
            .await
            .map(|_| ())
            .map_err(|err| publish_error(queue, err))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|err| ack_error(delivery_tag, err))
    }

    async fn reject(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue: false })
            .await
            .map_err(|err| ack_error(delivery_tag, err))
    }

    async fn cancel_consumer(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|err| BrokerError::Setup(err.to_string()))
    }

    async fn closed(&self) -> String {
        let mut closed = self.closed.clone();
        loop {
            if let Some(reason) = closed.borrow().clone() {
                return reason;
            }
            if closed.changed().await.is_err() {
                return "connection dropped".to_string();
            }
        }
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.connection
            .close(REPLY_SUCCESS, "worker shutdown")
            .await
            .map_err(|err| BrokerError::Closed(err.to_string()))
    }
}

fn publish_error(queue: &str, err: lapin::Error) -> BrokerError {
    BrokerError::Publish {
        queue: queue.to_string(),
        reason: err.to_string(),
    }
}

fn ack_error(delivery_tag: u64, err: lapin::Error) -> BrokerError {
    BrokerError::Ack {
        delivery_tag,
        reason: err.to_string(),
    }
}
