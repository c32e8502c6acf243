//! Durable hand-off of instructions from the submission side to processors.
//!
//! Delivery is **at-least-once**: a message leaves the queue only when it is
//! acknowledged. Rejected messages come back, and messages held by a consumer
//! that goes away are delivered again. Within one queue, a consumer sees
//! messages in publish order, but redeliveries can overtake or trail newer
//! messages, so nothing downstream may assume a global order.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use thiserror::Error;

use crate::instruction::{Instruction, QueuedTransaction};

pub mod memory;
pub mod postgres;

/// Broker-assigned handle used to resolve a delivery.
pub type DeliveryTag = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub body: Vec<u8>,
    /// 1 on first delivery, incremented on every redelivery.
    pub attempt: u32,
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Failed to serialize instruction: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Queue is closed")]
    Closed,
    #[error(transparent)]
    Queue(#[from] QueueError),
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Unknown delivery tag {0}")]
    UnknownDelivery(DeliveryTag),
    #[error("Queue state is poisoned")]
    Poisoned,
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

#[async_trait]
pub trait QueueChannel: Send + Sync {
    /// Enqueues a raw payload. Returns once the broker holds it durably.
    async fn publish_payload(&self, body: Vec<u8>) -> Result<(), PublishError>;

    /// Waits for the next delivery. `None` once the channel is closed.
    async fn receive(&self) -> Result<Option<Delivery>, QueueError>;

    /// Removes the delivery for good.
    async fn ack(&self, tag: DeliveryTag) -> Result<(), QueueError>;

    /// Returns the delivery to the queue, or drops it when `requeue` is false.
    async fn reject(&self, tag: DeliveryTag, requeue: bool) -> Result<(), QueueError>;

    /// Parks the delivery outside the work queue with a reason for operators.
    async fn dead_letter(&self, tag: DeliveryTag, reason: &str) -> Result<(), QueueError>;

    /// Stops handing out deliveries; consumers see the end of their stream.
    async fn close(&self);

    async fn publish(&self, instruction: &Instruction) -> Result<(), PublishError> {
        let body = QueuedTransaction::encode(instruction)?;
        self.publish_payload(body).await
    }

    /// Lazy stream of deliveries. Nothing is acknowledged automatically.
    fn consume(&self) -> BoxStream<'_, Result<Delivery, QueueError>> {
        stream::unfold(self, |queue| async move {
            match queue.receive().await {
                Ok(Some(delivery)) => Some((Ok(delivery), queue)),
                Ok(None) => None,
                Err(err) => Some((Err(err), queue)),
            }
        })
        .boxed()
    }
}

#[async_trait]
impl<Q> QueueChannel for std::sync::Arc<Q>
where
    Q: QueueChannel + ?Sized,
{
    async fn publish_payload(&self, body: Vec<u8>) -> Result<(), PublishError> {
        (**self).publish_payload(body).await
    }

    async fn receive(&self) -> Result<Option<Delivery>, QueueError> {
        (**self).receive().await
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), QueueError> {
        (**self).ack(tag).await
    }

    async fn reject(&self, tag: DeliveryTag, requeue: bool) -> Result<(), QueueError> {
        (**self).reject(tag, requeue).await
    }

    async fn dead_letter(&self, tag: DeliveryTag, reason: &str) -> Result<(), QueueError> {
        (**self).dead_letter(tag, reason).await
    }

    async fn close(&self) {
        (**self).close().await
    }
}
