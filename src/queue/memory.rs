//! In-process broker with the same delivery contract as the durable one.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Mutex, MutexGuard},
};

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::{debug, warn};

use super::{Delivery, DeliveryTag, PublishError, QueueChannel, QueueError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub body: Vec<u8>,
    pub attempts: u32,
    pub reason: String,
}

#[derive(Debug)]
struct Message {
    body: Vec<u8>,
    deliveries: u32,
}

#[derive(Debug, Default)]
struct State {
    next_tag: DeliveryTag,
    ready: VecDeque<Message>,
    unacked: HashMap<DeliveryTag, Message>,
    dead: Vec<DeadLetter>,
    closed: bool,
}

/// FIFO queue with explicit acknowledgement.
///
/// Closing drains: consumers keep receiving what is already queued and see
/// the end of the stream once nothing is ready.
#[derive(Debug, Default)]
pub struct InMemoryQueue {
    state: Mutex<State>,
    available: Notify,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, QueueError> {
        self.state.lock().map_err(|_| QueueError::Poisoned)
    }

    /// Simulates losing the consumer connection: every unacknowledged
    /// delivery goes back to the head of the queue, oldest first.
    pub fn drop_connection(&self) -> Result<usize, QueueError> {
        let mut state = self.state()?;
        let mut tags: Vec<DeliveryTag> = state.unacked.keys().copied().collect();
        tags.sort_unstable_by(|a, b| b.cmp(a));
        for tag in &tags {
            if let Some(message) = state.unacked.remove(tag) {
                state.ready.push_front(message);
            }
        }
        drop(state);
        if !tags.is_empty() {
            warn!(redelivering = tags.len(), "consumer connection dropped");
            self.available.notify_waiters();
        }
        Ok(tags.len())
    }

    pub fn ready_len(&self) -> Result<usize, QueueError> {
        Ok(self.state()?.ready.len())
    }

    pub fn unacked_len(&self) -> Result<usize, QueueError> {
        Ok(self.state()?.unacked.len())
    }

    pub fn dead_letters(&self) -> Result<Vec<DeadLetter>, QueueError> {
        Ok(self.state()?.dead.clone())
    }
}

#[async_trait]
impl QueueChannel for InMemoryQueue {
    async fn publish_payload(&self, body: Vec<u8>) -> Result<(), PublishError> {
        {
            let mut state = self.state()?;
            if state.closed {
                return Err(PublishError::Closed);
            }
            state.ready.push_back(Message {
                body,
                deliveries: 0,
            });
        }
        self.available.notify_waiters();
        Ok(())
    }

    async fn receive(&self) -> Result<Option<Delivery>, QueueError> {
        loop {
            // registered before the check so a publish in between is not missed
            let notified = self.available.notified();
            {
                let mut state = self.state()?;
                if let Some(mut message) = state.ready.pop_front() {
                    message.deliveries += 1;
                    state.next_tag += 1;
                    let tag = state.next_tag;
                    let delivery = Delivery {
                        tag,
                        body: message.body.clone(),
                        attempt: message.deliveries,
                    };
                    state.unacked.insert(tag, message);
                    return Ok(Some(delivery));
                }
                if state.closed {
                    return Ok(None);
                }
            }
            notified.await;
        }
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), QueueError> {
        self.state()?
            .unacked
            .remove(&tag)
            .map(|_| ())
            .ok_or(QueueError::UnknownDelivery(tag))
    }

    async fn reject(&self, tag: DeliveryTag, requeue: bool) -> Result<(), QueueError> {
        {
            let mut state = self.state()?;
            let message = state
                .unacked
                .remove(&tag)
                .ok_or(QueueError::UnknownDelivery(tag))?;
            if !requeue {
                debug!(tag, "discarding rejected delivery");
                return Ok(());
            }
            state.ready.push_back(message);
        }
        self.available.notify_waiters();
        Ok(())
    }

    async fn dead_letter(&self, tag: DeliveryTag, reason: &str) -> Result<(), QueueError> {
        let mut state = self.state()?;
        let message = state
            .unacked
            .remove(&tag)
            .ok_or(QueueError::UnknownDelivery(tag))?;
        state.dead.push(DeadLetter {
            body: message.body,
            attempts: message.deliveries,
            reason: reason.to_owned(),
        });
        Ok(())
    }

    async fn close(&self) {
        if let Ok(mut state) = self.state() {
            state.closed = true;
        }
        self.available.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use futures::StreamExt;

    use super::*;

    #[tokio::test]
    async fn delivers_in_publish_order_until_acked() {
        let queue = InMemoryQueue::new();
        for body in [b"1", b"2"] {
            queue.publish_payload(body.to_vec()).await.unwrap();
        }

        let first = queue.receive().await.unwrap().unwrap();
        let second = queue.receive().await.unwrap().unwrap();
        assert_eq!((first.body.as_slice(), first.attempt), (&b"1"[..], 1));
        assert_eq!(second.body, b"2");
        assert_eq!(queue.unacked_len().unwrap(), 2);

        queue.ack(first.tag).await.unwrap();
        assert!(matches!(
            queue.ack(first.tag).await,
            Err(QueueError::UnknownDelivery(_))
        ));
        queue.reject(second.tag, true).await.unwrap();

        let again = queue.receive().await.unwrap().unwrap();
        assert_eq!(again.body, b"2");
        assert_eq!(again.attempt, 2);
        assert_ne!(again.tag, second.tag);
    }

    #[tokio::test]
    async fn reject_without_requeue_and_dead_letter_remove_message() {
        let queue = InMemoryQueue::new();
        queue.publish_payload(b"a".to_vec()).await.unwrap();
        queue.publish_payload(b"b".to_vec()).await.unwrap();

        let a = queue.receive().await.unwrap().unwrap();
        queue.reject(a.tag, false).await.unwrap();
        let b = queue.receive().await.unwrap().unwrap();
        queue.dead_letter(b.tag, "poison").await.unwrap();

        assert_eq!(queue.ready_len().unwrap(), 0);
        assert_eq!(queue.unacked_len().unwrap(), 0);
        assert_eq!(
            queue.dead_letters().unwrap(),
            vec![DeadLetter {
                body: b"b".to_vec(),
                attempts: 1,
                reason: "poison".into()
            }]
        );
    }

    #[tokio::test]
    async fn dropped_connection_redelivers_unacked() {
        let queue = InMemoryQueue::new();
        queue.publish_payload(b"x".to_vec()).await.unwrap();
        queue.publish_payload(b"y".to_vec()).await.unwrap();
        queue.publish_payload(b"z".to_vec()).await.unwrap();
        let x = queue.receive().await.unwrap().unwrap();
        let _y = queue.receive().await.unwrap().unwrap();
        queue.ack(x.tag).await.unwrap();

        assert_eq!(queue.drop_connection().unwrap(), 1);
        let y = queue.receive().await.unwrap().unwrap();
        assert_eq!((y.body.as_slice(), y.attempt), (&b"y"[..], 2));
        let z = queue.receive().await.unwrap().unwrap();
        assert_eq!(z.body, b"z");
    }

    #[tokio::test]
    async fn consumer_waits_for_publish_and_stops_on_close() {
        let queue = Arc::new(InMemoryQueue::new());
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move {
                let mut bodies = Vec::new();
                let mut deliveries = queue.consume();
                while let Some(delivery) = deliveries.next().await {
                    let delivery = delivery.unwrap();
                    queue.ack(delivery.tag).await.unwrap();
                    bodies.push(delivery.body);
                }
                bodies
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.publish_payload(b"late".to_vec()).await.unwrap();
        queue.close().await;
        assert!(matches!(
            queue.publish_payload(b"after".to_vec()).await,
            Err(PublishError::Closed)
        ));

        let bodies = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bodies, vec![b"late".to_vec()]);
    }
}
