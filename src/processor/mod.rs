//! Consumption loop turning queue deliveries into balance mutations.
//!
//! Every delivery goes `Received -> Decoding -> Applying` and is then resolved
//! exactly once:
//!
//! | outcome                                   | resolution                    |
//! |-------------------------------------------|-------------------------------|
//! | applied                                   | ack ([`Resolution::Applied`]) |
//! | business rule refused it (terminal)       | ack ([`Resolution::Declined`])|
//! | transient fault, attempts left            | requeue                       |
//! | transient fault, attempts exhausted       | dead letter                   |
//! | payload cannot be decoded                 | dead letter                   |
//!
//! A failure talking to the queue itself leaves the delivery unresolved.
//! The processor logs it, backs off and keeps consuming; the broker hands the
//! delivery out again once its lease or connection is gone.
//!
//! Redelivery is at-least-once and instructions carry no idempotency key, so
//! a delivery whose commit succeeded but whose ack was lost is applied again.

use std::{ops::AddAssign, time::Duration};

use futures::StreamExt;
use tracing::{Instrument, error, info, info_span, warn};

use crate::{
    instruction::QueuedTransaction,
    mutator::{BalanceMutator, Disposition},
    queue::{Delivery, QueueChannel, QueueError},
    store::AccountStore,
};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_QUEUE_BACKOFF: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Applied,
    Declined,
    Requeued,
    DeadLettered,
}

/// Bounded redelivery before a message is treated as poison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl RetryPolicy {
    fn exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessorStats {
    pub applied: u64,
    pub declined: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
    /// Receives or resolutions the queue failed; not a count of deliveries.
    pub queue_failures: u64,
}

impl ProcessorStats {
    fn record(&mut self, resolution: Resolution) {
        match resolution {
            Resolution::Applied => self.applied += 1,
            Resolution::Declined => self.declined += 1,
            Resolution::Requeued => self.requeued += 1,
            Resolution::DeadLettered => self.dead_lettered += 1,
        }
    }
}

impl AddAssign for ProcessorStats {
    fn add_assign(&mut self, other: Self) {
        self.applied += other.applied;
        self.declined += other.declined;
        self.requeued += other.requeued;
        self.dead_lettered += other.dead_lettered;
        self.queue_failures += other.queue_failures;
    }
}

pub struct TransactionProcessor<Q, S> {
    queue: Q,
    mutator: BalanceMutator<S>,
    policy: RetryPolicy,
    backoff: Duration,
}

impl<Q, S> TransactionProcessor<Q, S>
where
    Q: QueueChannel,
    S: AccountStore,
{
    pub fn new(queue: Q, mutator: BalanceMutator<S>) -> Self {
        Self {
            queue,
            mutator,
            policy: RetryPolicy::default(),
            backoff: DEFAULT_QUEUE_BACKOFF,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Pause after a failed queue operation before consuming again.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    pub fn mutator(&self) -> &BalanceMutator<S> {
        &self.mutator
    }

    /// Drains the queue until it is closed.
    pub async fn run(&self) -> ProcessorStats {
        let mut stats = ProcessorStats::default();
        let mut deliveries = self.queue.consume();
        info!("waiting for transaction messages");
        while let Some(delivery) = deliveries.next().await {
            let resolved = match delivery {
                Ok(delivery) => self.handle(delivery).await,
                Err(err) => Err(err),
            };
            match resolved {
                Ok(resolution) => stats.record(resolution),
                Err(err) => {
                    stats.queue_failures += 1;
                    error!(error = %err, backoff = ?self.backoff, "queue operation failed");
                    tokio::time::sleep(self.backoff).await;
                }
            }
        }
        info!(?stats, "queue closed, processor stopped");
        stats
    }

    /// Decodes, applies and resolves one delivery.
    pub async fn handle(&self, delivery: Delivery) -> Result<Resolution, QueueError> {
        let span = info_span!("delivery", tag = delivery.tag, attempt = delivery.attempt);
        self.resolve(delivery).instrument(span).await
    }

    async fn resolve(&self, delivery: Delivery) -> Result<Resolution, QueueError> {
        let instruction = match QueuedTransaction::decode(&delivery.body) {
            Ok(instruction) => instruction,
            Err(err) => {
                warn!(error = %err, "undecodable payload");
                self.queue
                    .dead_letter(delivery.tag, &format!("undecodable: {err}"))
                    .await?;
                return Ok(Resolution::DeadLettered);
            }
        };

        let err = match self.mutator.apply(&instruction).await {
            Ok(outcome) => {
                self.queue.ack(delivery.tag).await?;
                info!(kind = ?instruction.kind(), entries = outcome.entries.len(), "transaction applied");
                return Ok(Resolution::Applied);
            }
            Err(err) => err,
        };

        match err.disposition() {
            Disposition::Terminal => {
                self.queue.ack(delivery.tag).await?;
                warn!(error = %err, "transaction declined");
                Ok(Resolution::Declined)
            }
            Disposition::Retryable if self.policy.exhausted(delivery.attempt) => {
                error!(error = %err, "retries exhausted");
                self.queue
                    .dead_letter(
                        delivery.tag,
                        &format!("failed after {} attempts: {err}", delivery.attempt),
                    )
                    .await?;
                Ok(Resolution::DeadLettered)
            }
            Disposition::Retryable => {
                warn!(error = %err, "transaction failed, requeueing");
                self.queue.reject(delivery.tag, true).await?;
                Ok(Resolution::Requeued)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    };

    use async_trait::async_trait;

    use crate::{
        account::AccountId,
        instruction::Instruction,
        money::Money,
        queue::{DeliveryTag, PublishError, memory::InMemoryQueue},
        store::{FaultPoint, memory::InMemoryStore},
    };

    use super::*;

    type Processor = TransactionProcessor<Arc<InMemoryQueue>, Arc<InMemoryStore>>;

    fn processor(accounts: &[(&str, u32)]) -> Processor {
        let store = Arc::new(InMemoryStore::new());
        for (id, balance) in accounts {
            store.open_account(*id, Money::from(*balance)).unwrap();
        }
        TransactionProcessor::new(Arc::new(InMemoryQueue::new()), BalanceMutator::new(store))
            .with_policy(RetryPolicy { max_attempts: 3 })
    }

    async fn next(processor: &Processor) -> Delivery {
        processor.queue().receive().await.unwrap().unwrap()
    }

    async fn balance(processor: &Processor, id: &str) -> Money {
        processor
            .mutator()
            .store()
            .get_balance(&AccountId::from(id))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn applied_delivery_is_acked() {
        let processor = processor(&[("A", 0)]);
        let deposit = Instruction::deposit("A", Money::from(5)).unwrap();
        processor.queue().publish(&deposit).await.unwrap();

        let resolution = processor.handle(next(&processor).await).await.unwrap();
        assert_eq!(resolution, Resolution::Applied);
        assert_eq!(balance(&processor, "A").await, Money::from(5));
        assert_eq!(processor.queue().unacked_len().unwrap(), 0);
        assert_eq!(processor.queue().ready_len().unwrap(), 0);
    }

    #[tokio::test]
    async fn business_failure_is_acked_not_retried() {
        let processor = processor(&[("A", 10)]);
        let withdrawal = Instruction::withdrawal("A", Money::from(11)).unwrap();
        processor.queue().publish(&withdrawal).await.unwrap();
        let ghost = Instruction::deposit("ghost", Money::from(1)).unwrap();
        processor.queue().publish(&ghost).await.unwrap();

        for _ in 0..2 {
            let resolution = processor.handle(next(&processor).await).await.unwrap();
            assert_eq!(resolution, Resolution::Declined);
        }
        assert_eq!(processor.queue().ready_len().unwrap(), 0);
        assert!(processor.queue().dead_letters().unwrap().is_empty());
        assert_eq!(balance(&processor, "A").await, Money::from(10));
    }

    #[tokio::test]
    async fn malformed_payload_is_dead_lettered() {
        let processor = processor(&[]);
        processor
            .queue()
            .publish_payload(br#"{"type":"deposit","amount":"lots"}"#.to_vec())
            .await
            .unwrap();

        let resolution = processor.handle(next(&processor).await).await.unwrap();
        assert_eq!(resolution, Resolution::DeadLettered);
        let dead = processor.queue().dead_letters().unwrap();
        assert_eq!(dead.len(), 1);
        assert!(dead[0].reason.starts_with("undecodable"));
    }

    #[tokio::test]
    async fn transient_failure_requeues_then_dead_letters() {
        let processor = processor(&[("A", 0)]);
        let store = processor.mutator().store();
        for _ in 0..3 {
            store.inject_fault(FaultPoint::Commit).unwrap();
        }
        let deposit = Instruction::deposit("A", Money::from(5)).unwrap();
        processor.queue().publish(&deposit).await.unwrap();

        for attempt in 1..=2 {
            let delivery = next(&processor).await;
            assert_eq!(delivery.attempt, attempt);
            assert_eq!(processor.handle(delivery).await.unwrap(), Resolution::Requeued);
        }
        let last = next(&processor).await;
        assert_eq!(processor.handle(last).await.unwrap(), Resolution::DeadLettered);

        let dead = processor.queue().dead_letters().unwrap();
        assert_eq!(dead[0].attempts, 3);
        assert!(dead[0].reason.contains("failed after 3 attempts"));
        assert_eq!(balance(&processor, "A").await, Money::ZERO);
    }

    #[tokio::test]
    async fn transient_failure_recovers_on_redelivery() {
        let processor = processor(&[("A", 0)]);
        processor
            .mutator()
            .store()
            .inject_fault(FaultPoint::AppendLedger)
            .unwrap();
        let deposit = Instruction::deposit("A", Money::from(5)).unwrap();
        processor.queue().publish(&deposit).await.unwrap();
        processor.queue().close().await;

        let stats = processor.run().await;
        assert_eq!(
            stats,
            ProcessorStats {
                applied: 1,
                requeued: 1,
                ..Default::default()
            }
        );
        assert_eq!(balance(&processor, "A").await, Money::from(5));
    }

    /// Queue whose first acknowledgement is lost on the way to the broker.
    struct LostFirstAck {
        inner: InMemoryQueue,
        failed: AtomicBool,
    }

    #[async_trait]
    impl QueueChannel for LostFirstAck {
        async fn publish_payload(&self, body: Vec<u8>) -> Result<(), PublishError> {
            self.inner.publish_payload(body).await
        }

        async fn receive(&self) -> Result<Option<Delivery>, QueueError> {
            self.inner.receive().await
        }

        async fn ack(&self, tag: DeliveryTag) -> Result<(), QueueError> {
            if !self.failed.swap(true, Ordering::SeqCst) {
                return Err(QueueError::Poisoned);
            }
            self.inner.ack(tag).await
        }

        async fn reject(&self, tag: DeliveryTag, requeue: bool) -> Result<(), QueueError> {
            self.inner.reject(tag, requeue).await
        }

        async fn dead_letter(&self, tag: DeliveryTag, reason: &str) -> Result<(), QueueError> {
            self.inner.dead_letter(tag, reason).await
        }

        async fn close(&self) {
            self.inner.close().await
        }
    }

    #[tokio::test]
    async fn queue_failure_does_not_stop_consumption() {
        let store = Arc::new(InMemoryStore::new());
        store.open_account("A", Money::ZERO).unwrap();
        let queue = LostFirstAck {
            inner: InMemoryQueue::new(),
            failed: AtomicBool::new(false),
        };
        let processor = TransactionProcessor::new(queue, BalanceMutator::new(store.clone()))
            .with_backoff(Duration::from_millis(1));

        let deposit = Instruction::deposit("A", Money::from(1)).unwrap();
        for _ in 0..3 {
            processor.queue().publish(&deposit).await.unwrap();
        }
        processor.queue().close().await;

        let stats = tokio::time::timeout(Duration::from_secs(1), processor.run())
            .await
            .unwrap();
        assert_eq!(
            stats,
            ProcessorStats {
                applied: 2,
                queue_failures: 1,
                ..Default::default()
            }
        );
        // the first deposit committed; only its ack was lost
        assert_eq!(store.get_balance(&"A".into()).await.unwrap(), Money::from(3));
        assert_eq!(processor.queue().inner.ready_len().unwrap(), 0);
        assert_eq!(processor.queue().inner.unacked_len().unwrap(), 1);
    }
}
