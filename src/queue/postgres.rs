//! Durable queue on a PostgreSQL table.
//!
//! Consumers lease the oldest ready row with `FOR UPDATE SKIP LOCKED`, so
//! any number of processors can share the table. A lease that is neither
//! acknowledged nor rejected before it expires makes the row deliverable
//! again, which is how a crashed consumer's work gets redelivered.
//!
//! Every lease draws a fresh `lease_id` and that id is the delivery tag, so a
//! consumer whose lease ran out can no longer resolve the row it lost.

use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tokio::sync::Notify;
use tracing::{debug, info};

use super::{Delivery, DeliveryTag, PublishError, QueueChannel, QueueError};

const SCHEMA: &[&str] = &[
    "CREATE SEQUENCE IF NOT EXISTS instruction_queue_lease_seq",
    r#"
    CREATE TABLE IF NOT EXISTS instruction_queue (
        id BIGSERIAL PRIMARY KEY,
        body BYTEA NOT NULL,
        state TEXT NOT NULL DEFAULT 'ready',
        attempts INTEGER NOT NULL DEFAULT 0,
        enqueued_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        leased_at TIMESTAMPTZ,
        lease_id BIGINT UNIQUE,
        dead_reason TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS instruction_queue_state_idx ON instruction_queue (state, id)",
];

pub struct PgQueue {
    pool: PgPool,
    poll_interval: Duration,
    lease: Duration,
    closed: AtomicBool,
    wake: Notify,
}

impl PgQueue {
    pub fn new(pool: PgPool, poll_interval: Duration, lease: Duration) -> Self {
        Self {
            pool,
            poll_interval,
            lease,
            closed: AtomicBool::new(false),
            wake: Notify::new(),
        }
    }

    pub async fn migrate(&self) -> Result<(), QueueError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn lease_next(&self) -> Result<Option<Delivery>, QueueError> {
        let row = sqlx::query(
            r#"
            UPDATE instruction_queue
            SET state = 'inflight',
                attempts = attempts + 1,
                leased_at = NOW(),
                lease_id = nextval('instruction_queue_lease_seq')
            WHERE id = (
                SELECT id FROM instruction_queue
                WHERE state = 'ready'
                   OR (state = 'inflight' AND leased_at < NOW() - make_interval(secs => $1))
                ORDER BY id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING lease_id, body, attempts
            "#,
        )
        .bind(self.lease.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> Result<Delivery, QueueError> {
            let lease_id: i64 = row.try_get("lease_id")?;
            let attempts: i32 = row.try_get("attempts")?;
            Ok(Delivery {
                tag: lease_id as DeliveryTag,
                body: row.try_get("body")?,
                attempt: attempts.max(0) as u32,
            })
        })
        .transpose()
    }

    async fn resolve(&self, tag: DeliveryTag, query: &str) -> Result<(), QueueError> {
        let done = sqlx::query(query)
            .bind(tag as i64)
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 0 {
            return Err(QueueError::UnknownDelivery(tag));
        }
        Ok(())
    }
}

#[async_trait]
impl QueueChannel for PgQueue {
    async fn publish_payload(&self, body: Vec<u8>) -> Result<(), PublishError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PublishError::Closed);
        }
        sqlx::query("INSERT INTO instruction_queue (body) VALUES ($1)")
            .bind(body)
            .execute(&self.pool)
            .await
            .map_err(QueueError::from)?;
        Ok(())
    }

    async fn receive(&self) -> Result<Option<Delivery>, QueueError> {
        loop {
            // undelivered rows stay in the table, so closing does not drain
            if self.closed.load(Ordering::Acquire) {
                return Ok(None);
            }
            if let Some(delivery) = self.lease_next().await? {
                return Ok(Some(delivery));
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = self.wake.notified() => {}
            }
        }
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), QueueError> {
        self.resolve(
            tag,
            "DELETE FROM instruction_queue WHERE lease_id = $1 AND state = 'inflight'",
        )
        .await
    }

    async fn reject(&self, tag: DeliveryTag, requeue: bool) -> Result<(), QueueError> {
        if requeue {
            self.resolve(
                tag,
                "UPDATE instruction_queue SET state = 'ready', leased_at = NULL, lease_id = NULL \
                 WHERE lease_id = $1 AND state = 'inflight'",
            )
            .await
        } else {
            debug!(tag, "discarding rejected delivery");
            self.ack(tag).await
        }
    }

    async fn dead_letter(&self, tag: DeliveryTag, reason: &str) -> Result<(), QueueError> {
        let done = sqlx::query(
            "UPDATE instruction_queue SET state = 'dead', dead_reason = $2 \
             WHERE lease_id = $1 AND state = 'inflight'",
        )
        .bind(tag as i64)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        if done.rows_affected() == 0 {
            return Err(QueueError::UnknownDelivery(tag));
        }
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.wake.notify_waiters();
        info!("instruction queue closed");
    }
}
