//! pgmq transport via direct SQLx.
//!
//! Calls pgmq's SQL functions: pgmq.create, pgmq.send. Each view queue maps
//! to the pgmq queue of the same name.

use async_trait::async_trait;
use opentelemetry::KeyValue;

use crate::error::{Error, Result};
use crate::telemetry::metrics;
use crate::transport::{Transport, TransportMessage, TransportReceipt};

use super::Db;

impl Db {
    /// Create a pgmq queue (idempotent).
    pub async fn create_queue(&self, queue_name: &str) -> Result<()> {
        sqlx::query("SELECT pgmq.create($1)")
            .bind(queue_name)
            .execute(self.pool())
            .await?;
        metrics::transport_operations().add(
            1,
            &[
                KeyValue::new("queue", queue_name.to_string()),
                KeyValue::new("operation", "create"),
            ],
        );
        Ok(())
    }

    /// Send a message to a pgmq queue. Returns the message ID.
    /// delay_seconds: 0 for immediate, >0 for delayed delivery.
    pub async fn send_to_queue(
        &self,
        queue_name: &str,
        payload: &serde_json::Value,
        delay_seconds: i32,
    ) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT pgmq.send($1, $2, $3)")
            .bind(queue_name)
            .bind(payload)
            .bind(delay_seconds)
            .fetch_one(self.pool())
            .await?;
        metrics::transport_operations().add(
            1,
            &[
                KeyValue::new("queue", queue_name.to_string()),
                KeyValue::new("operation", "send"),
            ],
        );
        Ok(row.0)
    }
}

/// [`Transport`] backed by pgmq. The receipt is the pgmq message id.
#[derive(Clone)]
pub struct PgmqTransport {
    db: Db,
    delay_seconds: i32,
}

impl PgmqTransport {
    pub fn new(db: Db) -> Self {
        Self {
            db,
            delay_seconds: 0,
        }
    }

    /// Hold messages back from consumers for `seconds` after sending.
    pub fn with_delay(mut self, seconds: i32) -> Self {
        self.delay_seconds = seconds;
        self
    }
}

#[async_trait]
impl Transport for PgmqTransport {
    async fn enqueue(&self, message: &TransportMessage) -> Result<TransportReceipt> {
        let payload = serde_json::to_value(message)?;
        let msg_id = self
            .db
            .send_to_queue(message.queue.as_str(), &payload, self.delay_seconds)
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        Ok(TransportReceipt(msg_id.to_string()))
    }
}
