//! Postgres implementation of the view's storage engine.
//!
//! Partitions are key prefixes of the `enqueued_items` primary key, so a
//! partition scan is an index range scan ordered by `item_key`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use sqlx::types::Json;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{BucketId, ContentRef, EnqueuedItem, ItemKey, Partition, QueueName, Slice};
use crate::store::{ContinuationToken, Page, SliceCondition, ViewStore};

use super::Db;

fn after_key(from: Option<&ContinuationToken>) -> Result<Option<Uuid>> {
    from.map(|token| token.last_key().map(|key| key.0)).transpose()
}

fn row_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

#[async_trait]
impl ViewStore for Db {
    async fn append_item(&self, item: &EnqueuedItem) -> Result<()> {
        sqlx::query(
            "INSERT INTO enqueued_items (queue_name, slice, bucket, item_key, enqueued_at, name, sender, recipients, header_ref, body_ref, attributes)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
             ON CONFLICT (queue_name, slice, bucket, item_key) DO NOTHING",
        )
        .bind(item.queue.as_str())
        .bind(item.slice.0)
        .bind(i64::from(item.bucket.0))
        .bind(item.key.0)
        .bind(item.enqueued_at)
        .bind(&item.name)
        .bind(&item.sender)
        .bind(&item.recipients)
        .bind(&item.header_ref.0)
        .bind(&item.body_ref.0)
        .bind(Json(&item.attributes))
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn scan_items(
        &self,
        partition: &Partition,
        from: Option<&ContinuationToken>,
        limit: usize,
    ) -> Result<Page<EnqueuedItem>> {
        let rows: Vec<EnqueuedItemRow> = sqlx::query_as(
            "SELECT queue_name, slice, bucket, item_key, enqueued_at, name, sender, recipients, header_ref, body_ref, attributes
             FROM enqueued_items
             WHERE queue_name = $1 AND slice = $2 AND bucket = $3
               AND ($4::uuid IS NULL OR item_key > $4)
             ORDER BY item_key
             LIMIT $5",
        )
        .bind(partition.queue.as_str())
        .bind(partition.slice.0)
        .bind(i64::from(partition.bucket.0))
        .bind(after_key(from)?)
        .bind(row_limit(limit))
        .fetch_all(self.pool())
        .await?;

        let items = rows
            .into_iter()
            .map(EnqueuedItemRow::try_into_item)
            .collect::<Result<Vec<_>>>()?;
        Ok(Page::from_rows(items, limit, |item| item.key))
    }

    async fn has_items(&self, partition: &Partition) -> Result<bool> {
        let (exists,): (bool,) = sqlx::query_as(
            "SELECT EXISTS (SELECT 1 FROM enqueued_items WHERE queue_name = $1 AND slice = $2 AND bucket = $3)",
        )
        .bind(partition.queue.as_str())
        .bind(partition.slice.0)
        .bind(i64::from(partition.bucket.0))
        .fetch_one(self.pool())
        .await?;
        Ok(exists)
    }

    async fn put_tombstone(&self, queue: &QueueName, key: ItemKey) -> Result<()> {
        sqlx::query(
            "INSERT INTO deleted_items (queue_name, item_key) VALUES ($1, $2)
             ON CONFLICT (queue_name, item_key) DO NOTHING",
        )
        .bind(queue.as_str())
        .bind(key.0)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn has_tombstone(&self, queue: &QueueName, key: ItemKey) -> Result<bool> {
        let (exists,): (bool,) = sqlx::query_as(
            "SELECT EXISTS (SELECT 1 FROM deleted_items WHERE queue_name = $1 AND item_key = $2)",
        )
        .bind(queue.as_str())
        .bind(key.0)
        .fetch_one(self.pool())
        .await?;
        Ok(exists)
    }

    async fn scan_tombstones(
        &self,
        queue: &QueueName,
        from: Option<&ContinuationToken>,
        limit: usize,
    ) -> Result<Page<ItemKey>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT item_key FROM deleted_items
             WHERE queue_name = $1 AND ($2::uuid IS NULL OR item_key > $2)
             ORDER BY item_key
             LIMIT $3",
        )
        .bind(queue.as_str())
        .bind(after_key(from)?)
        .bind(row_limit(limit))
        .fetch_all(self.pool())
        .await?;

        let keys = rows.into_iter().map(|(key,)| ItemKey(key)).collect();
        Ok(Page::from_rows(keys, limit, |key| *key))
    }

    async fn read_browse_start(&self, queue: &QueueName) -> Result<Option<Slice>> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT slice FROM browse_start WHERE queue_name = $1")
                .bind(queue.as_str())
                .fetch_optional(self.pool())
                .await?;
        Ok(row.map(|(slice,)| Slice(slice)))
    }

    async fn compare_and_swap_browse_start(
        &self,
        queue: &QueueName,
        condition: SliceCondition,
        new: Slice,
    ) -> Result<bool> {
        let sql = match condition {
            SliceCondition::Absent => {
                "INSERT INTO browse_start (queue_name, slice) VALUES ($1, $2)
                 ON CONFLICT (queue_name) DO NOTHING"
            }
            SliceCondition::Below => {
                "UPDATE browse_start SET slice = $2, updated_at = now()
                 WHERE queue_name = $1 AND slice < $2"
            }
        };
        let rows_affected = sqlx::query(sql)
            .bind(queue.as_str())
            .bind(new.0)
            .execute(self.pool())
            .await?
            .rows_affected();
        Ok(rows_affected == 1)
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct EnqueuedItemRow {
    queue_name: String,
    slice: i64,
    bucket: i64,
    item_key: Uuid,
    enqueued_at: chrono::DateTime<chrono::Utc>,
    name: String,
    sender: Option<String>,
    recipients: Vec<String>,
    header_ref: String,
    body_ref: String,
    attributes: Json<BTreeMap<String, serde_json::Value>>,
}

impl EnqueuedItemRow {
    fn try_into_item(self) -> Result<EnqueuedItem> {
        let bucket = u32::try_from(self.bucket)
            .map_err(|_| Error::Other(format!("bucket {} out of range", self.bucket)))?;
        Ok(EnqueuedItem {
            queue: QueueName::from(self.queue_name),
            slice: Slice(self.slice),
            bucket: BucketId(bucket),
            key: ItemKey(self.item_key),
            enqueued_at: self.enqueued_at,
            name: self.name,
            sender: self.sender,
            recipients: self.recipients,
            header_ref: ContentRef(self.header_ref),
            body_ref: ContentRef(self.body_ref),
            attributes: self.attributes.0,
        })
    }
}
