//! Seams to the systems around the view: the transport that actually moves
//! mail, and the blob store holding header and body bytes.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{ContentRef, ItemKey, QueueName};

/// What the view hands to the transport for one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportMessage {
    pub queue: QueueName,
    pub key: ItemKey,
    pub name: String,
    pub enqueued_at: DateTime<Utc>,
    pub header_ref: ContentRef,
    pub body_ref: ContentRef,
}

/// Transport-side identifier of an accepted message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransportReceipt(pub String);

impl std::fmt::Display for TransportReceipt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Durably accept a message. Once this returns `Ok` the message will be
    /// delivered whether or not it is indexed.
    async fn enqueue(&self, message: &TransportMessage) -> Result<TransportReceipt>;
}

/// Transport that only remembers what it was given.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    sent: Mutex<Vec<TransportMessage>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<TransportMessage> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn enqueue(&self, message: &TransportMessage) -> Result<TransportReceipt> {
        let mut sent = self.sent.lock().unwrap_or_else(|e| e.into_inner());
        sent.push(message.clone());
        Ok(TransportReceipt(sent.len().to_string()))
    }
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, bytes: Vec<u8>) -> Result<ContentRef>;

    /// Fails with [`Error::ContentMissing`] for unknown references.
    async fn get(&self, content: &ContentRef) -> Result<Vec<u8>>;
}

#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<ContentRef, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remove(&self, content: &ContentRef) {
        self.blobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(content);
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, bytes: Vec<u8>) -> Result<ContentRef> {
        let content = ContentRef(Uuid::new_v4().to_string());
        self.blobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(content.clone(), bytes);
        Ok(content)
    }

    async fn get(&self, content: &ContentRef) -> Result<Vec<u8>> {
        self.blobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(content)
            .cloned()
            .ok_or_else(|| Error::ContentMissing(content.to_string()))
    }
}
