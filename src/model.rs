//! Core data model.
//!
//! An enqueued item is a pointer to a mail that the transport has accepted.
//! The view never stores payload bytes, only references into the blob store,
//! so records stay small regardless of message size.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::{ContextV7, NoContext, Timestamp, Uuid};

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Name of one logical queue. Every other entity is scoped by it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueName(String);

impl QueueName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for QueueName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for QueueName {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Globally unique, time-ordered item identifier (UUIDv7). Newer keys
/// compare greater.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemKey(pub Uuid);

impl ItemKey {
    pub fn new() -> Self {
        Self::at(Utc::now())
    }

    /// Key whose time component is `at`, drawn from the process-wide
    /// [`KeyGenerator`].
    pub fn at(at: DateTime<Utc>) -> Self {
        static KEYS: KeyGenerator = KeyGenerator::new();
        KEYS.key_at(at)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Time component of the key. `None` for keys that are not UUIDv7.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        let (secs, nanos) = self.0.get_timestamp()?.to_unix();
        DateTime::from_timestamp(i64::try_from(secs).ok()?, nanos)
    }
}

impl Default for ItemKey {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ItemKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ItemKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| Error::Other(format!("invalid item key '{s}': {e}")))
    }
}

/// Mints UUIDv7 item keys. Keys for the current or a later millisecond
/// compare in creation order, including within one millisecond. A key for an
/// earlier millisecond (a replay) keeps its own timestamp and gets random low
/// bits.
pub struct KeyGenerator {
    state: Mutex<KeyState>,
}

struct KeyState {
    context: ContextV7,
    last_millis: u64,
}

impl KeyGenerator {
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(KeyState {
                context: ContextV7::new(),
                last_millis: 0,
            }),
        }
    }

    /// Timestamps before the epoch clamp to it.
    pub fn key_at(&self, at: DateTime<Utc>) -> ItemKey {
        let secs = at.timestamp().max(0) as u64;
        let nanos = if at.timestamp() < 0 {
            0
        } else {
            at.timestamp_subsec_nanos()
        };
        let millis = secs.saturating_mul(1_000) + u64::from(nanos / 1_000_000);

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let ts = if millis >= state.last_millis {
            state.last_millis = millis;
            Timestamp::from_unix(&state.context, secs, nanos)
        } else {
            Timestamp::from_unix(NoContext, secs, nanos)
        };
        ItemKey(Uuid::new_v7(ts))
    }
}

impl Default for KeyGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Time bucket: `floor(enqueued_at / slice_window)`. Slices are the browse
/// scan order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Slice(pub i64);

impl Slice {
    pub const MIN: Slice = Slice(i64::MIN);

    pub fn next(self) -> Slice {
        Slice(self.0.saturating_add(1))
    }

    pub fn saturating_sub(self, n: u32) -> Slice {
        Slice(self.0.saturating_sub(i64::from(n)))
    }
}

impl std::fmt::Display for Slice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Write fan-out dimension within a slice. Carries no time semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BucketId(pub u32);

impl std::fmt::Display for BucketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One physical partition of the index: `(queue, slice, bucket)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Partition {
    pub queue: QueueName,
    pub slice: Slice,
    pub bucket: BucketId,
}

impl Partition {
    pub fn new(queue: QueueName, slice: Slice, bucket: BucketId) -> Self {
        Self {
            queue,
            slice,
            bucket,
        }
    }
}

impl std::fmt::Display for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.queue, self.slice, self.bucket)
    }
}

/// Pointer into the external blob store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentRef(pub String);

impl std::fmt::Display for ContentRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContentRef {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// Enqueued item
// ---------------------------------------------------------------------------

/// Metadata of one item handed to the transport. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnqueuedItem {
    pub queue: QueueName,
    pub slice: Slice,
    pub bucket: BucketId,
    pub key: ItemKey,
    pub enqueued_at: DateTime<Utc>,

    /// Mail name as known by the producer (e.g. the SMTP transaction id).
    pub name: String,
    pub sender: Option<String>,
    pub recipients: Vec<String>,

    pub header_ref: ContentRef,
    pub body_ref: ContentRef,

    /// Arbitrary producer attributes. Opaque to the view.
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl EnqueuedItem {
    pub fn partition(&self) -> Partition {
        Partition::new(self.queue.clone(), self.slice, self.bucket)
    }
}

/// An enqueued item with its content resolved from the blob store.
#[derive(Debug, Clone)]
pub struct DetailedItem {
    pub item: EnqueuedItem,
    pub header: Vec<u8>,
    pub body: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Filter
// ---------------------------------------------------------------------------

/// Selects items for bulk removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemFilter {
    Name(String),
    Sender(String),
    Recipient(String),
}

impl ItemFilter {
    pub fn matches(&self, item: &EnqueuedItem) -> bool {
        match self {
            ItemFilter::Name(name) => item.name == *name,
            ItemFilter::Sender(sender) => item.sender.as_deref() == Some(sender.as_str()),
            ItemFilter::Recipient(rcpt) => item.recipients.iter().any(|r| r == rcpt),
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for the metadata of a freshly enqueued item. The public API for
/// recording into the index.
#[derive(Debug, Clone)]
pub struct NewItem {
    pub(crate) key: Option<ItemKey>,
    pub(crate) name: String,
    pub(crate) sender: Option<String>,
    pub(crate) recipients: Vec<String>,
    pub(crate) header_ref: ContentRef,
    pub(crate) body_ref: ContentRef,
    pub(crate) attributes: BTreeMap<String, serde_json::Value>,
}

impl NewItem {
    pub fn new(name: impl Into<String>, header_ref: ContentRef, body_ref: ContentRef) -> Self {
        Self {
            key: None,
            name: name.into(),
            sender: None,
            recipients: Vec::new(),
            header_ref,
            body_ref,
            attributes: BTreeMap::new(),
        }
    }

    /// Use a key assigned elsewhere (e.g. on a retried record). When unset,
    /// a key is derived from the enqueue timestamp.
    pub fn key(mut self, key: ItemKey) -> Self {
        self.key = Some(key);
        self
    }

    pub fn sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn recipient(mut self, recipient: impl Into<String>) -> Self {
        self.recipients.push(recipient.into());
        self
    }

    pub fn attribute(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(name.into(), value);
        self
    }
}
