//! # mailqueue-view
//!
//! Browsable, cancellable index over an at-least-once mail queue transport.
//!
//! Items the transport accepted are recorded into time-sliced, hash-bucketed
//! partitions so operators can list, count and delete what is still queued
//! without touching the transport itself. Storage is pluggable (in-memory or
//! Postgres via sqlx), the transport adapter uses pgmq, and everything is
//! observable through OpenTelemetry.

pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod model;
pub mod store;
pub mod telemetry;
pub mod transport;
pub mod view;

pub use error::{Error, Result};
pub use view::QueueView;
