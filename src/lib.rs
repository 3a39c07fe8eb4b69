//! Offline-first operation queue with bandwidth-aware sync.
//!
//! Local mutations are queued durably, then shipped in batches that are
//! delta-encoded against the last sent state, compressed at a level picked
//! from network and device conditions, chunked, and timed around network
//! quality.
//!
//! # Examples
//!
//! Queue only:
//! ```
//! use offsync::{config::QueueConfig, core::queue::OfflineOperationQueue};
//! use serde_json::json;
//!
//! let mut queue = OfflineOperationQueue::new(QueueConfig::default());
//! let data = json!({"title": "draft"}).as_object().cloned().unwrap();
//! let op = queue.enqueue_default("note.create", data, "session-1").unwrap();
//!
//! let batch = queue.get_next_batch(10);
//! assert_eq!(batch[0].id, op.id);
//! queue.mark_syncing([op.id.as_str()]);
//! queue.mark_synced(&op.id).unwrap();
//! assert_eq!(queue.get_stats().synced, 1);
//! ```
//!
//! Full pipeline:
//! ```
//! use offsync::{
//!     config::PipelineConfig,
//!     pipeline::{PipelineStep, SyncPipeline},
//!     types::Priority,
//! };
//! use serde_json::json;
//!
//! let mut pipeline = SyncPipeline::new(PipelineConfig::default()).unwrap();
//! let data = json!({"body": "hello"}).as_object().cloned().unwrap();
//! pipeline.enqueue("note.update", data, "s1", Priority::High).unwrap();
//!
//! // no samples yet: the default window is good, so this sends now
//! let PipelineStep::Ready(batch) = pipeline.next_step(false).unwrap() else {
//!     panic!("expected a ready batch");
//! };
//! assert_eq!(pipeline.complete(&batch.operation_ids), 1);
//! ```
//!
//! Background saving:
//! ```no_run
//! use offsync::{
//!     config::{QueueConfig, SaverConfig},
//!     core::queue::OfflineOperationQueue,
//!     persist::sqlite::SqliteAdapter,
//!     runtime::saver::spawn_queue_saver,
//! };
//!
//! # #[tokio::main]
//! # async fn main() {
//! let adapter = SqliteAdapter::open("offsync.db").expect("open sqlite");
//! let saver = spawn_queue_saver(Box::new(adapter), SaverConfig::default());
//! let queue = OfflineOperationQueue::new(QueueConfig::default());
//! saver.request_queue_save(&queue).await.expect("save");
//! saver.shutdown().await.expect("shutdown");
//! # }
//! ```

/// Injectable clocks and id generators.
pub mod clock;
/// Serde configuration for every component.
pub mod config;
/// The operation queue.
pub mod core;
/// Delta, compression, prefetch, timing and adaptive engines.
pub mod engine;
/// Operation records and their persisted form.
pub mod operation;
/// Key/value persistence adapters.
pub mod persist;
/// All engines wired into a send loop.
pub mod pipeline;
/// Queue events and the background saver.
pub mod runtime;
/// Shared primitive types and enums.
pub mod types;
