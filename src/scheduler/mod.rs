//! Admission and batch selection. The engine only needs the [`Scheduler`]
//! trait; the implementations here are simple first-come-first-served
//! policies good enough to drive the engine end to end.

pub mod embedding;
pub mod fifo;
pub mod kv_cache;

use crate::error::Result;
use crate::stream::EngineStream;
use std::sync::Arc;

pub use embedding::EmbeddingScheduler;
pub use fifo::FifoScheduler;
pub use kv_cache::KvCacheManager;

pub trait Scheduler: Send + Sync + 'static {
    type Request: Send;
    type Stream: EngineStream;

    /// Wraps the request in a new WAITING stream and queues it.
    fn enqueue(&self, request: Self::Request) -> Result<Arc<Self::Stream>>;

    /// Streams to run this iteration. Every returned stream is RUNNING.
    fn schedule(&self) -> Result<Vec<Arc<Self::Stream>>>;

    fn wait_queue_size(&self) -> usize;
}
