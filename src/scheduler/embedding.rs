use super::Scheduler;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::metrics::MetricsReporter;
use crate::stream::{EmbeddingInput, EmbeddingStream, EngineStream};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// Embedding requests finish in the iteration they run in, so each stream is
/// scheduled exactly once. Batches are capped by token count; a single
/// request larger than the cap still runs alone.
pub struct EmbeddingScheduler {
    max_batch_tokens: usize,
    metrics: Arc<dyn MetricsReporter>,
    waiting: Mutex<VecDeque<Arc<EmbeddingStream>>>,
}

impl EmbeddingScheduler {
    pub fn new(config: &EngineConfig, metrics: Arc<dyn MetricsReporter>) -> Self {
        Self {
            max_batch_tokens: config.max_batch_tokens,
            metrics,
            waiting: Mutex::new(VecDeque::new()),
        }
    }
}

impl Scheduler for EmbeddingScheduler {
    type Request = EmbeddingInput;
    type Stream = EmbeddingStream;

    fn enqueue(&self, request: EmbeddingInput) -> Result<Arc<EmbeddingStream>> {
        let stream = Arc::new(EmbeddingStream::new(request, self.metrics.clone()));
        self.waiting.lock().push_back(stream.clone());
        Ok(stream)
    }

    fn schedule(&self) -> Result<Vec<Arc<EmbeddingStream>>> {
        let mut waiting = self.waiting.lock();
        waiting.retain(|stream| !stream.check_timeout() && !stream.status().is_terminal());

        let mut batch = Vec::new();
        let mut batch_tokens = 0;
        while let Some(stream) = waiting.front() {
            let tokens = stream.input().total_tokens();
            if !batch.is_empty() && batch_tokens + tokens > self.max_batch_tokens {
                break;
            }
            if let Some(stream) = waiting.pop_front() {
                // Stopped by its caller since the timeout sweep.
                if let Err(e) = stream.set_running() {
                    tracing::debug!("skipping stream {}: {}", stream.id(), e);
                    continue;
                }
                batch_tokens += tokens;
                batch.push(stream);
            }
        }
        Ok(batch)
    }

    fn wait_queue_size(&self) -> usize {
        self.waiting.lock().len()
    }
}
