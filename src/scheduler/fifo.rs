use super::{KvCacheManager, Scheduler};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::metrics::MetricsReporter;
use crate::stream::{EngineStream, GenerateInput, GenerateStream};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Default)]
struct Queues {
    waiting: VecDeque<Arc<GenerateStream>>,
    running: Vec<Arc<GenerateStream>>,
}

/// First-come-first-served generation scheduler. Admitted streams stay in
/// the running set and are scheduled every iteration until they terminate.
pub struct FifoScheduler {
    max_seq_len: usize,
    max_batch_size: usize,
    max_batch_tokens: usize,
    kv_cache: Option<Arc<KvCacheManager>>,
    metrics: Arc<dyn MetricsReporter>,
    queues: Mutex<Queues>,
}

impl FifoScheduler {
    pub fn new(
        config: &EngineConfig,
        kv_cache: Option<Arc<KvCacheManager>>,
        metrics: Arc<dyn MetricsReporter>,
    ) -> Self {
        Self {
            max_seq_len: config.max_seq_len,
            max_batch_size: config.max_batch_size,
            max_batch_tokens: config.max_batch_tokens,
            kv_cache,
            metrics,
            queues: Mutex::new(Queues::default()),
        }
    }

    pub fn kv_cache(&self) -> Option<&Arc<KvCacheManager>> {
        self.kv_cache.as_ref()
    }

    pub fn running_size(&self) -> usize {
        self.queues.lock().running.len()
    }

    /// Grows a running stream's block table so the token fed this
    /// iteration has a slot.
    fn reserve_decode_blocks(cache: &KvCacheManager, stream: &GenerateStream) -> Result<()> {
        let held = stream.block_indice().first().map_or(0, |beam| beam.len());
        let needed = cache.blocks_for(stream.seq_length()).saturating_sub(held);
        if needed == 0 {
            return Ok(());
        }
        let blocks = cache.allocate(needed, stream.num_beams())?;
        if let Err(e) = stream.add_block_index(blocks.clone()) {
            cache.release(blocks);
            return Err(e);
        }
        Ok(())
    }

    /// Installs the prompt's blocks and the callback that hands them back
    /// once the stream terminates.
    fn admit_blocks(cache: &Arc<KvCacheManager>, stream: &Arc<GenerateStream>) -> Result<()> {
        let (table, reuse_length) = cache.allocate_prompt(stream.prompt(), stream.num_beams())?;
        if let Err(e) = stream.set_kvcache(table.clone(), reuse_length) {
            cache.release(table);
            return Err(e);
        }
        let weak = Arc::downgrade(stream);
        let cache = cache.clone();
        stream.add_resource_dtor(move || {
            let Some(stream) = weak.upgrade() else {
                return;
            };
            let table = stream.pop_block_indice();
            if stream.is_finished() {
                cache.release_finished(stream.prompt(), table);
            } else {
                cache.release(table);
            }
        });
        Ok(())
    }
}

impl Scheduler for FifoScheduler {
    type Request = GenerateInput;
    type Stream = GenerateStream;

    fn enqueue(&self, request: GenerateInput) -> Result<Arc<GenerateStream>> {
        let stream = Arc::new(GenerateStream::new(
            request,
            self.max_seq_len,
            self.metrics.clone(),
        )?);
        if let Some(cache) = &self.kv_cache {
            let needed = cache.blocks_for(stream.input_length()) * stream.num_beams();
            if needed > cache.num_blocks() {
                return Err(Error::InvalidInput(format!(
                    "prompt of {} tokens needs {} KV blocks but only {} exist",
                    stream.input_length(),
                    needed,
                    cache.num_blocks()
                )));
            }
        }
        if stream.num_beams() > self.max_batch_size {
            return Err(Error::InvalidInput(format!(
                "{} beams exceed max_batch_size {}",
                stream.num_beams(),
                self.max_batch_size
            )));
        }
        self.queues.lock().waiting.push_back(stream.clone());
        Ok(stream)
    }

    fn schedule(&self) -> Result<Vec<Arc<GenerateStream>>> {
        let mut queues = self.queues.lock();

        queues.running.retain(|stream| !stream.status().is_terminal());
        queues
            .waiting
            .retain(|stream| !stream.check_timeout() && !stream.status().is_terminal());

        let mut batch_size = 0;
        let mut batch_tokens = 0;
        let mut running = Vec::with_capacity(queues.running.len());
        for stream in std::mem::take(&mut queues.running) {
            if let Some(cache) = &self.kv_cache {
                if let Err(e) = Self::reserve_decode_blocks(cache, &stream) {
                    tracing::warn!("stream {} ran out of KV blocks: {}", stream.id(), e);
                    stream.set_stop(&e.to_string());
                    continue;
                }
            }
            batch_size += stream.num_beams();
            batch_tokens += stream.num_beams();
            running.push(stream);
        }

        while let Some(stream) = queues.waiting.front().cloned() {
            let context_tokens = stream.input_length() * stream.num_beams();
            if batch_size + stream.num_beams() > self.max_batch_size {
                break;
            }
            if batch_size > 0 && batch_tokens + context_tokens > self.max_batch_tokens {
                break;
            }
            if let Some(cache) = &self.kv_cache {
                match Self::admit_blocks(cache, &stream) {
                    Ok(()) => {}
                    // Head of line waits for blocks to come back.
                    Err(Error::CacheExhausted { .. }) => break,
                    Err(e) => {
                        queues.waiting.pop_front();
                        stream.set_stop(&e.to_string());
                        continue;
                    }
                }
            }
            queues.waiting.pop_front();
            // The caller may stop the stream after it was picked; its blocks
            // went back with the stop.
            if let Err(e) = stream.set_running() {
                tracing::debug!("skipping stream {}: {}", stream.id(), e);
                continue;
            }
            batch_size += stream.num_beams();
            batch_tokens += context_tokens;
            running.push(stream);
        }

        queues.running = running.clone();
        Ok(running)
    }

    fn wait_queue_size(&self) -> usize {
        self.queues.lock().waiting.len()
    }
}
