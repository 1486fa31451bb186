use super::{next_stream_id, run_dtors, EngineStream, Lifecycle, RowInput, Status};
use crate::error::{Error, Result};
use crate::metrics::{GaugeMetric, MetricsReporter};
use candle_core::Tensor;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;

/// A batch of sentences to embed, packed back to back in `token_ids`.
#[derive(Debug, Clone)]
pub struct EmbeddingInput {
    pub request_id: String,
    pub token_ids: Vec<u32>,
    /// Token count of each sentence; sums to `token_ids.len()`.
    pub input_lengths: Vec<usize>,
    /// Zero disables the timeout.
    pub timeout_ms: u64,
}

impl EmbeddingInput {
    pub fn new(token_ids: Vec<u32>, input_lengths: Vec<usize>) -> Result<Self> {
        if input_lengths.is_empty() || input_lengths.iter().any(|len| *len == 0) {
            return Err(Error::InvalidInput(
                "every sentence needs at least one token".to_string(),
            ));
        }
        let total: usize = input_lengths.iter().sum();
        if total != token_ids.len() {
            return Err(Error::InvalidInput(format!(
                "input lengths sum to {} but {} tokens were given",
                total,
                token_ids.len()
            )));
        }
        Ok(Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            token_ids,
            input_lengths,
            timeout_ms: 0,
        })
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn batch_size(&self) -> usize {
        self.input_lengths.len()
    }

    pub fn total_tokens(&self) -> usize {
        self.token_ids.len()
    }
}

#[derive(Debug, Clone, Default)]
pub struct EmbeddingOutput {
    /// `[batch_size, hidden]` once finished.
    pub embeddings: Option<Tensor>,
    pub finished: bool,
    pub cost_time_ms: u64,
}

struct EmbeddingState {
    lifecycle: Lifecycle,
    output: EmbeddingOutput,
}

pub struct EmbeddingStream {
    id: u64,
    input: EmbeddingInput,
    begin: Instant,
    metrics: Arc<dyn MetricsReporter>,
    state: Mutex<EmbeddingState>,
}

impl EmbeddingStream {
    pub fn new(input: EmbeddingInput, metrics: Arc<dyn MetricsReporter>) -> Self {
        Self {
            id: next_stream_id(),
            input,
            begin: Instant::now(),
            metrics,
            state: Mutex::new(EmbeddingState {
                lifecycle: Lifecycle::new(),
                output: EmbeddingOutput::default(),
            }),
        }
    }

    pub fn input(&self) -> &EmbeddingInput {
        &self.input
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.begin.elapsed().as_millis() as u64
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().lifecycle.status() == Status::Finished
    }

    pub fn add_resource_dtor(&self, dtor: impl FnOnce() + Send + 'static) {
        let rejected = self.state.lock().lifecycle.push_dtor(Box::new(dtor));
        if let Some(dtor) = rejected {
            dtor();
        }
    }

    pub fn set_running(&self) -> Result<()> {
        self.state.lock().lifecycle.set_running(self.id)?;
        self.metrics
            .report(GaugeMetric::WaitTime, self.elapsed_ms() as f64);
        Ok(())
    }

    pub fn set_stop(&self, reason: &str) -> bool {
        let dtors = self.state.lock().lifecycle.stop(reason);
        match dtors {
            Some(dtors) => {
                run_dtors(dtors);
                true
            }
            None => false,
        }
    }

    pub fn check_timeout(&self) -> bool {
        let running_time = self.elapsed_ms();
        if self.input.timeout_ms > 0 && self.input.timeout_ms < running_time {
            return self.set_stop(&format!("query has been running {running_time} ms timeout"));
        }
        false
    }

    /// Stores one embedding row per sentence and finishes the stream.
    pub fn update(&self, rows: Vec<Tensor>) -> Result<()> {
        if rows.len() != self.input.batch_size() {
            return Err(Error::BeamMismatch {
                expected: self.input.batch_size(),
                actual: rows.len(),
            });
        }
        let embeddings = Tensor::stack(&rows, 0)?;
        let dtors = {
            let mut state = self.state.lock();
            state.lifecycle.ensure_live(self.id)?;
            state.output = EmbeddingOutput {
                embeddings: Some(embeddings),
                finished: true,
                cost_time_ms: self.elapsed_ms(),
            };
            state.lifecycle.finish()
        };
        run_dtors(dtors);
        Ok(())
    }
}

impl EngineStream for EmbeddingStream {
    type Output = Tensor;
    type Snapshot = EmbeddingOutput;

    fn id(&self) -> u64 {
        self.id
    }

    fn batch_size(&self) -> usize {
        self.input.batch_size()
    }

    fn model_input(&self) -> Vec<RowInput> {
        let mut offset = 0;
        self.input
            .input_lengths
            .iter()
            .map(|len| {
                let tokens = self.input.token_ids[offset..offset + len].to_vec();
                offset += len;
                RowInput {
                    tokens,
                    sequence_length: *len,
                    reuse_length: 0,
                    is_context: true,
                    blocks: Vec::new(),
                }
            })
            .collect()
    }

    fn apply_outputs(&self, outputs: Vec<Tensor>) -> Result<()> {
        self.update(outputs)
    }

    fn set_stop(&self, reason: &str) -> bool {
        EmbeddingStream::set_stop(self, reason)
    }

    fn check_timeout(&self) -> bool {
        EmbeddingStream::check_timeout(self)
    }

    fn status(&self) -> Status {
        self.state.lock().lifecycle.status()
    }

    fn error_info(&self) -> Option<String> {
        self.state.lock().lifecycle.error_info()
    }

    fn output(&self) -> EmbeddingOutput {
        self.state.lock().output.clone()
    }

    fn subscribe(&self) -> watch::Receiver<Status> {
        self.state.lock().lifecycle.subscribe()
    }
}

impl fmt::Debug for EmbeddingStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmbeddingStream")
            .field("id", &self.id)
            .field("request_id", &self.input.request_id)
            .field("batch_size", &self.input.batch_size())
            .field("status", &self.status())
            .finish()
    }
}
