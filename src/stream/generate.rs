use super::stop::{StopCriterion, StopWordsCriterion};
use super::{next_stream_id, run_dtors, EngineStream, Lifecycle, RowInput, Status};
use crate::error::{Error, Result};
use crate::metrics::{GaugeMetric, MetricsReporter};
use candle_core::Tensor;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GenerateConfig {
    pub num_beams: usize,
    pub max_new_tokens: usize,
    pub min_new_tokens: usize,
    /// Zero disables the timeout.
    pub timeout_ms: u64,
    pub stop_words_list: Vec<Vec<u32>>,
}

impl Default for GenerateConfig {
    fn default() -> Self {
        Self {
            num_beams: 1,
            max_new_tokens: 8192,
            min_new_tokens: 0,
            timeout_ms: 0,
            stop_words_list: Vec::new(),
        }
    }
}

/// A client request as handed to the scheduler.
#[derive(Clone)]
pub struct GenerateInput {
    pub request_id: String,
    pub token_ids: Vec<u32>,
    pub generate_config: GenerateConfig,
    pub lora_id: Option<i64>,
    /// Extra criteria evaluated after the configured stop words.
    pub stop_criteria: Vec<Arc<dyn StopCriterion>>,
}

impl GenerateInput {
    pub fn new(token_ids: Vec<u32>, generate_config: GenerateConfig) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            token_ids,
            generate_config,
            lora_id: None,
            stop_criteria: Vec::new(),
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn with_lora(mut self, lora_id: i64) -> Self {
        self.lora_id = Some(lora_id);
        self
    }

    pub fn with_stop_criterion(mut self, criterion: Arc<dyn StopCriterion>) -> Self {
        self.stop_criteria.push(criterion);
        self
    }

    pub fn input_length(&self) -> usize {
        self.token_ids.len()
    }
}

impl fmt::Debug for GenerateInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerateInput")
            .field("request_id", &self.request_id)
            .field("input_length", &self.token_ids.len())
            .field("generate_config", &self.generate_config)
            .field("lora_id", &self.lora_id)
            .field("stop_criteria", &self.stop_criteria.len())
            .finish()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuxInfo {
    pub cost_time_ms: u64,
    pub input_len: usize,
    pub output_len: usize,
    pub reuse_len: usize,
    pub cum_log_probs: Option<Vec<f32>>,
    pub iter_count: usize,
}

#[derive(Debug, Clone, Default)]
pub struct GenerateOutput {
    /// Generated ids per beam, prompt excluded.
    pub output_ids: Vec<Vec<u32>>,
    pub hidden_states: Option<Tensor>,
    pub logits: Option<Tensor>,
    pub finished: bool,
    pub aux_info: AuxInfo,
}

/// One iteration's worth of results for a whole stream.
#[derive(Debug, Clone, Default)]
pub struct StreamUpdate {
    /// One row per beam, all rows the same length.
    pub new_tokens: Vec<Vec<u32>>,
    pub finished: bool,
    pub hidden_states: Option<Tensor>,
    pub logits: Option<Tensor>,
    pub cum_log_probs: Option<Vec<f32>>,
}

/// Executor output for a single beam.
#[derive(Debug, Clone, Default)]
pub struct BeamOutput {
    pub token_ids: Vec<u32>,
    pub finished: bool,
    pub hidden_states: Option<Tensor>,
    pub logits: Option<Tensor>,
    pub cum_log_prob: Option<f32>,
}

struct GenerateState {
    lifecycle: Lifecycle,
    seq_length: usize,
    /// `[num_beams, max_seq_len]`, row-major. Only `[.., ..seq_length]` is valid.
    complete_token_ids: Box<[u32]>,
    cum_log_probs: Vec<f32>,
    block_indice: Vec<Vec<u32>>,
    reuse_length: usize,
    output: GenerateOutput,
}

pub struct GenerateStream {
    id: u64,
    input: GenerateInput,
    max_seq_len: usize,
    num_beams: usize,
    begin: Instant,
    stop_criteria: Vec<Arc<dyn StopCriterion>>,
    metrics: Arc<dyn MetricsReporter>,
    state: Mutex<GenerateState>,
}

impl GenerateStream {
    pub fn new(
        input: GenerateInput,
        max_seq_len: usize,
        metrics: Arc<dyn MetricsReporter>,
    ) -> Result<Self> {
        let num_beams = input.generate_config.num_beams;
        let input_length = input.input_length();
        if num_beams == 0 {
            return Err(Error::InvalidInput("num_beams must be positive".to_string()));
        }
        if input_length == 0 {
            return Err(Error::InvalidInput(format!(
                "request {} has an empty prompt",
                input.request_id
            )));
        }
        if input_length >= max_seq_len {
            return Err(Error::InvalidInput(format!(
                "request {} prompt length {} leaves no room under max_seq_len {}",
                input.request_id, input_length, max_seq_len
            )));
        }

        let mut complete_token_ids = vec![0u32; num_beams * max_seq_len].into_boxed_slice();
        for beam in 0..num_beams {
            let offset = beam * max_seq_len;
            complete_token_ids[offset..offset + input_length].copy_from_slice(&input.token_ids);
        }

        let mut stop_criteria: Vec<Arc<dyn StopCriterion>> = Vec::new();
        let stop_words = StopWordsCriterion::new(input.generate_config.stop_words_list.clone());
        if !stop_words.is_empty() {
            stop_criteria.push(Arc::new(stop_words));
        }
        stop_criteria.extend(input.stop_criteria.iter().cloned());

        let state = GenerateState {
            lifecycle: Lifecycle::new(),
            seq_length: input_length,
            complete_token_ids,
            cum_log_probs: vec![0.0; num_beams],
            block_indice: vec![Vec::new(); num_beams],
            reuse_length: 0,
            output: GenerateOutput {
                output_ids: vec![Vec::new(); num_beams],
                aux_info: AuxInfo {
                    input_len: input_length,
                    ..Default::default()
                },
                ..Default::default()
            },
        };

        Ok(Self {
            id: next_stream_id(),
            input,
            max_seq_len,
            num_beams,
            begin: Instant::now(),
            stop_criteria,
            metrics,
            state: Mutex::new(state),
        })
    }

    pub fn stream_id(&self) -> u64 {
        self.id
    }

    pub fn request_id(&self) -> &str {
        &self.input.request_id
    }

    pub fn input_length(&self) -> usize {
        self.input.input_length()
    }

    pub fn prompt(&self) -> &[u32] {
        &self.input.token_ids
    }

    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    pub fn num_beams(&self) -> usize {
        self.num_beams
    }

    pub fn generate_config(&self) -> &GenerateConfig {
        &self.input.generate_config
    }

    pub fn lora_id(&self) -> Option<i64> {
        self.input.lora_id
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.begin.elapsed().as_millis() as u64
    }

    pub fn seq_length(&self) -> usize {
        self.state.lock().seq_length
    }

    pub fn reuse_length(&self) -> usize {
        self.state.lock().reuse_length
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().lifecycle.status() == Status::Finished
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().lifecycle.status() == Status::Stopped
    }

    pub fn cum_log_probs(&self) -> Vec<f32> {
        self.state.lock().cum_log_probs.clone()
    }

    pub fn block_indice(&self) -> Vec<Vec<u32>> {
        self.state.lock().block_indice.clone()
    }

    /// Valid prefix of the token buffer, one row per beam.
    pub fn complete_token_ids(&self) -> Vec<Vec<u32>> {
        let state = self.state.lock();
        self.rows(&state, 0, state.seq_length)
    }

    fn rows(&self, state: &GenerateState, from: usize, to: usize) -> Vec<Vec<u32>> {
        (0..self.num_beams)
            .map(|beam| {
                let offset = beam * self.max_seq_len;
                state.complete_token_ids[offset + from..offset + to].to_vec()
            })
            .collect()
    }

    pub fn add_resource_dtor(&self, dtor: impl FnOnce() + Send + 'static) {
        let rejected = self.state.lock().lifecycle.push_dtor(Box::new(dtor));
        if let Some(dtor) = rejected {
            dtor();
        }
    }

    pub fn set_running(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.lifecycle.set_running(self.id)?;
        self.metrics
            .report(GaugeMetric::WaitTime, self.elapsed_ms() as f64);
        Ok(())
    }

    /// Returns false if the stream was already terminal.
    pub fn set_stop(&self, reason: &str) -> bool {
        let dtors = self.state.lock().lifecycle.stop(reason);
        match dtors {
            Some(dtors) => {
                tracing::debug!("stream {} stopped: {}", self.id, reason);
                run_dtors(dtors);
                true
            }
            None => false,
        }
    }

    pub fn check_timeout(&self) -> bool {
        let timeout_ms = self.input.generate_config.timeout_ms;
        let running_time = self.elapsed_ms();
        if timeout_ms > 0 && timeout_ms < running_time {
            return self.set_stop(&format!("query has been running {running_time} ms timeout"));
        }
        false
    }

    pub fn set_kvcache(&self, block_indice: Vec<Vec<u32>>, reuse_length: usize) -> Result<()> {
        if block_indice.len() != self.num_beams {
            return Err(Error::BeamMismatch {
                expected: self.num_beams,
                actual: block_indice.len(),
            });
        }
        if reuse_length > self.input_length() {
            return Err(Error::InvalidInput(format!(
                "reuse length {} exceeds prompt length {}",
                reuse_length,
                self.input_length()
            )));
        }
        let mut state = self.state.lock();
        state.lifecycle.ensure_live(self.id)?;
        state.block_indice = block_indice;
        state.reuse_length = reuse_length;
        state.output.aux_info.reuse_len = reuse_length;
        Ok(())
    }

    pub fn add_block_index(&self, block_index: Vec<Vec<u32>>) -> Result<()> {
        let mut state = self.state.lock();
        state.lifecycle.ensure_live(self.id)?;
        if block_index.len() != state.block_indice.len() {
            return Err(Error::BeamMismatch {
                expected: state.block_indice.len(),
                actual: block_index.len(),
            });
        }
        for (owned, added) in state.block_indice.iter_mut().zip(block_index) {
            owned.extend(added);
        }
        Ok(())
    }

    /// Takes the block table, leaving one empty list per beam.
    pub fn pop_block_indice(&self) -> Vec<Vec<u32>> {
        let mut state = self.state.lock();
        std::mem::replace(&mut state.block_indice, vec![Vec::new(); self.num_beams])
    }

    pub fn update(&self, update: StreamUpdate) -> Result<()> {
        let StreamUpdate {
            new_tokens,
            mut finished,
            hidden_states,
            logits,
            cum_log_probs,
        } = update;
        if new_tokens.len() != self.num_beams {
            return Err(Error::BeamMismatch {
                expected: self.num_beams,
                actual: new_tokens.len(),
            });
        }
        let step = new_tokens[0].len();
        if new_tokens.iter().any(|row| row.len() != step) {
            return Err(Error::InvalidInput(format!(
                "stream {} got ragged token rows",
                self.id
            )));
        }
        if let Some(probs) = &cum_log_probs {
            if probs.len() != self.num_beams {
                return Err(Error::BeamMismatch {
                    expected: self.num_beams,
                    actual: probs.len(),
                });
            }
        }

        let dtors = {
            let mut state = self.state.lock();
            state.lifecycle.ensure_live(self.id)?;
            if state.output.aux_info.iter_count == 0 {
                self.metrics
                    .report(GaugeMetric::FirstTokenRt, self.elapsed_ms() as f64);
            }
            for i in 0..step {
                let pos = state.seq_length;
                for (beam, row) in new_tokens.iter().enumerate() {
                    state.complete_token_ids[beam * self.max_seq_len + pos] = row[i];
                }
                state.seq_length += 1;
                if self.need_finish(&state) {
                    finished = true;
                    break;
                }
            }
            if let Some(probs) = &cum_log_probs {
                state.cum_log_probs.copy_from_slice(probs);
            }

            let output_len = state.seq_length - self.input_length();
            let cost_time_ms = self.elapsed_ms();
            let aux = &mut state.output.aux_info;
            aux.cost_time_ms = cost_time_ms;
            aux.output_len = output_len;
            aux.cum_log_probs = cum_log_probs;
            aux.iter_count += 1;
            state.output.hidden_states = hidden_states;
            state.output.logits = logits;
            state.output.finished = finished;

            if finished {
                Some(state.lifecycle.finish())
            } else {
                None
            }
        };
        if let Some(dtors) = dtors {
            tracing::debug!("stream {} finished", self.id);
            run_dtors(dtors);
        }
        Ok(())
    }

    /// The length cap ignores `min_new_tokens`; only stop criteria are gated.
    fn need_finish(&self, state: &GenerateState) -> bool {
        let config = &self.input.generate_config;
        let input_length = self.input_length();
        let max_length = self
            .max_seq_len
            .min(input_length.saturating_add(config.max_new_tokens));
        state.seq_length >= max_length
            || (state.seq_length >= input_length.saturating_add(config.min_new_tokens)
                && self.invoke_stop_criteria(state))
    }

    fn invoke_stop_criteria(&self, state: &GenerateState) -> bool {
        let input_length = self.input_length();
        if state.seq_length == input_length {
            return false;
        }
        let generated = &state.complete_token_ids[input_length..state.seq_length];
        self.stop_criteria
            .iter()
            .any(|criterion| criterion.should_stop(generated))
    }
}

impl EngineStream for GenerateStream {
    type Output = BeamOutput;
    type Snapshot = GenerateOutput;

    fn id(&self) -> u64 {
        self.id
    }

    fn batch_size(&self) -> usize {
        self.num_beams
    }

    fn model_input(&self) -> Vec<RowInput> {
        let state = self.state.lock();
        let is_context = state.output.aux_info.iter_count == 0;
        let from = if is_context {
            state.reuse_length
        } else {
            state.seq_length - 1
        };
        self.rows(&state, from, state.seq_length)
            .into_iter()
            .zip(state.block_indice.iter())
            .map(|(tokens, blocks)| RowInput {
                tokens,
                sequence_length: state.seq_length,
                reuse_length: state.reuse_length,
                is_context,
                blocks: blocks.clone(),
            })
            .collect()
    }

    fn apply_outputs(&self, outputs: Vec<BeamOutput>) -> Result<()> {
        if outputs.len() != self.num_beams {
            return Err(Error::BeamMismatch {
                expected: self.num_beams,
                actual: outputs.len(),
            });
        }
        let finished = outputs.iter().all(|o| o.finished);
        let hidden_states = stack_rows(outputs.iter().map(|o| o.hidden_states.as_ref()))?;
        let logits = stack_rows(outputs.iter().map(|o| o.logits.as_ref()))?;
        let cum_log_probs = outputs
            .iter()
            .map(|o| o.cum_log_prob)
            .collect::<Option<Vec<_>>>();
        let new_tokens = outputs.into_iter().map(|o| o.token_ids).collect();
        self.update(StreamUpdate {
            new_tokens,
            finished,
            hidden_states,
            logits,
            cum_log_probs,
        })
    }

    fn set_stop(&self, reason: &str) -> bool {
        GenerateStream::set_stop(self, reason)
    }

    fn check_timeout(&self) -> bool {
        GenerateStream::check_timeout(self)
    }

    fn status(&self) -> Status {
        self.state.lock().lifecycle.status()
    }

    fn error_info(&self) -> Option<String> {
        self.state.lock().lifecycle.error_info()
    }

    /// Output ids are materialised from the token buffer at snapshot time.
    fn output(&self) -> GenerateOutput {
        let state = self.state.lock();
        let mut output = state.output.clone();
        output.output_ids = self.rows(&state, self.input_length(), state.seq_length);
        output
    }

    fn subscribe(&self) -> watch::Receiver<Status> {
        self.state.lock().lifecycle.subscribe()
    }
}

/// Stacks per-beam tensors along a new leading axis; None unless every beam
/// has one.
fn stack_rows<'a>(rows: impl Iterator<Item = Option<&'a Tensor>>) -> Result<Option<Tensor>> {
    let rows = match rows.collect::<Option<Vec<_>>>() {
        Some(rows) if !rows.is_empty() => rows,
        _ => return Ok(None),
    };
    Ok(Some(Tensor::stack(&rows, 0)?))
}

impl PartialEq for GenerateStream {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for GenerateStream {}

impl Hash for GenerateStream {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for GenerateStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("GenerateStream")
            .field("id", &self.id)
            .field("request_id", &self.input.request_id)
            .field("status", &state.lifecycle.status())
            .field("input_length", &self.input_length())
            .field("seq_length", &state.seq_length)
            .field("max_seq_len", &self.max_seq_len)
            .field("reuse_length", &state.reuse_length)
            .finish()
    }
}
