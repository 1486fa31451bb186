//! The forward pass seen from the engine loop.
//!
//! A real deployment plugs a model runner in here. The synthetic executors
//! produce deterministic results so the engine can be driven without a
//! model, from the CLI or from tests.

use crate::batch::BatchedInput;
use crate::error::{Error, Result};
use crate::stream::BeamOutput;
use candle_core::Tensor;
use rand::Rng;
use std::time::Duration;

pub trait Executor: Send + 'static {
    /// One element per batch row.
    type Output: Send + 'static;

    fn process(&mut self, batch: &BatchedInput) -> Result<Vec<Self::Output>>;

    /// Waits for outstanding device work. Only called on the coordinating
    /// rank, before outputs are handed to the streams.
    fn synchronize(&mut self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    Error(String),
    Panic(String),
}

/// Emits `last_token + 1` (mod vocab) for every row.
#[derive(Debug, Clone)]
pub struct SyntheticExecutor {
    vocab_size: u32,
    hidden_size: Option<usize>,
    delay: Duration,
    jitter_ms: u64,
    faults: Vec<(usize, Fault)>,
    iteration: usize,
}

impl SyntheticExecutor {
    pub fn new(vocab_size: u32) -> Self {
        Self {
            vocab_size: vocab_size.max(1),
            hidden_size: None,
            delay: Duration::ZERO,
            jitter_ms: 0,
            faults: Vec::new(),
            iteration: 0,
        }
    }

    pub fn with_delay(mut self, delay_ms: u64) -> Self {
        self.delay = Duration::from_millis(delay_ms);
        self
    }

    pub fn with_jitter(mut self, jitter_ms: u64) -> Self {
        self.jitter_ms = jitter_ms;
        self
    }

    /// Attach a `[hidden_size]` hidden-state row to every output.
    pub fn with_hidden_states(mut self, hidden_size: usize) -> Self {
        self.hidden_size = Some(hidden_size);
        self
    }

    /// Inject `fault` on the given 1-based call to `process`.
    pub fn with_fault(mut self, iteration: usize, fault: Fault) -> Self {
        self.faults.push((iteration, fault));
        self
    }

    pub fn iterations(&self) -> usize {
        self.iteration
    }

    fn sleep(&self) {
        let mut delay = self.delay;
        if self.jitter_ms > 0 {
            delay += Duration::from_millis(rand::rng().random_range(0..=self.jitter_ms));
        }
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
    }
}

impl Executor for SyntheticExecutor {
    type Output = BeamOutput;

    fn process(&mut self, batch: &BatchedInput) -> Result<Vec<BeamOutput>> {
        self.iteration += 1;
        self.sleep();
        if let Some((_, fault)) = self.faults.iter().find(|(at, _)| *at == self.iteration) {
            match fault {
                Fault::Error(message) => return Err(Error::executor(message.clone())),
                Fault::Panic(message) => panic!("{}", message),
            }
        }

        let device = batch.input_ids.device();
        (0..batch.batch_size())
            .map(|row| -> Result<BeamOutput> {
                let last = batch.row_tokens(row).last().copied().unwrap_or(0);
                let next = (last + 1) % self.vocab_size;
                let hidden_states = match self.hidden_size {
                    Some(hidden) => Some(Tensor::from_vec(
                        vec![next as f32; hidden],
                        hidden,
                        device,
                    )?),
                    None => None,
                };
                Ok(BeamOutput {
                    token_ids: vec![next],
                    hidden_states,
                    ..Default::default()
                })
            })
            .collect()
    }
}

/// Mean-pools a fixed pseudo-embedding table over each row's tokens.
#[derive(Debug, Clone)]
pub struct SyntheticEmbeddingExecutor {
    hidden_size: usize,
}

impl SyntheticEmbeddingExecutor {
    pub fn new(hidden_size: usize) -> Self {
        Self {
            hidden_size: hidden_size.max(1),
        }
    }

    fn embed(&self, token: u32, dim: usize) -> f32 {
        ((token as usize * 31 + dim * 17) % 97) as f32 / 97.0
    }
}

impl Executor for SyntheticEmbeddingExecutor {
    type Output = Tensor;

    fn process(&mut self, batch: &BatchedInput) -> Result<Vec<Tensor>> {
        let device = batch.input_ids.device();
        (0..batch.batch_size())
            .map(|row| -> Result<Tensor> {
                let tokens = batch.row_tokens(row);
                let table = tokens
                    .iter()
                    .flat_map(|token| (0..self.hidden_size).map(move |dim| (*token, dim)))
                    .map(|(token, dim)| self.embed(token, dim))
                    .collect::<Vec<_>>();
                let table = Tensor::from_vec(table, (tokens.len(), self.hidden_size), device)?;
                Ok(table.mean(0)?)
            })
            .collect()
    }
}
