//! Per-request serving state.
//!
//! A stream is shared between the engine thread (which mutates it once per
//! iteration) and the async caller waiting for it. Every stream kind guards
//! its mutable state with its own lock and only hands out snapshots.

pub mod embedding;
pub mod generate;
pub mod stop;

use crate::error::{Error, Result};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;

pub use embedding::{EmbeddingInput, EmbeddingOutput, EmbeddingStream};
pub use generate::{
    AuxInfo, BeamOutput, GenerateConfig, GenerateInput, GenerateOutput, GenerateStream,
    StreamUpdate,
};
pub use stop::{StopCriterion, StopWordsCriterion};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Waiting,
    Running,
    Stopped,
    Finished,
}

impl Status {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Stopped | Status::Finished)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Waiting => "WAITING",
            Status::Running => "RUNNING",
            Status::Stopped => "STOPPED",
            Status::Finished => "FINISHED",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Release callback registered when a resource is acquired for a stream.
pub type ResourceDtor = Box<dyn FnOnce() + Send + 'static>;

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(0);

pub(crate) fn next_stream_id() -> u64 {
    NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed)
}

pub(crate) fn run_dtors(dtors: Vec<ResourceDtor>) {
    for dtor in dtors {
        dtor();
    }
}

/// One batch row contributed by a stream: a beam for generation, a sentence
/// for embedding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowInput {
    /// Tokens to feed this iteration.
    pub tokens: Vec<u32>,
    /// Total tokens in the row after this iteration's input.
    pub sequence_length: usize,
    /// Leading tokens already present in the KV cache.
    pub reuse_length: usize,
    /// Whether this is the row's first (context) pass.
    pub is_context: bool,
    pub blocks: Vec<u32>,
}

/// What the engine loop needs from any kind of stream.
pub trait EngineStream: Send + Sync + 'static {
    /// One element of the executor's flat output collection.
    type Output: Send + 'static;
    /// Point-in-time copy handed to callers.
    type Snapshot: Clone + Send + 'static;

    fn id(&self) -> u64;

    /// Number of batch rows this stream occupies.
    fn batch_size(&self) -> usize;

    fn model_input(&self) -> Vec<RowInput>;

    /// Fold exactly `batch_size()` outputs into the stream.
    fn apply_outputs(&self, outputs: Vec<Self::Output>) -> Result<()>;

    /// Force the stream to STOPPED. Returns false if it was already terminal.
    fn set_stop(&self, reason: &str) -> bool;

    /// Returns true if this call stopped the stream.
    fn check_timeout(&self) -> bool;

    fn status(&self) -> Status;

    fn error_info(&self) -> Option<String>;

    fn output(&self) -> Self::Snapshot;

    fn subscribe(&self) -> watch::Receiver<Status>;
}

/// Status bookkeeping shared by every stream kind. Always accessed under
/// the owning stream's lock.
pub(crate) struct Lifecycle {
    status: Status,
    error_info: Option<String>,
    dtors: Vec<ResourceDtor>,
    status_tx: watch::Sender<Status>,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        let (status_tx, _) = watch::channel(Status::Waiting);
        Self {
            status: Status::Waiting,
            error_info: None,
            dtors: Vec::new(),
            status_tx,
        }
    }

    pub(crate) fn status(&self) -> Status {
        self.status
    }

    pub(crate) fn error_info(&self) -> Option<String> {
        self.error_info.clone()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Status> {
        self.status_tx.subscribe()
    }

    pub(crate) fn ensure_live(&self, id: u64) -> Result<()> {
        if self.status.is_terminal() {
            return Err(Error::StreamTerminated(id));
        }
        Ok(())
    }

    pub(crate) fn set_running(&mut self, id: u64) -> Result<()> {
        if self.status != Status::Waiting {
            return Err(Error::InvalidTransition {
                id,
                from: self.status.as_str(),
                to: Status::Running.as_str(),
            });
        }
        self.transition(Status::Running);
        Ok(())
    }

    /// Moves to FINISHED and detaches the release list for the caller to run
    /// once the stream lock is dropped.
    pub(crate) fn finish(&mut self) -> Vec<ResourceDtor> {
        self.transition(Status::Finished);
        std::mem::take(&mut self.dtors)
    }

    /// None if already terminal.
    pub(crate) fn stop(&mut self, reason: &str) -> Option<Vec<ResourceDtor>> {
        if self.status.is_terminal() {
            return None;
        }
        self.error_info = Some(reason.to_string());
        self.transition(Status::Stopped);
        Some(std::mem::take(&mut self.dtors))
    }

    /// Hands the callback back if the stream is already terminal.
    pub(crate) fn push_dtor(&mut self, dtor: ResourceDtor) -> Option<ResourceDtor> {
        if self.status.is_terminal() {
            return Some(dtor);
        }
        self.dtors.push(dtor);
        None
    }

    fn transition(&mut self, status: Status) {
        self.status = status;
        self.status_tx.send_replace(status);
    }
}
