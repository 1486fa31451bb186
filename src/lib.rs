//! Request lifecycle and step scheduling for a continuous-batching
//! inference engine.

pub mod batch;
pub mod config;
pub mod distributed;
pub mod engine;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod scheduler;
pub mod stream;

pub use batch::{BatchDescriptor, BatchedInput};
pub use config::{EngineConfig, EngineConfigBuilder};
pub use distributed::{ChannelCollective, Collective, LocalCollective};
pub use engine::{
    distribute_outputs, is_fatal, Engine, EngineHandle, FatalError, ProcessTerminator,
    StepOutcome, Terminator,
};
pub use error::{Error, Result};
pub use executor::{Executor, Fault, SyntheticEmbeddingExecutor, SyntheticExecutor};
pub use metrics::{GaugeMetric, MetricsReporter, RecordingReporter, TracingReporter};
pub use scheduler::{EmbeddingScheduler, FifoScheduler, KvCacheManager, Scheduler};
pub use stream::{
    EmbeddingInput, EmbeddingOutput, EmbeddingStream, EngineStream, GenerateConfig,
    GenerateInput, GenerateOutput, GenerateStream, Status,
};
