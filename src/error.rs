use std::backtrace::Backtrace;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("stream {0} is already terminal")]
    StreamTerminated(u64),
    #[error("stream {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: u64,
        from: &'static str,
        to: &'static str,
    },
    #[error("beam count mismatch: expected {expected}, got {actual}")]
    BeamMismatch { expected: usize, actual: usize },
    #[error("batch size not equal to output length, {expected} vs {actual}")]
    BatchMismatch { expected: usize, actual: usize },
    /// `trace` is the stack at the point the failure was raised.
    #[error("executor error: {message}")]
    Executor { message: String, trace: String },
    #[error("collective error: {0}")]
    Collective(String),
    #[error("{0}")]
    Stream(String),
    #[error("kv cache exhausted: need {needed} blocks, {available} free")]
    CacheExhausted { needed: usize, available: usize },
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    pub fn executor(message: impl Into<String>) -> Self {
        Error::Executor {
            message: message.into(),
            trace: Backtrace::force_capture().to_string(),
        }
    }

    /// The stack recorded when the error was raised, if it carries one.
    pub fn trace(&self) -> Option<&str> {
        match self {
            Error::Executor { trace, .. } => Some(trace.as_str()),
            _ => None,
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
