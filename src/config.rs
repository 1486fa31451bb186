use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Engine-wide settings shared by the step loop, the reference schedulers
/// and the async bridge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Hard cap on prompt + generated tokens for every stream.
    pub max_seq_len: usize,
    /// Maximum number of beams that may run in one iteration.
    pub max_batch_size: usize,
    /// Maximum number of tokens fed in one iteration. A single request
    /// over the limit still runs, alone.
    pub max_batch_tokens: usize,
    /// Tokens per KV-cache block.
    pub block_size: usize,
    /// Total KV-cache blocks managed by the reference scheduler.
    pub num_blocks: usize,
    /// Keep finished prompt blocks around for prefix reuse.
    pub reuse_cache: bool,
    /// Upper bound on blocks held by the prefix reuse pool.
    pub max_cached_blocks: usize,
    /// How often a waiting caller re-checks its stream.
    pub poll_interval_ms: u64,
    /// Sleep on the coordinating rank when nothing is scheduled.
    pub idle_backoff_ms: u64,
    /// How long a non-coordinating rank waits for a batch descriptor.
    pub rank_wait_ms: u64,
    /// Error texts that mark an accelerator-level fault.
    pub fatal_error_markers: Vec<String>,
    /// Pause between flushing metrics and terminating on a fatal error.
    pub fatal_exit_delay_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_seq_len: 2048,
            max_batch_size: 64,
            max_batch_tokens: 8192,
            block_size: 32,
            num_blocks: 4096,
            reuse_cache: false,
            max_cached_blocks: 1024,
            poll_interval_ms: 1,
            idle_backoff_ms: 1,
            rank_wait_ms: 10,
            fatal_error_markers: vec!["CUDA".to_string()],
            fatal_exit_delay_ms: 100,
        }
    }
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::new()
    }

    /// Load a JSON config file; missing keys fall back to defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        let config: Self = serde_json::from_reader(file)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_seq_len < 2 {
            return Err(Error::Config(format!(
                "max_seq_len must be at least 2, got {}",
                self.max_seq_len
            )));
        }
        if self.block_size == 0 {
            return Err(Error::Config("block_size must be positive".to_string()));
        }
        if self.max_batch_size == 0 || self.max_batch_tokens == 0 {
            return Err(Error::Config(
                "max_batch_size and max_batch_tokens must be positive".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(Error::Config("poll_interval_ms must be positive".to_string()));
        }
        if self.reuse_cache && self.max_cached_blocks >= self.num_blocks {
            return Err(Error::Config(format!(
                "max_cached_blocks ({}) must leave room in num_blocks ({})",
                self.max_cached_blocks, self.num_blocks
            )));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn idle_backoff(&self) -> Duration {
        Duration::from_millis(self.idle_backoff_ms)
    }

    pub fn rank_wait(&self) -> Duration {
        Duration::from_millis(self.rank_wait_ms)
    }

    pub fn fatal_exit_delay(&self) -> Duration {
        Duration::from_millis(self.fatal_exit_delay_ms)
    }
}

/// Builder for EngineConfig with a fluent API.
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    fn new() -> Self {
        Self {
            config: EngineConfig::default(),
        }
    }

    pub fn max_seq_len(mut self, len: usize) -> Self {
        self.config.max_seq_len = len;
        self
    }

    pub fn max_batch_size(mut self, size: usize) -> Self {
        self.config.max_batch_size = size;
        self
    }

    pub fn max_batch_tokens(mut self, tokens: usize) -> Self {
        self.config.max_batch_tokens = tokens;
        self
    }

    pub fn block_size(mut self, size: usize) -> Self {
        self.config.block_size = size;
        self
    }

    pub fn num_blocks(mut self, blocks: usize) -> Self {
        self.config.num_blocks = blocks;
        self
    }

    /// Enable prefix reuse with the given pool capacity (in blocks).
    pub fn reuse_cache(mut self, max_cached_blocks: usize) -> Self {
        self.config.reuse_cache = true;
        self.config.max_cached_blocks = max_cached_blocks;
        self
    }

    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms;
        self
    }

    pub fn idle_backoff_ms(mut self, ms: u64) -> Self {
        self.config.idle_backoff_ms = ms;
        self
    }

    pub fn rank_wait_ms(mut self, ms: u64) -> Self {
        self.config.rank_wait_ms = ms;
        self
    }

    pub fn fatal_error_markers(mut self, markers: Vec<String>) -> Self {
        self.config.fatal_error_markers = markers;
        self
    }

    pub fn fatal_exit_delay_ms(mut self, ms: u64) -> Self {
        self.config.fatal_exit_delay_ms = ms;
        self
    }

    pub fn build(self) -> Result<EngineConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
