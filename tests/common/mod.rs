#![allow(dead_code)]

use candle_serve::{
    EngineConfig, FifoScheduler, KvCacheManager, MetricsReporter, RecordingReporter, Terminator,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Records exit codes instead of exiting.
#[derive(Default)]
pub struct RecordingTerminator {
    codes: Mutex<Vec<i32>>,
}

impl RecordingTerminator {
    pub fn codes(&self) -> Vec<i32> {
        self.codes.lock().clone()
    }
}

impl Terminator for RecordingTerminator {
    fn terminate(&self, code: i32) {
        self.codes.lock().push(code);
    }
}

pub fn config() -> EngineConfig {
    EngineConfig::builder()
        .max_seq_len(64)
        .max_batch_size(8)
        .block_size(4)
        .num_blocks(64)
        .fatal_exit_delay_ms(1)
        .build()
        .unwrap()
}

pub fn generate_scheduler(
    config: &EngineConfig,
    metrics: Arc<RecordingReporter>,
) -> (Arc<FifoScheduler>, Arc<KvCacheManager>) {
    let kv_cache = Arc::new(KvCacheManager::from_config(config));
    let metrics: Arc<dyn MetricsReporter> = metrics;
    let scheduler = Arc::new(FifoScheduler::new(config, Some(kv_cache.clone()), metrics));
    (scheduler, kv_cache)
}

/// Polls `cond` until it holds or two seconds pass.
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..400 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}
