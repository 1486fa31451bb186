use anyhow::Context;
use candle_serve::{
    EmbeddingInput, EmbeddingScheduler, Engine, EngineConfig, FifoScheduler, GenerateConfig,
    GenerateInput, KvCacheManager, LocalCollective, MetricsReporter, SyntheticEmbeddingExecutor,
    SyntheticExecutor, TracingReporter,
};
use clap::{Parser, ValueEnum};
use rand::Rng;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Workload {
    Generate,
    Embedding,
}

/// Drives the engine with synthetic traffic.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON engine config; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = Workload::Generate)]
    workload: Workload,

    /// Number of concurrent requests
    #[arg(long, default_value_t = 32)]
    requests: usize,

    #[arg(long, default_value_t = 64)]
    prompt_len: usize,

    #[arg(long, default_value_t = 32)]
    max_new_tokens: usize,

    #[arg(long, default_value_t = 1)]
    num_beams: usize,

    /// Per-request timeout, 0 disables it
    #[arg(long, default_value_t = 0)]
    timeout_ms: u64,

    #[arg(long)]
    max_batch_size: Option<usize>,

    #[arg(long)]
    block_size: Option<usize>,

    #[arg(long)]
    num_blocks: Option<usize>,

    /// Keep finished prompts for prefix reuse, up to this many blocks
    #[arg(long)]
    reuse_cache: Option<usize>,

    #[arg(long, default_value_t = 32000)]
    vocab_size: u32,

    #[arg(long, default_value_t = 256)]
    hidden_size: usize,

    /// Simulated forward-pass latency
    #[arg(long, default_value_t = 2)]
    step_ms: u64,

    #[arg(long, default_value_t = 1)]
    jitter_ms: u64,
}

fn load_config(args: &Args) -> anyhow::Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::from_json_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(max_batch_size) = args.max_batch_size {
        config.max_batch_size = max_batch_size;
    }
    if let Some(block_size) = args.block_size {
        config.block_size = block_size;
    }
    if let Some(num_blocks) = args.num_blocks {
        config.num_blocks = num_blocks;
    }
    if let Some(max_cached_blocks) = args.reuse_cache {
        config.reuse_cache = true;
        config.max_cached_blocks = max_cached_blocks;
    }
    config.validate()?;
    Ok(config)
}

async fn run_generate(
    args: &Args,
    config: EngineConfig,
    metrics: Arc<dyn MetricsReporter>,
) -> anyhow::Result<()> {
    let kv_cache = Arc::new(KvCacheManager::from_config(&config));
    let scheduler = Arc::new(FifoScheduler::new(
        &config,
        Some(kv_cache.clone()),
        metrics.clone(),
    ));
    let executor = SyntheticExecutor::new(args.vocab_size)
        .with_delay(args.step_ms)
        .with_jitter(args.jitter_ms);
    let handle = Engine::new(
        scheduler,
        executor,
        Box::new(LocalCollective),
        metrics,
        config,
    )?
    .start()?;

    let generate_config = GenerateConfig {
        num_beams: args.num_beams,
        max_new_tokens: args.max_new_tokens,
        timeout_ms: args.timeout_ms,
        ..Default::default()
    };
    // Half of every prompt is shared so prefix reuse has something to find.
    let requests = {
        let mut rng = rand::rng();
        let shared_prefix: Vec<u32> = (0..args.prompt_len / 2)
            .map(|_| rng.random_range(0..args.vocab_size))
            .collect();
        (0..args.requests)
            .map(|_| {
                let mut prompt = shared_prefix.clone();
                let rest = args.prompt_len - prompt.len();
                prompt.extend((0..rest).map(|_| rng.random_range(0..args.vocab_size)));
                GenerateInput::new(prompt, generate_config.clone())
            })
            .collect::<Vec<_>>()
    };

    let begin = Instant::now();
    let results =
        futures::future::join_all(requests.into_iter().map(|request| handle.decode(request)))
            .await;
    let elapsed = begin.elapsed();

    let mut tokens = 0;
    let mut failed = 0;
    for result in results {
        match result {
            Ok(output) => tokens += output.aux_info.output_len * output.output_ids.len(),
            Err(e) => {
                failed += 1;
                warn!("request failed: {e}");
            }
        }
    }
    info!(
        "{} requests, {} failed, {} tokens in {:.2}s ({:.1} tokens/s), {} KV blocks free",
        args.requests,
        failed,
        tokens,
        elapsed.as_secs_f64(),
        tokens as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
        kv_cache.num_free_blocks()
    );
    handle.stop();
    Ok(())
}

async fn run_embedding(
    args: &Args,
    config: EngineConfig,
    metrics: Arc<dyn MetricsReporter>,
) -> anyhow::Result<()> {
    let scheduler = Arc::new(EmbeddingScheduler::new(&config, metrics.clone()));
    let handle = Engine::new(
        scheduler,
        SyntheticEmbeddingExecutor::new(args.hidden_size),
        Box::new(LocalCollective),
        metrics,
        config,
    )?
    .start()?;

    // --num-beams doubles as the number of sentences per request.
    let requests = {
        let mut rng = rand::rng();
        let mut requests = Vec::with_capacity(args.requests);
        for _ in 0..args.requests {
            let lengths = vec![args.prompt_len.max(1); args.num_beams.max(1)];
            let tokens = (0..lengths.iter().sum::<usize>())
                .map(|_| rng.random_range(0..args.vocab_size))
                .collect();
            requests.push(EmbeddingInput::new(tokens, lengths)?.with_timeout_ms(args.timeout_ms));
        }
        requests
    };

    let begin = Instant::now();
    let results =
        futures::future::join_all(requests.into_iter().map(|request| handle.decode(request)))
            .await;
    let failed = results.iter().filter(|r| r.is_err()).count();
    info!(
        "{} embedding requests, {} failed, in {:.2}s",
        args.requests,
        failed,
        begin.elapsed().as_secs_f64()
    );
    handle.stop();
    Ok(())
}

/// Callers share one cooperative thread; the engine loop runs on its own.
fn runtime() -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    info!("Engine config {:?}", config);
    let metrics: Arc<dyn MetricsReporter> = Arc::new(TracingReporter);

    runtime()?.block_on(async {
        match args.workload {
            Workload::Generate => run_generate(&args, config, metrics).await,
            Workload::Embedding => run_embedding(&args, config, metrics).await,
        }
    })
}
