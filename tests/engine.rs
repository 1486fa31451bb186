mod common;

use candle_serve::{
    EmbeddingInput, EmbeddingScheduler, Engine, EngineStream, Error, Fault, GaugeMetric,
    GenerateConfig, GenerateInput, LocalCollective, MetricsReporter, RecordingReporter,
    Scheduler, Status, SyntheticEmbeddingExecutor, SyntheticExecutor,
};
use common::{config, eventually, generate_scheduler, RecordingTerminator};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

fn request(prompt: Vec<u32>, max_new_tokens: usize) -> GenerateInput {
    GenerateInput::new(
        prompt,
        GenerateConfig {
            max_new_tokens,
            ..Default::default()
        },
    )
}

#[tokio::test]
async fn test_decode_runs_request_to_completion() {
    let config = config();
    let metrics = Arc::new(RecordingReporter::new());
    let (scheduler, kv_cache) = generate_scheduler(&config, metrics.clone());
    let handle = Engine::new(
        scheduler,
        SyntheticExecutor::new(1000),
        Box::new(LocalCollective),
        metrics.clone(),
        config,
    )
    .unwrap()
    .start_with_terminator(Arc::new(RecordingTerminator::default()))
    .unwrap();

    let output = handle.decode(request(vec![1, 2, 3], 4)).await.unwrap();
    assert!(output.finished);
    assert_eq!(output.output_ids, vec![vec![4, 5, 6, 7]]);
    assert_eq!(output.aux_info.input_len, 3);
    assert_eq!(output.aux_info.output_len, 4);
    assert_eq!(output.aux_info.iter_count, 4);

    assert!(eventually(|| kv_cache.num_free_blocks() == 64).await);
    assert!(!metrics.values(GaugeMetric::BatchSize).is_empty());
    assert_eq!(metrics.values(GaugeMetric::FirstTokenRt).len(), 1);
    handle.stop();
    assert!(!handle.is_running());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_requests_share_batches() {
    let config = config();
    let metrics = Arc::new(RecordingReporter::new());
    let (scheduler, _) = generate_scheduler(&config, metrics.clone());
    let handle = Engine::new(
        scheduler,
        SyntheticExecutor::new(1000).with_delay(1),
        Box::new(LocalCollective),
        metrics.clone(),
        config,
    )
    .unwrap()
    .start_with_terminator(Arc::new(RecordingTerminator::default()))
    .unwrap();

    let requests = (0..6u32).map(|i| request(vec![i * 100], 5));
    let outputs =
        futures::future::join_all(requests.map(|request| handle.decode(request))).await;
    for (i, output) in outputs.into_iter().enumerate() {
        let start = i as u32 * 100 + 1;
        assert_eq!(output.unwrap().output_ids, vec![(start..start + 5).collect::<Vec<_>>()]);
    }
    assert!(metrics
        .values(GaugeMetric::BatchSize)
        .iter()
        .any(|size| *size > 1.0));
    handle.stop();
}

#[tokio::test]
async fn test_executor_failure_reaches_caller_and_loop_survives() {
    let config = config();
    let metrics = Arc::new(RecordingReporter::new());
    let (scheduler, kv_cache) = generate_scheduler(&config, metrics.clone());
    let terminator = Arc::new(RecordingTerminator::default());
    let handle = Engine::new(
        scheduler,
        SyntheticExecutor::new(1000).with_fault(1, Fault::Error("boom".to_string())),
        Box::new(LocalCollective),
        metrics,
        config,
    )
    .unwrap()
    .start_with_terminator(terminator.clone())
    .unwrap();

    match handle.decode(request(vec![1, 2], 3)).await {
        Err(Error::Stream(text)) => {
            assert!(text.starts_with("executor error: boom, Traceback: "), "{text}");
        }
        other => panic!("expected a stopped stream, got {other:?}"),
    }
    assert!(eventually(|| kv_cache.num_free_blocks() == 64).await);

    let output = handle.decode(request(vec![1, 2], 3)).await.unwrap();
    assert_eq!(output.output_ids, vec![vec![3, 4, 5]]);
    assert!(terminator.codes().is_empty());
    assert!(handle.is_running());
    handle.stop();
}

#[tokio::test]
async fn test_executor_panic_stops_only_its_batch() {
    let config = config();
    let metrics = Arc::new(RecordingReporter::new());
    let (scheduler, _) = generate_scheduler(&config, metrics.clone());
    let handle = Engine::new(
        scheduler,
        SyntheticExecutor::new(1000).with_fault(1, Fault::Panic("kernel exploded".to_string())),
        Box::new(LocalCollective),
        metrics,
        config,
    )
    .unwrap()
    .start_with_terminator(Arc::new(RecordingTerminator::default()))
    .unwrap();

    let err = handle.decode(request(vec![7], 2)).await.unwrap_err();
    assert!(err.to_string().contains("kernel exploded"));
    let output = handle.decode(request(vec![7], 2)).await.unwrap();
    assert_eq!(output.output_ids, vec![vec![8, 9]]);
    handle.stop();
}

#[tokio::test]
async fn test_accelerator_failure_terminates_process() {
    let config = config();
    let metrics = Arc::new(RecordingReporter::new());
    let (scheduler, _) = generate_scheduler(&config, metrics.clone());
    let terminator = Arc::new(RecordingTerminator::default());
    let handle = Engine::new(
        scheduler,
        SyntheticExecutor::new(1000)
            .with_fault(1, Fault::Error("CUDA error: an illegal memory access".to_string())),
        Box::new(LocalCollective),
        metrics.clone(),
        config,
    )
    .unwrap()
    .start_with_terminator(terminator.clone())
    .unwrap();

    let err = handle.decode(request(vec![1], 3)).await.unwrap_err();
    assert!(err.to_string().contains("CUDA error"));
    assert!(eventually(|| !terminator.codes().is_empty()).await);
    assert_eq!(terminator.codes(), vec![-1]);
    assert_eq!(metrics.values(GaugeMetric::ErrorExit), vec![1.0]);
    assert_eq!(metrics.flush_count(), 1);
    assert!(eventually(|| !handle.is_running()).await);

    // Nothing runs after a fatal failure.
    let stream = handle.enqueue(request(vec![1], 3)).unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert_eq!(stream.status(), Status::Waiting);
}

#[tokio::test]
async fn test_decode_times_out() {
    let config = config();
    let metrics = Arc::new(RecordingReporter::new());
    let (scheduler, kv_cache) = generate_scheduler(&config, metrics.clone());
    let handle = Engine::new(
        scheduler,
        SyntheticExecutor::new(1000).with_delay(20),
        Box::new(LocalCollective),
        metrics,
        config,
    )
    .unwrap()
    .start_with_terminator(Arc::new(RecordingTerminator::default()))
    .unwrap();

    let input = GenerateInput::new(
        vec![1, 2, 3],
        GenerateConfig {
            max_new_tokens: 50,
            timeout_ms: 10,
            ..Default::default()
        },
    );
    match handle.decode(input).await {
        Err(Error::Stream(text)) => {
            assert!(text.starts_with("query has been running "), "{text}");
            assert!(text.ends_with(" ms timeout"), "{text}");
        }
        other => panic!("expected a timeout, got {other:?}"),
    }
    assert!(eventually(|| kv_cache.num_free_blocks() == 64).await);
    handle.stop();
}

#[tokio::test]
async fn test_cancel_stops_waiting_caller() {
    let config = config();
    let metrics = Arc::new(RecordingReporter::new());
    let (scheduler, _) = generate_scheduler(&config, metrics.clone());
    let handle = Engine::new(
        scheduler,
        SyntheticExecutor::new(1000).with_delay(5),
        Box::new(LocalCollective),
        metrics,
        config,
    )
    .unwrap()
    .start_with_terminator(Arc::new(RecordingTerminator::default()))
    .unwrap();

    let stream = handle.enqueue(request(vec![1, 2], 50)).unwrap();
    assert!(handle.cancel(&stream, "client went away"));
    assert!(!handle.cancel(&stream, "twice"));
    match handle.wait(&stream).await {
        Err(Error::Stream(text)) => assert_eq!(text, "client went away"),
        other => panic!("expected a cancelled stream, got {other:?}"),
    }
    handle.stop();
}

#[tokio::test]
async fn test_finished_prompt_is_reused_by_next_request() {
    let config = candle_serve::EngineConfig::builder()
        .max_seq_len(64)
        .block_size(4)
        .num_blocks(32)
        .reuse_cache(8)
        .build()
        .unwrap();
    let metrics = Arc::new(RecordingReporter::new());
    let (scheduler, kv_cache) = generate_scheduler(&config, metrics.clone());
    let handle = Engine::new(
        scheduler,
        SyntheticExecutor::new(1000),
        Box::new(LocalCollective),
        metrics,
        config,
    )
    .unwrap()
    .start_with_terminator(Arc::new(RecordingTerminator::default()))
    .unwrap();

    let prompt: Vec<u32> = (10..19).collect();
    let first = handle.decode(request(prompt.clone(), 2)).await.unwrap();
    assert_eq!(first.aux_info.reuse_len, 0);
    assert!(eventually(|| kv_cache.num_cached_blocks() == 2).await);

    let second = handle.decode(request(prompt, 2)).await.unwrap();
    assert_eq!(second.aux_info.reuse_len, 8);
    assert_eq!(second.output_ids, first.output_ids);
    handle.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_snapshots_are_never_torn() {
    let config = config();
    let metrics = Arc::new(RecordingReporter::new());
    let (scheduler, _) = generate_scheduler(&config, metrics.clone());
    let handle = Engine::new(
        scheduler,
        SyntheticExecutor::new(1000),
        Box::new(LocalCollective),
        metrics,
        config,
    )
    .unwrap()
    .start_with_terminator(Arc::new(RecordingTerminator::default()))
    .unwrap();

    let input = GenerateInput::new(
        vec![1],
        GenerateConfig {
            num_beams: 2,
            max_new_tokens: 40,
            ..Default::default()
        },
    );
    let stream = handle.enqueue(input).unwrap();
    let done = Arc::new(AtomicBool::new(false));
    let reader = {
        let stream = stream.clone();
        let done = done.clone();
        std::thread::spawn(move || {
            while !done.load(Ordering::SeqCst) {
                let output = stream.output();
                assert_eq!(output.output_ids[0].len(), output.output_ids[1].len());
                assert_eq!(output.output_ids[0].len(), output.aux_info.output_len);
                let expected: Vec<u32> = (2..2 + output.output_ids[0].len() as u32).collect();
                assert_eq!(output.output_ids[0], expected);
            }
        })
    };
    let output = handle.wait(&stream).await.unwrap();
    done.store(true, Ordering::SeqCst);
    reader.join().unwrap();
    assert_eq!(output.output_ids[0].len(), 40);
    handle.stop();
}

#[tokio::test]
async fn test_embedding_request_round_trip() {
    let config = config();
    let metrics: Arc<dyn MetricsReporter> = Arc::new(RecordingReporter::new());
    let scheduler = Arc::new(EmbeddingScheduler::new(&config, metrics.clone()));
    let handle = Engine::new(
        scheduler.clone(),
        SyntheticEmbeddingExecutor::new(8),
        Box::new(LocalCollective),
        metrics,
        config,
    )
    .unwrap()
    .start_with_terminator(Arc::new(RecordingTerminator::default()))
    .unwrap();

    let input = EmbeddingInput::new(vec![1, 2, 3, 4, 5], vec![2, 3]).unwrap();
    let output = handle.decode(input).await.unwrap();
    assert!(output.finished);
    assert_eq!(output.embeddings.unwrap().dims(), &[2, 8]);
    assert_eq!(scheduler.wait_queue_size(), 0);
    handle.stop();
}
