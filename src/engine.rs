//! The step loop and the async bridge in front of it.
//!
//! One dedicated thread owns the [`Engine`] and calls [`Engine::step`] until
//! it is told to stop or a fatal error escalates to process termination.
//! Callers talk to it through an [`EngineHandle`]: they enqueue requests
//! into the shared scheduler and await the stream's terminal state.

use crate::batch::BatchedInput;
use crate::config::EngineConfig;
use crate::distributed::Collective;
use crate::error::{Error, Result};
use crate::executor::Executor;
use crate::metrics::{GaugeMetric, MetricsReporter};
use crate::scheduler::Scheduler;
use crate::stream::{EngineStream, Status};
use candle_core::Device;
use flume::TryRecvError;
use parking_lot::Mutex;
use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Once};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

type StreamOf<Sch> = <Sch as Scheduler>::Stream;
type OutputOf<Sch> = <StreamOf<Sch> as EngineStream>::Output;
type SnapshotOf<Sch> = <StreamOf<Sch> as EngineStream>::Snapshot;

#[derive(Debug)]
pub enum StepOutcome<S> {
    /// Nothing was scheduled (or, off the coordinating rank, nothing
    /// arrived in time).
    Idle,
    Executed { streams: Vec<Arc<S>> },
    /// The iteration failed; every stream in it has been stopped.
    Failed { streams: Vec<Arc<S>>, error: String },
}

/// A failure the process cannot recover from. Once `step` returns this the
/// loop must not run again.
#[derive(Debug, Clone, thiserror::Error)]
#[error("fatal failure on rank {rank}: {message}")]
pub struct FatalError {
    pub rank: usize,
    pub message: String,
}

/// Failures are fatal under tensor parallelism, since a lost rank leaves the
/// group out of step, or when the text names a broken accelerator.
pub fn is_fatal(world_size: usize, text: &str, markers: &[String]) -> bool {
    world_size > 1
        || markers
            .iter()
            .any(|marker| !marker.is_empty() && text.contains(marker.as_str()))
}

/// Hands each stream its contiguous slice of the flat output list, in
/// scheduled order.
pub fn distribute_outputs<S: EngineStream>(
    streams: &[Arc<S>],
    outputs: Vec<S::Output>,
) -> Result<()> {
    let expected: usize = streams.iter().map(|stream| stream.batch_size()).sum();
    if outputs.len() != expected {
        return Err(Error::BatchMismatch {
            expected,
            actual: outputs.len(),
        });
    }
    let mut outputs = outputs.into_iter();
    for stream in streams {
        let slice = outputs.by_ref().take(stream.batch_size()).collect();
        match stream.apply_outputs(slice) {
            Ok(()) => {}
            // Cancelled while the batch was in flight.
            Err(Error::StreamTerminated(id)) => debug!("dropping outputs of stopped stream {id}"),
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// What to do once a fatal failure has been reported.
pub trait Terminator: Send + Sync {
    fn terminate(&self, code: i32);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessTerminator;

impl Terminator for ProcessTerminator {
    fn terminate(&self, code: i32) {
        std::process::exit(code);
    }
}

thread_local! {
    static CAPTURE_PANIC_TRACE: Cell<bool> = const { Cell::new(false) };
    static PANIC_TRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// Records the stack at the panic site while an iteration runs on the
/// current thread, then defers to the previously installed hook.
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if CAPTURE_PANIC_TRACE.with(Cell::get) {
                let trace = Backtrace::force_capture().to_string();
                PANIC_TRACE.with(|slot| *slot.borrow_mut() = Some(trace));
            }
            previous(info);
        }));
    });
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

pub struct Engine<Sch, E>
where
    Sch: Scheduler,
    E: Executor<Output = OutputOf<Sch>>,
{
    scheduler: Arc<Sch>,
    executor: E,
    collective: Box<dyn Collective>,
    metrics: Arc<dyn MetricsReporter>,
    config: EngineConfig,
    device: Device,
}

impl<Sch, E> Engine<Sch, E>
where
    Sch: Scheduler,
    E: Executor<Output = OutputOf<Sch>>,
{
    pub fn new(
        scheduler: Arc<Sch>,
        executor: E,
        collective: Box<dyn Collective>,
        metrics: Arc<dyn MetricsReporter>,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;
        install_panic_hook();
        Ok(Self {
            scheduler,
            executor,
            collective,
            metrics,
            config,
            device: Device::Cpu,
        })
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn scheduler(&self) -> &Arc<Sch> {
        &self.scheduler
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn rank(&self) -> usize {
        self.collective.rank()
    }

    /// Runs one iteration. Per-iteration failures stop the batch's streams
    /// and come back as [`StepOutcome::Failed`]; only fatal ones are `Err`.
    pub fn step(&mut self) -> std::result::Result<StepOutcome<StreamOf<Sch>>, FatalError> {
        let mut scheduled = Vec::new();
        CAPTURE_PANIC_TRACE.with(|capture| capture.set(true));
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.iterate(&mut scheduled)));
        CAPTURE_PANIC_TRACE.with(|capture| capture.set(false));
        let (message, trace) = match result {
            Ok(Ok(outcome)) => return Ok(outcome),
            Ok(Err(e)) => {
                let trace = match e.trace() {
                    Some(trace) => trace.to_string(),
                    None => Backtrace::force_capture().to_string(),
                };
                (e.to_string(), trace)
            }
            Err(payload) => {
                let trace = PANIC_TRACE
                    .with(|slot| slot.borrow_mut().take())
                    .unwrap_or_else(|| Backtrace::force_capture().to_string());
                (format!("executor panicked: {}", panic_message(payload)), trace)
            }
        };

        let text = format!("{}, Traceback: {}", message, trace);
        error!(
            "iteration failed on rank {} with {} streams: {}",
            self.rank(),
            scheduled.len(),
            message
        );
        for stream in &scheduled {
            stream.set_stop(&text);
        }
        if is_fatal(
            self.collective.world_size(),
            &text,
            &self.config.fatal_error_markers,
        ) {
            return Err(FatalError {
                rank: self.rank(),
                message,
            });
        }
        Ok(StepOutcome::Failed {
            streams: scheduled,
            error: text,
        })
    }

    fn iterate(
        &mut self,
        scheduled: &mut Vec<Arc<StreamOf<Sch>>>,
    ) -> Result<StepOutcome<StreamOf<Sch>>> {
        let begin = Instant::now();
        let coordinator = self.collective.is_coordinator();
        if coordinator {
            *scheduled = self.scheduler.schedule()?;
            if scheduled.is_empty() {
                std::thread::sleep(self.config.idle_backoff());
                return Ok(StepOutcome::Idle);
            }
        }

        let batch = match BatchedInput::generate_model_input(
            scheduled.as_slice(),
            self.collective.as_ref(),
            self.config.rank_wait(),
            &self.device,
        )? {
            Some(batch) => batch,
            None => return Ok(StepOutcome::Idle),
        };
        let outputs = self.executor.process(&batch)?;
        if !coordinator {
            return Ok(StepOutcome::Executed {
                streams: Vec::new(),
            });
        }

        self.executor.synchronize()?;
        if outputs.len() != batch.batch_size() {
            return Err(Error::BatchMismatch {
                expected: batch.batch_size(),
                actual: outputs.len(),
            });
        }
        distribute_outputs(scheduled.as_slice(), outputs)?;

        self.metrics.report(
            GaugeMetric::WaitQueueSize,
            self.scheduler.wait_queue_size() as f64,
        );
        self.metrics
            .report(GaugeMetric::BatchSize, scheduled.len() as f64);
        self.metrics.report(
            GaugeMetric::IterateLatency,
            begin.elapsed().as_millis() as f64,
        );
        Ok(StepOutcome::Executed {
            streams: scheduled.clone(),
        })
    }

    /// Reports the exit, gives the sink time to drain, then terminates.
    fn escalate(&self, fatal: &FatalError, terminator: &dyn Terminator) {
        error!("{fatal}, terminating");
        self.metrics.report(GaugeMetric::ErrorExit, 1.0);
        self.metrics.flush();
        std::thread::sleep(self.config.fatal_exit_delay());
        terminator.terminate(-1);
    }

    /// Moves the engine onto its own thread, exiting the process on a fatal
    /// failure.
    pub fn start(self) -> Result<EngineHandle<Sch>> {
        self.start_with_terminator(Arc::new(ProcessTerminator))
    }

    pub fn start_with_terminator(
        mut self,
        terminator: Arc<dyn Terminator>,
    ) -> Result<EngineHandle<Sch>> {
        let scheduler = self.scheduler.clone();
        let poll_interval = self.config.poll_interval();
        let rank = self.rank();
        let (shutdown_tx, shutdown_rx) = flume::bounded::<()>(1);

        let thread = std::thread::Builder::new()
            .name("engine-loop".to_string())
            .spawn(move || {
                info!("engine loop started on rank {rank}");
                loop {
                    match shutdown_rx.try_recv() {
                        Err(TryRecvError::Empty) => {}
                        Ok(()) | Err(TryRecvError::Disconnected) => break,
                    }
                    if let Err(fatal) = self.step() {
                        self.escalate(&fatal, terminator.as_ref());
                        break;
                    }
                }
                info!("engine loop exited on rank {rank}");
            })?;

        Ok(EngineHandle {
            scheduler,
            poll_interval,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            thread: Mutex::new(Some(thread)),
        })
    }
}

/// Caller-side access to a running engine.
pub struct EngineHandle<Sch: Scheduler> {
    scheduler: Arc<Sch>,
    poll_interval: Duration,
    shutdown_tx: Mutex<Option<flume::Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl<Sch: Scheduler> EngineHandle<Sch> {
    pub fn scheduler(&self) -> &Arc<Sch> {
        &self.scheduler
    }

    /// Queues a request and returns its stream without waiting.
    pub fn enqueue(&self, request: Sch::Request) -> Result<Arc<StreamOf<Sch>>> {
        self.scheduler.enqueue(request)
    }

    /// Runs a request to completion. A stopped stream surfaces its stop
    /// reason as [`Error::Stream`].
    pub async fn decode(&self, request: Sch::Request) -> Result<SnapshotOf<Sch>> {
        let stream = self.enqueue(request)?;
        self.wait(&stream).await
    }

    /// Waits for `stream` to turn terminal, checking its timeout on every
    /// poll tick. Dropping the future only stops the waiting.
    pub async fn wait(&self, stream: &Arc<StreamOf<Sch>>) -> Result<SnapshotOf<Sch>> {
        let mut status_rx = stream.subscribe();
        let mut tick = tokio::time::interval(self.poll_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            match stream.status() {
                Status::Finished => return Ok(stream.output()),
                Status::Stopped => {
                    return Err(Error::Stream(stream.error_info().unwrap_or_default()))
                }
                Status::Waiting | Status::Running => {}
            }
            stream.check_timeout();
            tokio::select! {
                _ = status_rx.changed() => {}
                _ = tick.tick() => {}
            }
        }
    }

    /// Returns false if the stream had already terminated.
    pub fn cancel(&self, stream: &StreamOf<Sch>, reason: &str) -> bool {
        stream.set_stop(reason)
    }

    pub fn is_running(&self) -> bool {
        self.thread
            .lock()
            .as_ref()
            .is_some_and(|thread| !thread.is_finished())
    }

    /// Signals the loop and waits for the current iteration to finish.
    pub fn stop(&self) {
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                warn!("engine loop thread panicked");
            }
        }
    }
}

impl<Sch: Scheduler> Drop for EngineHandle<Sch> {
    fn drop(&mut self) {
        // Dropping the sender disconnects the loop; it exits after the
        // current iteration without being joined.
        self.shutdown_tx.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::LocalCollective;
    use crate::executor::{Fault, SyntheticExecutor};
    use crate::metrics::RecordingReporter;
    use crate::scheduler::FifoScheduler;
    use crate::stream::{BeamOutput, GenerateConfig, GenerateInput, GenerateStream};

    fn markers() -> Vec<String> {
        vec!["CUDA".to_string()]
    }

    #[test]
    fn test_is_fatal_truth_table() {
        assert!(is_fatal(2, "anything", &markers()));
        assert!(is_fatal(1, "CUDA error: device-side assert", &markers()));
        assert!(!is_fatal(1, "boom", &markers()));
        assert!(!is_fatal(1, "cuda lower case", &markers()));
        assert!(!is_fatal(1, "CUDA", &[]));
        assert!(!is_fatal(1, "CUDA", &[String::new()]));
    }

    fn stream(num_beams: usize) -> Arc<GenerateStream> {
        let config = GenerateConfig {
            num_beams,
            ..Default::default()
        };
        Arc::new(
            GenerateStream::new(
                GenerateInput::new(vec![1, 2], config),
                32,
                Arc::new(RecordingReporter::new()),
            )
            .unwrap(),
        )
    }

    fn beam(token: u32) -> BeamOutput {
        BeamOutput {
            token_ids: vec![token],
            ..Default::default()
        }
    }

    #[test]
    fn test_distribute_outputs_by_batch_contribution() {
        let streams = vec![stream(2), stream(1), stream(3)];
        let outputs = (10..16).map(beam).collect();
        distribute_outputs(&streams, outputs).unwrap();
        assert_eq!(streams[0].output().output_ids, vec![vec![10], vec![11]]);
        assert_eq!(streams[1].output().output_ids, vec![vec![12]]);
        assert_eq!(
            streams[2].output().output_ids,
            vec![vec![13], vec![14], vec![15]]
        );
    }

    #[test]
    fn test_distribute_outputs_rejects_wrong_length() {
        let streams = vec![stream(2), stream(1), stream(3)];
        for len in [5, 7] {
            let outputs = (0..len).map(beam).collect();
            assert!(matches!(
                distribute_outputs(&streams, outputs),
                Err(Error::BatchMismatch { expected: 6, .. })
            ));
        }
        assert!(streams.iter().all(|s| s.output().aux_info.iter_count == 0));
    }

    #[test]
    fn test_distribute_skips_cancelled_stream() {
        let streams = vec![stream(1), stream(1)];
        streams[0].set_stop("cancelled");
        distribute_outputs(&streams, vec![beam(1), beam(2)]).unwrap();
        assert_eq!(streams[1].output().output_ids, vec![vec![2]]);
    }

    fn engine(
        executor: SyntheticExecutor,
    ) -> Engine<FifoScheduler, SyntheticExecutor> {
        let config = EngineConfig::builder().max_seq_len(32).build().unwrap();
        let metrics: Arc<dyn MetricsReporter> = Arc::new(RecordingReporter::new());
        let scheduler = Arc::new(FifoScheduler::new(&config, None, metrics.clone()));
        Engine::new(
            scheduler,
            executor,
            Box::new(LocalCollective),
            metrics,
            config,
        )
        .unwrap()
    }

    #[test]
    fn test_step_idle_without_work() {
        let mut engine = engine(SyntheticExecutor::new(100));
        assert!(matches!(engine.step(), Ok(StepOutcome::Idle)));
        assert_eq!(engine.executor().iterations(), 0);
    }

    #[test]
    fn test_step_failure_stops_batch_and_loop_continues() {
        let mut engine =
            engine(SyntheticExecutor::new(100).with_fault(1, Fault::Error("boom".to_string())));
        let a = engine
            .scheduler()
            .enqueue(GenerateInput::new(vec![1], GenerateConfig::default()))
            .unwrap();
        match engine.step() {
            Ok(StepOutcome::Failed { streams, error }) => {
                assert_eq!(streams.len(), 1);
                assert!(error.starts_with("executor error: boom, Traceback: "));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(a.status(), Status::Stopped);
        assert!(a.error_info().unwrap().contains("boom"));

        let b = engine
            .scheduler()
            .enqueue(GenerateInput::new(vec![1], GenerateConfig::default()))
            .unwrap();
        assert!(matches!(engine.step(), Ok(StepOutcome::Executed { .. })));
        assert_eq!(b.output().output_ids, vec![vec![2]]);
    }

    #[test]
    fn test_step_panic_is_contained() {
        let mut engine = engine(
            SyntheticExecutor::new(100).with_fault(1, Fault::Panic("kernel exploded".to_string())),
        );
        let a = engine
            .scheduler()
            .enqueue(GenerateInput::new(vec![1], GenerateConfig::default()))
            .unwrap();
        assert!(matches!(engine.step(), Ok(StepOutcome::Failed { .. })));
        assert!(a.error_info().unwrap().contains("kernel exploded"));
    }

    #[test]
    fn test_traceback_points_at_failure_site() {
        let mut engine =
            engine(SyntheticExecutor::new(100).with_fault(1, Fault::Error("boom".to_string())));
        let a = engine
            .scheduler()
            .enqueue(GenerateInput::new(vec![1], GenerateConfig::default()))
            .unwrap();
        engine.step().unwrap();
        let text = a.error_info().unwrap();
        let (_, trace) = text.split_once(", Traceback: ").unwrap();
        assert!(trace.contains("SyntheticExecutor"), "{trace}");
    }

    #[test]
    fn test_panic_traceback_points_at_panic_site() {
        let mut engine = engine(
            SyntheticExecutor::new(100).with_fault(1, Fault::Panic("kernel exploded".to_string())),
        );
        let a = engine
            .scheduler()
            .enqueue(GenerateInput::new(vec![1], GenerateConfig::default()))
            .unwrap();
        engine.step().unwrap();
        let text = a.error_info().unwrap();
        let (_, trace) = text.split_once(", Traceback: ").unwrap();
        assert!(trace.contains("SyntheticExecutor"), "{trace}");
    }

    #[test]
    fn test_step_accelerator_failure_is_fatal() {
        let mut engine = engine(
            SyntheticExecutor::new(100)
                .with_fault(1, Fault::Error("CUDA error: out of memory".to_string())),
        );
        let a = engine
            .scheduler()
            .enqueue(GenerateInput::new(vec![1], GenerateConfig::default()))
            .unwrap();
        let fatal = engine.step().unwrap_err();
        assert_eq!(fatal.rank, 0);
        assert!(fatal.message.contains("CUDA"));
        assert_eq!(a.status(), Status::Stopped);
    }
}
