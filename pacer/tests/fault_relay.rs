//! Fault capture on the worker and relay to the control thread.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::Once;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use pacer::{
    CapturedFault, DispatchContext, DispatchResult, Operation, Steppable, Worker, WorkerConfig,
    WorkerError, WorkerState,
};

static INIT_TRACING: Once = Once::new();

/// Initialize tracing for tests (only once).
fn init_test_tracing() {
    INIT_TRACING.call_once(|| {
        pacer::init_tracing();
    });
}

#[derive(Debug, thiserror::Error)]
#[error("bus error on call {0}")]
struct BusError(u32);

enum Failure {
    Error,
    Panic,
}

/// Steps normally until armed, then fails on its `fail_on`th armed call.
///
/// Armed only after `start` returns, so `start` never observes the fault.
struct FaultOn {
    fail_on: u32,
    failure: Failure,
    armed: Arc<AtomicBool>,
    calls: Arc<AtomicU32>,
}

impl FaultOn {
    fn new(fail_on: u32, failure: Failure) -> Self {
        Self {
            fail_on,
            failure,
            armed: Arc::new(AtomicBool::new(false)),
            calls: Arc::new(AtomicU32::new(0)),
        }
    }
}

impl Steppable for FaultOn {
    type Error = BusError;

    fn step(&mut self, result: &mut DispatchResult, max_cycles: u64) -> Result<(), BusError> {
        if !self.armed.load(Ordering::Acquire) {
            result.set_ok(max_cycles.min(4));
            return Ok(());
        }
        let call = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        if call == self.fail_on {
            match self.failure {
                Failure::Error => return Err(BusError(call)),
                Failure::Panic => panic!("illegal opcode on call {call}"),
            }
        }
        result.set_ok(max_cycles.min(4));
        Ok(())
    }
}

/// Blocks inside `step` until released.
struct Wedged {
    release: Arc<AtomicBool>,
}

impl Steppable for Wedged {
    type Error = BusError;

    fn step(&mut self, result: &mut DispatchResult, max_cycles: u64) -> Result<(), BusError> {
        while !self.release.load(Ordering::Acquire) {
            thread::sleep(Duration::from_millis(1));
        }
        result.set_ok(max_cycles);
        Ok(())
    }
}

fn spawn<S: Steppable + Send + 'static>(config: WorkerConfig) -> Worker<S> {
    init_test_tracing();
    Worker::spawn(config).expect("spawn worker")
}

/// Starts `core` and arms it once the worker is running.
fn start_armed(worker: &mut Worker<FaultOn>, core: FaultOn) {
    let armed = Arc::clone(&core.armed);
    worker.start(DispatchContext::new(1_000_000, core).unwrap()).unwrap();
    armed.store(true, Ordering::Release);
}

fn wait_for_state<S: Steppable + Send + 'static>(worker: &Worker<S>, state: WorkerState) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while worker.state() != state {
        assert!(Instant::now() < deadline, "worker stuck in {}", worker.state());
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn step_error_is_relayed_once_then_terminated() {
    let mut worker: Worker<FaultOn> = spawn(WorkerConfig::unprivileged());
    let core = FaultOn::new(3, Failure::Error);
    let calls = Arc::clone(&core.calls);

    start_armed(&mut worker, core);
    wait_for_state(&worker, WorkerState::Exception);

    match worker.stop() {
        Err(WorkerError::Fault(fault)) => {
            assert_eq!(fault.to_string(), "step failed: bus error on call 3");
            let source = fault.step_error().expect("step error");
            assert_eq!(source.downcast_ref::<BusError>().map(|e| e.0), Some(3));
        }
        other => panic!("expected relayed fault, got {other:?}"),
    }

    assert!(matches!(worker.stop(), Err(WorkerError::Terminated)));
    assert!(matches!(worker.resume(), Err(WorkerError::Terminated)));
    assert!(!worker.is_running());

    // No further steps after the fault.
    assert_eq!(calls.load(Ordering::Relaxed), 3);

    worker.shutdown().unwrap();
}

#[test]
fn errored_context_can_be_reclaimed() {
    let mut worker: Worker<FaultOn> = spawn(WorkerConfig::unprivileged());
    start_armed(&mut worker, FaultOn::new(5, Failure::Error));
    wait_for_state(&worker, WorkerState::Exception);

    let context = worker.reclaim().expect("context parked after step error");
    assert_eq!(context.steppable().calls.load(Ordering::Relaxed), 5);
    assert!(worker.reclaim().is_none());

    assert!(matches!(worker.shutdown(), Err(WorkerError::Fault(CapturedFault::Step(_)))));
}

#[test]
fn panic_in_step_is_relayed() {
    let mut worker: Worker<FaultOn> = spawn(WorkerConfig::unprivileged());
    start_armed(&mut worker, FaultOn::new(2, Failure::Panic));
    wait_for_state(&worker, WorkerState::Exception);

    match worker.suspend() {
        Err(WorkerError::Fault(CapturedFault::Panic(message))) => {
            assert_eq!(message, "illegal opcode on call 2");
        }
        other => panic!("expected relayed panic, got {other:?}"),
    }
    assert!(worker.reclaim().is_none(), "a panic unwinds through the context");
}

#[test]
fn unobserved_fault_is_returned_by_shutdown() {
    let mut worker: Worker<FaultOn> = spawn(WorkerConfig::unprivileged());
    start_armed(&mut worker, FaultOn::new(1, Failure::Error));
    wait_for_state(&worker, WorkerState::Exception);

    assert!(matches!(worker.shutdown(), Err(WorkerError::Fault(_))));
}

#[test]
fn dropping_with_unobserved_fault_panics() {
    let mut worker: Worker<FaultOn> = spawn(WorkerConfig::unprivileged());
    start_armed(&mut worker, FaultOn::new(1, Failure::Error));
    wait_for_state(&worker, WorkerState::Exception);

    let dropped = panic::catch_unwind(AssertUnwindSafe(move || drop(worker)));
    assert!(dropped.is_err(), "fault was silently discarded");
}

#[test]
fn dropping_after_fault_was_observed_is_quiet() {
    let mut worker: Worker<FaultOn> = spawn(WorkerConfig::unprivileged());
    start_armed(&mut worker, FaultOn::new(1, Failure::Error));
    wait_for_state(&worker, WorkerState::Exception);

    assert!(matches!(worker.stop(), Err(WorkerError::Fault(_))));
    drop(worker);
}

#[test]
fn wedged_step_times_out_and_is_detached() {
    let release = Arc::new(AtomicBool::new(false));
    let config = WorkerConfig::unprivileged().with_handshake_timeout(Duration::from_millis(200));
    let mut worker: Worker<Wedged> = spawn(config);

    worker
        .start(
            DispatchContext::new(
                1_000_000,
                Wedged {
                    release: Arc::clone(&release),
                },
            )
            .unwrap(),
        )
        .unwrap();

    match worker.stop() {
        Err(WorkerError::Timeout { operation, waited }) => {
            assert_eq!(operation, Operation::Stop);
            assert!(waited >= Duration::from_millis(200));
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    assert!(matches!(worker.suspend(), Err(WorkerError::Unresponsive)));
    assert!(matches!(worker.stop(), Err(WorkerError::Unresponsive)));

    let began = Instant::now();
    drop(worker);
    assert!(began.elapsed() < Duration::from_secs(1), "drop joined a wedged thread");

    // Let the detached thread observe its quit and exit.
    release.store(true, Ordering::Release);
}
