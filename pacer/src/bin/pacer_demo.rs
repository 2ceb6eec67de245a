//! Drives a synthetic core through the frame loop a front-end would run:
//! start the worker, render, stop it, then sleep until emulated time
//! catches up with wall time.
//!
//! ```text
//! cargo run --features tracing --bin pacer-demo -- --rate 3579545 --frames 120
//! ```

use std::convert::Infallible;
use std::process::ExitCode;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;

use pacer::{
    CpuConfig, DispatchContext, DispatchResult, DispatchStatus, RealtimePolicy, Steppable, Worker,
    WorkerConfig, WorkerError,
};

#[derive(Parser)]
#[command(version, about = "Paced emulation worker demo")]
struct Args {
    /// Emulated clock rate in Hz
    #[arg(long, default_value_t = 3_579_545)]
    rate: u64,

    /// Number of frames to run
    #[arg(long, default_value_t = 300)]
    frames: u32,

    /// Front-end frame rate
    #[arg(long, default_value_t = 60.0)]
    frame_rate: f64,

    /// Most cycles a single step may execute
    #[arg(long, default_value_t = 76)]
    cycles_per_step: u64,

    /// Worker timeslice in microseconds
    #[arg(long, default_value_t = 100)]
    timeslice_us: u64,

    /// Stop with a debugger trap once this many cycles have run
    #[arg(long)]
    break_at: Option<u64>,

    /// Keep the default OS scheduler
    #[arg(long)]
    no_realtime: bool,

    /// Do not pin the worker to a core
    #[arg(long)]
    no_pin: bool,
}

/// Stand-in for a CPU core: burns up to `cycles_per_step` cycles per call.
struct SyntheticCore {
    cycles_per_step: u64,
    executed: u64,
    break_at: Option<u64>,
}

impl Steppable for SyntheticCore {
    type Error = Infallible;

    fn step(&mut self, result: &mut DispatchResult, max_cycles: u64) -> Result<(), Infallible> {
        let cycles = max_cycles.min(self.cycles_per_step);
        self.executed += cycles;

        match self.break_at {
            Some(at) if self.executed >= at => {
                result.set_debugger(cycles, "cycle breakpoint", None, None);
            }
            _ => result.set_ok(cycles),
        }
        Ok(())
    }
}

fn main() -> ExitCode {
    pacer::init_tracing();

    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("pacer-demo: {error}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<(), WorkerError> {
    if !(args.frame_rate.is_finite() && args.frame_rate > 0.0) {
        return Err(WorkerError::InvalidConfig("frame rate must be positive"));
    }

    let mut config = WorkerConfig::default().with_timeslice(Duration::from_micros(args.timeslice_us));
    if args.no_pin {
        config = config.with_cpu(CpuConfig::Disabled);
    }
    if args.no_realtime {
        config = config.with_realtime(RealtimePolicy::Disabled);
    }

    let mut worker = Worker::spawn(config)?;
    let mut next = Some(DispatchContext::new(
        args.rate,
        SyntheticCore {
            cycles_per_step: args.cycles_per_step.max(1),
            executed: 0,
            break_at: args.break_at,
        },
    )?);

    // Emulated time may lag wall time by one frame before it is reset.
    let frame = Duration::from_secs_f64(1.0 / args.frame_rate);
    let rate = args.rate as f64;
    let began = Instant::now();
    let mut virtual_time = began;
    let mut total_cycles = 0u64;

    for _ in 0..args.frames {
        let Some(context) = next.take() else { break };
        worker.start(context)?;

        // "Render": the worker keeps emulating meanwhile.
        thread::sleep(frame / 2);

        let Some(mut context) = worker.stop()? else { break };
        let cycles = context.cycles_emulated();
        total_cycles += cycles;

        match context.result().status() {
            DispatchStatus::Ok => {}
            DispatchStatus::Debugger => {
                println!(
                    "breakpoint: {} after {} cycles",
                    context.result().message().unwrap_or("trap"),
                    total_cycles
                );
                // Leave the "debugger": clear the trap and continue.
                context.steppable_mut().break_at = None;
                context.result_mut().set_ok(0);
            }
            DispatchStatus::Fatal => {
                eprintln!("fatal: {}", context.result().message().unwrap_or("unknown"));
                break;
            }
        }

        // Fresh cycle count for the next frame, same core and result slot.
        let (steppable, result) = context.into_parts();
        next = Some(DispatchContext::new(args.rate, steppable)?.with_result(result));

        virtual_time += Duration::from_secs_f64(cycles as f64 / rate);
        let now = Instant::now();
        if now.saturating_duration_since(virtual_time) > frame {
            virtual_time = now;
        } else if virtual_time > now {
            thread::sleep(virtual_time - now);
        }
    }

    worker.shutdown()?;

    let elapsed = began.elapsed();
    let target = rate * elapsed.as_secs_f64();
    println!(
        "emulated {total_cycles} cycles in {:.3}s; target {:.0} ({:.2}%)",
        elapsed.as_secs_f64(),
        target,
        100.0 * total_cycles as f64 / target.max(1.0)
    );
    Ok(())
}
