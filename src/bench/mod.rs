mod body;
mod mode;

pub use body::{RunState, TaskReport};
pub use mode::{BenchmarkRun, Mode, Pacing, Role, TaskPlan};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use body::TaskBody;

use crate::clock::{self, Nanos};
use crate::error::Error;
use crate::sync::SyncPrimitive;
use crate::task::{PeriodicTask, SchedClass, StartTime, TaskHandle};

/// Idle-loop poll interval while the tasks run.
const POLL_STEP: Duration = Duration::from_millis(10);

/// How often progress is logged.
const PROGRESS_EVERY: Duration = Duration::from_secs(1);

/// Grace period for tasks to report after the quit flag is raised.
const COLLECT_GRACE: Duration = Duration::from_secs(2);

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn signal_handler(_sig: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

fn install_signal_handlers() {
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = signal_handler as *const () as usize;
        sa.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut sa.sa_mask);
        libc::sigaction(libc::SIGTERM, &sa, std::ptr::null_mut());
        libc::sigaction(libc::SIGINT, &sa, std::ptr::null_mut());
    }
}

/// Locks current and future pages so task loops never page-fault.
/// Failure (usually missing privileges) only costs determinism.
fn lock_memory() {
    let ret = unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) };
    if ret != 0 {
        log::warn!(
            target: "rtbench::bench",
            "mlockall failed: {}; page faults may disturb the measurements",
            std::io::Error::last_os_error(),
        );
    }
}

struct Started {
    handle: TaskHandle,
    progress: Arc<AtomicU64>,
}

/// Creates the task and, unless it is signal-driven, arms its period on
/// the shared `origin` so every timer of the run has the same phase.
fn create_task(
    plan: &TaskPlan,
    class: SchedClass,
    origin: Nanos,
    start_delay: Nanos,
) -> Result<PeriodicTask, Error> {
    let mut task = PeriodicTask::create(plan.name, plan.priority, plan.stack_kb, class)?
        .with_start_delay(start_delay);
    if plan.pacing == Pacing::Timer {
        task.arm_period(StartTime::At(origin), plan.nominal)?;
    }
    log::debug!(
        target: "rtbench::bench",
        "'{}': prio {}, stack {} KiB, period {} ns",
        task.name(), task.priority(), task.stack_kb(), task.period(),
    );
    Ok(task)
}

/// Runs one benchmark to completion: builds the tasks of the selected mode,
/// runs them until the primary task has its samples, then returns the task
/// reports, the high-priority task first.
pub fn run(bench: &BenchmarkRun) -> Result<Vec<TaskReport>, Error> {
    if bench.lock_memory {
        lock_memory();
    }
    install_signal_handlers();

    let class = if bench.realtime {
        SchedClass::Realtime
    } else {
        SchedClass::Normal
    };

    let sync = bench
        .mode
        .mechanism()
        .map(SyncPrimitive::new)
        .transpose()?
        .map(Arc::new);

    let origin = clock::read_clock();
    let state = Arc::new(RunState::new(origin));

    // Every task is created and armed before any of them starts, so a
    // resource failure leaves nothing running.
    let high = create_task(&bench.high, class, origin, bench.start_delay)?;
    let low = match &bench.low {
        Some(plan) => Some((
            create_task(plan, class, origin, bench.start_delay)?,
            plan.clone(),
        )),
        None => None,
    };

    log::info!(
        target: "rtbench::bench",
        "{}: {} s, {} task(s), {} samples, class {}",
        bench.mode.label(), bench.duration, bench.task_count(), bench.target_samples(), class.label(),
    );

    let (report_tx, report_rx) = mpsc::channel();
    let mut started = Vec::with_capacity(2);

    let spawn = |task: PeriodicTask, plan: TaskPlan| -> Result<Started, Error> {
        let progress = Arc::new(AtomicU64::new(0));
        let body = TaskBody::new(
            plan,
            sync.clone(),
            Arc::clone(&state),
            Arc::clone(&progress),
            report_tx.clone(),
        );
        let handle = task.start(move |ctx| body.run(ctx))?;
        Ok(Started { handle, progress })
    };

    started.push(spawn(high, bench.high.clone())?);
    if let Some((task, plan)) = low {
        match spawn(task, plan) {
            Ok(s) => started.push(s),
            Err(e) => {
                shut_down(&state, sync.as_deref());
                return Err(e);
            }
        }
    }
    drop(spawn);
    drop(report_tx);

    idle_until_quit(&state, &started, bench.target_samples());
    shut_down(&state, sync.as_deref());

    collect(report_rx, &started, bench)
}

fn shut_down(state: &RunState, sync: Option<&SyncPrimitive>) {
    state.request_quit();
    if let Some(sync) = sync {
        sync.close();
    }
}

fn idle_until_quit(state: &RunState, started: &[Started], target: usize) {
    let mut last_report = Instant::now();
    while !state.quit() {
        if SHUTDOWN.load(Ordering::Relaxed) {
            log::warn!(target: "rtbench::bench", "interrupted, stopping tasks");
            state.request_quit();
            break;
        }
        thread::sleep(POLL_STEP);

        if last_report.elapsed() >= PROGRESS_EVERY {
            last_report = Instant::now();
            for s in started {
                log::info!(
                    target: "rtbench::bench",
                    "'{}': {}/{} samples, {} overruns",
                    s.handle.name(),
                    s.progress.load(Ordering::Relaxed),
                    target,
                    s.handle.overruns(),
                );
            }
        }
    }
}

fn collect(
    rx: mpsc::Receiver<TaskReport>,
    started: &[Started],
    bench: &BenchmarkRun,
) -> Result<Vec<TaskReport>, Error> {
    let longest = bench
        .low
        .as_ref()
        .map_or(bench.high.nominal, |p| p.nominal.max(bench.high.nominal));
    let deadline = Instant::now() + COLLECT_GRACE + Duration::from_nanos(bench.start_delay + 4 * longest);

    let mut reports = Vec::with_capacity(started.len());
    while reports.len() < started.len() {
        let wait = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(wait) {
            Ok(report) => reports.push(report),
            Err(_) => {
                let missing = started
                    .iter()
                    .map(|s| s.handle.name())
                    .find(|name| reports.iter().all(|r: &TaskReport| r.name != *name))
                    .unwrap_or("unknown");
                return Err(Error::TaskLost(missing.to_string()));
            }
        }
    }

    reports.sort_by_key(|r| r.role);
    for r in &reports {
        if r.samples.is_empty() {
            log::warn!(target: "rtbench::bench", "'{}' recorded no samples", r.name);
        }
        log::info!(
            target: "rtbench::bench",
            "'{}' finished: {} samples, {} overruns",
            r.name, r.samples.len(), r.overruns,
        );
    }
    Ok(reports)
}
