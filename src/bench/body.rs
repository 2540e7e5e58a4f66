use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};

use crate::bench::mode::{Pacing, Role, TaskPlan};
use crate::clock::{self, Nanos};
use crate::error::Error;
use crate::recorder::{EdgeBuffer, Recorded, SampleBuffer, TickSample};
use crate::sync::SyncPrimitive;
use crate::task::TaskContext;

/// State shared by the orchestrator and every task of one run.
pub struct RunState {
    quit: AtomicBool,
    origin: Nanos,
}

impl RunState {
    pub fn new(origin: Nanos) -> Self {
        Self {
            quit: AtomicBool::new(false),
            origin,
        }
    }

    pub fn quit(&self) -> bool {
        self.quit.load(Ordering::Acquire)
    }

    /// Monotonic: once set it is never cleared.
    pub fn request_quit(&self) {
        self.quit.store(true, Ordering::Release);
    }

    /// Clock reading every oscilloscope edge is relative to.
    pub fn origin(&self) -> Nanos {
        self.origin
    }
}

/// Everything a task hands back when it ends.
pub struct TaskReport {
    pub name: &'static str,
    pub role: Role,
    pub nominal: Nanos,
    pub samples: SampleBuffer,
    pub edges: EdgeBuffer,
    pub overruns: u64,
}

/// The per-tick loop of one benchmark task. Built on the orchestrator
/// thread; every buffer is allocated before the task starts.
pub struct TaskBody {
    plan: TaskPlan,
    samples: SampleBuffer,
    edges: EdgeBuffer,
    sync: Option<Arc<SyncPrimitive>>,
    run: Arc<RunState>,
    progress: Arc<AtomicU64>,
    report: mpsc::Sender<TaskReport>,
}

impl TaskBody {
    pub fn new(
        plan: TaskPlan,
        sync: Option<Arc<SyncPrimitive>>,
        run: Arc<RunState>,
        progress: Arc<AtomicU64>,
        report: mpsc::Sender<TaskReport>,
    ) -> Self {
        let samples = SampleBuffer::with_capacity(plan.capacity);
        let edges = match plan.edge_limit {
            0 => EdgeBuffer::disabled(),
            limit => EdgeBuffer::new(limit, run.origin()),
        };
        Self {
            plan,
            samples,
            edges,
            sync,
            run,
            progress,
            report,
        }
    }

    fn is_producer(&self) -> bool {
        self.plan.role == Role::High
    }

    /// Runs ticks until the run ends, then sends the report.
    pub fn run(mut self, mut ctx: TaskContext) {
        log::debug!(
            target: self.plan.role.log_target(),
            "'{}' running, period {} ns, {} sample slots",
            ctx.name(), ctx.period(), self.samples.capacity(),
        );
        let mut tick: u64 = 0;
        let mut prev_start = clock::read_clock();

        loop {
            let signaled_at = match self.wait_for_signal() {
                Ok(at) => at,
                Err(Error::Closed { .. }) => break,
                Err(e) => {
                    log::error!(
                        target: self.plan.role.log_target(),
                        "'{}' wait failed: {}", self.plan.name, e,
                    );
                    if self.run.quit() {
                        break;
                    }
                    continue;
                }
            };

            let start = clock::read_clock();
            self.spin_work();
            let done = clock::read_clock();

            if self.is_producer() {
                if let Some(sync) = &self.sync {
                    if let Err(e) = sync.signal(tick, clock::read_clock()) {
                        log::warn!(
                            target: self.plan.role.log_target(),
                            "'{}' signal dropped: {}", self.plan.name, e,
                        );
                    }
                }
            }

            let mut sample = TickSample::measure(prev_start, start, done, self.plan.nominal);
            if let Some(at) = signaled_at {
                sample = sample.with_latency(start.saturating_sub(at));
            }
            match self.samples.record(tick, sample) {
                Recorded::Stored(n) => {
                    self.progress.store(n as u64, Ordering::Relaxed);
                    if Some(n) == self.plan.target {
                        self.run.request_quit();
                    }
                }
                Recorded::Full => {
                    if self.is_producer() {
                        self.run.request_quit();
                    }
                    break;
                }
                Recorded::WarmUp => {}
            }
            self.edges.record_edge(tick, start, done);

            prev_start = start;
            tick += 1;

            match self.plan.pacing {
                Pacing::Timer => {
                    if self.run.quit() {
                        break;
                    }
                    ctx.wait_for_next_tick();
                }
                // Signal-driven tasks end when the primitive is closed, so
                // every token sent before the quit is still consumed.
                Pacing::Signal => {}
            }
        }

        let report = TaskReport {
            name: self.plan.name,
            role: self.plan.role,
            nominal: self.plan.nominal,
            samples: self.samples,
            edges: self.edges,
            overruns: ctx.overruns(),
        };
        ctx.terminate();
        let _ = self.report.send(report);
    }

    fn wait_for_signal(&self) -> Result<Option<Nanos>, Error> {
        match (&self.plan.pacing, &self.sync) {
            (Pacing::Signal, Some(sync)) => sync.wait(),
            _ => Ok(None),
        }
    }

    /// Busy work of one tick, one acquire/release per slice.
    fn spin_work(&self) {
        let guard = self
            .sync
            .as_deref()
            .filter(|s| s.mechanism().is_exclusive());
        let mut left = self.plan.work;
        while left > 0 {
            let slice = left.min(self.plan.slice.max(1));
            let held = match guard {
                Some(sync) => match sync.acquire() {
                    Ok(()) => Some(sync),
                    Err(e) => {
                        log::warn!(
                            target: self.plan.role.log_target(),
                            "'{}' acquire failed: {}", self.plan.name, e,
                        );
                        None
                    }
                },
                None => None,
            };
            clock::spin(slice);
            if let Some(sync) = held {
                if let Err(e) = sync.release() {
                    log::warn!(
                        target: self.plan.role.log_target(),
                        "'{}' release failed: {}", self.plan.name, e,
                    );
                }
            }
            left -= slice;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quit_is_monotonic() {
        let run = RunState::new(5);
        assert!(!run.quit());
        run.request_quit();
        run.request_quit();
        assert!(run.quit());
        assert_eq!(run.origin(), 5);
    }
}
