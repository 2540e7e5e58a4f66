use std::path::PathBuf;

use crate::clock::{self, Nanos};
use crate::config::{Board, Settings, TaskConfig};
use crate::error::Error;
use crate::recorder::MAX_SAMPLES;
use crate::sync::Mechanism;

/// Test mode, fixed once before any task starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Nothing selected: the high-priority task runs alone.
    None,
    SinglePeriodic,
    DualPeriodic,
    Mutex,
    Semaphore,
    EventFlag,
    MessageQueue,
}

impl Mode {
    /// Resolves the `-p` / `-m` selectors.
    pub fn select(periodic: Option<u8>, mechanism: Option<Mechanism>) -> Result<Mode, Error> {
        let mode = match (periodic, mechanism) {
            (Some(n), _) if n != 1 && n != 2 => {
                return Err(Error::Config(format!(
                    "invalid task count {}: choose between 1 and 2 only",
                    n
                )))
            }
            (Some(1), Some(m)) => {
                return Err(Error::Config(format!(
                    "the {} mechanism needs two tasks",
                    m.name()
                )))
            }
            (_, Some(Mechanism::Mutex)) => Mode::Mutex,
            (_, Some(Mechanism::Semaphore)) => Mode::Semaphore,
            (_, Some(Mechanism::EventFlag)) => Mode::EventFlag,
            (_, Some(Mechanism::MessageQueue)) => Mode::MessageQueue,
            (Some(1), None) => Mode::SinglePeriodic,
            (Some(_), None) => Mode::DualPeriodic,
            (None, None) => Mode::None,
        };
        Ok(mode)
    }

    pub fn label(self) -> &'static str {
        match self {
            Mode::None => "Default",
            Mode::SinglePeriodic => "Single Periodic Test",
            Mode::DualPeriodic => "Two-task Periodic Test",
            Mode::Mutex => "Mutex Test",
            Mode::Semaphore => "Semaphore Test",
            Mode::EventFlag => "Event Flag Test",
            Mode::MessageQueue => "Message Queue Test",
        }
    }

    pub fn mechanism(self) -> Option<Mechanism> {
        match self {
            Mode::Mutex => Some(Mechanism::Mutex),
            Mode::Semaphore => Some(Mechanism::Semaphore),
            Mode::EventFlag => Some(Mechanism::EventFlag),
            Mode::MessageQueue => Some(Mechanism::MessageQueue),
            _ => None,
        }
    }

    pub fn task_count(self) -> usize {
        match self {
            Mode::None | Mode::SinglePeriodic => 1,
            _ => 2,
        }
    }

    /// The low-priority task is woken by the high-priority task instead of
    /// its own timer.
    pub fn is_signal_driven(self) -> bool {
        matches!(self, Mode::EventFlag | Mode::MessageQueue)
    }

    /// Thread and result-file names of the high and low task.
    pub fn task_names(self) -> (&'static str, &'static str) {
        match self {
            Mode::None => ("default", "default_l"),
            Mode::SinglePeriodic => ("1periodic", "1periodic_l"),
            Mode::DualPeriodic => ("2periodic_h", "2periodic_l"),
            Mode::Mutex => ("mutex_h", "mutex_l"),
            Mode::Semaphore => ("semaphore_h", "semaphore_l"),
            Mode::EventFlag => ("eventflag_h", "eventflag_l"),
            Mode::MessageQueue => ("msgq_h", "msgq_l"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Role {
    High,
    Low,
}

impl Role {
    /// Log target of the task body; the logger tags its lines with the role.
    pub fn log_target(self) -> &'static str {
        match self {
            Role::High => "rtbench::task::high",
            Role::Low => "rtbench::task::low",
        }
    }
}

/// How a task gets from one tick to the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pacing {
    /// Own absolute periodic timer.
    Timer,
    /// Blocks on the synchronization primitive.
    Signal,
}

/// Everything a task body needs to know about its task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskPlan {
    pub name: &'static str,
    pub role: Role,
    pub priority: i32,
    pub stack_kb: i64,
    /// Period the task is timed by, or the producer's period when
    /// signal-driven. Jitter is measured against it.
    pub nominal: Nanos,
    pub pacing: Pacing,
    pub work: Nanos,
    pub slice: Nanos,
    pub capacity: usize,
    /// Sample count that ends the run; only the primary task has one.
    pub target: Option<usize>,
    pub edge_limit: usize,
}

/// Read-only description of one benchmark run.
#[derive(Debug, Clone)]
pub struct BenchmarkRun {
    pub mode: Mode,
    pub duration: u64,
    pub oscilloscope: bool,
    pub board: Board,
    pub results_dir: PathBuf,
    pub realtime: bool,
    pub lock_memory: bool,
    pub start_delay: Nanos,
    pub high: TaskPlan,
    pub low: Option<TaskPlan>,
}

/// Samples a task with period `period` records over `duration` seconds.
pub fn samples_for(duration: u64, period: Nanos) -> usize {
    let ticks = duration.saturating_mul(clock::ticks_per_sec(period));
    usize::try_from(ticks).unwrap_or(usize::MAX).min(MAX_SAMPLES)
}

impl BenchmarkRun {
    pub fn new(mode: Mode, settings: &Settings) -> Result<Self, Error> {
        let bench = &settings.bench;
        if bench.duration == 0 {
            return Err(Error::Config("test duration must be at least one second".into()));
        }

        if mode.task_count() > 1 && settings.low.priority >= settings.high.priority {
            return Err(Error::Config(format!(
                "low task priority {} must be below high task priority {}",
                settings.low.priority, settings.high.priority
            )));
        }

        let (high_name, low_name) = mode.task_names();
        let target = samples_for(bench.duration, settings.high.period());
        let edge_limit = |limit: usize| if bench.oscilloscope { limit } else { 0 };

        let high = TaskPlan {
            name: high_name,
            role: Role::High,
            priority: settings.high.priority,
            stack_kb: settings.high.stack_kb,
            nominal: settings.high.period(),
            pacing: Pacing::Timer,
            work: settings.high.work(),
            slice: settings.high.slice(),
            capacity: target,
            target: Some(target),
            edge_limit: edge_limit(crate::recorder::HIGH_EDGE_LIMIT),
        };

        let low = (mode.task_count() > 1)
            .then(|| Self::low_plan(mode, low_name, &settings.low, &settings.high, bench.duration, target))
            .map(|mut plan| {
                plan.edge_limit = edge_limit(crate::recorder::LOW_EDGE_LIMIT);
                plan
            });

        Ok(Self {
            mode,
            duration: bench.duration,
            oscilloscope: bench.oscilloscope,
            board: bench.board,
            results_dir: bench.results_dir.clone(),
            realtime: bench.realtime,
            lock_memory: bench.lock_memory,
            start_delay: bench.start_delay(),
            high,
            low,
        })
    }

    fn low_plan(
        mode: Mode,
        name: &'static str,
        low: &TaskConfig,
        high: &TaskConfig,
        duration: u64,
        target: usize,
    ) -> TaskPlan {
        if mode.is_signal_driven() {
            // One wake per producer tick; it cannot outrun the primary.
            TaskPlan {
                name,
                role: Role::Low,
                priority: low.priority,
                stack_kb: low.stack_kb,
                nominal: high.period(),
                pacing: Pacing::Signal,
                work: 0,
                slice: low.slice(),
                capacity: (target + 1).min(MAX_SAMPLES),
                target: None,
                edge_limit: 0,
            }
        } else {
            TaskPlan {
                name,
                role: Role::Low,
                priority: low.priority,
                stack_kb: low.stack_kb,
                nominal: low.period(),
                pacing: Pacing::Timer,
                work: low.work(),
                slice: low.slice(),
                capacity: (samples_for(duration, low.period()) + 2).min(MAX_SAMPLES),
                target: None,
                edge_limit: 0,
            }
        }
    }

    pub fn task_count(&self) -> usize {
        self.mode.task_count()
    }

    /// Samples the primary task records before the run ends.
    pub fn target_samples(&self) -> usize {
        self.high.target.unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::NSEC_PER_MSEC;

    #[test]
    fn test_select_modes() {
        assert_eq!(Mode::select(None, None).unwrap(), Mode::None);
        assert_eq!(Mode::select(Some(1), None).unwrap(), Mode::SinglePeriodic);
        assert_eq!(Mode::select(Some(2), None).unwrap(), Mode::DualPeriodic);
        assert_eq!(Mode::select(None, Some(Mechanism::Mutex)).unwrap(), Mode::Mutex);
        assert_eq!(
            Mode::select(Some(2), Some(Mechanism::MessageQueue)).unwrap(),
            Mode::MessageQueue
        );
    }

    #[test]
    fn test_select_rejects_bad_task_count() {
        let err = Mode::select(Some(3), None).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        let err = Mode::select(Some(1), Some(Mechanism::Semaphore)).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_mode_properties() {
        assert_eq!(Mode::None.task_count(), 1);
        assert_eq!(Mode::EventFlag.task_count(), 2);
        assert!(Mode::MessageQueue.is_signal_driven());
        assert!(!Mode::Mutex.is_signal_driven());
        assert_eq!(Mode::Semaphore.mechanism(), Some(Mechanism::Semaphore));
        assert_eq!(Mode::DualPeriodic.mechanism(), None);
        assert_eq!(Mode::MessageQueue.task_names(), ("msgq_h", "msgq_l"));
    }

    #[test]
    fn test_zero_duration_rejected() {
        let mut settings = Settings::default();
        settings.bench.duration = 0;
        let err = BenchmarkRun::new(Mode::SinglePeriodic, &settings).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_low_task_must_rank_below_high_task() {
        let mut settings = Settings::default();
        settings.high.priority = 40;
        settings.low.priority = 90;
        settings.validate();
        let err = BenchmarkRun::new(Mode::Mutex, &settings).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(err.exit_code(), 2);

        settings.low.priority = 40;
        assert!(BenchmarkRun::new(Mode::MessageQueue, &settings).is_err());

        // A single task has nothing to rank against.
        assert!(BenchmarkRun::new(Mode::SinglePeriodic, &settings).is_ok());
    }

    #[test]
    fn test_target_follows_duration_and_period() {
        let settings = Settings::default();
        let run = BenchmarkRun::new(Mode::SinglePeriodic, &settings).unwrap();
        assert_eq!(run.target_samples(), 3 * 1000);
        assert_eq!(run.task_count(), 1);
        assert!(run.low.is_none());
        assert_eq!(run.high.nominal, NSEC_PER_MSEC);
    }

    #[test]
    fn test_tick_count_clamped_to_capacity() {
        let mut settings = Settings::default();
        settings.bench.duration = 3600;
        settings.high.period_us = 100;
        let run = BenchmarkRun::new(Mode::SinglePeriodic, &settings).unwrap();
        assert_eq!(run.target_samples(), MAX_SAMPLES);
        assert_eq!(samples_for(u64::MAX, 1), MAX_SAMPLES);
    }

    #[test]
    fn test_signal_driven_low_plan() {
        let settings = Settings::default();
        let run = BenchmarkRun::new(Mode::MessageQueue, &settings).unwrap();
        let low = run.low.as_ref().unwrap();
        assert_eq!(low.pacing, Pacing::Signal);
        assert_eq!(low.nominal, run.high.nominal);
        assert_eq!(low.target, None);
        assert!(low.capacity > run.target_samples());
    }

    #[test]
    fn test_timer_driven_low_plan() {
        let mut settings = Settings::default();
        settings.bench.oscilloscope = true;
        let run = BenchmarkRun::new(Mode::Mutex, &settings).unwrap();
        let low = run.low.as_ref().unwrap();
        assert_eq!(low.pacing, Pacing::Timer);
        assert_eq!(low.nominal, 5 * NSEC_PER_MSEC);
        assert_eq!(low.capacity, 3 * 200 + 2);
        assert_eq!(low.edge_limit, crate::recorder::LOW_EDGE_LIMIT);
        assert_eq!(run.high.edge_limit, crate::recorder::HIGH_EDGE_LIMIT);
    }
}
