use std::any::Any;
use std::ffi::{c_void, CString};
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::{mem, ptr};

use crate::clock::{self, Nanos, CLOCK_ID, NSEC_PER_SEC};
use crate::error::{AttrStep, Error};

/// Stack size in KiB used when zero is requested.
pub const DEFAULT_STACK_KB: u64 = 256;

/// Delay between arming and the first expiry, so every task reaches its
/// first wait before any deadline fires.
pub const START_DELAY: Nanos = NSEC_PER_SEC;

/// Linux thread names are limited to 16 bytes including the NUL.
const MAX_THREAD_NAME: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedClass {
    /// SCHED_FIFO at a fixed priority, no time slicing.
    Realtime,
    /// SCHED_OTHER; the priority is ignored.
    Normal,
}

impl SchedClass {
    pub fn label(self) -> &'static str {
        match self {
            SchedClass::Realtime => "RT",
            SchedClass::Normal => "NRT",
        }
    }
}

/// Base instant the first expiry is computed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartTime {
    Now,
    At(Nanos),
}

/// Number of deadlines missed when a timer read reports `expiries`.
pub fn missed_deadlines(expiries: u64) -> u64 {
    expiries.saturating_sub(1)
}

/// Owned `pthread_attr_t`, destroyed exactly once.
struct ThreadAttr(Box<libc::pthread_attr_t>);

impl ThreadAttr {
    fn new() -> Result<Self, i32> {
        // SAFETY: pthread_attr_init fully initializes the zeroed storage.
        let mut attr: Box<libc::pthread_attr_t> = Box::new(unsafe { mem::zeroed() });
        let err = unsafe { libc::pthread_attr_init(attr.as_mut()) };
        if err != 0 {
            return Err(err);
        }
        Ok(Self(attr))
    }

    fn as_mut_ptr(&mut self) -> *mut libc::pthread_attr_t {
        self.0.as_mut()
    }

    fn as_ptr(&self) -> *const libc::pthread_attr_t {
        self.0.as_ref()
    }
}

impl Drop for ThreadAttr {
    fn drop(&mut self) {
        // SAFETY: initialized in `new`, destroyed only here.
        unsafe {
            libc::pthread_attr_destroy(self.0.as_mut());
        }
    }
}

/// Absolute-time periodic timerfd. Closing the descriptor on drop releases
/// the kernel timer.
pub struct PeriodicTimer {
    file: File,
}

impl PeriodicTimer {
    /// Creates a timer whose first expiry is the absolute `first_expiry` and
    /// which then fires every `period`.
    pub fn arm(first_expiry: Nanos, period: Nanos) -> io::Result<Self> {
        // SAFETY: plain syscall; the returned descriptor is owned below.
        let fd = unsafe { libc::timerfd_create(CLOCK_ID, libc::TFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let spec = libc::itimerspec {
            it_interval: clock::to_timespec(period),
            it_value: clock::to_timespec(first_expiry),
        };
        let ret = unsafe {
            libc::timerfd_settime(
                fd.as_raw_fd(),
                libc::TFD_TIMER_ABSTIME,
                &spec,
                ptr::null_mut(),
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            file: File::from(fd),
        })
    }

    /// Blocks until the next expiry and returns how many expiries happened
    /// since the previous read (more than one means missed deadlines).
    pub fn wait(&mut self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        self.file.read_exact(&mut buf)?;
        Ok(u64::from_ne_bytes(buf))
    }
}

/// Periodic task: a POSIX thread with a fixed scheduling class and
/// priority, driven by an absolute-deadline timerfd. Not yet started.
pub struct PeriodicTask {
    name: String,
    class: SchedClass,
    priority: i32,
    stack_kb: u64,
    period: Nanos,
    start_delay: Nanos,
    attr: ThreadAttr,
    timer: Option<PeriodicTimer>,
    overruns: Arc<AtomicU64>,
}

impl PeriodicTask {
    /// Configures the thread attributes. A zero `stack_kb` selects
    /// `DEFAULT_STACK_KB`; a negative one is taken as its absolute value.
    pub fn create(
        name: &str,
        priority: i32,
        stack_kb: i64,
        class: SchedClass,
    ) -> Result<Self, Error> {
        let attr_err = |step: AttrStep, code: i32| {
            log::debug!(
                target: "rtbench::task",
                "[{}] {} failed for '{}' with err={}",
                class.label(), step, name, code,
            );
            Error::Attribute {
                task: name.to_string(),
                step,
                code,
            }
        };

        let mut attr = ThreadAttr::new().map_err(|code| attr_err(AttrStep::Init, code))?;

        if class == SchedClass::Realtime {
            let err = unsafe {
                libc::pthread_attr_setinheritsched(attr.as_mut_ptr(), libc::PTHREAD_EXPLICIT_SCHED)
            };
            if err != 0 {
                return Err(attr_err(AttrStep::InheritSched, err));
            }
        }

        let err = unsafe {
            libc::pthread_attr_setdetachstate(attr.as_mut_ptr(), libc::PTHREAD_CREATE_DETACHED)
        };
        if err != 0 {
            return Err(attr_err(AttrStep::DetachState, err));
        }

        if class == SchedClass::Realtime {
            let err = unsafe { libc::pthread_attr_setschedpolicy(attr.as_mut_ptr(), libc::SCHED_FIFO) };
            if err != 0 {
                return Err(attr_err(AttrStep::SchedPolicy, err));
            }
            let param = libc::sched_param {
                sched_priority: priority,
            };
            let err = unsafe { libc::pthread_attr_setschedparam(attr.as_mut_ptr(), &param) };
            if err != 0 {
                return Err(attr_err(AttrStep::Priority, err));
            }
        }

        let stack_kb = match stack_kb.unsigned_abs() {
            0 => DEFAULT_STACK_KB,
            n => n,
        };
        let stack_bytes = stack_kb
            .checked_mul(1024)
            .and_then(|b| libc::size_t::try_from(b).ok())
            .ok_or_else(|| attr_err(AttrStep::StackSize, libc::EINVAL))?;
        let err = unsafe { libc::pthread_attr_setstacksize(attr.as_mut_ptr(), stack_bytes) };
        if err != 0 {
            return Err(attr_err(AttrStep::StackSize, err));
        }

        Ok(Self {
            name: name.to_string(),
            class,
            priority: if class == SchedClass::Realtime { priority } else { 0 },
            stack_kb,
            period: 0,
            start_delay: START_DELAY,
            attr,
            timer: None,
            overruns: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Overrides `START_DELAY` for the next `arm_period`.
    pub fn with_start_delay(mut self, delay: Nanos) -> Self {
        self.start_delay = delay;
        self
    }

    /// Installs the absolute periodic timer. The first expiry lands at
    /// `start + start_delay`, then every `period` after that, independent of
    /// how late any single wake is served.
    pub fn arm_period(&mut self, start: StartTime, period: Nanos) -> Result<(), Error> {
        if period == 0 {
            return Err(Error::Timer {
                task: self.name.clone(),
                op: "arm",
                source: io::Error::new(io::ErrorKind::InvalidInput, "period must be non-zero"),
            });
        }
        let base = match start {
            StartTime::Now => clock::read_clock(),
            StartTime::At(t) => t,
        };
        let timer = PeriodicTimer::arm(base + self.start_delay, period).map_err(|source| {
            Error::Timer {
                task: self.name.clone(),
                op: "arm",
                source,
            }
        })?;
        self.timer = Some(timer);
        self.period = period;
        self.overruns.store(0, Ordering::Relaxed);
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn stack_kb(&self) -> u64 {
        self.stack_kb
    }

    pub fn period(&self) -> Nanos {
        self.period
    }

    /// Launches the detached thread and names it. Consumes the descriptor:
    /// a task starts at most once. `entry` receives the context that owns
    /// the timer.
    pub fn start<F>(mut self, entry: F) -> Result<TaskHandle, Error>
    where
        F: FnOnce(TaskContext) + Send + 'static,
    {
        let ctx = TaskContext {
            name: self.name.clone(),
            period: self.period,
            timer: self.timer.take(),
            overruns: Arc::clone(&self.overruns),
        };

        let (named_tx, named_rx) = mpsc::sync_channel(1);
        let launch = Box::new(Launch {
            name: thread_name(&self.name),
            named: named_tx,
            body: Box::new(move || entry(ctx)),
        });
        let raw = Box::into_raw(launch) as *mut c_void;

        // SAFETY: pthread_t is plain data written by pthread_create.
        let mut thread: libc::pthread_t = unsafe { mem::zeroed() };
        let err = unsafe { libc::pthread_create(&mut thread, self.attr.as_ptr(), trampoline, raw) };
        if err != 0 {
            // The thread never ran; reclaim the payload so the timer is released.
            drop(unsafe { Box::from_raw(raw as *mut Launch) });
            log::debug!(
                target: "rtbench::task",
                "[{}] failed to create thread '{}' with err={}",
                self.class.label(), self.name, err,
            );
            return Err(Error::Spawn {
                task: self.name.clone(),
                code: err,
            });
        }

        match named_rx.recv() {
            Ok(0) => {}
            Ok(code) => {
                return Err(Error::Naming {
                    task: self.name.clone(),
                    code,
                })
            }
            Err(_) => {
                return Err(Error::Spawn {
                    task: self.name.clone(),
                    code: libc::ECHILD,
                })
            }
        }

        log::debug!(
            target: "rtbench::task",
            "[{}] created thread '{}' prio={} period={} ns ok",
            self.class.label(), self.name, self.priority, self.period,
        );

        Ok(TaskHandle {
            name: self.name.clone(),
            overruns: Arc::clone(&self.overruns),
        })
    }
}

struct Launch {
    name: CString,
    named: mpsc::SyncSender<i32>,
    body: Box<dyn FnOnce() + Send>,
}

extern "C" fn trampoline(arg: *mut c_void) -> *mut c_void {
    // SAFETY: `arg` is the `Launch` leaked by `PeriodicTask::start`, handed
    // to exactly one thread.
    let launch = unsafe { Box::from_raw(arg as *mut Launch) };
    let Launch { name, named, body } = *launch;

    let err = unsafe { libc::pthread_setname_np(libc::pthread_self(), name.as_ptr()) };
    let _ = named.send(err);
    if err != 0 {
        return ptr::null_mut();
    }

    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(body)) {
        log::error!(
            target: "rtbench::task",
            "task '{}' panicked: {}",
            name.to_string_lossy(),
            panic_message(payload.as_ref()),
        );
    }
    ptr::null_mut()
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

fn thread_name(name: &str) -> CString {
    let mut end = name.len().min(MAX_THREAD_NAME);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    let bytes: Vec<u8> = name.as_bytes()[..end]
        .iter()
        .copied()
        .filter(|&b| b != 0)
        .collect();
    CString::new(bytes).unwrap_or_default()
}

/// What the orchestrator keeps of a started task.
pub struct TaskHandle {
    name: String,
    overruns: Arc<AtomicU64>,
}

impl TaskHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }
}

/// Per-thread view of a running task. Owns the periodic timer.
pub struct TaskContext {
    name: String,
    period: Nanos,
    timer: Option<PeriodicTimer>,
    overruns: Arc<AtomicU64>,
}

impl TaskContext {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn period(&self) -> Nanos {
        self.period
    }

    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }

    /// Blocks until the next periodic expiry. Missed deadlines are added to
    /// the overrun counter; a failed read is logged and never counted.
    pub fn wait_for_next_tick(&mut self) {
        let Some(timer) = self.timer.as_mut() else {
            log::error!(target: "rtbench::task", "'{}' has no armed period", self.name);
            return;
        };
        match timer.wait() {
            Ok(expiries) => {
                let missed = missed_deadlines(expiries);
                if missed > 0 {
                    self.overruns.fetch_add(missed, Ordering::Relaxed);
                }
            }
            Err(e) => {
                log::error!(
                    target: "rtbench::task",
                    "timer wait failed for '{}': {}", self.name, e,
                );
            }
        }
    }

    /// Ends the task: the timer is released and no further ticks happen.
    pub fn terminate(self) {
        log::debug!(
            target: "rtbench::task",
            "'{}' terminated, overruns={}", self.name, self.overruns(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::NSEC_PER_MSEC;
    use std::time::Duration;

    #[test]
    fn test_missed_deadlines() {
        assert_eq!(missed_deadlines(0), 0);
        assert_eq!(missed_deadlines(1), 0);
        assert_eq!(missed_deadlines(2), 1);
        assert_eq!(missed_deadlines(7), 6);
    }

    #[test]
    fn test_create_default_and_negative_stack() {
        let task = PeriodicTask::create("t0", 0, 0, SchedClass::Normal).unwrap();
        assert_eq!(task.stack_kb(), DEFAULT_STACK_KB);
        assert_eq!(task.priority(), 0);

        let task = PeriodicTask::create("t1", 0, -512, SchedClass::Normal).unwrap();
        assert_eq!(task.stack_kb(), 512);
    }

    #[test]
    fn test_create_rejects_tiny_stack() {
        match PeriodicTask::create("tiny", 0, 1, SchedClass::Normal) {
            Err(Error::Attribute { step, task, .. }) => {
                assert_eq!(step, AttrStep::StackSize);
                assert_eq!(task, "tiny");
            }
            _ => panic!("expected stack size attribute error"),
        }
    }

    #[test]
    fn test_create_rejects_out_of_range_priority() {
        match PeriodicTask::create("prio", 0, 0, SchedClass::Realtime) {
            Err(Error::Attribute { step, .. }) => assert_eq!(step, AttrStep::Priority),
            _ => panic!("expected priority attribute error"),
        }
    }

    #[test]
    fn test_arm_rejects_zero_period() {
        let mut task = PeriodicTask::create("zero", 0, 0, SchedClass::Normal).unwrap();
        let err = task.arm_period(StartTime::Now, 0).unwrap_err();
        assert!(matches!(err, Error::Timer { op: "arm", .. }));
    }

    #[test]
    fn test_create_rejects_overflowing_stack() {
        match PeriodicTask::create("big", 0, i64::MIN, SchedClass::Normal) {
            Err(Error::Attribute { step, code, .. }) => {
                assert_eq!(step, AttrStep::StackSize);
                assert_eq!(code, libc::EINVAL);
            }
            _ => panic!("expected stack size attribute error"),
        }
    }

    #[test]
    fn test_failed_timer_read_is_not_an_overrun() {
        // /dev/null reads hit EOF, so every wait fails.
        let mut ctx = TaskContext {
            name: "broken".into(),
            period: NSEC_PER_MSEC,
            timer: Some(PeriodicTimer {
                file: File::open("/dev/null").unwrap(),
            }),
            overruns: Arc::new(AtomicU64::new(0)),
        };
        for _ in 0..5 {
            ctx.wait_for_next_tick();
        }
        assert_eq!(ctx.overruns(), 0);

        let mut unarmed = TaskContext {
            timer: None,
            ..ctx
        };
        unarmed.wait_for_next_tick();
        assert_eq!(unarmed.overruns(), 0);
    }

    #[test]
    fn test_thread_name_truncated() {
        let name = thread_name("a_very_long_task_name");
        assert_eq!(name.as_bytes().len(), MAX_THREAD_NAME);
        assert_eq!(thread_name("msgq_h").as_bytes(), b"msgq_h");
    }

    #[test]
    fn test_absolute_wakes_do_not_drift() {
        const PERIOD: Nanos = 2 * NSEC_PER_MSEC;
        const WAKES: usize = 50;

        let base = clock::read_clock();
        let delay = 10 * NSEC_PER_MSEC;
        let mut task = PeriodicTask::create("drift", 0, 0, SchedClass::Normal)
            .unwrap()
            .with_start_delay(delay);
        task.arm_period(StartTime::At(base), PERIOD).unwrap();

        let (tx, rx) = mpsc::channel();
        task.start(move |mut ctx| {
            let mut wakes = Vec::with_capacity(WAKES);
            for _ in 0..WAKES {
                ctx.wait_for_next_tick();
                wakes.push(clock::read_clock());
            }
            let overruns = ctx.overruns();
            ctx.terminate();
            let _ = tx.send((wakes, overruns));
        })
        .unwrap();

        let (wakes, overruns) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let first_expiry = base + delay;
        for (i, &w) in wakes.iter().enumerate() {
            // A timer never fires early, and missed expiries only push later wakes further out.
            assert!(w >= first_expiry + i as u64 * PERIOD);
        }
        // Drift stays bounded: the last wake tracks its absolute deadline.
        let last_deadline = first_expiry + (WAKES as u64 - 1 + overruns) * PERIOD;
        assert!(wakes[WAKES - 1] < last_deadline + 50 * NSEC_PER_MSEC);
    }

    #[test]
    fn test_overrun_counted_when_work_exceeds_period() {
        const PERIOD: Nanos = 2 * NSEC_PER_MSEC;

        let mut task = PeriodicTask::create("overrun", 0, 0, SchedClass::Normal)
            .unwrap()
            .with_start_delay(5 * NSEC_PER_MSEC);
        task.arm_period(StartTime::Now, PERIOD).unwrap();

        let (tx, rx) = mpsc::channel();
        let handle = task
            .start(move |mut ctx| {
                ctx.wait_for_next_tick();
                let before = ctx.overruns();
                // At least four further expiries happen during this spin.
                clock::spin(9 * NSEC_PER_MSEC);
                ctx.wait_for_next_tick();
                let after = ctx.overruns();
                ctx.terminate();
                let _ = tx.send((before, after));
            })
            .unwrap();

        let (before, after) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(after - before >= 3, "overruns {} -> {}", before, after);
        assert_eq!(handle.overruns(), after);
        assert_eq!(handle.name(), "overrun");
    }
}
