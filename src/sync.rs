use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::io;
use std::mem;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crate::clock::Nanos;
use crate::error::Error;

/// Bits the high-priority task raises on the event flag.
pub const EVENT_MASK: u32 = 0x1;

/// Slots in the message queue; the consumer drains one per tick.
pub const QUEUE_CAPACITY: usize = 255;

pub const TOKEN_PAYLOAD: [u8; 7] = *b"Trivial";

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Mechanism {
    /// Priority-inheritance mutex
    #[value(name = "mtx")]
    Mutex,
    /// Counting semaphore, initial value 1
    #[value(name = "sem")]
    Semaphore,
    /// Event flag group
    #[value(name = "evf")]
    EventFlag,
    /// Bounded message queue
    #[value(name = "msg")]
    MessageQueue,
}

impl Mechanism {
    pub fn name(self) -> &'static str {
        match self {
            Mechanism::Mutex => "mutex",
            Mechanism::Semaphore => "semaphore",
            Mechanism::EventFlag => "event flag",
            Mechanism::MessageQueue => "message queue",
        }
    }

    /// True for disciplines that guard a shared compute spin.
    pub fn is_exclusive(self) -> bool {
        matches!(self, Mechanism::Mutex | Mechanism::Semaphore)
    }
}

/// Fixed-size message carried through the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token {
    pub seq: u64,
    pub sent_at: Nanos,
    pub payload: [u8; 7],
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// `pthread_mutex_t` with the priority-inheritance protocol.
pub struct PiMutex {
    raw: Box<UnsafeCell<libc::pthread_mutex_t>>,
}

// SAFETY: the pthread mutex is designed for cross-thread use and never moves
// once boxed.
unsafe impl Send for PiMutex {}
unsafe impl Sync for PiMutex {}

impl PiMutex {
    pub fn new() -> io::Result<Self> {
        let raw: Box<UnsafeCell<libc::pthread_mutex_t>> =
            Box::new(UnsafeCell::new(unsafe { mem::zeroed() }));
        let mut attr: libc::pthread_mutexattr_t = unsafe { mem::zeroed() };

        unsafe {
            let err = libc::pthread_mutexattr_init(&mut attr);
            if err != 0 {
                return Err(io::Error::from_raw_os_error(err));
            }
            let err = libc::pthread_mutexattr_setprotocol(&mut attr, libc::PTHREAD_PRIO_INHERIT);
            if err != 0 {
                libc::pthread_mutexattr_destroy(&mut attr);
                return Err(io::Error::from_raw_os_error(err));
            }
            let err = libc::pthread_mutex_init(raw.get(), &attr);
            libc::pthread_mutexattr_destroy(&mut attr);
            if err != 0 {
                return Err(io::Error::from_raw_os_error(err));
            }
        }

        Ok(Self { raw })
    }

    pub fn lock(&self) -> io::Result<()> {
        match unsafe { libc::pthread_mutex_lock(self.raw.get()) } {
            0 => Ok(()),
            err => Err(io::Error::from_raw_os_error(err)),
        }
    }

    pub fn unlock(&self) -> io::Result<()> {
        match unsafe { libc::pthread_mutex_unlock(self.raw.get()) } {
            0 => Ok(()),
            err => Err(io::Error::from_raw_os_error(err)),
        }
    }
}

impl Drop for PiMutex {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_mutex_destroy(self.raw.get());
        }
    }
}

/// Process-private POSIX counting semaphore.
pub struct Semaphore {
    raw: Box<UnsafeCell<libc::sem_t>>,
}

// SAFETY: sem_t is designed for cross-thread use and never moves once boxed.
unsafe impl Send for Semaphore {}
unsafe impl Sync for Semaphore {}

impl Semaphore {
    pub fn new(value: u32) -> io::Result<Self> {
        let raw: Box<UnsafeCell<libc::sem_t>> = Box::new(UnsafeCell::new(unsafe { mem::zeroed() }));
        if unsafe { libc::sem_init(raw.get(), 0, value) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { raw })
    }

    /// P operation; retried when a signal interrupts the wait.
    pub fn wait(&self) -> io::Result<()> {
        loop {
            if unsafe { libc::sem_wait(self.raw.get()) } == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    /// V operation.
    pub fn post(&self) -> io::Result<()> {
        if unsafe { libc::sem_post(self.raw.get()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn value(&self) -> i32 {
        let mut v: libc::c_int = 0;
        unsafe {
            libc::sem_getvalue(self.raw.get(), &mut v);
        }
        v
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe {
            libc::sem_destroy(self.raw.get());
        }
    }
}

struct EventState {
    bits: u32,
    signaled_at: Nanos,
    closed: bool,
}

/// Bit-pattern event group. A wait consumes the bits it was waiting for.
pub struct EventFlag {
    state: Mutex<EventState>,
    cond: Condvar,
}

impl EventFlag {
    pub fn new(initial: u32) -> Self {
        Self {
            state: Mutex::new(EventState {
                bits: initial,
                signaled_at: 0,
                closed: false,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn signal(&self, mask: u32, now: Nanos) {
        let mut state = lock(&self.state);
        state.bits |= mask;
        state.signaled_at = now;
        self.cond.notify_all();
    }

    /// Blocks until every bit of `mask` is set and returns the time of the
    /// signal that completed the pattern.
    pub fn wait_all(&self, mask: u32) -> Result<Nanos, Error> {
        let mut state = lock(&self.state);
        while state.bits & mask != mask {
            if state.closed {
                return Err(Error::Closed {
                    mechanism: Mechanism::EventFlag.name(),
                });
            }
            state = self
                .cond
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state.bits &= !mask;
        Ok(state.signaled_at)
    }

    pub fn close(&self) {
        lock(&self.state).closed = true;
        self.cond.notify_all();
    }
}

struct QueueState {
    items: VecDeque<Token>,
    closed: bool,
}

/// Bounded FIFO of tokens, allocated to capacity up front.
pub struct MessageQueue {
    state: Mutex<QueueState>,
    not_empty: Condvar,
    capacity: usize,
}

impl MessageQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_empty: Condvar::new(),
            capacity,
        }
    }

    /// Enqueues without blocking; a full queue is a transient error.
    pub fn send(&self, token: Token) -> Result<(), Error> {
        let mut state = lock(&self.state);
        if state.items.len() >= self.capacity {
            return Err(Error::Wait {
                mechanism: Mechanism::MessageQueue.name(),
                reason: format!("queue full ({} tokens)", self.capacity),
            });
        }
        state.items.push_back(token);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Blocks until a token is available. Tokens queued before `close` are
    /// still delivered.
    pub fn recv(&self) -> Result<Token, Error> {
        let mut state = lock(&self.state);
        loop {
            if let Some(token) = state.items.pop_front() {
                return Ok(token);
            }
            if state.closed {
                return Err(Error::Closed {
                    mechanism: Mechanism::MessageQueue.name(),
                });
            }
            state = self
                .not_empty
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.state).items.len()
    }

    pub fn close(&self) {
        lock(&self.state).closed = true;
        self.not_empty.notify_all();
    }
}

/// The primitive selected for a run.
///
/// Exclusive kinds (mutex, semaphore) are used through `acquire`/`release`
/// around the compute spin. Triggering kinds (event flag, message queue) are
/// used through `signal`/`wait`: the high-priority task signals once per tick
/// and the low-priority task blocks on it. The other pair of operations is a
/// no-op, so task bodies never branch on the mode.
pub enum SyncPrimitive {
    Mutex(PiMutex),
    Semaphore(Semaphore),
    EventFlag(EventFlag),
    MessageQueue(MessageQueue),
}

impl SyncPrimitive {
    pub fn new(mechanism: Mechanism) -> Result<Self, Error> {
        let create_err = |source| Error::SyncCreate {
            mechanism: mechanism.name(),
            source,
        };
        let primitive = match mechanism {
            Mechanism::Mutex => SyncPrimitive::Mutex(PiMutex::new().map_err(create_err)?),
            Mechanism::Semaphore => SyncPrimitive::Semaphore(Semaphore::new(1).map_err(create_err)?),
            Mechanism::EventFlag => SyncPrimitive::EventFlag(EventFlag::new(0)),
            Mechanism::MessageQueue => SyncPrimitive::MessageQueue(MessageQueue::new(QUEUE_CAPACITY)),
        };
        Ok(primitive)
    }

    pub fn mechanism(&self) -> Mechanism {
        match self {
            SyncPrimitive::Mutex(_) => Mechanism::Mutex,
            SyncPrimitive::Semaphore(_) => Mechanism::Semaphore,
            SyncPrimitive::EventFlag(_) => Mechanism::EventFlag,
            SyncPrimitive::MessageQueue(_) => Mechanism::MessageQueue,
        }
    }

    fn wait_err(&self, e: io::Error) -> Error {
        Error::Wait {
            mechanism: self.mechanism().name(),
            reason: e.to_string(),
        }
    }

    pub fn acquire(&self) -> Result<(), Error> {
        match self {
            SyncPrimitive::Mutex(m) => m.lock().map_err(|e| self.wait_err(e)),
            SyncPrimitive::Semaphore(s) => s.wait().map_err(|e| self.wait_err(e)),
            _ => Ok(()),
        }
    }

    pub fn release(&self) -> Result<(), Error> {
        match self {
            SyncPrimitive::Mutex(m) => m.unlock().map_err(|e| self.wait_err(e)),
            SyncPrimitive::Semaphore(s) => s.post().map_err(|e| self.wait_err(e)),
            _ => Ok(()),
        }
    }

    /// Triggers the consumer. `seq` numbers the producer's tick.
    pub fn signal(&self, seq: u64, now: Nanos) -> Result<(), Error> {
        match self {
            SyncPrimitive::EventFlag(f) => {
                f.signal(EVENT_MASK, now);
                Ok(())
            }
            SyncPrimitive::MessageQueue(q) => q.send(Token {
                seq,
                sent_at: now,
                payload: TOKEN_PAYLOAD,
            }),
            _ => Ok(()),
        }
    }

    /// Blocks until the producer signals; returns the signal's timestamp.
    /// Exclusive kinds have no producer and return `None` immediately.
    pub fn wait(&self) -> Result<Option<Nanos>, Error> {
        match self {
            SyncPrimitive::EventFlag(f) => f.wait_all(EVENT_MASK).map(Some),
            SyncPrimitive::MessageQueue(q) => q.recv().map(|t| Some(t.sent_at)),
            _ => Ok(None),
        }
    }

    /// Wakes any blocked consumer with `Error::Closed`.
    pub fn close(&self) {
        match self {
            SyncPrimitive::EventFlag(f) => f.close(),
            SyncPrimitive::MessageQueue(q) => {
                q.close();
                log::debug!(target: "rtbench::bench", "message queue closed, {} tokens pending", q.len());
            }
            _ => {}
        }
    }
}
