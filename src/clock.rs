/// Nanoseconds on the monotonic clock, or a nanosecond interval.
pub type Nanos = u64;

pub const NSEC_PER_USEC: Nanos = 1_000;
pub const NSEC_PER_MSEC: Nanos = 1_000_000;
pub const NSEC_PER_SEC: Nanos = 1_000_000_000;

/// Clock every timer is armed on. Reads through `read_clock` use the same
/// domain so period timestamps and spins are comparable.
pub const CLOCK_ID: libc::clockid_t = libc::CLOCK_MONOTONIC;

/// Current monotonic time in nanoseconds.
pub fn read_clock() -> Nanos {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid, writable timespec; CLOCK_MONOTONIC always exists on Linux.
    unsafe {
        libc::clock_gettime(CLOCK_ID, &mut ts);
    }
    from_timespec(&ts)
}

/// Busy-waits for `duration` without yielding the CPU.
pub fn spin(duration: Nanos) {
    let end = read_clock() + duration;
    while read_clock() < end {
        std::hint::spin_loop();
    }
}

pub fn to_timespec(ns: Nanos) -> libc::timespec {
    libc::timespec {
        tv_sec: (ns / NSEC_PER_SEC) as libc::time_t,
        tv_nsec: (ns % NSEC_PER_SEC) as libc::c_long,
    }
}

pub fn from_timespec(ts: &libc::timespec) -> Nanos {
    (ts.tv_sec as u64)
        .wrapping_mul(NSEC_PER_SEC)
        .wrapping_add(ts.tv_nsec as u64)
}

/// Number of periods that fit in one second, at least one.
pub fn ticks_per_sec(period: Nanos) -> u64 {
    if period == 0 {
        return 0;
    }
    (NSEC_PER_SEC / period).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_is_monotonic() {
        let a = read_clock();
        let b = read_clock();
        assert!(b >= a);
    }

    #[test]
    fn test_spin_waits_at_least_duration() {
        let start = read_clock();
        spin(2 * NSEC_PER_MSEC);
        assert!(read_clock() - start >= 2 * NSEC_PER_MSEC);
    }

    #[test]
    fn test_timespec_conversion() {
        let ns = 3 * NSEC_PER_SEC + 250;
        let ts = to_timespec(ns);
        assert_eq!(ts.tv_sec, 3);
        assert_eq!(ts.tv_nsec, 250);
        assert_eq!(from_timespec(&ts), ns);
    }

    #[test]
    fn test_ticks_per_sec() {
        assert_eq!(ticks_per_sec(NSEC_PER_MSEC), 1000);
        assert_eq!(ticks_per_sec(5 * NSEC_PER_MSEC), 200);
        assert_eq!(ticks_per_sec(2 * NSEC_PER_SEC), 1);
        assert_eq!(ticks_per_sec(0), 0);
    }
}
