use crate::clock::Nanos;

/// Ticks discarded at the start of every task.
pub const WARMUP_TICKS: u64 = 2;

/// One hour of samples at a 1 ms period.
pub const MAX_SAMPLES: usize = 3_600_000;

/// Oscilloscope edges kept for the high- and low-priority task.
pub const HIGH_EDGE_LIMIT: usize = 16;
pub const LOW_EDGE_LIMIT: usize = 3;

/// Timing of one completed period.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSample {
    /// Interval between this period start and the previous one.
    pub period: Nanos,
    /// Period start to end of work.
    pub completion: Nanos,
    /// `|period - nominal|`
    pub jitter: Nanos,
    /// Producer signal to consumer wake, for signal-driven tasks.
    pub latency: Option<Nanos>,
}

impl TickSample {
    pub fn measure(prev_start: Nanos, start: Nanos, done: Nanos, nominal: Nanos) -> Self {
        let period = start.saturating_sub(prev_start);
        Self {
            period,
            completion: done.saturating_sub(start),
            jitter: period.abs_diff(nominal),
            latency: None,
        }
    }

    pub fn with_latency(mut self, latency: Nanos) -> Self {
        self.latency = Some(latency);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recorded {
    /// Tick fell in the warm-up window and was dropped.
    WarmUp,
    /// Stored; carries the new sample count.
    Stored(usize),
    /// Buffer already at capacity; nothing was written.
    Full,
}

/// Pre-allocated arena of tick samples indexed by tick count. Written only
/// from inside its task.
pub struct SampleBuffer {
    samples: Vec<TickSample>,
    capacity: usize,
}

impl SampleBuffer {
    /// Allocates room for `capacity` samples, bounded by `MAX_SAMPLES`.
    /// Pages are touched up front so recording never page-faults.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.min(MAX_SAMPLES);
        let mut samples = Vec::with_capacity(capacity);
        samples.resize(capacity, TickSample::default());
        samples.clear();
        Self { samples, capacity }
    }

    /// Appends the sample of tick `tick`. Never allocates and never blocks.
    pub fn record(&mut self, tick: u64, sample: TickSample) -> Recorded {
        if tick < WARMUP_TICKS {
            return Recorded::WarmUp;
        }
        if self.samples.len() >= self.capacity {
            return Recorded::Full;
        }
        self.samples.push(sample);
        Recorded::Stored(self.samples.len())
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.samples.len() >= self.capacity
    }

    pub fn samples(&self) -> &[TickSample] {
        &self.samples
    }
}

/// Start and end of one active window, relative to process start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeSample {
    pub start: Nanos,
    pub end: Nanos,
}

/// Edge timestamps of the first `limit` ticks, for oscilloscope output.
pub struct EdgeBuffer {
    edges: Vec<EdgeSample>,
    limit: usize,
    origin: Nanos,
}

impl EdgeBuffer {
    pub fn new(limit: usize, origin: Nanos) -> Self {
        Self {
            edges: Vec::with_capacity(limit),
            limit,
            origin,
        }
    }

    /// A buffer that records nothing.
    pub fn disabled() -> Self {
        Self::new(0, 0)
    }

    pub fn record_edge(&mut self, tick: u64, start: Nanos, end: Nanos) -> bool {
        if tick >= self.limit as u64 || self.edges.len() >= self.limit {
            return false;
        }
        self.edges.push(EdgeSample {
            start: start.saturating_sub(self.origin),
            end: end.saturating_sub(self.origin),
        });
        true
    }

    pub fn edges(&self) -> &[EdgeSample] {
        &self.edges
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::NSEC_PER_MSEC;

    fn sample(period: Nanos) -> TickSample {
        TickSample::measure(0, period, period + 10, NSEC_PER_MSEC)
    }

    #[test]
    fn test_measure_jitter_is_absolute_deviation() {
        let start = 1_000 + NSEC_PER_MSEC + 250;
        let late = TickSample::measure(1_000, start, start + 650, NSEC_PER_MSEC);
        assert_eq!(late.period, NSEC_PER_MSEC + 250);
        assert_eq!(late.completion, 650);
        assert_eq!(late.jitter, 250);

        let early = TickSample::measure(0, NSEC_PER_MSEC - 40, NSEC_PER_MSEC, NSEC_PER_MSEC);
        assert_eq!(early.jitter, 40);
        assert_eq!(early.latency, None);
        assert_eq!(early.with_latency(5).latency, Some(5));
    }

    #[test]
    fn test_warmup_ticks_discarded() {
        let mut buf = SampleBuffer::with_capacity(10);
        assert_eq!(buf.record(0, sample(1)), Recorded::WarmUp);
        assert_eq!(buf.record(1, sample(2)), Recorded::WarmUp);
        assert_eq!(buf.record(2, sample(3)), Recorded::Stored(1));
        assert_eq!(buf.samples()[0].period, 3);
        // Re-submitting a warm-up index never stores it.
        assert_eq!(buf.record(1, sample(4)), Recorded::WarmUp);
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn test_full_buffer_never_overwrites() {
        let mut buf = SampleBuffer::with_capacity(3);
        for tick in 2..5 {
            assert!(matches!(buf.record(tick, sample(tick)), Recorded::Stored(_)));
        }
        assert!(buf.is_full());
        assert_eq!(buf.record(5, sample(99)), Recorded::Full);
        let periods: Vec<_> = buf.samples().iter().map(|s| s.period).collect();
        assert_eq!(periods, vec![2, 3, 4]);
    }

    #[test]
    fn test_capacity_bounded_by_max() {
        let buf = SampleBuffer::with_capacity(MAX_SAMPLES + 1);
        assert_eq!(buf.capacity(), MAX_SAMPLES);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_edges_limited_to_first_ticks() {
        let mut edges = EdgeBuffer::new(LOW_EDGE_LIMIT, 1_000);
        for tick in 0..10u64 {
            edges.record_edge(tick, 1_000 + tick * 100, 1_050 + tick * 100);
        }
        assert_eq!(edges.edges().len(), LOW_EDGE_LIMIT);
        assert_eq!(edges.edges()[0], EdgeSample { start: 0, end: 50 });
        assert_eq!(edges.edges()[2], EdgeSample { start: 200, end: 250 });

        let mut off = EdgeBuffer::disabled();
        assert!(!off.record_edge(0, 1, 2));
    }
}
