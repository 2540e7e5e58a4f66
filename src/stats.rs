use crate::clock::Nanos;
use crate::recorder::TickSample;

/// Distribution of one metric column.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Summary {
    pub count: usize,
    pub min: Nanos,
    pub max: Nanos,
    pub mean: f64,
    /// Population standard deviation.
    pub stddev: f64,
}

/// Per-column summaries of a task's samples.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSummary {
    pub period: Option<Summary>,
    pub completion: Option<Summary>,
    pub jitter: Option<Summary>,
    pub latency: Option<Summary>,
}

/// Summarizes the values `pick` extracts; `None` when there are none.
pub fn column<F>(samples: &[TickSample], pick: F) -> Option<Summary>
where
    F: Fn(&TickSample) -> Option<Nanos>,
{
    let mut count = 0usize;
    let mut min = Nanos::MAX;
    let mut max = 0;
    let mut sum = 0.0;
    for v in samples.iter().filter_map(&pick) {
        count += 1;
        min = min.min(v);
        max = max.max(v);
        sum += v as f64;
    }
    if count == 0 {
        return None;
    }

    let mean = sum / count as f64;
    let var = samples
        .iter()
        .filter_map(&pick)
        .map(|v| {
            let d = v as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / count as f64;

    Some(Summary {
        count,
        min,
        max,
        mean,
        stddev: var.sqrt(),
    })
}

pub fn summarize(samples: &[TickSample]) -> TaskSummary {
    TaskSummary {
        period: column(samples, |s| Some(s.period)),
        completion: column(samples, |s| Some(s.completion)),
        jitter: column(samples, |s| Some(s.jitter)),
        latency: column(samples, |s| s.latency),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(period: Nanos, jitter: Nanos) -> TickSample {
        TickSample {
            period,
            completion: 10,
            jitter,
            latency: None,
        }
    }

    #[test]
    fn test_empty_has_no_summary() {
        let s = summarize(&[]);
        assert!(s.period.is_none());
        assert!(s.latency.is_none());
    }

    #[test]
    fn test_column_stats() {
        let samples: Vec<_> = [2, 4, 4, 4, 5, 5, 7, 9]
            .iter()
            .map(|&p| sample(p, p.saturating_sub(2)))
            .collect();
        let period = column(&samples, |s| Some(s.period)).unwrap();
        assert_eq!(period.count, 8);
        assert_eq!(period.min, 2);
        assert_eq!(period.max, 9);
        assert!((period.mean - 5.0).abs() < 1e-9);
        assert!((period.stddev - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_latency_only_counts_present_values() {
        let mut samples = vec![sample(1, 0); 3];
        samples[1].latency = Some(40);
        samples[2].latency = Some(60);
        let s = summarize(&samples);
        let latency = s.latency.unwrap();
        assert_eq!(latency.count, 2);
        assert!((latency.mean - 50.0).abs() < 1e-9);
        assert_eq!(s.completion.unwrap().stddev, 0.0);
    }
}
