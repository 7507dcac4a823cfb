//! Progress throttling for transfer jobs.

use std::time::{Duration, Instant};

use uuid::Uuid;

/// Minimum percent step between two samples.
pub const DEFAULT_STEP_PERCENT: u8 = 10;
/// Minimum time between two samples.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(3);

/// One emitted progress point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSample {
    pub job: Uuid,
    pub percent: u8,
    pub bytes_so_far: u64,
    pub total_bytes: u64,
}

/// Decides which byte counts are worth reporting. A sample is emitted only when
/// the integer percent changed and at least one of: the step was reached, the
/// interval elapsed, or the transfer is complete.
#[derive(Debug, Clone)]
pub struct ProgressThrottle {
    job: Uuid,
    step: u8,
    interval: Duration,
    last_percent: Option<u8>,
    last_at: Option<Instant>,
}

impl ProgressThrottle {
    pub fn new(job: Uuid) -> Self {
        Self::with_limits(job, DEFAULT_STEP_PERCENT, DEFAULT_INTERVAL)
    }

    pub fn with_limits(job: Uuid, step: u8, interval: Duration) -> Self {
        Self {
            job,
            step: step.max(1),
            interval,
            last_percent: None,
            last_at: None,
        }
    }

    pub fn observe(&mut self, done: u64, total: u64, now: Instant) -> Option<ProgressSample> {
        let percent = percent_of(done, total);
        let complete = total > 0 && done >= total;
        let due = match (self.last_percent, self.last_at) {
            (Some(last), Some(at)) => {
                if percent == last {
                    return None;
                }
                complete
                    || percent.saturating_sub(last) >= self.step
                    || now.duration_since(at) >= self.interval
            }
            // First observation: report once something moved.
            _ => percent > 0 || complete,
        };
        if !due {
            return None;
        }
        self.last_percent = Some(percent);
        self.last_at = Some(now);
        Some(ProgressSample {
            job: self.job,
            percent,
            bytes_so_far: done,
            total_bytes: total,
        })
    }

    /// Final 100% sample, emitted unless one was already reported.
    pub fn finish(&mut self, done: u64, total: u64, now: Instant) -> Option<ProgressSample> {
        if self.last_percent == Some(100) {
            return None;
        }
        self.last_percent = Some(100);
        self.last_at = Some(now);
        Some(ProgressSample {
            job: self.job,
            percent: 100,
            bytes_so_far: done,
            total_bytes: total.max(done),
        })
    }
}

/// Integer percent, clamped to 100. Zero total counts as 0%.
pub fn percent_of(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let p = (done.min(total) as u128 * 100) / total as u128;
    p as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_math() {
        assert_eq!(percent_of(0, 100), 0);
        assert_eq!(percent_of(999, 1000), 99);
        assert_eq!(percent_of(1000, 1000), 100);
        assert_eq!(percent_of(2000, 1000), 100);
        assert_eq!(percent_of(5, 0), 0);
    }

    #[test]
    fn emits_on_ten_point_steps() {
        let t0 = Instant::now();
        let mut th = ProgressThrottle::new(Uuid::new_v4());
        let percents: Vec<u8> = (1..=100u64)
            .filter_map(|i| th.observe(i * 10, 1000, t0))
            .map(|s| s.percent)
            .collect();
        assert_eq!(percents, vec![1, 11, 21, 31, 41, 51, 61, 71, 81, 91, 100]);
    }

    #[test]
    fn emits_after_interval_on_small_change() {
        let t0 = Instant::now();
        let mut th = ProgressThrottle::new(Uuid::new_v4());
        assert!(th.observe(10, 100, t0).is_some());
        assert!(th.observe(12, 100, t0 + Duration::from_secs(1)).is_none());
        let s = th.observe(13, 100, t0 + Duration::from_secs(4)).unwrap();
        assert_eq!(s.percent, 13);
    }

    #[test]
    fn unchanged_percent_never_emits() {
        let t0 = Instant::now();
        let mut th = ProgressThrottle::new(Uuid::new_v4());
        assert!(th.observe(50, 100, t0).is_some());
        assert!(th.observe(50, 100, t0 + Duration::from_secs(60)).is_none());
    }

    #[test]
    fn finish_forces_final_sample_once() {
        let t0 = Instant::now();
        let mut th = ProgressThrottle::new(Uuid::new_v4());
        th.observe(5, 100, t0);
        let s = th.finish(100, 100, t0).unwrap();
        assert_eq!(s.percent, 100);
        assert!(th.finish(100, 100, t0).is_none());
    }
}
