//! Time-ordered sample window for one (tenant, metric).

use std::collections::VecDeque;

/// Samples ordered by timestamp, oldest first.
#[derive(Debug, Clone, Default)]
pub struct TenantWindow {
    samples: VecDeque<(u64, f64)>,
}

impl TenantWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a sample in timestamp order. Non-finite values are dropped and
    /// `false` is returned.
    pub fn push(&mut self, timestamp: u64, value: f64) -> bool {
        if !value.is_finite() {
            return false;
        }
        match self.samples.back() {
            Some(&(last, _)) if last > timestamp => {
                let idx = self.samples.partition_point(|&(ts, _)| ts <= timestamp);
                self.samples.insert(idx, (timestamp, value));
            }
            _ => self.samples.push_back((timestamp, value)),
        }
        true
    }

    /// Drop every sample older than `cutoff`. Returns how many were evicted.
    pub fn evict_before(&mut self, cutoff: u64) -> usize {
        let mut evicted = 0;
        while let Some(&(ts, _)) = self.samples.front() {
            if ts >= cutoff {
                break;
            }
            self.samples.pop_front();
            evicted += 1;
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Most recent sample.
    pub fn latest(&self) -> Option<(u64, f64)> {
        self.samples.back().copied()
    }

    /// Oldest sample.
    pub fn oldest(&self) -> Option<(u64, f64)> {
        self.samples.front().copied()
    }

    /// All samples, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = (u64, f64)> + '_ {
        self.samples.iter().copied()
    }

    /// Values with `from <= timestamp <= to`.
    pub fn values_between(&self, from: u64, to: u64) -> impl Iterator<Item = f64> + '_ {
        let start = self.samples.partition_point(|&(ts, _)| ts < from);
        self.samples
            .range(start..)
            .take_while(move |&&(ts, _)| ts <= to)
            .map(|&(_, v)| v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_order_samples_are_sorted() {
        let mut w = TenantWindow::new();
        w.push(10, 1.0);
        w.push(30, 3.0);
        w.push(20, 2.0);
        w.push(5, 0.5);
        let ts: Vec<u64> = w.iter().map(|(ts, _)| ts).collect();
        assert_eq!(ts, vec![5, 10, 20, 30]);
        assert_eq!(w.latest(), Some((30, 3.0)));
    }

    #[test]
    fn non_finite_values_rejected() {
        let mut w = TenantWindow::new();
        assert!(!w.push(1, f64::NAN));
        assert!(!w.push(1, f64::INFINITY));
        assert!(w.is_empty());
    }

    #[test]
    fn evicts_oldest_first() {
        let mut w = TenantWindow::new();
        for ts in [100, 200, 300, 400] {
            w.push(ts, ts as f64);
        }
        assert_eq!(w.evict_before(250), 2);
        assert_eq!(w.oldest(), Some((300, 300.0)));
        assert_eq!(w.evict_before(0), 0);
    }

    #[test]
    fn values_between_is_inclusive() {
        let mut w = TenantWindow::new();
        for ts in [10, 20, 30, 40, 50] {
            w.push(ts, ts as f64);
        }
        let v: Vec<f64> = w.values_between(20, 40).collect();
        assert_eq!(v, vec![20.0, 30.0, 40.0]);
        assert_eq!(w.values_between(60, 90).count(), 0);
    }
}
