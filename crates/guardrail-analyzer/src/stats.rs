//! Small statistics helpers shared by the analyzer and the breaker.

/// Percentile by sorted-rank linear interpolation: `rank = p/100 × (n − 1)`.
///
/// `p` is clamped to [0, 100]. Returns `None` for an empty slice.
pub fn percentile(values: &[f64], p: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable_by(f64::total_cmp);

    let rank = p.clamp(0.0, 100.0) / 100.0 * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

/// Arithmetic mean, `None` when there is nothing to average.
pub fn mean(values: impl IntoIterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values
        .into_iter()
        .fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    (count > 0).then(|| sum / count as f64)
}

/// Largest value, `None` when empty.
pub fn max(values: impl IntoIterator<Item = f64>) -> Option<f64> {
    values.into_iter().reduce(f64::max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentile_interpolates() {
        let v = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(percentile(&v, 50.0), Some(3.0));
        assert_eq!(percentile(&v, 100.0), Some(5.0));
        assert_eq!(percentile(&v, 0.0), Some(1.0));
        // rank = 0.95 * 4 = 3.8 → 4 + 0.8 * 1
        let p95 = percentile(&v, 95.0).unwrap();
        assert!((p95 - 4.8).abs() < 1e-9);
    }

    #[test]
    fn percentile_ignores_input_order() {
        assert_eq!(percentile(&[5.0, 1.0, 3.0], 50.0), Some(3.0));
        assert_eq!(percentile(&[7.0], 95.0), Some(7.0));
        assert_eq!(percentile(&[], 95.0), None);
    }

    #[test]
    fn mean_and_max() {
        assert_eq!(mean([2.0, 4.0]), Some(3.0));
        assert_eq!(mean(std::iter::empty()), None);
        assert_eq!(max([1.0, 9.0, 3.0]), Some(9.0));
        assert_eq!(max(std::iter::empty()), None);
    }
}
