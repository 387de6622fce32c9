//! Spike detection: short-term rate against a day-old baseline.

use guardrail_core::SpikeSettings;

use crate::stats::mean;
use crate::window::TenantWindow;

/// Outcome of spike detection for one window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpikeVerdict {
    /// `None` when there is no usable baseline.
    pub ratio: Option<f64>,
    pub detected: bool,
    /// Capped multiplier while detected, 1.0 otherwise.
    pub multiplier: f64,
}

impl SpikeVerdict {
    pub const UNDETERMINED: SpikeVerdict = SpikeVerdict {
        ratio: None,
        detected: false,
        multiplier: 1.0,
    };

    /// Classify a known ratio.
    pub fn from_ratio(ratio: f64, threshold: f64, max_multiplier: f64) -> Self {
        if !ratio.is_finite() {
            return Self::UNDETERMINED;
        }
        let detected = ratio > threshold;
        Self {
            ratio: Some(ratio),
            detected,
            multiplier: if detected { ratio.min(max_multiplier) } else { 1.0 },
        }
    }
}

/// Compare the mean over the last rate window with the mean over
/// `[now − 2·offset, now − offset]`.
///
/// A missing or zero baseline makes the spike undeterminable.
pub fn detect(window: &TenantWindow, now: u64, settings: &SpikeSettings) -> SpikeVerdict {
    let rate_window = settings.rate_window.as_secs();
    let offset = settings.baseline_offset.as_secs();

    let Some(rate) = mean(window.values_between(now.saturating_sub(rate_window), now)) else {
        return SpikeVerdict::UNDETERMINED;
    };
    if now < offset {
        return SpikeVerdict::UNDETERMINED;
    }
    let baseline = mean(window.values_between(now.saturating_sub(offset.saturating_mul(2)), now - offset));
    match baseline {
        Some(b) if b > 0.0 => {
            SpikeVerdict::from_ratio(rate / b, settings.threshold, settings.max_multiplier)
        }
        _ => SpikeVerdict::UNDETERMINED,
    }
}
