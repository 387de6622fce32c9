//! Trend Analyzer — owns the rolling windows and produces analysis results.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use guardrail_core::{AnalysisResult, AnalysisSettings, MetricSample, SpikeSettings, TenantId};

use crate::spike;
use crate::stats::{max, mean, percentile};
use crate::window::TenantWindow;

/// Compute statistics for one window at `now`.
///
/// Pure: only samples with `now − W <= timestamp <= now` are considered and
/// the window itself is not modified. Fewer than two samples yield a
/// zero-confidence result.
pub fn analyze_window(
    tenant: &str,
    metric: &str,
    window: &TenantWindow,
    now: u64,
    analysis: &AnalysisSettings,
    spike_settings: &SpikeSettings,
) -> AnalysisResult {
    let span = analysis.window.as_secs();
    let start = now.saturating_sub(span);
    let values: Vec<f64> = window.values_between(start, now).collect();
    let current_value = window.latest().map(|(_, v)| v).unwrap_or_default();

    if values.len() < 2 {
        return AnalysisResult {
            tenant: tenant.to_string(),
            metric: metric.to_string(),
            current_value,
            percentile: 0.0,
            moving_average: 0.0,
            peak: 0.0,
            trend_slope: 0.0,
            spike_detected: false,
            spike_multiplier: 1.0,
            spike_ratio: None,
            sample_count: values.len(),
            confidence: 0.0,
        };
    }

    let m = analysis.moving_average_window.as_secs();
    let recent = mean(window.values_between(now.saturating_sub(m) + 1, now));
    let older = if now >= m {
        mean(window.values_between(now.saturating_sub(m.saturating_mul(2)) + 1, now - m))
    } else {
        None
    };
    let trend_slope = match (recent, older) {
        (Some(r), Some(o)) if o > 0.0 => (r - o) / o,
        _ => 0.0,
    };

    let verdict = spike::detect(window, now, spike_settings);

    let first = window
        .iter()
        .find(|&(ts, _)| ts >= start)
        .map(|(ts, _)| ts)
        .unwrap_or(now);
    let last = window.latest().map(|(ts, _)| ts.min(now)).unwrap_or(now);
    let confidence = if span == 0 {
        0.0
    } else {
        (last.saturating_sub(first) as f64 / span as f64).clamp(0.0, 1.0)
    };

    AnalysisResult {
        tenant: tenant.to_string(),
        metric: metric.to_string(),
        current_value,
        percentile: percentile(&values, analysis.percentile).unwrap_or_default(),
        moving_average: recent.unwrap_or_default(),
        peak: max(values.iter().copied()).unwrap_or_default(),
        trend_slope,
        spike_detected: verdict.detected,
        spike_multiplier: verdict.multiplier,
        spike_ratio: verdict.ratio,
        sample_count: values.len(),
        confidence,
    }
}

/// All metric windows of one tenant.
#[derive(Debug, Clone, Default)]
pub struct TenantSeries {
    windows: HashMap<String, TenantWindow>,
}

impl TenantSeries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add samples for one metric.
    pub fn ingest(&mut self, metric: &str, samples: impl IntoIterator<Item = (u64, f64)>) -> usize {
        let window = self.windows.entry(metric.to_string()).or_default();
        samples
            .into_iter()
            .filter(|&(ts, v)| window.push(ts, v))
            .count()
    }

    /// Evict samples older than `now − W` from every window and drop empty
    /// windows.
    pub fn evict(&mut self, now: u64, analysis: &AnalysisSettings) -> usize {
        let cutoff = now.saturating_sub(analysis.window.as_secs());
        let evicted = self
            .windows
            .values_mut()
            .map(|w| w.evict_before(cutoff))
            .sum();
        self.windows.retain(|_, w| !w.is_empty());
        evicted
    }

    pub fn window(&self, metric: &str) -> Option<&TenantWindow> {
        self.windows.get(metric)
    }

    pub fn metrics(&self) -> impl Iterator<Item = &str> {
        self.windows.keys().map(String::as_str)
    }

    /// Analyze every metric, sorted by metric name.
    pub fn analyze(
        &self,
        tenant: &str,
        now: u64,
        analysis: &AnalysisSettings,
        spike_settings: &SpikeSettings,
    ) -> BTreeMap<String, AnalysisResult> {
        self.windows
            .iter()
            .map(|(metric, w)| {
                (
                    metric.clone(),
                    analyze_window(tenant, metric, w, now, analysis, spike_settings),
                )
            })
            .collect()
    }
}

/// Rolling windows for every tenant.
///
/// Each tenant sits behind its own mutex so tenants can be analyzed in
/// parallel while the outer map is only write-locked to add or forget
/// tenants.
#[derive(Debug, Default)]
pub struct TrendAnalyzer {
    tenants: RwLock<HashMap<TenantId, Arc<Mutex<TenantSeries>>>>,
}

impl TrendAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Series for `tenant`, created on first use.
    pub async fn series(&self, tenant: &str) -> Arc<Mutex<TenantSeries>> {
        if let Some(s) = self.tenants.read().await.get(tenant) {
            return s.clone();
        }
        let mut tenants = self.tenants.write().await;
        tenants
            .entry(tenant.to_string())
            .or_insert_with(|| {
                debug!(%tenant, "tracking new tenant");
                Arc::new(Mutex::new(TenantSeries::new()))
            })
            .clone()
    }

    /// Forget tenants that are no longer listed. Returns how many were
    /// dropped.
    pub async fn retain_tenants(&self, listed: &[TenantId]) -> usize {
        let keep: HashSet<&str> = listed.iter().map(String::as_str).collect();
        let mut tenants = self.tenants.write().await;
        let before = tenants.len();
        tenants.retain(|t, _| {
            let kept = keep.contains(t.as_str());
            if !kept {
                debug!(tenant = %t, "forgetting tenant windows");
            }
            kept
        });
        before - tenants.len()
    }

    /// Add raw samples, routing each to its tenant and metric.
    pub async fn ingest(&self, samples: Vec<MetricSample>) -> usize {
        let mut grouped: HashMap<TenantId, Vec<MetricSample>> = HashMap::new();
        for s in samples {
            grouped.entry(s.tenant.clone()).or_default().push(s);
        }
        let mut accepted = 0;
        for (tenant, samples) in grouped {
            let series = self.series(&tenant).await;
            let mut series = series.lock().await;
            for s in samples {
                accepted += series.ingest(&s.metric, [(s.timestamp, s.value)]);
            }
        }
        accepted
    }

    /// Evict and analyze one tenant. Unknown tenants yield nothing.
    pub async fn analyze(
        &self,
        tenant: &str,
        now: u64,
        analysis: &AnalysisSettings,
        spike_settings: &SpikeSettings,
    ) -> BTreeMap<String, AnalysisResult> {
        let Some(series) = self.tenants.read().await.get(tenant).cloned() else {
            return BTreeMap::new();
        };
        let mut series = series.lock().await;
        series.evict(now, analysis);
        series.analyze(tenant, now, analysis, spike_settings)
    }

    pub async fn tenants(&self) -> Vec<TenantId> {
        let mut out: Vec<TenantId> = self.tenants.read().await.keys().cloned().collect();
        out.sort();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const HOUR: u64 = 3600;
    const DAY: u64 = 86_400;

    fn settings() -> (AnalysisSettings, SpikeSettings) {
        (AnalysisSettings::default(), SpikeSettings::default())
    }

    fn sample(tenant: &str, metric: &str, timestamp: u64, value: f64) -> MetricSample {
        MetricSample {
            tenant: tenant.into(),
            metric: metric.into(),
            timestamp,
            value,
        }
    }

    #[test]
    fn fewer_than_two_samples_has_zero_confidence() {
        let (a, s) = settings();
        let mut w = TenantWindow::new();
        w.push(100, 5.0);
        let r = analyze_window("t", "m", &w, 100, &a, &s);
        assert_eq!(r.confidence, 0.0);
        assert_eq!(r.sample_count, 1);
        assert!(!r.is_actionable());
        assert_eq!(r.current_value, 5.0);
    }

    #[test]
    fn statistics_over_full_window() {
        let (a, s) = settings();
        let now = 10 * DAY;
        let mut w = TenantWindow::new();
        // Hourly samples across 48h: older 24h at 100, recent 24h at 200.
        for h in 0..=48 {
            let ts = now - 48 * HOUR + h * HOUR;
            let v = if h <= 24 { 100.0 } else { 200.0 };
            w.push(ts, v);
        }
        let r = analyze_window("t", "m", &w, now, &a, &s);
        assert_eq!(r.peak, 200.0);
        assert_eq!(r.current_value, 200.0);
        assert_eq!(r.moving_average, 200.0);
        assert_eq!(r.percentile, 200.0);
        assert!((r.confidence - 1.0).abs() < 1e-9);
        // Last 12h (200) vs the 12h before (200) → flat.
        assert_eq!(r.trend_slope, 0.0);
        // Rate 200 over a 100 baseline.
        assert_eq!(r.spike_ratio, Some(2.0));
        assert!(!r.spike_detected);
    }

    #[test]
    fn trend_slope_compares_sub_windows() {
        let (a, s) = settings();
        let now = 5 * DAY;
        let mut w = TenantWindow::new();
        for h in 1..=12 {
            w.push(now - 24 * HOUR + h * HOUR, 100.0);
        }
        for h in 1..=12 {
            w.push(now - 12 * HOUR + h * HOUR, 150.0);
        }
        let r = analyze_window("t", "m", &w, now, &a, &s);
        assert!((r.trend_slope - 0.5).abs() < 1e-9);
    }

    #[test]
    fn samples_outside_window_are_ignored() {
        let (mut a, s) = settings();
        a.window = Duration::from_secs(DAY);
        a.moving_average_window = Duration::from_secs(HOUR);
        let now = 10 * DAY;
        let mut w = TenantWindow::new();
        w.push(now - 3 * DAY, 10_000.0);
        w.push(now - 60, 10.0);
        w.push(now, 20.0);
        let r = analyze_window("t", "m", &w, now, &a, &s);
        assert_eq!(r.peak, 20.0);
        assert_eq!(r.sample_count, 2);
    }

    #[tokio::test]
    async fn ingest_and_analyze_per_tenant() {
        let (a, s) = settings();
        let analyzer = TrendAnalyzer::new();
        let now = 3 * DAY;
        let accepted = analyzer
            .ingest(vec![
                sample("acme", "ingestion_rate", now - 120, 10.0),
                sample("acme", "ingestion_rate", now, 30.0),
                sample("acme", "series", now, 5.0),
                sample("beta", "ingestion_rate", now, f64::NAN),
            ])
            .await;
        assert_eq!(accepted, 3);

        let results = analyzer.analyze("acme", now, &a, &s).await;
        assert_eq!(results.len(), 2);
        assert!(results["ingestion_rate"].is_actionable());
        assert!(!results["series"].is_actionable());
        assert!(analyzer.analyze("nobody", now, &a, &s).await.is_empty());
    }

    #[tokio::test]
    async fn analyze_evicts_old_samples() {
        let (a, s) = settings();
        let analyzer = TrendAnalyzer::new();
        analyzer
            .ingest(vec![
                sample("acme", "m", 0, 1.0),
                sample("acme", "m", 10, 1.0),
            ])
            .await;
        let results = analyzer.analyze("acme", 10 * DAY, &a, &s).await;
        assert!(results.is_empty());
        let series = analyzer.series("acme").await;
        assert!(series.lock().await.window("m").is_none());
    }

    #[tokio::test]
    async fn retain_forgets_unlisted_tenants() {
        let analyzer = TrendAnalyzer::new();
        analyzer
            .ingest(vec![sample("a", "m", 1, 1.0), sample("b", "m", 1, 1.0)])
            .await;
        assert_eq!(analyzer.retain_tenants(&["a".to_string()]).await, 1);
        assert_eq!(analyzer.tenants().await, vec!["a".to_string()]);
    }
}
