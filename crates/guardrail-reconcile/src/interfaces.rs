//! Interfaces to the systems the controller does not own.
//!
//! Scraping, limit patching, and resource monitoring live outside the
//! controller. Each is reached through one of these traits; every call is
//! wrapped in a timeout by the caller.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;

use guardrail_core::{LimitValue, MetricSample, ResourcePressure, Scope, TenantId, TrafficObservation};

/// Boxed future returned by collaborator calls.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send + 'a>>;

/// One collection round. Partial data is normal: tenants whose collection
/// failed are listed in `failures` and skipped for this cycle.
#[derive(Debug, Clone, Default)]
pub struct CollectedMetrics {
    pub samples: Vec<MetricSample>,
    /// tenant → reason.
    pub failures: HashMap<TenantId, String>,
}

/// Supplies tenants and their metric samples.
pub trait Collector: Send + Sync {
    fn tenant_list(&self) -> BoxFuture<'_, Vec<TenantId>>;

    fn collect_metrics(&self) -> BoxFuture<'_, CollectedMetrics>;
}

/// Pushes effective limits to the metrics backend. Only called in enforce
/// mode.
pub trait Patcher: Send + Sync {
    fn apply_limits<'a>(
        &'a self,
        tenant: &'a str,
        limits: BTreeMap<String, LimitValue>,
    ) -> BoxFuture<'a, ()>;
}

/// Reads aggregate resource usage of the shared backend.
pub trait PressureSource: Send + Sync {
    fn sample(&self) -> BoxFuture<'_, ResourcePressure>;
}

/// Reads live traffic per protected scope.
pub trait TrafficSource: Send + Sync {
    fn observe(&self) -> BoxFuture<'_, HashMap<Scope, TrafficObservation>>;
}
