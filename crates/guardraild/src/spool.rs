//! File-spool collaborators.
//!
//! Stands in for the scraping, patching, and monitoring systems the
//! controller talks to in production. Layout under the spool directory:
//!
//! ```text
//! tenants.json            ["acme", "beta"]          (optional)
//! samples/<tenant>.json   [MetricSample, ...]       (consumed on read)
//! pressure.json           ResourcePressure
//! traffic.json            {"global": {...}, "acme": {"ingestion": 1200}}
//! applied/<tenant>.json   written by the patcher
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use serde::Deserialize;
use tracing::{debug, warn};

use guardrail_core::{
    LimitValue, MetricSample, ResourcePressure, Scope, TenantId, TrafficObservation,
};
use guardrail_reconcile::{
    BoxFuture, CollectedMetrics, Collector, Patcher, PressureSource, TrafficSource,
};

/// One scope's traffic as written in `traffic.json`. Missing metrics are
/// zero.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawTraffic {
    ingestion: f64,
    query: f64,
    series: f64,
    burst: f64,
}

impl From<RawTraffic> for TrafficObservation {
    fn from(raw: RawTraffic) -> Self {
        TrafficObservation {
            ingestion: raw.ingestion,
            query: raw.query,
            series: raw.series,
            burst: raw.burst,
        }
    }
}

/// All four collaborators backed by one directory.
#[derive(Debug, Clone)]
pub struct FileSpool {
    dir: PathBuf,
}

impl FileSpool {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn samples_dir(&self) -> PathBuf {
        self.dir.join("samples")
    }

    fn applied_dir(&self) -> PathBuf {
        self.dir.join("applied")
    }

    /// Tenants with a pending sample file.
    async fn spooled_tenants(&self) -> anyhow::Result<BTreeSet<TenantId>> {
        let mut out = BTreeSet::new();
        let mut entries = match tokio::fs::read_dir(self.samples_dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e).context("reading samples directory"),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json")
                && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
            {
                out.insert(stem.to_string());
            }
        }
        Ok(out)
    }

    async fn read_tenants(&self) -> anyhow::Result<Vec<TenantId>> {
        let path = self.dir.join("tenants.json");
        match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("parsing {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(self.spooled_tenants().await?.into_iter().collect())
            }
            Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
        }
    }

    /// Read and remove every sample file. A file that cannot be read or
    /// parsed becomes a failure for its tenant.
    async fn drain_samples(&self) -> anyhow::Result<CollectedMetrics> {
        let mut collected = CollectedMetrics::default();
        for tenant in self.spooled_tenants().await? {
            let path = self.samples_dir().join(format!("{tenant}.json"));
            match read_samples(&path, &tenant).await {
                Ok(samples) => {
                    debug!(%tenant, count = samples.len(), "samples read from spool");
                    collected.samples.extend(samples);
                    if let Err(e) = tokio::fs::remove_file(&path).await {
                        warn!(path = %path.display(), error = %e, "failed to remove consumed sample file");
                    }
                }
                Err(e) => {
                    collected.failures.insert(tenant, format!("{e:#}"));
                }
            }
        }
        Ok(collected)
    }

    async fn write_applied(
        &self,
        tenant: &str,
        limits: &BTreeMap<String, LimitValue>,
    ) -> anyhow::Result<()> {
        if tenant.contains(['/', '\\']) || tenant.starts_with('.') {
            bail!("tenant id {tenant:?} is not a valid file name");
        }
        let dir = self.applied_dir();
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("{tenant}.json"));
        let tmp = dir.join(format!(".{tenant}.json.tmp"));
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(limits)?).await?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }
}

async fn read_samples(path: &Path, tenant: &str) -> anyhow::Result<Vec<MetricSample>> {
    let bytes = tokio::fs::read(path).await?;
    let samples: Vec<MetricSample> = serde_json::from_slice(&bytes)
        .with_context(|| format!("parsing {}", path.display()))?;
    if let Some(other) = samples.iter().find(|s| s.tenant != tenant) {
        bail!("sample for tenant {:?} in {}", other.tenant, path.display());
    }
    Ok(samples)
}

fn parse_scope(key: &str) -> Scope {
    if key == "global" {
        Scope::Global
    } else {
        Scope::tenant(key.strip_prefix("tenant/").unwrap_or(key))
    }
}

impl Collector for FileSpool {
    fn tenant_list(&self) -> BoxFuture<'_, Vec<TenantId>> {
        Box::pin(self.read_tenants())
    }

    fn collect_metrics(&self) -> BoxFuture<'_, CollectedMetrics> {
        Box::pin(self.drain_samples())
    }
}

impl Patcher for FileSpool {
    fn apply_limits<'a>(
        &'a self,
        tenant: &'a str,
        limits: BTreeMap<String, LimitValue>,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move { self.write_applied(tenant, &limits).await })
    }
}

impl PressureSource for FileSpool {
    fn sample(&self) -> BoxFuture<'_, ResourcePressure> {
        Box::pin(async move {
            let path = self.dir.join("pressure.json");
            let bytes = tokio::fs::read(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            Ok(serde_json::from_slice(&bytes)?)
        })
    }
}

impl TrafficSource for FileSpool {
    fn observe(&self) -> BoxFuture<'_, HashMap<Scope, TrafficObservation>> {
        Box::pin(async move {
            let path = self.dir.join("traffic.json");
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
                Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
            };
            let raw: HashMap<String, RawTraffic> = serde_json::from_slice(&bytes)?;
            Ok(raw
                .into_iter()
                .map(|(key, obs)| (parse_scope(&key), obs.into()))
                .collect())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, rel: &str, body: &str) {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }

    #[tokio::test]
    async fn samples_are_consumed_and_bad_files_fail_their_tenant() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "samples/acme.json",
            r#"[{"tenant":"acme","metric":"ingestion_rate","timestamp":100,"value":5.0}]"#,
        );
        write(dir.path(), "samples/broken.json", "not json");
        let spool = FileSpool::new(dir.path());

        let tenants = spool.tenant_list().await.unwrap();
        assert_eq!(tenants, vec!["acme".to_string(), "broken".to_string()]);

        let collected = spool.collect_metrics().await.unwrap();
        assert_eq!(collected.samples.len(), 1);
        assert!(collected.failures.contains_key("broken"));
        assert!(!dir.path().join("samples/acme.json").exists());

        let again = spool.collect_metrics().await.unwrap();
        assert!(again.samples.is_empty());
    }

    #[tokio::test]
    async fn explicit_tenant_list_wins() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "tenants.json", r#"["beta"]"#);
        write(dir.path(), "samples/acme.json", "[]");
        let spool = FileSpool::new(dir.path());
        assert_eq!(spool.tenant_list().await.unwrap(), vec!["beta".to_string()]);
    }

    #[tokio::test]
    async fn traffic_and_pressure() {
        let dir = tempfile::tempdir().unwrap();
        let spool = FileSpool::new(dir.path());
        assert!(spool.observe().await.unwrap().is_empty());
        assert!(spool.sample().await.is_err());

        write(
            dir.path(),
            "traffic.json",
            r#"{"global": {"ingestion": 1000}, "acme": {"query": 5}}"#,
        );
        write(
            dir.path(),
            "pressure.json",
            r#"{"cpu_percent": 40, "memory_percent": 91, "disk_percent": 0,
                "network_percent": 0, "ingestion_rate": 0, "ingestion_capacity": 0}"#,
        );
        let traffic = spool.observe().await.unwrap();
        assert_eq!(traffic[&Scope::Global].ingestion, 1000.0);
        assert_eq!(traffic[&Scope::tenant("acme")].query, 5.0);
        assert_eq!(traffic[&Scope::tenant("acme")].ingestion, 0.0);
        assert_eq!(spool.sample().await.unwrap().normalized(), 91.0);
    }

    #[tokio::test]
    async fn patcher_writes_limits() {
        let dir = tempfile::tempdir().unwrap();
        let spool = FileSpool::new(dir.path());
        let mut limits = BTreeMap::new();
        limits.insert("ingestion_rate".to_string(), LimitValue::Rate(1200.0));
        spool.apply_limits("acme", limits.clone()).await.unwrap();

        let written: BTreeMap<String, LimitValue> = serde_json::from_slice(
            &std::fs::read(dir.path().join("applied/acme.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(written, limits);
        assert!(spool.apply_limits("../evil", BTreeMap::new()).await.is_err());
    }
}
