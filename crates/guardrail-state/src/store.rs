//! StateStore — redb-backed persistence for breaker, emergency, and
//! recommendation state.
//!
//! All values are JSON-serialized into redb's `&[u8]` value columns. The
//! store supports both on-disk and in-memory backends (the latter for
//! testing).

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition, TableHandle};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use guardrail_core::{CircuitBreakerState, EmergencyState, RecommendedLimit, Scope, TenantId};

use crate::error::{StateError, StateResult};
use crate::tables::*;

type Table = TableDefinition<'static, &'static str, &'static [u8]>;

fn table_err(table: Table) -> impl FnOnce(redb::TableError) -> StateError {
    move |source| StateError::Table {
        table: table.name().to_string(),
        source,
    }
}

fn encode<T: Serialize>(table: Table, key: &str, value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|source| StateError::Encode {
        table: table.name().to_string(),
        key: key.to_string(),
        source,
    })
}

fn decode<T: DeserializeOwned>(table: Table, key: &str, bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(|source| StateError::Corrupt {
        table: table.name().to_string(),
        key: key.to_string(),
        source,
    })
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path)?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            ?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write()?;
        for table in [BREAKERS, EMERGENCY, RECOMMENDATIONS] {
            txn.open_table(table).map_err(table_err(table))?;
        }
        txn.commit()?;
        Ok(())
    }

    fn put<T: Serialize>(&self, table: Table, key: &str, value: &T) -> StateResult<()> {
        let bytes = encode(table, key, value)?;
        let txn = self.db.begin_write()?;
        {
            let mut t = txn.open_table(table).map_err(table_err(table))?;
            t.insert(key, bytes.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, table: Table, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read()?;
        let t = txn.open_table(table).map_err(table_err(table))?;
        match t.get(key)? {
            Some(guard) => Ok(Some(decode(table, key, guard.value())?)),
            None => Ok(None),
        }
    }

    fn list<T: DeserializeOwned>(&self, table: Table) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read()?;
        let t = txn.open_table(table).map_err(table_err(table))?;
        let mut results = Vec::new();
        for entry in t.iter()? {
            let (key, value) = entry?;
            results.push(decode(table, key.value(), value.value())?);
        }
        Ok(results)
    }

    // ── Breakers ───────────────────────────────────────────────────

    /// Insert or update one scope's breaker state.
    pub fn put_breaker(&self, state: &CircuitBreakerState) -> StateResult<()> {
        let key = state.scope.table_key();
        self.put(BREAKERS, &key, state)?;
        debug!(%key, state = %state.state, "breaker stored");
        Ok(())
    }

    pub fn get_breaker(&self, scope: &Scope) -> StateResult<Option<CircuitBreakerState>> {
        self.get(BREAKERS, &scope.table_key())
    }

    /// All breaker states, ordered by key.
    pub fn list_breakers(&self) -> StateResult<Vec<CircuitBreakerState>> {
        self.list(BREAKERS)
    }

    /// Delete a scope's breaker. Returns true if it existed.
    pub fn delete_breaker(&self, scope: &Scope) -> StateResult<bool> {
        let key = scope.table_key();
        let txn = self.db.begin_write()?;
        let existed;
        {
            let mut table = txn.open_table(BREAKERS).map_err(table_err(BREAKERS))?;
            existed = table.remove(key.as_str())?.is_some();
        }
        txn.commit()?;
        debug!(%key, existed, "breaker deleted");
        Ok(existed)
    }

    // ── Emergency ──────────────────────────────────────────────────

    pub fn put_emergency(&self, state: &EmergencyState) -> StateResult<()> {
        self.put(EMERGENCY, EMERGENCY_KEY, state)?;
        debug!(level = %state.level, factor = state.limit_factor, "emergency state stored");
        Ok(())
    }

    pub fn get_emergency(&self) -> StateResult<Option<EmergencyState>> {
        self.get(EMERGENCY, EMERGENCY_KEY)
    }

    // ── Recommendations ────────────────────────────────────────────

    /// Replace every stored recommendation of `tenant` with `limits` in one
    /// transaction.
    pub fn replace_recommendations(
        &self,
        tenant: &str,
        limits: &[RecommendedLimit],
    ) -> StateResult<()> {
        let prefix = format!("{tenant}:");
        let mut encoded = Vec::with_capacity(limits.len());
        for limit in limits {
            let key = limit.table_key();
            let value = encode(RECOMMENDATIONS, &key, limit)?;
            encoded.push((key, value));
        }

        let txn = self.db.begin_write()?;
        {
            let mut table = txn
                .open_table(RECOMMENDATIONS)
                .map_err(table_err(RECOMMENDATIONS))?;
            let mut stale = Vec::new();
            for entry in table.iter()? {
                let (key, _) = entry?;
                if key.value().starts_with(&prefix) {
                    stale.push(key.value().to_string());
                }
            }
            for key in &stale {
                table.remove(key.as_str())?;
            }
            for (key, value) in &encoded {
                table.insert(key.as_str(), value.as_slice())?;
            }
        }
        txn.commit()?;
        debug!(%tenant, count = limits.len(), "recommendations stored");
        Ok(())
    }

    /// All stored recommendations grouped by tenant.
    pub fn list_recommendations(&self) -> StateResult<BTreeMap<TenantId, Vec<RecommendedLimit>>> {
        let mut grouped: BTreeMap<TenantId, Vec<RecommendedLimit>> = BTreeMap::new();
        for rec in self.list::<RecommendedLimit>(RECOMMENDATIONS)? {
            grouped.entry(rec.tenant.clone()).or_default().push(rec);
        }
        Ok(grouped)
    }

    /// Drop a forgotten tenant's recommendations.
    pub fn delete_recommendations(&self, tenant: &str) -> StateResult<()> {
        self.replace_recommendations(tenant, &[])
    }
}
