//! StateStore — redb-backed persistence for the local backend.
//!
//! Provides typed operations over nodes, targets, datapoints, published
//! metrics, alerts, dashboards, and leases. All values are JSON-serialized
//! into redb's `&[u8]` value columns. The store supports both on-disk and
//! in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
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
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        for table in ALL {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic JSON access ────────────────────────────────────────

    fn put_json<T: Serialize>(&self, table: JsonTable, key: &str, value: &T) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            t.insert(key, bytes.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(&self, table: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        match t.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// All values whose key starts with `prefix`, in key order.
    fn list_json<T: DeserializeOwned>(&self, table: JsonTable, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in t.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
            }
        }
        Ok(results)
    }

    fn remove(&self, table: JsonTable, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            existed = t.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// Read-modify-write of one key inside a single write transaction.
    ///
    /// `f` receives the current value (if any) and returns the new value;
    /// returning `None` deletes the key. The new value is returned.
    fn update_json<T, F>(&self, table: JsonTable, key: &str, f: F) -> StateResult<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(Option<T>) -> Option<T>,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let updated;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            let current: Option<T> = match t.get(key).map_err(map_err!(Read))? {
                Some(guard) => {
                    Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?)
                }
                None => None,
            };
            updated = f(current);
            match &updated {
                Some(value) => {
                    let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
                    t.insert(key, bytes.as_slice()).map_err(map_err!(Write))?;
                }
                None => {
                    t.remove(key).map_err(map_err!(Write))?;
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(updated)
    }

    // ── Nodes ──────────────────────────────────────────────────────

    pub fn put_node(&self, node: &NodeRecord) -> StateResult<()> {
        self.put_json(NODES, &node.id, node)?;
        debug!(node = %node.id, state = %node.state, "node stored");
        Ok(())
    }

    pub fn get_node(&self, id: &str) -> StateResult<Option<NodeRecord>> {
        self.get_json(NODES, id)
    }

    /// All nodes in id order.
    pub fn list_nodes(&self) -> StateResult<Vec<NodeRecord>> {
        self.list_json(NODES, "")
    }

    /// Apply `f` to an existing node. Fails with `NotFound` if absent.
    pub fn update_node<F>(&self, id: &str, f: F) -> StateResult<NodeRecord>
    where
        F: FnOnce(&mut NodeRecord),
    {
        self.update_json(NODES, id, |current: Option<NodeRecord>| {
            current.map(|mut node| {
                f(&mut node);
                node
            })
        })?
        .ok_or_else(|| StateError::NotFound(format!("node {id}")))
    }

    pub fn delete_node(&self, id: &str) -> StateResult<bool> {
        self.remove(NODES, id)
    }

    // ── Targets ────────────────────────────────────────────────────

    pub fn get_target(&self, group: &str, id: &str) -> StateResult<Option<TargetRecord>> {
        self.get_json(TARGETS, &target_key(group, id))
    }

    pub fn list_targets(&self, group: &str) -> StateResult<Vec<TargetRecord>> {
        self.list_json(TARGETS, &format!("{group}|"))
    }

    /// Insert the target unless one with the same port is already present.
    pub fn register_target(&self, target: TargetRecord) -> StateResult<TargetRecord> {
        let key = target.table_key();
        let stored = self.update_json(TARGETS, &key, |current: Option<TargetRecord>| match current {
            Some(existing) if existing.port == target.port => Some(existing),
            _ => Some(target),
        })?;
        stored.ok_or_else(|| StateError::Write(format!("target {key} vanished")))
    }

    pub fn update_target<F>(&self, group: &str, id: &str, f: F) -> StateResult<Option<TargetRecord>>
    where
        F: FnOnce(&mut TargetRecord),
    {
        self.update_json(TARGETS, &target_key(group, id), |current: Option<TargetRecord>| {
            current.map(|mut target| {
                f(&mut target);
                target
            })
        })
    }

    pub fn deregister_target(&self, group: &str, id: &str) -> StateResult<bool> {
        self.remove(TARGETS, &target_key(group, id))
    }

    // ── Datapoints ─────────────────────────────────────────────────

    pub fn put_datapoint(&self, point: &DatapointRecord) -> StateResult<()> {
        self.put_json(DATAPOINTS, &point.table_key(), point)
    }

    /// All samples of one metric series for a node, oldest first.
    pub fn list_datapoints(&self, node_id: &str, metric: &str) -> StateResult<Vec<DatapointRecord>> {
        self.list_json(DATAPOINTS, &format!("{node_id}|{metric}|"))
    }

    // ── Published metrics ──────────────────────────────────────────

    pub fn put_published(&self, datum: &fleet_core::MetricDatum) -> StateResult<()> {
        let key = format!(
            "{}/{}|{:020}|{}",
            datum.namespace,
            datum.name,
            datum.timestamp.timestamp_millis().max(0),
            uuid::Uuid::new_v4().simple()
        );
        self.put_json(PUBLISHED, &key, datum)
    }

    /// Published values of `{namespace}/{name}`, oldest first.
    pub fn list_published(&self, namespace: &str, name: &str) -> StateResult<Vec<fleet_core::MetricDatum>> {
        self.list_json(PUBLISHED, &format!("{namespace}/{name}|"))
    }

    // ── Alerts ─────────────────────────────────────────────────────

    pub fn put_alert(&self, alert: &AlertRecord) -> StateResult<()> {
        let key = format!(
            "{:020}|{}",
            alert.sent_at.timestamp_millis().max(0),
            uuid::Uuid::new_v4().simple()
        );
        self.put_json(ALERTS, &key, alert)
    }

    /// All alerts, oldest first.
    pub fn list_alerts(&self) -> StateResult<Vec<AlertRecord>> {
        self.list_json(ALERTS, "")
    }

    // ── Dashboards ─────────────────────────────────────────────────

    pub fn put_dashboard(&self, dashboard: &DashboardRecord) -> StateResult<()> {
        self.put_json(DASHBOARDS, &dashboard.name, dashboard)
    }

    pub fn get_dashboard(&self, name: &str) -> StateResult<Option<DashboardRecord>> {
        self.get_json(DASHBOARDS, name)
    }

    // ── Leases ─────────────────────────────────────────────────────

    /// Grant `name` to `candidate` if it is free, expired, or already held by
    /// the same holder. Returns the lease now stored.
    pub fn try_acquire_lease(
        &self,
        name: &str,
        candidate: LeaseRecord,
        now: chrono::DateTime<chrono::Utc>,
    ) -> StateResult<LeaseRecord> {
        let stored = self.update_json(LEASES, name, |current: Option<LeaseRecord>| match current {
            Some(held) if held.holder != candidate.holder && held.expires_at > now => Some(held),
            _ => Some(candidate),
        })?;
        stored.ok_or_else(|| StateError::Write(format!("lease {name} vanished")))
    }

    pub fn get_lease(&self, name: &str) -> StateResult<Option<LeaseRecord>> {
        self.get_json(LEASES, name)
    }

    /// Delete the lease only if `holder` owns it.
    pub fn release_lease(&self, name: &str, holder: &str) -> StateResult<bool> {
        let mut released = false;
        self.update_json(LEASES, name, |current: Option<LeaseRecord>| match current {
            Some(held) if held.holder == holder => {
                released = true;
                None
            }
            other => other,
        })?;
        Ok(released)
    }
}
