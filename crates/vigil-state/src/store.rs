//! StateStore — redb-backed state persistence for Vigil.
//!
//! Provides typed persistence for anomalies, scaling events, policies and
//! the scaling state. All values are JSON-serialized into redb's `&[u8]`
//! value columns. The store supports both on-disk and in-memory backends
//! (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
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

type Table = TableDefinition<'static, &'static str, &'static [u8]>;

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
        txn.open_table(ANOMALIES).map_err(map_err!(Table))?;
        txn.open_table(SCALING_EVENTS).map_err(map_err!(Table))?;
        txn.open_table(POLICIES).map_err(map_err!(Table))?;
        txn.open_table(SCALING_STATE).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic JSON rows ──────────────────────────────────────────

    fn put_rows<'a, T, I>(&self, table_def: Table, rows: I) -> StateResult<usize>
    where
        T: Serialize + 'a,
        I: IntoIterator<Item = (&'a str, &'a T)>,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut written = 0;
        {
            let mut table = txn.open_table(table_def).map_err(map_err!(Table))?;
            for (key, row) in rows {
                let value = serde_json::to_vec(row).map_err(map_err!(Serialize))?;
                table
                    .insert(key, value.as_slice())
                    .map_err(map_err!(Write))?;
                written += 1;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(written)
    }

    fn get_row<T: DeserializeOwned>(&self, table_def: Table, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table_def).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let row = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(row))
            }
            None => Ok(None),
        }
    }

    fn list_rows<T: DeserializeOwned>(&self, table_def: Table) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table_def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let row = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(row);
        }
        Ok(results)
    }

    // ── Anomalies ──────────────────────────────────────────────────

    /// Insert or update anomaly records in a single transaction.
    pub fn put_anomalies(&self, anomalies: &[Anomaly]) -> StateResult<()> {
        if anomalies.is_empty() {
            return Ok(());
        }
        let written = self.put_rows(ANOMALIES, anomalies.iter().map(|a| (a.id.as_str(), a)))?;
        debug!(count = written, "anomalies stored");
        Ok(())
    }

    /// Get an anomaly by ID.
    pub fn get_anomaly(&self, id: &str) -> StateResult<Option<Anomaly>> {
        self.get_row(ANOMALIES, id)
    }

    /// List all anomalies in creation order.
    pub fn list_anomalies(&self) -> StateResult<Vec<Anomaly>> {
        self.list_rows(ANOMALIES)
    }

    // ── Scaling events ─────────────────────────────────────────────

    /// Insert or update scaling events in a single transaction.
    pub fn put_events(&self, events: &[ScalingEvent]) -> StateResult<()> {
        if events.is_empty() {
            return Ok(());
        }
        let written = self.put_rows(SCALING_EVENTS, events.iter().map(|e| (e.id.as_str(), e)))?;
        debug!(count = written, "scaling events stored");
        Ok(())
    }

    /// List all scaling events in creation order.
    pub fn list_events(&self) -> StateResult<Vec<ScalingEvent>> {
        self.list_rows(SCALING_EVENTS)
    }

    // ── Policies ───────────────────────────────────────────────────

    /// Insert or update a scaling policy.
    pub fn put_policy(&self, policy: &ScalingPolicy) -> StateResult<()> {
        self.put_rows(POLICIES, [(policy.id.as_str(), policy)])?;
        debug!(policy = %policy.id, "policy stored");
        Ok(())
    }

    /// Get a policy by ID.
    pub fn get_policy(&self, id: &str) -> StateResult<Option<ScalingPolicy>> {
        self.get_row(POLICIES, id)
    }

    /// List all policies ordered by ID.
    pub fn list_policies(&self) -> StateResult<Vec<ScalingPolicy>> {
        self.list_rows(POLICIES)
    }

    // ── Scaling state ──────────────────────────────────────────────

    /// Replace the persisted scaling state.
    pub fn put_scaling_state(&self, state: &ScalingState) -> StateResult<()> {
        self.put_rows(SCALING_STATE, [(SCALING_STATE_KEY, state)])?;
        Ok(())
    }

    /// Get the persisted scaling state, if one was ever written.
    pub fn get_scaling_state(&self) -> StateResult<Option<ScalingState>> {
        self.get_row(SCALING_STATE, SCALING_STATE_KEY)
    }
}
