//! Document store adapter for PCE catalog records.
//!
//! Owns the uniqueness invariant: exactly one stored record per normalized
//! identifier, enforced by a storage-level unique index rather than by
//! check-then-insert logic in the caller.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::Utc;
use pce_core::{ProductRecord, IDENTIFIER_FIELD};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "pce-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("backend error: {0}")]
    Backend(String),
    #[error("field `{0}` is reserved; uniqueness is keyed on it")]
    ReservedField(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// Connectivity status reported alongside data so callers can tell an empty
/// store from an unreachable one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreHealth {
    Available,
    Unavailable { reason: String },
}

impl StoreHealth {
    pub fn is_available(&self) -> bool {
        matches!(self, StoreHealth::Available)
    }
}

/// Storage seam for catalog records.
///
/// Duplicate insertion is an expected outcome, not an error: `insert`
/// reports it as `Ok(false)`. Update and delete match the exact,
/// unnormalized identifier; only insertion and the duplicate pre-filter
/// normalize.
pub trait CatalogStore: Send {
    fn health(&self) -> StoreHealth;

    /// Insert a record. Returns `Ok(false)` without touching storage when
    /// the normalized identifier is empty, and `Ok(false)` when the unique
    /// index rejects the row as a duplicate.
    fn insert(&mut self, record: &ProductRecord) -> Result<bool, StoreError>;

    /// Every stored record, in insertion order.
    fn get_all(&self) -> Result<Vec<ProductRecord>, StoreError>;

    /// Point lookup by exact, unnormalized identifier.
    fn get(&self, identifier: &str) -> Result<Option<ProductRecord>, StoreError>;

    /// Point lookup by normalized identifier.
    fn contains_normalized(&self, normalized: &str) -> Result<bool, StoreError>;

    fn count(&self) -> Result<usize, StoreError>;

    /// Merge `fields` into the record with the exactly-matching identifier.
    /// No-op when absent.
    fn update(
        &mut self,
        identifier: &str,
        fields: &BTreeMap<String, JsonValue>,
    ) -> Result<(), StoreError>;

    /// Remove the record with the exactly-matching identifier. No-op when
    /// absent.
    fn delete(&mut self, identifier: &str) -> Result<(), StoreError>;

    /// Remove `name` from every stored record. Idempotent; records without
    /// the field are unaffected.
    fn delete_field(&mut self, name: &str) -> Result<(), StoreError>;

    /// Rename `old` to `new` on every record that has `old`. A pre-existing
    /// `new` value on the same record is overwritten (last write wins).
    fn rename_field(&mut self, old: &str, new: &str) -> Result<(), StoreError>;
}

/// SQLite-backed catalog store. Records are one row each: the raw and
/// normalized identifier plus the remaining fields as a JSON document.
pub struct SqliteCatalogStore {
    conn: Connection,
}

impl SqliteCatalogStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), StoreError> {
        self.conn.pragma_update(None, "journal_mode", "WAL")?;
        self.conn.pragma_update(None, "synchronous", "FULL")?;

        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS products (
                rowid INTEGER PRIMARY KEY,
                identifier TEXT NOT NULL,
                identifier_norm TEXT NOT NULL,
                fields_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_products_identifier_norm
                ON products(identifier_norm);
            "#,
        )?;
        Ok(())
    }

    fn row_to_record(identifier: String, fields_json: &str) -> ProductRecord {
        let fields: BTreeMap<String, JsonValue> =
            serde_json::from_str(fields_json).unwrap_or_default();
        ProductRecord { identifier, fields }
    }

    fn reject_reserved(name: &str) -> Result<(), StoreError> {
        if name == IDENTIFIER_FIELD {
            return Err(StoreError::ReservedField(name.to_string()));
        }
        Ok(())
    }

    /// Rewrite `fields_json` for every row where `mutate` changes the map.
    fn mutate_all_fields<F>(&mut self, mutate: F) -> Result<(), StoreError>
    where
        F: Fn(&mut BTreeMap<String, JsonValue>) -> bool,
    {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut touched: Vec<(i64, String)> = Vec::new();
        {
            let mut stmt = tx.prepare("SELECT rowid, fields_json FROM products")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?;
            for row in rows {
                let (rowid, fields_json) = row?;
                let mut fields: BTreeMap<String, JsonValue> =
                    serde_json::from_str(&fields_json).unwrap_or_default();
                if mutate(&mut fields) {
                    touched.push((rowid, serde_json::to_string(&fields)?));
                }
            }
        }
        let now = Utc::now().to_rfc3339();
        for (rowid, fields_json) in touched {
            tx.execute(
                "UPDATE products SET fields_json = ?1, updated_at = ?2 WHERE rowid = ?3",
                params![fields_json, now, rowid],
            )?;
        }
        tx.commit()?;
        Ok(())
    }
}

impl CatalogStore for SqliteCatalogStore {
    fn health(&self) -> StoreHealth {
        StoreHealth::Available
    }

    fn insert(&mut self, record: &ProductRecord) -> Result<bool, StoreError> {
        let normalized = record.normalized_identifier();
        if normalized.is_empty() {
            return Ok(false);
        }
        let fields_json = serde_json::to_string(&record.fields)?;
        let now = Utc::now().to_rfc3339();
        let changed = self.conn.execute(
            "INSERT INTO products (identifier, identifier_norm, fields_json, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(identifier_norm) DO NOTHING",
            params![record.identifier, normalized, fields_json, now, now],
        )?;
        Ok(changed > 0)
    }

    fn get_all(&self) -> Result<Vec<ProductRecord>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT identifier, fields_json FROM products ORDER BY rowid")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (identifier, fields_json) = row?;
            out.push(Self::row_to_record(identifier, &fields_json));
        }
        Ok(out)
    }

    fn get(&self, identifier: &str) -> Result<Option<ProductRecord>, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT identifier, fields_json FROM products WHERE identifier = ?1",
                params![identifier],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;
        Ok(row.map(|(identifier, fields_json)| Self::row_to_record(identifier, &fields_json)))
    }

    fn contains_normalized(&self, normalized: &str) -> Result<bool, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT count(*) FROM products WHERE identifier_norm = ?1",
            params![normalized],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn count(&self) -> Result<usize, StoreError> {
        let count: i64 = self
            .conn
            .query_row("SELECT count(*) FROM products", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn update(
        &mut self,
        identifier: &str,
        fields: &BTreeMap<String, JsonValue>,
    ) -> Result<(), StoreError> {
        if fields.contains_key(IDENTIFIER_FIELD) {
            return Err(StoreError::ReservedField(IDENTIFIER_FIELD.to_string()));
        }
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let existing = tx
            .query_row(
                "SELECT rowid, fields_json FROM products WHERE identifier = ?1",
                params![identifier],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;
        if let Some((rowid, fields_json)) = existing {
            let mut merged: BTreeMap<String, JsonValue> =
                serde_json::from_str(&fields_json).unwrap_or_default();
            for (name, value) in fields {
                merged.insert(name.clone(), value.clone());
            }
            tx.execute(
                "UPDATE products SET fields_json = ?1, updated_at = ?2 WHERE rowid = ?3",
                params![serde_json::to_string(&merged)?, Utc::now().to_rfc3339(), rowid],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn delete(&mut self, identifier: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "DELETE FROM products WHERE identifier = ?1",
            params![identifier],
        )?;
        Ok(())
    }

    fn delete_field(&mut self, name: &str) -> Result<(), StoreError> {
        Self::reject_reserved(name)?;
        let name = name.to_string();
        self.mutate_all_fields(|fields| fields.remove(&name).is_some())
    }

    fn rename_field(&mut self, old: &str, new: &str) -> Result<(), StoreError> {
        Self::reject_reserved(old)?;
        Self::reject_reserved(new)?;
        if old == new {
            return Ok(());
        }
        let (old, new) = (old.to_string(), new.to_string());
        self.mutate_all_fields(|fields| match fields.remove(&old) {
            Some(value) => {
                fields.insert(new.clone(), value);
                true
            }
            None => false,
        })
    }
}

/// Fail-closed front over the SQLite adapter.
///
/// Callers are not required to branch on connectivity: when the backend is
/// unreachable, reads return empty sequences and writes become no-ops, and
/// `health` reports the degraded state so an empty store can be told apart
/// from an unreachable one. Argument errors (`ReservedField`) still
/// propagate; only backend failures are absorbed.
pub struct FailClosedStore {
    inner: Option<SqliteCatalogStore>,
    health: StoreHealth,
}

impl FailClosedStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Self {
        match SqliteCatalogStore::open(&path) {
            Ok(store) => Self::from_store(store),
            Err(err) => {
                warn!(
                    error = %err,
                    path = %path.as_ref().display(),
                    "catalog store unavailable; degrading to empty view"
                );
                Self {
                    inner: None,
                    health: StoreHealth::Unavailable {
                        reason: err.to_string(),
                    },
                }
            }
        }
    }

    pub fn from_store(store: SqliteCatalogStore) -> Self {
        Self {
            inner: Some(store),
            health: StoreHealth::Available,
        }
    }

    fn absorb<T>(result: Result<T, StoreError>, fallback: T, op: &str) -> Result<T, StoreError> {
        match result {
            Ok(value) => Ok(value),
            Err(err @ StoreError::ReservedField(_)) => Err(err),
            Err(err) => {
                warn!(error = %err, op, "store operation degraded to no-op");
                Ok(fallback)
            }
        }
    }
}

impl CatalogStore for FailClosedStore {
    fn health(&self) -> StoreHealth {
        self.health.clone()
    }

    fn insert(&mut self, record: &ProductRecord) -> Result<bool, StoreError> {
        match self.inner.as_mut() {
            Some(store) => Self::absorb(store.insert(record), false, "insert"),
            None => Ok(false),
        }
    }

    fn get_all(&self) -> Result<Vec<ProductRecord>, StoreError> {
        match self.inner.as_ref() {
            Some(store) => Self::absorb(store.get_all(), Vec::new(), "get_all"),
            None => Ok(Vec::new()),
        }
    }

    fn get(&self, identifier: &str) -> Result<Option<ProductRecord>, StoreError> {
        match self.inner.as_ref() {
            Some(store) => Self::absorb(store.get(identifier), None, "get"),
            None => Ok(None),
        }
    }

    fn contains_normalized(&self, normalized: &str) -> Result<bool, StoreError> {
        match self.inner.as_ref() {
            Some(store) => Self::absorb(store.contains_normalized(normalized), false, "contains"),
            None => Ok(false),
        }
    }

    fn count(&self) -> Result<usize, StoreError> {
        match self.inner.as_ref() {
            Some(store) => Self::absorb(store.count(), 0, "count"),
            None => Ok(0),
        }
    }

    fn update(
        &mut self,
        identifier: &str,
        fields: &BTreeMap<String, JsonValue>,
    ) -> Result<(), StoreError> {
        match self.inner.as_mut() {
            Some(store) => Self::absorb(store.update(identifier, fields), (), "update"),
            None => Ok(()),
        }
    }

    fn delete(&mut self, identifier: &str) -> Result<(), StoreError> {
        match self.inner.as_mut() {
            Some(store) => Self::absorb(store.delete(identifier), (), "delete"),
            None => Ok(()),
        }
    }

    fn delete_field(&mut self, name: &str) -> Result<(), StoreError> {
        match self.inner.as_mut() {
            Some(store) => Self::absorb(store.delete_field(name), (), "delete_field"),
            None => Ok(()),
        }
    }

    fn rename_field(&mut self, old: &str, new: &str) -> Result<(), StoreError> {
        match self.inner.as_mut() {
            Some(store) => Self::absorb(store.rename_field(old, new), (), "rename_field"),
            None => Ok(()),
        }
    }
}
