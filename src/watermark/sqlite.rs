//! SQLite storage backend for watermarks

use super::traits::{
    Granularity, ItemAssignment, OpenStore, WatermarkEntry, WatermarkError, WatermarkResult,
    WatermarkStore,
};
use crate::ids::{ConnectorId, ItemId, ItemScope, ScanModeId, ALL_ITEMS};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Transaction, TransactionBehavior};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

/// How long a writer waits for another connection before giving up
const BUSY_TIMEOUT: Duration = Duration::from_millis(500);

const CREATE_TABLES: &str = r#"
    -- One row per (connector, scan mode, item | 'all') cursor
    CREATE TABLE IF NOT EXISTS watermarks (
        connector_id TEXT NOT NULL,
        scan_mode_id TEXT NOT NULL,
        item_id TEXT NOT NULL,
        max_instant TEXT NOT NULL,
        PRIMARY KEY (connector_id, scan_mode_id, item_id)
    );

    -- Active granularity per connector; absent means aggregate
    CREATE TABLE IF NOT EXISTS watermark_granularity (
        connector_id TEXT PRIMARY KEY,
        per_item INTEGER NOT NULL
    );

    PRAGMA journal_mode = WAL;
"#;

/// SQLite-backed watermark store
///
/// Thread-safe via internal mutex on the connection. Every mutation runs in
/// an `IMMEDIATE` transaction, so a crash leaves either the previous or the
/// next state on disk.
pub struct SqliteWatermarkStore {
    conn: Mutex<Connection>,
}

/// Fixed-width RFC 3339 (nanoseconds, `Z`), so text order equals time order.
fn encode_instant(instant: &DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn decode_instant(raw: &str) -> WatermarkResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| WatermarkError::DateParse(format!("{}: {}", raw, e)))
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == ErrorCode::DatabaseBusy || e.code == ErrorCode::DatabaseLocked
    )
}

fn read_instant(
    conn: &Connection,
    connector: &ConnectorId,
    scan_mode: &ScanModeId,
    item: &str,
) -> WatermarkResult<Option<DateTime<Utc>>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT max_instant FROM watermarks
             WHERE connector_id = ?1 AND scan_mode_id = ?2 AND item_id = ?3",
            params![connector.as_str(), scan_mode.as_str(), item],
            |row| row.get(0),
        )
        .optional()?;
    raw.as_deref().map(decode_instant).transpose()
}

/// Insert a row unless one already exists for the key. Returns rows inserted.
fn insert_if_absent(
    conn: &Connection,
    connector: &ConnectorId,
    scan_mode: &ScanModeId,
    item: &str,
    instant: &DateTime<Utc>,
) -> WatermarkResult<usize> {
    let rows = conn.execute(
        "INSERT INTO watermarks (connector_id, scan_mode_id, item_id, max_instant)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(connector_id, scan_mode_id, item_id) DO NOTHING",
        params![connector.as_str(), scan_mode.as_str(), item, encode_instant(instant)],
    )?;
    Ok(rows)
}

/// Insert or move forward. Returns 0 when the stored value is already newer or equal.
fn upsert_max(
    conn: &Connection,
    connector: &ConnectorId,
    scan_mode: &ScanModeId,
    item: &str,
    instant: &DateTime<Utc>,
) -> WatermarkResult<usize> {
    let rows = conn.execute(
        "INSERT INTO watermarks (connector_id, scan_mode_id, item_id, max_instant)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(connector_id, scan_mode_id, item_id) DO UPDATE SET
             max_instant = excluded.max_instant
         WHERE excluded.max_instant > watermarks.max_instant",
        params![connector.as_str(), scan_mode.as_str(), item, encode_instant(instant)],
    )?;
    Ok(rows)
}

fn delete_row(
    conn: &Connection,
    connector: &ConnectorId,
    scan_mode: &ScanModeId,
    item: &str,
) -> WatermarkResult<usize> {
    let rows = conn.execute(
        "DELETE FROM watermarks WHERE connector_id = ?1 AND scan_mode_id = ?2 AND item_id = ?3",
        params![connector.as_str(), scan_mode.as_str(), item],
    )?;
    Ok(rows)
}

fn read_granularity(conn: &Connection, connector: &ConnectorId) -> WatermarkResult<Granularity> {
    let per_item: Option<bool> = conn
        .query_row(
            "SELECT per_item FROM watermark_granularity WHERE connector_id = ?1",
            params![connector.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(Granularity::from_per_item(per_item.unwrap_or(false)))
}

fn write_granularity(
    conn: &Connection,
    connector: &ConnectorId,
    granularity: Granularity,
) -> WatermarkResult<()> {
    conn.execute(
        "INSERT INTO watermark_granularity (connector_id, per_item) VALUES (?1, ?2)
         ON CONFLICT(connector_id) DO UPDATE SET per_item = excluded.per_item",
        params![connector.as_str(), granularity.is_per_item()],
    )?;
    Ok(())
}

fn read_rows(conn: &Connection, connector: &ConnectorId) -> WatermarkResult<Vec<WatermarkEntry>> {
    let mut stmt = conn.prepare(
        "SELECT scan_mode_id, item_id, max_instant FROM watermarks
         WHERE connector_id = ?1 ORDER BY scan_mode_id, item_id",
    )?;
    let rows = stmt.query_map(params![connector.as_str()], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
        ))
    })?;

    let mut entries = Vec::new();
    for row in rows {
        let (scan_mode, item, raw) = row?;
        entries.push(WatermarkEntry {
            connector: connector.clone(),
            scan_mode: ScanModeId::from(scan_mode),
            item: ItemScope::from_column(item),
            max_instant: decode_instant(&raw)?,
        });
    }
    Ok(entries)
}

impl SqliteWatermarkStore {
    fn from_connection(conn: Connection) -> WatermarkResult<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock_conn(&self) -> WatermarkResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| WatermarkError::LockPoisoned)
    }

    /// Run `f` inside one `IMMEDIATE` transaction for `connector`.
    ///
    /// Failing to acquire the write lock surfaces as
    /// [`WatermarkError::ReconciliationConflict`]; any error from `f` rolls
    /// the whole transaction back.
    fn reconcile<T>(
        &self,
        connector: &ConnectorId,
        f: impl FnOnce(&Transaction<'_>) -> WatermarkResult<T>,
    ) -> WatermarkResult<T> {
        let mut conn = self.lock_conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| {
                if is_busy(&e) {
                    WatermarkError::ReconciliationConflict(connector.clone())
                } else {
                    WatermarkError::Database(e)
                }
            })?;
        let out = f(&tx)?;
        tx.commit().map_err(|e| {
            if is_busy(&e) {
                WatermarkError::ReconciliationConflict(connector.clone())
            } else {
                WatermarkError::Database(e)
            }
        })?;
        Ok(out)
    }
}

impl OpenStore for SqliteWatermarkStore {
    fn open(path: impl AsRef<Path>) -> WatermarkResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::from_connection(Connection::open(path)?)
    }

    fn open_in_memory() -> WatermarkResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }
}

impl WatermarkStore for SqliteWatermarkStore {
    fn get(
        &self,
        connector: &ConnectorId,
        scan_mode: &ScanModeId,
        item: Option<&ItemId>,
    ) -> WatermarkResult<Option<DateTime<Utc>>> {
        let conn = self.lock_conn()?;
        let scope = ItemScope::from_item(item);
        read_instant(&conn, connector, scan_mode, scope.as_column())
    }

    fn advance(
        &self,
        connector: &ConnectorId,
        scan_mode: &ScanModeId,
        item: Option<&ItemId>,
        instant: DateTime<Utc>,
    ) -> WatermarkResult<bool> {
        if item.is_some_and(|id| id.is_reserved()) {
            return Err(WatermarkError::ReservedItemId);
        }

        let mut conn = self.lock_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        match (read_granularity(&tx, connector)?, item) {
            (Granularity::Aggregate, Some(id)) => {
                return Err(WatermarkError::GranularityMismatch {
                    connector: connector.clone(),
                    reason: format!("item cursor \"{}\" on an aggregate connector", id),
                });
            }
            (Granularity::PerItem, None) => {
                return Err(WatermarkError::GranularityMismatch {
                    connector: connector.clone(),
                    reason: "aggregate cursor on a per-item connector".to_string(),
                });
            }
            _ => {}
        }

        let scope = ItemScope::from_item(item);
        let moved = upsert_max(&tx, connector, scan_mode, scope.as_column(), &instant)? > 0;
        tx.commit()?;

        if moved {
            debug!(connector = %connector, scan_mode = %scan_mode, item = %scope, %instant, "watermark advanced");
        }
        Ok(moved)
    }

    fn granularity(&self, connector: &ConnectorId) -> WatermarkResult<Granularity> {
        let conn = self.lock_conn()?;
        read_granularity(&conn, connector)
    }

    fn list(&self, connector: &ConnectorId) -> WatermarkResult<Vec<WatermarkEntry>> {
        let conn = self.lock_conn()?;
        read_rows(&conn, connector)
    }

    fn reconcile_item_scan_mode_changed(
        &self,
        connector: &ConnectorId,
        item: &ItemId,
        old_scan_mode: &ScanModeId,
        new_scan_mode: &ScanModeId,
        assignments: &[ItemAssignment],
    ) -> WatermarkResult<()> {
        if old_scan_mode == new_scan_mode {
            return Ok(());
        }

        self.reconcile(connector, |tx| {
            if read_granularity(tx, connector)?.is_per_item() {
                // The item carries its own cursor; the target row is only
                // created if no row exists there yet.
                if let Some(instant) = read_instant(tx, connector, old_scan_mode, item.as_str())? {
                    let inserted =
                        insert_if_absent(tx, connector, new_scan_mode, item.as_str(), &instant)?;
                    if inserted == 0 {
                        debug!(connector = %connector, item = %item, scan_mode = %new_scan_mode,
                            "kept existing per-item cursor on target scan mode");
                    }
                }
                delete_row(tx, connector, old_scan_mode, item.as_str())?;
            } else {
                if let Some(instant) = read_instant(tx, connector, old_scan_mode, ALL_ITEMS)? {
                    let inserted =
                        insert_if_absent(tx, connector, new_scan_mode, ALL_ITEMS, &instant)?;
                    if inserted == 0 {
                        debug!(connector = %connector, scan_mode = %new_scan_mode,
                            "kept existing aggregate cursor on target scan mode");
                    }
                }
                let still_referenced = assignments.iter().any(|a| &a.scan_mode == old_scan_mode);
                if !still_referenced {
                    delete_row(tx, connector, old_scan_mode, ALL_ITEMS)?;
                }
            }
            Ok(())
        })
    }

    fn reconcile_item_removed(
        &self,
        connector: &ConnectorId,
        item: &ItemId,
        assignments: &[ItemAssignment],
    ) -> WatermarkResult<usize> {
        let removed = self.reconcile(connector, |tx| {
            if read_granularity(tx, connector)?.is_per_item() {
                let rows = tx.execute(
                    "DELETE FROM watermarks WHERE connector_id = ?1 AND item_id = ?2",
                    params![connector.as_str(), item.as_str()],
                )?;
                return Ok(rows);
            }

            // Aggregate rows survive as long as one item still uses the scan mode
            let mut removed = 0;
            for entry in read_rows(tx, connector)? {
                let referenced = assignments.iter().any(|a| a.scan_mode == entry.scan_mode);
                if entry.item.is_all() && !referenced {
                    removed += delete_row(tx, connector, &entry.scan_mode, ALL_ITEMS)?;
                }
            }
            Ok(removed)
        })?;

        debug!(connector = %connector, item = %item, removed, "reconciled item removal");
        Ok(removed)
    }

    fn reconcile_connector_removed(&self, connector: &ConnectorId) -> WatermarkResult<usize> {
        let removed = self.reconcile(connector, |tx| {
            let rows = tx.execute(
                "DELETE FROM watermarks WHERE connector_id = ?1",
                params![connector.as_str()],
            )?;
            tx.execute(
                "DELETE FROM watermark_granularity WHERE connector_id = ?1",
                params![connector.as_str()],
            )?;
            Ok(rows)
        })?;

        info!(connector = %connector, removed, "dropped connector watermarks");
        Ok(removed)
    }

    fn reconcile_granularity_toggled(
        &self,
        connector: &ConnectorId,
        enable_per_item: bool,
        assignments: &[ItemAssignment],
    ) -> WatermarkResult<()> {
        let target = Granularity::from_per_item(enable_per_item);

        let changed = self.reconcile(connector, |tx| {
            if read_granularity(tx, connector)? == target {
                return Ok(false);
            }

            let rows = read_rows(tx, connector)?;
            if enable_per_item {
                for entry in rows.iter().filter(|e| e.item.is_all()) {
                    for assignment in assignments.iter().filter(|a| a.scan_mode == entry.scan_mode) {
                        insert_if_absent(
                            tx,
                            connector,
                            &entry.scan_mode,
                            assignment.item.as_str(),
                            &entry.max_instant,
                        )?;
                    }
                }
                tx.execute(
                    "DELETE FROM watermarks WHERE connector_id = ?1 AND item_id = ?2",
                    params![connector.as_str(), ALL_ITEMS],
                )?;
            } else {
                // Collapse each scan mode to its newest item cursor
                let mut newest: BTreeMap<ScanModeId, DateTime<Utc>> = BTreeMap::new();
                for entry in rows.iter().filter(|e| !e.item.is_all()) {
                    newest
                        .entry(entry.scan_mode.clone())
                        .and_modify(|max| *max = (*max).max(entry.max_instant))
                        .or_insert(entry.max_instant);
                }
                tx.execute(
                    "DELETE FROM watermarks WHERE connector_id = ?1 AND item_id <> ?2",
                    params![connector.as_str(), ALL_ITEMS],
                )?;
                for (scan_mode, instant) in &newest {
                    upsert_max(tx, connector, scan_mode, ALL_ITEMS, instant)?;
                }
            }

            write_granularity(tx, connector, target)?;
            Ok(true)
        })?;

        if changed {
            info!(connector = %connector, per_item = enable_per_item, "watermark granularity toggled");
        }
        Ok(())
    }
}
