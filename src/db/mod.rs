// Copyright (c) 2026 ironloop contributors
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/ironloop/ironloop

//! Database module for persistent channel history

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use tracing::info;

use crate::channels::ChangeEvent;
use crate::config::DatabaseConfig;

/// One channel snapshot row, as written at each persist interval.
#[derive(Debug, Clone)]
pub struct ChannelRow {
    /// Snapshot timestamp, RFC 3339
    pub timestamp: String,
    /// Channel name
    pub channel_name: String,
    /// Channel kind label
    pub channel_kind: String,
    /// Engineering value
    pub value: f64,
    /// Unit label
    pub unit: String,
}

/// Append-only SQLite store for channel snapshots and change events.
///
/// The connection sits behind a mutex because dashboard-style readers may
/// share the file; writers and readers both take the lock.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create the database at the configured path.
    pub fn open(config: &DatabaseConfig) -> Result<Self> {
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&config.path)?;

        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
        "#,
        )?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.create_tables()?;

        info!("Database opened at {:?}", config.path);
        Ok(db)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.create_tables()?;
        Ok(db)
    }

    fn create_tables(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            -- Channel snapshots, one row per channel per persist interval
            CREATE TABLE IF NOT EXISTS channel_data (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                channel_name TEXT NOT NULL,
                channel_kind TEXT NOT NULL,
                value REAL NOT NULL,
                unit TEXT NOT NULL DEFAULT ''
            );

            CREATE INDEX IF NOT EXISTS idx_channel_data_timestamp ON channel_data(timestamp);
            CREATE INDEX IF NOT EXISTS idx_channel_data_name ON channel_data(channel_name);

            -- Discrete input transitions
            CREATE TABLE IF NOT EXISTS channel_changes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                channel_name TEXT NOT NULL,
                old_value REAL NOT NULL,
                new_value REAL NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_channel_changes_timestamp ON channel_changes(timestamp);
        "#,
        )?;

        Ok(())
    }

    /// Store a snapshot batch inside one transaction.
    pub fn store_snapshot(&self, rows: &[ChannelRow]) -> Result<usize> {
        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;

        let mut count = 0;
        for row in rows {
            tx.execute(
                "INSERT INTO channel_data (timestamp, channel_name, channel_kind, value, unit)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    row.timestamp,
                    row.channel_name,
                    row.channel_kind,
                    row.value,
                    row.unit
                ],
            )?;
            count += 1;
        }

        tx.commit()?;
        Ok(count)
    }

    /// Store change events inside one transaction.
    pub fn store_changes(&self, events: &[ChangeEvent]) -> Result<usize> {
        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;

        let mut count = 0;
        for event in events {
            tx.execute(
                "INSERT INTO channel_changes (timestamp, channel_name, old_value, new_value)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    event.timestamp.to_rfc3339(),
                    event.channel,
                    event.old_value,
                    event.new_value
                ],
            )?;
            count += 1;
        }

        tx.commit()?;
        Ok(count)
    }

    /// Most recent snapshot values for a channel, newest first.
    pub fn recent(&self, channel: &str, limit: usize) -> Result<Vec<ChannelRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT timestamp, channel_name, channel_kind, value, unit FROM channel_data
             WHERE channel_name = ?1 ORDER BY timestamp DESC LIMIT ?2",
        )?;

        let rows = stmt.query_map(params![channel, limit as i64], |row| {
            Ok(ChannelRow {
                timestamp: row.get(0)?,
                channel_name: row.get(1)?,
                channel_kind: row.get(2)?,
                value: row.get(3)?,
                unit: row.get(4)?,
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Row counts for the two tables: (snapshots, changes).
    pub fn counts(&self) -> Result<(usize, usize)> {
        let conn = self.conn.lock();
        let data: i64 = conn.query_row("SELECT COUNT(*) FROM channel_data", [], |r| r.get(0))?;
        let changes: i64 =
            conn.query_row("SELECT COUNT(*) FROM channel_changes", [], |r| r.get(0))?;
        Ok((data as usize, changes as usize))
    }

    /// Delete rows older than the retention window.
    pub fn cleanup(&self, retention_days: u32) -> Result<usize> {
        let conn = self.conn.lock();
        let cutoff = Utc::now() - chrono::Duration::days(retention_days as i64);

        let deleted_data = conn.execute(
            "DELETE FROM channel_data WHERE timestamp < ?1",
            params![cutoff.to_rfc3339()],
        )?;
        let deleted_changes = conn.execute(
            "DELETE FROM channel_changes WHERE timestamp < ?1",
            params![cutoff.to_rfc3339()],
        )?;

        if deleted_data + deleted_changes > 0 {
            info!(
                "Cleaned up {} snapshot and {} change rows older than {} days",
                deleted_data, deleted_changes, retention_days
            );
        }

        Ok(deleted_data + deleted_changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(channel: &str, value: f64) -> ChannelRow {
        ChannelRow {
            timestamp: Utc::now().to_rfc3339(),
            channel_name: channel.to_string(),
            channel_kind: "analog_in".to_string(),
            value,
            unit: "°C".to_string(),
        }
    }

    #[test]
    fn snapshot_batch_and_query() {
        let db = Database::open_in_memory().unwrap();
        let stored = db
            .store_snapshot(&[row("temp", 20.0), row("temp", 21.0), row("press", 1.2)])
            .unwrap();
        assert_eq!(stored, 3);

        let recent = db.recent("temp", 10).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].channel_name, "temp");
    }

    #[test]
    fn change_rows_are_appended() {
        let db = Database::open_in_memory().unwrap();
        db.store_changes(&[ChangeEvent {
            channel: "door".into(),
            old_value: 0.0,
            new_value: 1.0,
            timestamp: Utc::now(),
            description: "door: false -> true".into(),
        }])
        .unwrap();

        assert_eq!(db.counts().unwrap(), (0, 1));
    }

    #[test]
    fn cleanup_keeps_recent_rows() {
        let db = Database::open_in_memory().unwrap();
        db.store_snapshot(&[row("temp", 20.0)]).unwrap();
        let removed = db.cleanup(30).unwrap();
        assert_eq!(removed, 0);
        assert_eq!(db.counts().unwrap(), (1, 0));
    }
}
