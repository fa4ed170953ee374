//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! The per-process embedded log store
//!
//! Three tables: `logentry` (monotonic uid from 1), `metric` (UNIQUE(name)
//! upsert) and `resource`. All writes are serialized through a single
//! writer thread owning the sqlite connection; readers go through the same
//! thread with a bounded wait, so a wedged disk surfaces as an error
//! instead of a hang.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Error;
use anyhow::Result;
use log::trace;
use log::warn;
use rusqlite::params;
use rusqlite::Connection;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;

mod models;

pub use models::LogEntry;
pub use models::MetricSample;
pub use models::ResourceSample;
pub use models::Severity;

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS logentry (
        uid       INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp INTEGER NOT NULL,
        severity  INTEGER NOT NULL,
        message   TEXT    NOT NULL
    );

    CREATE TABLE IF NOT EXISTS metric (
        name      TEXT    NOT NULL UNIQUE,
        value     INTEGER NOT NULL,
        timestamp INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS resource (
        timestamp   INTEGER NOT NULL,
        cpu_percent REAL    NOT NULL,
        rss_bytes   INTEGER NOT NULL
    );
"#;

enum Command {
    AppendEntry {
        timestamp: i64,
        severity: Severity,
        message: String,
    },
    UpsertMetric {
        name: String,
        value: i64,
        timestamp: i64,
    },
    AppendResource(ResourceSample),
    Entries(oneshot::Sender<Result<Vec<LogEntry>>>),
    Metrics(oneshot::Sender<Result<Vec<MetricSample>>>),
    Resources(oneshot::Sender<Result<Vec<ResourceSample>>>),
    Flush(oneshot::Sender<Result<()>>),
}

/// Handle to the embedded store of one tier or wrapper process
///
/// Cloneable; all clones feed the same writer. Dropping the last clone
/// shuts the writer down and closes the database file.
#[derive(Clone, Debug)]
pub struct LogStore {
    tx: UnboundedSender<Command>,
    path: Option<PathBuf>,
    read_timeout: Duration,
}

impl LogStore {
    pub fn open(path: &Path, read_timeout: Duration) -> Result<LogStore> {
        let conn = Connection::open(path)
            .with_context(|| format!("Opening log store at {}", path.display()))?;
        Self::start(conn, Some(path.to_path_buf()), read_timeout)
    }

    /// In-memory store, used by tests and by tiers that have no state dir
    pub fn open_in_memory(read_timeout: Duration) -> Result<LogStore> {
        let conn = Connection::open_in_memory().context("Opening in-memory log store")?;
        Self::start(conn, None, read_timeout)
    }

    fn start(conn: Connection, path: Option<PathBuf>, read_timeout: Duration) -> Result<LogStore> {
        conn.execute_batch(SCHEMA).context("Creating store schema")?;

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        std::thread::Builder::new()
            .name(String::from("gator-store-writer"))
            .spawn(move || {
                while let Some(command) = rx.blocking_recv() {
                    serve(&conn, command);
                }
                trace!("Store writer shutting down");
            })
            .context("Spawning store writer thread")?;

        Ok(LogStore {
            tx,
            path,
            read_timeout,
        })
    }

    /// Path of the database file, absent for in-memory stores
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn append_entry(&self, timestamp: i64, severity: Severity, message: &str) {
        self.send(Command::AppendEntry {
            timestamp,
            severity,
            message: message.to_string(),
        })
    }

    pub fn upsert_metric(&self, name: &str, value: i64, timestamp: i64) {
        self.send(Command::UpsertMetric {
            name: name.to_string(),
            value,
            timestamp,
        })
    }

    pub fn append_resource(&self, sample: ResourceSample) {
        self.send(Command::AppendResource(sample))
    }

    pub async fn entries(&self) -> Result<Vec<LogEntry>> {
        self.read(Command::Entries).await
    }

    pub async fn metrics(&self) -> Result<Vec<MetricSample>> {
        self.read(Command::Metrics).await
    }

    pub async fn resources(&self) -> Result<Vec<ResourceSample>> {
        self.read(Command::Resources).await
    }

    /// Wait until every previously submitted write hit the database
    pub async fn flush(&self) -> Result<()> {
        self.read(Command::Flush).await
    }

    fn send(&self, command: Command) {
        if self.tx.send(command).is_err() {
            warn!("Log store writer is gone, dropping write");
        }
    }

    async fn read<T, F>(&self, make: F) -> Result<T>
    where
        F: FnOnce(oneshot::Sender<Result<T>>) -> Command,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .map_err(|_| anyhow!("Log store writer is gone"))?;

        tokio::time::timeout(self.read_timeout, reply_rx)
            .await
            .map_err(|_| anyhow!("Log store did not answer within {:?}", self.read_timeout))?
            .map_err(|_| anyhow!("Log store writer dropped the reply"))?
    }
}

fn serve(conn: &Connection, command: Command) {
    match command {
        Command::AppendEntry {
            timestamp,
            severity,
            message,
        } => {
            let r = conn.execute(
                "INSERT INTO logentry (timestamp, severity, message) VALUES (?1, ?2, ?3)",
                params![timestamp, severity.value(), message],
            );
            if let Err(e) = r {
                warn!("Failed to append log entry: {e}");
            }
        }

        Command::UpsertMetric {
            name,
            value,
            timestamp,
        } => {
            let r = conn.execute(
                r#"INSERT INTO metric (name, value, timestamp) VALUES (?1, ?2, ?3)
                   ON CONFLICT(name) DO UPDATE
                   SET value = excluded.value, timestamp = excluded.timestamp"#,
                params![name, value, timestamp],
            );
            if let Err(e) = r {
                warn!("Failed to upsert metric {name}: {e}");
            }
        }

        Command::AppendResource(sample) => {
            let r = conn.execute(
                "INSERT INTO resource (timestamp, cpu_percent, rss_bytes) VALUES (?1, ?2, ?3)",
                params![sample.timestamp, sample.cpu_percent, sample.rss_bytes as i64],
            );
            if let Err(e) = r {
                warn!("Failed to append resource sample: {e}");
            }
        }

        Command::Entries(reply) => {
            let _ = reply.send(query_entries(conn));
        }

        Command::Metrics(reply) => {
            let _ = reply.send(query_metrics(conn));
        }

        Command::Resources(reply) => {
            let _ = reply.send(query_resources(conn));
        }

        Command::Flush(reply) => {
            // All prior commands have been served by the time this one is
            // reached; sqlite commits per statement.
            let _ = reply.send(Ok(()));
        }
    }
}

fn query_entries(conn: &Connection) -> Result<Vec<LogEntry>> {
    let mut stmt = conn.prepare("SELECT uid, timestamp, severity, message FROM logentry ORDER BY uid")?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, i64>(2)?,
            row.get::<_, String>(3)?,
        ))
    })?;

    rows.map(|r| {
        let (uid, timestamp, severity, message) = r?;
        Ok(LogEntry {
            uid,
            timestamp,
            severity: Severity::try_from(severity)?,
            message,
        })
    })
    .collect()
}

fn query_metrics(conn: &Connection) -> Result<Vec<MetricSample>> {
    let mut stmt = conn.prepare("SELECT name, value, timestamp FROM metric ORDER BY name")?;
    let rows = stmt.query_map([], |row| {
        Ok(MetricSample {
            name: row.get(0)?,
            value: row.get(1)?,
            timestamp: row.get(2)?,
        })
    })?;

    rows.map(|r| r.map_err(Error::from)).collect()
}

fn query_resources(conn: &Connection) -> Result<Vec<ResourceSample>> {
    let mut stmt =
        conn.prepare("SELECT timestamp, cpu_percent, rss_bytes FROM resource ORDER BY timestamp")?;
    let rows = stmt.query_map([], |row| {
        Ok(ResourceSample {
            timestamp: row.get(0)?,
            cpu_percent: row.get(1)?,
            rss_bytes: row.get::<_, i64>(2)? as u64,
        })
    })?;

    rows.map(|r| r.map_err(Error::from)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> LogStore {
        LogStore::open_in_memory(Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_uids_are_contiguous_from_one() {
        let store = store();
        store.append_entry(100, Severity::Info, "first");
        store.append_entry(101, Severity::Warning, "second");
        store.append_entry(102, Severity::Error, "third");

        let entries = store.entries().await.unwrap();
        assert_eq!(
            entries.iter().map(|e| e.uid).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(entries[2].message, "third");
        assert_eq!(entries[2].severity, Severity::Error);
    }

    #[tokio::test]
    async fn test_duplicate_entries_are_not_deduped() {
        let store = store();
        store.append_entry(100, Severity::Info, "same");
        store.append_entry(100, Severity::Info, "same");

        let entries = store.entries().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_ne!(entries[0].uid, entries[1].uid);
    }

    #[tokio::test]
    async fn test_metric_upsert_is_last_write_wins() {
        let store = store();
        store.upsert_metric("items", 1, 100);
        store.upsert_metric("items", 5, 110);
        store.upsert_metric("other", 7, 120);

        let metrics = store.metrics().await.unwrap();
        assert_eq!(metrics.len(), 2);
        assert_eq!(
            metrics[0],
            MetricSample {
                name: String::from("items"),
                value: 5,
                timestamp: 110
            }
        );
    }

    #[tokio::test]
    async fn test_flush_waits_for_prior_writes() {
        let store = store();
        for i in 0..100 {
            store.append_entry(i, Severity::Info, "tick");
        }
        store.flush().await.unwrap();

        let entries = store.entries().await.unwrap();
        assert_eq!(entries.len(), 100);
        assert_eq!(entries.last().unwrap().uid, 100);
    }

    #[tokio::test]
    async fn test_resource_samples_roundtrip() {
        let store = store();
        store.append_resource(ResourceSample {
            timestamp: 100,
            cpu_percent: 42.5,
            rss_bytes: 1024 * 1024,
        });

        let samples = store.resources().await.unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].rss_bytes, 1024 * 1024);
    }
}
