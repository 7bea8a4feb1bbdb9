//! SQLite revocation store implementation.

use crate::{Error, Result, Revocation, RevocationEvent, RevocationEventKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::info;
use zcap::{BoxError, RevocationStore};

/// SQLite-backed revocation list with an append-only audit log.
///
/// Queries run on the blocking thread pool. The connection lock is only
/// taken there, so concurrent verifiers never stall the async executor.
pub struct SqliteRevocationStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRevocationStore {
    /// Open or create a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_connection(Connection::open(path)?)
    }

    /// Create an in-memory store (useful for testing).
    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS revocations (
                capability_id TEXT PRIMARY KEY,
                revoked_at TEXT NOT NULL,
                reason TEXT
            );
            CREATE TABLE IF NOT EXISTS revocation_events (
                id TEXT PRIMARY KEY,
                capability_id TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                kind TEXT NOT NULL,
                data TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_revocation_events_capability
                ON revocation_events(capability_id, timestamp);
            "#,
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            // An aborted transaction rolls back on drop.
            let mut conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut conn)
        })
        .await?
    }

    /// Revoke a capability. Revoking twice keeps the first record.
    ///
    /// Returns whether the capability was newly revoked.
    pub async fn revoke(&self, capability_id: &str, reason: Option<&str>) -> Result<bool> {
        let event = RevocationEvent::revoked(capability_id, reason.map(String::from));
        let inserted = self
            .with_conn(move |conn| {
                let tx = conn.transaction()?;
                let inserted = tx.execute(
                    "INSERT OR IGNORE INTO revocations (capability_id, revoked_at, reason) VALUES (?1, ?2, ?3)",
                    params![
                        event.capability_id,
                        event.timestamp.to_rfc3339(),
                        revoked_reason(&event.kind),
                    ],
                )?;
                if inserted > 0 {
                    append(&tx, &event)?;
                }
                tx.commit()?;
                Ok(inserted > 0)
            })
            .await?;

        if inserted {
            info!(capability_id, "capability revoked");
        }
        Ok(inserted)
    }

    /// Withdraw a revocation. Returns whether one existed.
    pub async fn reinstate(&self, capability_id: &str) -> Result<bool> {
        let event = RevocationEvent::new(capability_id, RevocationEventKind::Reinstated);
        let removed = self
            .with_conn(move |conn| {
                let tx = conn.transaction()?;
                let removed = tx.execute(
                    "DELETE FROM revocations WHERE capability_id = ?1",
                    [&event.capability_id],
                )?;
                if removed > 0 {
                    append(&tx, &event)?;
                }
                tx.commit()?;
                Ok(removed > 0)
            })
            .await?;

        if removed {
            info!(capability_id, "capability reinstated");
        }
        Ok(removed)
    }

    /// Look up the revocation record of one capability.
    pub async fn get(&self, capability_id: &str) -> Result<Option<Revocation>> {
        let capability_id = capability_id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT capability_id, revoked_at, reason FROM revocations WHERE capability_id = ?1",
                [&capability_id],
                |row| {
                    let capability_id: String = row.get(0)?;
                    let revoked_at: String = row.get(1)?;
                    let reason: Option<String> = row.get(2)?;
                    Ok((capability_id, revoked_at, reason))
                },
            )
            .optional()?
            .map(|(capability_id, revoked_at, reason)| -> Result<Revocation> {
                Ok(Revocation {
                    capability_id,
                    revoked_at: parse_timestamp("revocations", &revoked_at)?,
                    reason,
                })
            })
            .transpose()
        })
        .await
    }

    /// All current revocations, oldest first.
    pub async fn list(&self) -> Result<Vec<Revocation>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT capability_id, revoked_at, reason FROM revocations ORDER BY revoked_at",
            )?;

            let rows = stmt
                .query_map([], |row| {
                    let capability_id: String = row.get(0)?;
                    let revoked_at: String = row.get(1)?;
                    let reason: Option<String> = row.get(2)?;
                    Ok((capability_id, revoked_at, reason))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            rows.into_iter()
                .map(|(capability_id, revoked_at, reason)| -> Result<Revocation> {
                    Ok(Revocation {
                        capability_id,
                        revoked_at: parse_timestamp("revocations", &revoked_at)?,
                        reason,
                    })
                })
                .collect()
        })
        .await
    }

    /// Audit history of one capability, ordered by timestamp.
    pub async fn history(&self, capability_id: &str) -> Result<Vec<RevocationEvent>> {
        let capability_id = capability_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, capability_id, timestamp, data FROM revocation_events
                 WHERE capability_id = ?1 ORDER BY timestamp, rowid",
            )?;

            let rows = stmt
                .query_map([&capability_id], |row| {
                    let id: String = row.get(0)?;
                    let capability_id: String = row.get(1)?;
                    let timestamp: String = row.get(2)?;
                    let data: String = row.get(3)?;
                    Ok((id, capability_id, timestamp, data))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            rows.into_iter()
                .map(|(id, capability_id, timestamp, data)| -> Result<RevocationEvent> {
                    Ok(RevocationEvent {
                        id: id.parse().map_err(|e| Error::Corrupt {
                            table: "revocation_events",
                            reason: format!("bad id '{id}': {e}"),
                        })?,
                        capability_id,
                        timestamp: parse_timestamp("revocation_events", &timestamp)?,
                        kind: serde_json::from_str(&data)?,
                    })
                })
                .collect()
        })
        .await
    }

    async fn contains(&self, capability_id: &str) -> Result<bool> {
        let capability_id = capability_id.to_string();
        self.with_conn(move |conn| {
            let found = conn
                .query_row(
                    "SELECT 1 FROM revocations WHERE capability_id = ?1",
                    [&capability_id],
                    |_| Ok(()),
                )
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }
}

#[async_trait]
impl RevocationStore for SqliteRevocationStore {
    async fn is_revoked(&self, capability_id: &str) -> std::result::Result<bool, BoxError> {
        Ok(self.contains(capability_id).await?)
    }
}

fn revoked_reason(kind: &RevocationEventKind) -> Option<&str> {
    match kind {
        RevocationEventKind::Revoked { reason } => reason.as_deref(),
        RevocationEventKind::Reinstated => None,
    }
}

fn append(conn: &Connection, event: &RevocationEvent) -> Result<()> {
    conn.execute(
        "INSERT INTO revocation_events (id, capability_id, timestamp, kind, data) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            event.id.to_string(),
            event.capability_id,
            event.timestamp.to_rfc3339(),
            event.kind.name(),
            serde_json::to_string(&event.kind)?,
        ],
    )?;
    Ok(())
}

fn parse_timestamp(table: &'static str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Corrupt {
            table,
            reason: format!("bad timestamp '{value}': {e}"),
        })
}
