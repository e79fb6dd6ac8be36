use std::path::Path;

use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};

use chrono::{DateTime, Utc};

use crate::core::types::{BlockRecord, Finding};

/// Sqlite-backed persistence for reconcile runs and block records. The
/// finding table is the "prior persisted state" side of the classifier
/// contract; block_records is owned by the auto-blocker.
pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn default_path() -> std::path::PathBuf {
        std::path::PathBuf::from("data").join("osprey.db")
    }

    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS findings (
              fingerprint TEXT NOT NULL,
              org_id TEXT NOT NULL,
              account_id TEXT NOT NULL,
              status TEXT NOT NULL,
              severity TEXT NOT NULL,
              first_seen TEXT NOT NULL,
              last_seen TEXT NOT NULL,
              resolved_at TEXT,
              occurrence_count INTEGER NOT NULL,
              suppressed INTEGER NOT NULL DEFAULT 0,
              suppression_expires_at TEXT,
              data_json TEXT NOT NULL,
              PRIMARY KEY (fingerprint, org_id, account_id)
            );
            CREATE INDEX IF NOT EXISTS idx_findings_scope ON findings(org_id, account_id);

            CREATE TABLE IF NOT EXISTS block_records (
              ip TEXT PRIMARY KEY,
              reason TEXT NOT NULL,
              blocked_at TEXT NOT NULL,
              expires_at TEXT NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    pub fn load_findings(&self, org_id: &str, account_id: &str) -> Result<Vec<Finding>> {
        let mut stmt = self.conn.prepare(
            "SELECT data_json FROM findings WHERE org_id = ?1 AND account_id = ?2",
        )?;
        let rows = stmt.query_map(params![org_id, account_id], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            let json = row?;
            let finding: Finding = serde_json::from_str(&json)?;
            out.push(finding);
        }
        Ok(out)
    }

    pub fn upsert_findings(&mut self, findings: &[Finding]) -> Result<()> {
        let tx = self.conn.transaction()?;
        for f in findings {
            let data_json = serde_json::to_string(f)?;
            tx.execute(
                "INSERT OR REPLACE INTO findings
                 (fingerprint, org_id, account_id, status, severity, first_seen, last_seen,
                  resolved_at, occurrence_count, suppressed, suppression_expires_at, data_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    f.fingerprint,
                    f.org_id,
                    f.account_id,
                    f.status,
                    format!("{:?}", f.severity).to_lowercase(),
                    f.first_seen.to_rfc3339(),
                    f.last_seen.to_rfc3339(),
                    f.resolved_at.map(|t| t.to_rfc3339()),
                    f.occurrence_count as i64,
                    f.suppressed as i64,
                    f.suppression_expires_at.map(|t| t.to_rfc3339()),
                    data_json
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_block(&self, ip: &str) -> Result<Option<BlockRecord>> {
        let row = self
            .conn
            .query_row(
                "SELECT ip, reason, blocked_at, expires_at FROM block_records WHERE ip = ?1",
                params![ip],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;
        match row {
            Some((ip, reason, blocked_at, expires_at)) => Ok(Some(BlockRecord {
                ip,
                reason,
                blocked_at: parse_ts(&blocked_at)?,
                expires_at: parse_ts(&expires_at)?,
            })),
            None => Ok(None),
        }
    }

    /// The ip column is the primary key, so a refresh replaces the row in
    /// place and can never leave two records for one IP.
    pub fn upsert_block(&mut self, record: &BlockRecord) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO block_records (ip, reason, blocked_at, expires_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                record.ip,
                record.reason,
                record.blocked_at.to_rfc3339(),
                record.expires_at.to_rfc3339()
            ],
        )?;
        Ok(())
    }

    /// Guarded delete for the expiry sweep: only removes the row if it is
    /// still expired at delete time, so a concurrent refresh of
    /// `expires_at` is never undone.
    pub fn delete_block_if_expired(&mut self, ip: &str, now: DateTime<Utc>) -> Result<bool> {
        let n = self.conn.execute(
            "DELETE FROM block_records WHERE ip = ?1 AND expires_at <= ?2",
            params![ip, now.to_rfc3339()],
        )?;
        Ok(n > 0)
    }

    /// Returns true when a row was actually removed.
    pub fn delete_block(&mut self, ip: &str) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM block_records WHERE ip = ?1", params![ip])?;
        Ok(n > 0)
    }

    pub fn active_blocks(&self, now: DateTime<Utc>) -> Result<Vec<BlockRecord>> {
        self.blocks_where("expires_at > ?1", now)
    }

    pub fn expired_blocks(&self, now: DateTime<Utc>) -> Result<Vec<BlockRecord>> {
        self.blocks_where("expires_at <= ?1", now)
    }

    fn blocks_where(&self, cond: &str, now: DateTime<Utc>) -> Result<Vec<BlockRecord>> {
        let sql = format!(
            "SELECT ip, reason, blocked_at, expires_at FROM block_records WHERE {} ORDER BY ip",
            cond
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![now.to_rfc3339()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (ip, reason, blocked_at, expires_at) = row?;
            out.push(BlockRecord {
                ip,
                reason,
                blocked_at: parse_ts(&blocked_at)?,
                expires_at: parse_ts(&expires_at)?,
            });
        }
        Ok(out)
    }
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}
