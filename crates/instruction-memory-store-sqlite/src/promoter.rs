use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, Result};
use instruction_memory_core::{AuditDecision, SourceInfo};
use rusqlite::{params, Connection, OptionalExtension};

use crate::{now_rfc3339, open_connection, open_in_memory_connection, rfc3339};

const PROMOTER_SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS promoter_items (
  ns              TEXT NOT NULL,
  item_id         TEXT NOT NULL,
  version         INTEGER NOT NULL,
  title           TEXT NOT NULL,
  content         TEXT NOT NULL,
  labels_json     TEXT NOT NULL,
  content_hash    TEXT NOT NULL,
  is_active       INTEGER NOT NULL,
  policy_version  TEXT NOT NULL,
  source_repo     TEXT NOT NULL,
  source_ref      TEXT NOT NULL,
  source_path     TEXT NOT NULL,
  source_blob_sha TEXT NOT NULL,
  updated_at      TEXT NOT NULL,
  PRIMARY KEY (ns, item_id)
);

CREATE TABLE IF NOT EXISTS promoter_item_versions (
  ns              TEXT NOT NULL,
  item_id         TEXT NOT NULL,
  version         INTEGER NOT NULL,
  title           TEXT NOT NULL,
  content         TEXT NOT NULL,
  labels_json     TEXT NOT NULL,
  content_hash    TEXT NOT NULL,
  input_event_id  TEXT NOT NULL,
  policy_version  TEXT NOT NULL,
  source_repo     TEXT NOT NULL,
  source_ref      TEXT NOT NULL,
  source_path     TEXT NOT NULL,
  source_blob_sha TEXT NOT NULL,
  emitted_at      TEXT NOT NULL,
  PRIMARY KEY (ns, item_id, version)
);

CREATE TABLE IF NOT EXISTS promoter_seen_events (
  ns       TEXT NOT NULL,
  event_id TEXT NOT NULL,
  PRIMARY KEY (ns, event_id)
);

CREATE TABLE IF NOT EXISTS promoter_audit (
  ns             TEXT NOT NULL,
  decision_id    TEXT PRIMARY KEY,
  item_id        TEXT NOT NULL,
  input_event_id TEXT NOT NULL,
  action         TEXT NOT NULL,
  reason_code    TEXT NOT NULL,
  reason_detail  TEXT,
  policy_version TEXT NOT NULL,
  input_subject  TEXT NOT NULL,
  input_hash     TEXT NOT NULL,
  prior_version  INTEGER NOT NULL,
  prior_hash     TEXT,
  new_version    INTEGER,
  is_same_hash   INTEGER NOT NULL,
  delta_type     TEXT,
  delta_subject  TEXT,
  delta_msg_id   TEXT,
  delta_stream   TEXT,
  delta_seq      INTEGER,
  received_at    TEXT NOT NULL,
  decided_at     TEXT NOT NULL,
  published_at   TEXT,
  latency_ms     INTEGER NOT NULL,
  emitted_at     TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS ix_promoter_audit_ns     ON promoter_audit(ns);
CREATE INDEX IF NOT EXISTS ix_promoter_audit_item   ON promoter_audit(ns, item_id);
CREATE INDEX IF NOT EXISTS ix_promoter_audit_reason ON promoter_audit(ns, reason_code);
";

/// Current snapshot of one promoted item, as read for gate decisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriorItem {
    pub version: u32,
    pub is_active: bool,
    pub content_hash: String,
}

/// One accepted mutation: the new current snapshot plus its immutable
/// history row, written in a single transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct PromotionRecord {
    pub ns: String,
    pub item_id: String,
    pub version: u32,
    pub title: String,
    pub content: String,
    pub labels: BTreeSet<String>,
    pub content_hash: String,
    pub is_active: bool,
    pub policy_version: String,
    pub source: SourceInfo,
    pub input_event_id: String,
}

/// Summary of one audit row, used by forensics queries and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRow {
    pub decision_id: String,
    pub action: String,
    pub reason_code: String,
    pub prior_version: u32,
    pub new_version: Option<u32>,
    pub delta_msg_id: Option<String>,
}

/// Promoter-owned state: current items, append-only version history, the
/// seen-events idempotency ledger, and the compact audit projection.
pub struct PromoterStore {
    conn: Connection,
}

impl PromoterStore {
    /// Open (or create) the promoter database.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or the schema
    /// cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = open_connection(path)?;
        conn.execute_batch(PROMOTER_SCHEMA_SQL).context("failed to apply promoter schema")?;
        Ok(Self { conn })
    }

    /// Open a private in-memory store, used by tests.
    ///
    /// # Errors
    /// Returns an error when the schema cannot be applied.
    pub fn open_in_memory() -> Result<Self> {
        let conn = open_in_memory_connection()?;
        conn.execute_batch(PROMOTER_SCHEMA_SQL).context("failed to apply promoter schema")?;
        Ok(Self { conn })
    }

    /// Read the current snapshot of an item, if any.
    ///
    /// # Errors
    /// Returns an error when the read fails.
    pub fn get_item(&self, ns: &str, item_id: &str) -> Result<Option<PriorItem>> {
        let prior = self
            .conn
            .query_row(
                "SELECT version, is_active, content_hash
                 FROM promoter_items WHERE ns = ?1 AND item_id = ?2",
                params![ns, item_id],
                |row| {
                    Ok(PriorItem {
                        version: row.get(0)?,
                        is_active: row.get::<_, i64>(1)? == 1,
                        content_hash: row.get(2)?,
                    })
                },
            )
            .optional()
            .context("failed to read current item")?;
        Ok(prior)
    }

    /// # Errors
    /// Returns an error when the ledger read fails.
    pub fn is_seen(&self, ns: &str, event_key: &str) -> Result<bool> {
        let seen = self
            .conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM promoter_seen_events WHERE ns = ?1 AND event_id = ?2)",
                params![ns, event_key],
                |row| row.get::<_, i64>(0),
            )
            .context("failed to read seen-events ledger")?;
        Ok(seen == 1)
    }

    /// Record an input event as fully processed. Written only after all
    /// downstream effects of the event have succeeded.
    ///
    /// # Errors
    /// Returns an error when the ledger write fails.
    pub fn mark_seen(&mut self, ns: &str, event_key: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO promoter_seen_events(ns, event_id) VALUES (?1, ?2)",
                params![ns, event_key],
            )
            .context("failed to mark event as seen")?;
        Ok(())
    }

    /// Atomically upsert the current snapshot and append its history row.
    ///
    /// # Errors
    /// Returns an error when either write or the commit fails.
    pub fn record_promotion(&mut self, record: &PromotionRecord) -> Result<()> {
        let labels_json =
            serde_json::to_string(&record.labels).context("failed to serialize labels")?;
        let now = now_rfc3339()?;

        let tx = self.conn.transaction().context("failed to start promotion transaction")?;

        tx.execute(
            "INSERT INTO promoter_items
               (ns, item_id, version, title, content, labels_json, content_hash, is_active,
                policy_version, source_repo, source_ref, source_path, source_blob_sha, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
             ON CONFLICT(ns, item_id) DO UPDATE SET
               version = excluded.version,
               title = excluded.title,
               content = excluded.content,
               labels_json = excluded.labels_json,
               content_hash = excluded.content_hash,
               is_active = excluded.is_active,
               policy_version = excluded.policy_version,
               source_repo = excluded.source_repo,
               source_ref = excluded.source_ref,
               source_path = excluded.source_path,
               source_blob_sha = excluded.source_blob_sha,
               updated_at = excluded.updated_at",
            params![
                record.ns,
                record.item_id,
                i64::from(record.version),
                record.title,
                record.content,
                labels_json,
                record.content_hash,
                i64::from(record.is_active),
                record.policy_version,
                record.source.repo,
                record.source.git_ref,
                record.source.path,
                record.source.blob_sha,
                now,
            ],
        )
        .context("failed to upsert current item")?;

        tx.execute(
            "INSERT INTO promoter_item_versions
               (ns, item_id, version, title, content, labels_json, content_hash, input_event_id,
                policy_version, source_repo, source_ref, source_path, source_blob_sha, emitted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                record.ns,
                record.item_id,
                i64::from(record.version),
                record.title,
                record.content,
                labels_json,
                record.content_hash,
                record.input_event_id,
                record.policy_version,
                record.source.repo,
                record.source.git_ref,
                record.source.path,
                record.source.blob_sha,
                now,
            ],
        )
        .context("failed to append item version")?;

        tx.commit().context("failed to commit promotion transaction")?;
        Ok(())
    }

    /// Persist one audit decision row.
    ///
    /// # Errors
    /// Returns an error when the insert fails; callers treat this as
    /// non-fatal.
    pub fn insert_audit(&mut self, audit: &AuditDecision) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO promoter_audit
                   (ns, decision_id, item_id, input_event_id, action, reason_code, reason_detail,
                    policy_version, input_subject, input_hash, prior_version, prior_hash,
                    new_version, is_same_hash, delta_type, delta_subject, delta_msg_id,
                    delta_stream, delta_seq, received_at, decided_at, published_at, latency_ms,
                    emitted_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                         ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24)",
                params![
                    audit.ns,
                    audit.decision_id.to_string(),
                    audit.item_id,
                    audit.input_event_id,
                    audit.action.as_str(),
                    audit.reason_code,
                    audit.reason_detail,
                    audit.policy_version,
                    audit.input_subject,
                    audit.input_hash,
                    i64::from(audit.prior_version),
                    audit.prior_hash,
                    audit.new_version.map(i64::from),
                    i64::from(audit.is_same_hash),
                    audit.delta_type.map(|delta_type| delta_type.as_str()),
                    audit.delta_subject,
                    audit.delta_msg_id,
                    audit.delta_stream,
                    audit.delta_seq,
                    rfc3339(audit.received_at)?,
                    rfc3339(audit.decided_at)?,
                    audit.published_at.map(rfc3339).transpose()?,
                    audit.latency_ms,
                    rfc3339(audit.emitted_at)?,
                ],
            )
            .context("failed to insert audit row")?;
        Ok(())
    }

    /// Audit rows for one item, oldest first.
    ///
    /// # Errors
    /// Returns an error when the read fails.
    pub fn list_audit(&self, ns: &str, item_id: &str) -> Result<Vec<AuditRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT decision_id, action, reason_code, prior_version, new_version, delta_msg_id
             FROM promoter_audit
             WHERE ns = ?1 AND item_id = ?2
             ORDER BY decided_at ASC, decision_id ASC",
        )?;
        let rows = stmt.query_map(params![ns, item_id], |row| {
            Ok(AuditRow {
                decision_id: row.get(0)?,
                action: row.get(1)?,
                reason_code: row.get(2)?,
                prior_version: row.get(3)?,
                new_version: row.get(4)?,
                delta_msg_id: row.get(5)?,
            })
        })?;

        let mut audit_rows = Vec::new();
        for row in rows {
            audit_rows.push(row?);
        }
        Ok(audit_rows)
    }

    /// Version lineage of one item, ascending.
    ///
    /// # Errors
    /// Returns an error when the read fails.
    pub fn version_history(&self, ns: &str, item_id: &str) -> Result<Vec<u32>> {
        let mut stmt = self.conn.prepare(
            "SELECT version FROM promoter_item_versions
             WHERE ns = ?1 AND item_id = ?2
             ORDER BY version ASC",
        )?;
        let rows = stmt.query_map(params![ns, item_id], |row| row.get::<_, u32>(0))?;

        let mut versions = Vec::new();
        for row in rows {
            versions.push(row?);
        }
        Ok(versions)
    }
}
